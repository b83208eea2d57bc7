//! Error types for the entitlement gate.
//!
//! All errors implement the standard [`std::error::Error`] trait via
//! [`thiserror::Error`].
//!
//! # Error Categories
//!
//! - **Ingestion errors** ([`GateError::MalformedEvent`]): the webhook body
//!   could not be understood at all. The only error class that is surfaced
//!   to the payment gateway (as a 400).
//! - **Concurrency errors** ([`GateError::WriteConflict`]): a conditional
//!   store write lost a race. Retryable with backoff.
//! - **Integrity errors** ([`GateError::DuplicateEntitlement`],
//!   [`GateError::CascadeIncomplete`]): a data invariant would be violated.
//! - **Validation errors** ([`GateError::InvalidIdentifier`]): input failed
//!   identifier validation.

use thiserror::Error;

/// Result type alias for gate operations.
///
/// All fallible functions in this crate return this type.
pub type Result<T> = std::result::Result<T, GateError>;

/// Errors that can occur while reconciling billing state or resolving access.
///
/// Most reconciliation failures are deliberately *not* surfaced to the
/// gateway: the webhook is acknowledged regardless, and the failure is
/// logged for out-of-band remediation. See [`crate::reconciler`] for the
/// acknowledgement policy.
#[must_use = "errors should be handled, propagated, or explicitly panicked"]
#[derive(Debug, Error)]
pub enum GateError {
    /// The webhook body is structurally unusable.
    ///
    /// This is the only error the server surfaces as a 400 response. The
    /// gateway never retries a 400 by design, so this variant is reserved
    /// for payloads with no event type or an unparseable body. Events that
    /// merely fail to match a local record are acknowledged and dropped.
    #[error("malformed webhook event: {0}")]
    MalformedEvent(String),

    /// An identifier failed validation.
    ///
    /// Identifiers must be non-empty, at most 64 characters, and contain
    /// only alphanumeric characters, hyphens, and underscores.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A second live subscription was requested for a (principal, assistant)
    /// pair that already has one in {pending, active, overdue}.
    ///
    /// The existing record is never silently overwritten.
    #[error("principal {principal_id} already has a live subscription for assistant {assistant_id}")]
    DuplicateEntitlement {
        /// Owning principal.
        principal_id: String,
        /// Assistant the duplicate targets.
        assistant_id: String,
    },

    /// A conditional store write observed a version other than the one it
    /// expected.
    ///
    /// Two concurrently processed deliveries raced on the same record. The
    /// loser re-reads and retries; after bounded retries the event is
    /// acknowledged anyway and flagged for manual reconciliation.
    #[error("write conflict on {entity}: expected version {expected}, found {found}")]
    WriteConflict {
        /// Human-readable record reference, e.g. `subscription sub-123`.
        entity: String,
        /// Version the writer expected.
        expected: u64,
        /// Version actually stored.
        found: u64,
    },

    /// A referenced record does not exist in the store.
    #[error("record not found: {0}")]
    NotFound(String),

    /// A package cascade could not be applied atomically.
    ///
    /// Partial cascades are a correctness defect; the transaction is rolled
    /// back and the whole cascade retried.
    #[error("package cascade incomplete: {0}")]
    CascadeIncomplete(String),

    /// The pricing table has no entry for the requested kind and cadence.
    #[error("no price configured for {kind} billed {cadence}")]
    PricingUnavailable {
        /// Entitlement kind, `individual` or `package-3`/`package-6`.
        kind: String,
        /// Billing cadence.
        cadence: String,
    },

    /// The requested operation is not valid for the record's current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

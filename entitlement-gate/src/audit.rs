//! Audit logging for reconciliation and billing events.
//!
//! Every webhook delivery gets a correlation UUID; everything logged about
//! it carries that id so one delivery can be traced across resolution,
//! transition, cascade, and retries. Gateway customer ids are partially
//! redacted before logging.
//!
//! Audit entries use the dedicated tracing target `audit` so they can be
//! filtered and routed to a separate sink from operational logs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Types of auditable reconciliation events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReconcileEventType {
    /// A webhook delivery was received and parsed.
    EventReceived,
    /// No local record or principal matched the event. Expected noise.
    IdentityUnresolved,
    /// A lifecycle transition was written.
    TransitionApplied,
    /// The record already reflected the event.
    TransitionNoOp,
    /// The transition was refused (stale, terminal, or no such edge).
    TransitionRejected,
    /// A package update was propagated to all children atomically.
    CascadeApplied,
    /// A conditional write lost a race and was retried.
    WriteConflictRetried,
    /// Retries were exhausted; the event needs manual reconciliation.
    ManualReconciliationFlagged,
    /// A user-initiated cancel was recorded.
    SubscriptionCancelled,
}

/// Contextual details attached to an audit entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReconcileDetails {
    /// Gateway event type string, e.g. `PAYMENT_RECEIVED`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_event: Option<String>,
    /// Gateway subscription id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_subscription_id: Option<String>,
    /// Gateway customer id, redacted via [`redact_customer_id`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_customer_id: Option<String>,
    /// Local record the event was applied to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    /// Status before the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_from: Option<String>,
    /// Status after the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_to: Option<String>,
    /// Failure or rejection detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Duration of the operation in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// One audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileEvent {
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub event_type: ReconcileEventType,
    /// Correlation id of the webhook delivery.
    pub request_id: Uuid,
    /// Contextual details.
    pub details: ReconcileDetails,
}

impl ReconcileEvent {
    /// Creates a new audit entry.
    #[must_use]
    pub fn new(event_type: ReconcileEventType, request_id: Uuid) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            request_id,
            details: ReconcileDetails::default(),
        }
    }

    /// Adds the gateway event type.
    #[must_use]
    pub fn with_gateway_event(mut self, event: impl Into<String>) -> Self {
        self.details.gateway_event = Some(event.into());
        self
    }

    /// Adds the gateway subscription id.
    #[must_use]
    pub fn with_gateway_subscription_id(mut self, id: impl Into<String>) -> Self {
        self.details.gateway_subscription_id = Some(id.into());
        self
    }

    /// Adds the gateway customer id, redacting it first.
    #[must_use]
    pub fn with_gateway_customer_id(mut self, id: &str) -> Self {
        self.details.gateway_customer_id = Some(redact_customer_id(id));
        self
    }

    /// Adds the local record reference, e.g. `subscription sub-123`.
    #[must_use]
    pub fn with_record(mut self, record: impl Into<String>) -> Self {
        self.details.record = Some(record.into());
        self
    }

    /// Adds the before and after statuses.
    #[must_use]
    pub fn with_statuses(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.details.status_from = Some(from.into());
        self.details.status_to = Some(to.into());
        self
    }

    /// Adds a failure or rejection reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.details.reason = Some(reason.into());
        self
    }

    /// Adds the operation duration.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        reason = "duration in ms fits u64 for practical values"
    )]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.details.duration_ms = Some(duration.as_millis() as u64);
        self
    }
}

/// Logs an audit entry to tracing with target `audit`.
pub fn audit_log(event: &ReconcileEvent) {
    tracing::info!(
        target: "audit",
        timestamp = %event.timestamp,
        event_type = ?event.event_type,
        request_id = %event.request_id,
        details = ?event.details,
        "AUDIT"
    );
}

/// Redacts a gateway customer id to its last four characters, keeping any
/// `cus_`-style prefix for correlation.
#[must_use]
pub fn redact_customer_id(customer_id: &str) -> String {
    if customer_id.len() <= 4 {
        return customer_id.to_owned();
    }
    let prefix_len = customer_id.find('_').map_or(0, |pos| pos + 1);
    let visible_start = customer_id.len() - 4;
    if prefix_len > visible_start {
        // Prefix and suffix would overlap; redact nothing extra.
        return customer_id.to_owned();
    }
    format!(
        "{}{}{}",
        &customer_id[..prefix_len],
        "*".repeat(visible_start - prefix_len),
        &customer_id[visible_start..]
    )
}

/// Convenience macro for one-expression audit logging.
///
/// # Examples
///
/// ```
/// use entitlement_gate::{audit, audit::ReconcileEventType};
/// use uuid::Uuid;
///
/// audit!(ReconcileEventType::EventReceived, Uuid::new_v4());
/// audit!(
///     ReconcileEventType::TransitionApplied,
///     Uuid::new_v4(),
///     with_record("subscription sub-1"),
///     with_statuses("pending", "active"),
/// );
/// ```
#[macro_export]
macro_rules! audit {
    ($event_type:expr, $request_id:expr) => {
        $crate::audit::audit_log(
            &$crate::audit::ReconcileEvent::new($event_type, $request_id)
        )
    };
    ($event_type:expr, $request_id:expr, $($method:ident($($arg:expr),*)),+ $(,)?) => {
        $crate::audit::audit_log(
            &$crate::audit::ReconcileEvent::new($event_type, $request_id)
                $(.$method($($arg),*))+
        )
    };
}

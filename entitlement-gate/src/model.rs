//! Persisted entitlement records and their identifiers.
//!
//! Three record kinds can grant assistant access: an individual
//! [`Subscription`], a [`Package`] owning several child subscriptions, and an
//! [`InstitutionalLicense`] covering every active member of an institution.
//! Records are never hard-deleted; terminal records are retained for audit
//! and billing history.
//!
//! Every mutable record carries a `version` token for conditional writes and
//! a `last_event_at` watermark holding the embedded timestamp of the most
//! recent gateway event reflected in it. The watermark is what makes state
//! progression monotonic under at-least-once, unordered delivery.

use chrono::{DateTime, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{GateError, Result};

/// Validates a local identifier: non-empty, at most 64 characters,
/// alphanumeric plus hyphens and underscores. UUID-shaped values pass.
fn validate_identifier(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(GateError::InvalidIdentifier(format!("{kind} cannot be empty")));
    }
    if id.len() > 64 {
        return Err(GateError::InvalidIdentifier(format!(
            "{kind} must be 64 characters or less"
        )));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(GateError::InvalidIdentifier(format!(
            "{kind} can only contain alphanumeric characters, hyphens, and underscores"
        )));
    }
    Ok(())
}

macro_rules! local_id {
    ($(#[$doc:meta])* $name:ident, $kind:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier after validation.
            ///
            /// # Errors
            ///
            /// Returns [`GateError::InvalidIdentifier`] if the value is
            /// empty, exceeds 64 characters, or contains characters other
            /// than alphanumerics, hyphens, and underscores.
            pub fn new<S: Into<String>>(id: S) -> Result<Self> {
                let id = id.into();
                validate_identifier($kind, &id)?;
                Ok(Self(id))
            }

            /// Returns the inner string reference.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

local_id!(
    /// Identifier of an authenticated end-user.
    PrincipalId,
    "principal_id"
);
local_id!(
    /// Identifier of an AI assistant that access is gated for.
    AssistantId,
    "assistant_id"
);
local_id!(
    /// Identifier of an individual subscription record.
    SubscriptionId,
    "subscription_id"
);
local_id!(
    /// Identifier of a package record.
    PackageId,
    "package_id"
);
local_id!(
    /// Identifier of an institution.
    InstitutionId,
    "institution_id"
);

/// Subscription identifier assigned by the payment gateway.
///
/// Opaque to this crate: the gateway controls its format, so no validation
/// is applied beyond non-emptiness at the call sites that need it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatewaySubscriptionId(String);

impl GatewaySubscriptionId {
    /// Wraps a gateway-issued subscription identifier.
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Returns the inner string reference.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Customer identifier assigned by the payment gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatewayCustomerId(String);

impl GatewayCustomerId {
    /// Wraps a gateway-issued customer identifier.
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Returns the inner string reference.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Billing cadence for subscriptions and packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// Billed every month.
    Monthly,
    /// Billed every six months.
    Semiannual,
}

impl Cadence {
    /// Number of calendar months covered by one paid period.
    #[must_use]
    pub fn period_months(self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Semiannual => 6,
        }
    }

    /// Computes the expiry for a period anchored at `from`.
    ///
    /// Saturates at the end of representable time rather than failing;
    /// calendar overflow is not reachable with real-world anchors.
    #[must_use]
    pub fn expiry_from(self, from: DateTime<Utc>) -> DateTime<Utc> {
        from.checked_add_months(Months::new(self.period_months()))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monthly => f.write_str("monthly"),
            Self::Semiannual => f.write_str("semiannual"),
        }
    }
}

/// Lifecycle status shared by subscriptions and packages.
///
/// The valid transitions are owned by [`crate::lifecycle`]; this type only
/// answers classification questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementStatus {
    /// Created at checkout, awaiting asynchronous payment (boleto, PIX).
    Pending,
    /// Paid and in good standing.
    Active,
    /// Payment missed; in the grace period.
    Overdue,
    /// Terminated by the gateway or by explicit user cancel. Terminal.
    Cancelled,
    /// Grace period lapsed without renewal. Terminal.
    Expired,
}

impl EntitlementStatus {
    /// True for states no regular transition may leave.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired)
    }

    /// True for states that count against the one-live-subscription rule.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Active | Self::Overdue)
    }

    /// Whether this status grants access under the given grace policy.
    ///
    /// Expiry is checked separately by the access engine; this is a pure
    /// status classification.
    #[must_use]
    pub fn grants_access(self, policy: GracePolicy) -> bool {
        match self {
            Self::Active => true,
            Self::Overdue => policy == GracePolicy::PreserveAccess,
            Self::Pending | Self::Cancelled | Self::Expired => false,
        }
    }
}

impl std::fmt::Display for EntitlementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Overdue => "overdue",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Policy for records in the `overdue` state.
///
/// The source system's behavior and its comments disagreed on this point;
/// the gate resolves it one way, explicitly: overdue preserves access during
/// the grace period and is only flagged, never silently revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GracePolicy {
    /// Overdue records keep granting access until they expire.
    #[default]
    PreserveAccess,
    /// Overdue records stop granting access immediately.
    Suspend,
}

/// Number of seats in a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageSize {
    /// Three child subscriptions.
    Three,
    /// Six child subscriptions.
    Six,
}

impl PackageSize {
    /// Number of child subscriptions the package owns.
    #[must_use]
    pub fn seats(self) -> usize {
        match self {
            Self::Three => 3,
            Self::Six => 6,
        }
    }
}

/// Individual subscription granting one principal access to one assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique subscription identifier.
    pub id: SubscriptionId,
    /// Owning principal.
    pub principal_id: PrincipalId,
    /// Assistant this subscription unlocks.
    pub assistant_id: AssistantId,
    /// Billing cadence.
    pub cadence: Cadence,
    /// Amount charged per period.
    pub amount: Decimal,
    /// Current lifecycle status.
    pub status: EntitlementStatus,
    /// Gateway subscription reference, set at creation when available.
    pub gateway_subscription_id: Option<GatewaySubscriptionId>,
    /// Gateway customer reference.
    pub gateway_customer_id: Option<GatewayCustomerId>,
    /// Checkout reference of the form `{kind}_{principal_uuid}_{timestamp}`,
    /// used to recover identity for first-payment events.
    pub external_reference: Option<String>,
    /// End of the currently paid period. `None` until first confirmation.
    pub expires_at: Option<DateTime<Utc>>,
    /// Parent package, when this record is a package seat.
    pub package_id: Option<PackageId>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Embedded timestamp of the latest gateway event reflected here.
    pub last_event_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency token; bumped on every conditional write.
    pub version: u64,
}

/// Package of subscriptions billed together.
///
/// The package status is authoritative over its children: after each
/// reconciliation pass settles, every child status equals the parent's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    /// Unique package identifier.
    pub id: PackageId,
    /// Owning principal.
    pub principal_id: PrincipalId,
    /// Number of owned child subscriptions.
    pub size: PackageSize,
    /// Billing cadence.
    pub cadence: Cadence,
    /// Total amount charged per period across all seats.
    pub total_amount: Decimal,
    /// Current lifecycle status.
    pub status: EntitlementStatus,
    /// Gateway subscription reference.
    pub gateway_subscription_id: Option<GatewaySubscriptionId>,
    /// Gateway customer reference.
    pub gateway_customer_id: Option<GatewayCustomerId>,
    /// Checkout reference, as on [`Subscription`].
    pub external_reference: Option<String>,
    /// End of the currently paid period.
    pub expires_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Embedded timestamp of the latest gateway event reflected here.
    pub last_event_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency token.
    pub version: u64,
}

/// Payment standing of an institutional license.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicensePaymentStatus {
    /// Invoiced and paid.
    Paid,
    /// Evaluation period granted by sales.
    Trial,
    /// Payment lapsed; access withheld.
    Suspended,
}

impl LicensePaymentStatus {
    /// Whether this standing grants member access.
    #[must_use]
    pub fn grants_access(self) -> bool {
        matches!(self, Self::Paid | Self::Trial)
    }
}

/// Site license granting assistant access to all active institution members,
/// independent of their personal billing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstitutionalLicense {
    /// Licensed institution.
    pub institution_id: InstitutionId,
    /// Commercial plan label, e.g. `enterprise`.
    pub plan_type: String,
    /// License validity end.
    pub valid_until: DateTime<Utc>,
    /// Seat cap; `None` means uncapped.
    pub max_users: Option<u32>,
    /// Payment standing.
    pub payment_status: LicensePaymentStatus,
    /// Optimistic-concurrency token.
    pub version: u64,
}

/// Membership of a principal in an institution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    /// Institution joined.
    pub institution_id: InstitutionId,
    /// Only active memberships confer license access.
    pub active: bool,
}

/// Authenticated end-user identity with institutional memberships.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// Unique principal identifier. Checkout references embed this as a
    /// hyphenated UUID, so principals are created with UUID-shaped ids.
    pub id: PrincipalId,
    /// Gateway customer mapping, last-resort identity signal.
    pub gateway_customer_id: Option<GatewayCustomerId>,
    /// Institutional memberships.
    pub memberships: Vec<Membership>,
}

/// Institution able to hold a license.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Institution {
    /// Unique institution identifier.
    pub id: InstitutionId,
    /// Display name.
    pub name: String,
    /// Assistants enabled for this institution's members.
    pub enabled_assistants: Vec<AssistantId>,
    /// Count of currently active members, checked against the seat cap.
    pub active_members: u32,
}

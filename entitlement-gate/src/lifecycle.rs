//! Lifecycle state machine for subscriptions and packages.
//!
//! One pure planning function, [`plan_transition`], decides what a gateway
//! event does to a record. The reconciler owns the write; this module owns
//! the rules:
//!
//! ```text
//! pending ──► active ──┬─► overdue ──┬─► active (renewal)
//!    │          │      │             ├─► cancelled
//!    │          │      │             └─► expired
//!    │          └──────┴─► cancelled
//!    └────────────────────► cancelled
//! ```
//!
//! `cancelled` and `expired` are terminal. A confirmation can resurrect a
//! terminal record only as a renewal whose expiry strictly extends what the
//! regressing event left behind; replaying a stale confirmation can never
//! revive a deliberately cancelled entitlement.
//!
//! All comparisons use the event's embedded timestamp against the record's
//! `last_event_at` watermark, never the local receipt time. Replaying an
//! identical event is detected as a no-op before anything is written.

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;

use crate::gateway::{EventCategory, WebhookEvent};
use crate::model::{Cadence, EntitlementStatus, Package, Subscription};

/// Days an overdue record keeps its standing before it can be expired.
pub const OVERDUE_GRACE_DAYS: i64 = 30;

/// Lifecycle-relevant slice of a record, shared by subscriptions and
/// packages so the planner does not care which it is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitlementState {
    /// Current status.
    pub status: EntitlementStatus,
    /// End of the paid period, when one was ever confirmed.
    pub expires_at: Option<DateTime<Utc>>,
    /// Embedded timestamp of the latest event reflected in the record.
    pub last_event_at: Option<DateTime<Utc>>,
}

impl From<&Subscription> for EntitlementState {
    fn from(record: &Subscription) -> Self {
        Self {
            status: record.status,
            expires_at: record.expires_at,
            last_event_at: record.last_event_at,
        }
    }
}

impl From<&Package> for EntitlementState {
    fn from(record: &Package) -> Self {
        Self {
            status: record.status,
            expires_at: record.expires_at,
            last_event_at: record.last_event_at,
        }
    }
}

/// What the planner decided for one event against one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Write the new status and expiry, and advance the watermark to the
    /// event's timestamp.
    Apply {
        /// Status after the transition.
        status: EntitlementStatus,
        /// Expiry after the transition.
        expires_at: Option<DateTime<Utc>>,
    },
    /// The record already reflects this event. Nothing is written.
    NoOp,
    /// The event must not be applied. Nothing is written; the reason is
    /// logged and the event acknowledged.
    Rejected(RejectReason),
}

/// Why a transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// A strictly later event is already reflected in the record.
    StaleEvent,
    /// The record is terminal and the event is not a qualifying renewal.
    TerminalState,
    /// The state machine has no such edge, e.g. overdue from pending.
    InvalidTransition,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StaleEvent => "stale_event",
            Self::TerminalState => "terminal_state",
            Self::InvalidTransition => "invalid_transition",
        };
        f.write_str(s)
    }
}

/// Infers the paid period length in months from the charged amount.
///
/// Price-band fallback for when the authoritative cadence cannot be loaded:
/// below 150 is one month, 150 to 300 is six months, 300 and above is a
/// year. Fragile to price changes, which is why it is strictly a last
/// resort and never the primary source of truth.
#[must_use]
pub fn infer_period_months(amount: Decimal) -> u32 {
    if amount < Decimal::from(150) {
        1
    } else if amount < Decimal::from(300) {
        6
    } else {
        12
    }
}

/// Resolves the period length, preferring the record's cadence and only
/// degrading to amount inference, then to a single month.
#[must_use]
pub fn resolve_period_months(cadence: Option<Cadence>, amount: Option<Decimal>) -> u32 {
    match (cadence, amount) {
        (Some(cadence), _) => cadence.period_months(),
        (None, Some(amount)) => infer_period_months(amount),
        (None, None) => 1,
    }
}

/// Plans the effect of one normalized gateway event on one record.
///
/// Pure: reads nothing but its arguments, writes nothing. The caller is
/// responsible for applying [`TransitionOutcome::Apply`] with a conditional
/// write and for advancing the watermark to `event.event_timestamp`.
#[must_use]
pub fn plan_transition(
    current: &EntitlementState,
    event: &WebhookEvent,
    cadence: Option<Cadence>,
) -> TransitionOutcome {
    let target = match event.category() {
        EventCategory::Confirmed => {
            let months = resolve_period_months(cadence, event.amount);
            let computed = event
                .event_timestamp
                .checked_add_months(chrono::Months::new(months))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            // A renewal never silently shortens an existing expiry.
            let expires_at = match current.expires_at {
                Some(existing) => Some(existing.max(computed)),
                None => Some(computed),
            };
            (EntitlementStatus::Active, expires_at)
        }
        EventCategory::Overdue => (EntitlementStatus::Overdue, current.expires_at),
        EventCategory::Cancelled => (EntitlementStatus::Cancelled, current.expires_at),
        EventCategory::Unknown => return TransitionOutcome::NoOp,
    };

    // Idempotency first: an exact replay is a no-op regardless of ordering.
    if target == (current.status, current.expires_at) {
        return TransitionOutcome::NoOp;
    }

    // Monotonicity: an event at or before the watermark cannot change state.
    if let Some(watermark) = current.last_event_at
        && event.event_timestamp <= watermark
    {
        return TransitionOutcome::Rejected(RejectReason::StaleEvent);
    }

    let (status, expires_at) = target;
    match (current.status, status) {
        // Renewal out of a terminal state must materially extend the expiry
        // the regressing event left behind.
        (from, EntitlementStatus::Active) if from.is_terminal() => {
            let extends = match (current.expires_at, expires_at) {
                (Some(existing), Some(renewed)) => renewed > existing,
                (None, Some(_)) => true,
                _ => false,
            };
            if extends {
                TransitionOutcome::Apply { status, expires_at }
            } else {
                TransitionOutcome::Rejected(RejectReason::StaleEvent)
            }
        }
        (from, _) if from.is_terminal() => {
            TransitionOutcome::Rejected(RejectReason::TerminalState)
        }
        // overdue is only reachable from active; an unpaid pending record
        // grants nothing, so flagging it would be meaningless.
        (EntitlementStatus::Pending, EntitlementStatus::Overdue) => {
            TransitionOutcome::Rejected(RejectReason::InvalidTransition)
        }
        _ => TransitionOutcome::Apply { status, expires_at },
    }
}

/// Plans expiry of an overdue record whose grace window has lapsed.
///
/// Returns `Some` only when the record is overdue, has a known expiry, and
/// `now` is past the expiry plus [`OVERDUE_GRACE_DAYS`].
#[must_use]
pub fn plan_expiry(current: &EntitlementState, now: DateTime<Utc>) -> Option<TransitionOutcome> {
    if current.status != EntitlementStatus::Overdue {
        return None;
    }
    let expires_at = current.expires_at?;
    if now > expires_at + TimeDelta::days(OVERDUE_GRACE_DAYS) {
        Some(TransitionOutcome::Apply {
            status: EntitlementStatus::Expired,
            expires_at: Some(expires_at),
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::gateway::GatewayEventType;

    fn ts(raw: &str) -> DateTime<Utc> {
        raw.parse().expect("timestamp should parse")
    }

    fn event(event_type: GatewayEventType, at: &str, amount: Option<Decimal>) -> WebhookEvent {
        WebhookEvent {
            event_type,
            gateway_payment_id: Some("pay_1".into()),
            gateway_subscription_id: None,
            gateway_customer_id: None,
            external_reference: None,
            amount,
            event_timestamp: ts(at),
            raw_status: None,
        }
    }

    fn state(
        status: EntitlementStatus,
        expires_at: Option<&str>,
        last_event_at: Option<&str>,
    ) -> EntitlementState {
        EntitlementState {
            status,
            expires_at: expires_at.map(ts),
            last_event_at: last_event_at.map(ts),
        }
    }

    // ========================================================================
    // Confirmation Tests
    // ========================================================================

    #[test]
    fn test_pending_activates_on_confirmation() {
        let current = state(EntitlementStatus::Pending, None, None);
        let received = event(GatewayEventType::PaymentReceived, "2026-03-01T10:00:00Z", None);

        let outcome = plan_transition(&current, &received, Some(Cadence::Monthly));
        assert_eq!(
            outcome,
            TransitionOutcome::Apply {
                status: EntitlementStatus::Active,
                expires_at: Some(ts("2026-04-01T10:00:00Z")),
            }
        );
    }

    #[test]
    fn test_reconfirmation_of_active_is_renewal_refresh() {
        // Client-side optimistic activation commonly precedes the async
        // confirmation; the second confirmation extends, not rejects.
        let current = state(
            EntitlementStatus::Active,
            Some("2026-04-01T10:00:00Z"),
            Some("2026-03-01T10:00:00Z"),
        );
        let renewal = event(GatewayEventType::PaymentConfirmed, "2026-04-01T09:00:00Z", None);

        let outcome = plan_transition(&current, &renewal, Some(Cadence::Monthly));
        assert_eq!(
            outcome,
            TransitionOutcome::Apply {
                status: EntitlementStatus::Active,
                expires_at: Some(ts("2026-05-01T09:00:00Z")),
            }
        );
    }

    #[test]
    fn test_renewal_never_shortens_expiry() {
        let current = state(
            EntitlementStatus::Overdue,
            Some("2026-09-01T00:00:00Z"),
            Some("2026-03-01T00:00:00Z"),
        );
        // A monthly confirmation whose computed expiry lands before the
        // stored semiannual one keeps the stored value.
        let renewal = event(GatewayEventType::PaymentReceived, "2026-03-02T00:00:00Z", None);

        let outcome = plan_transition(&current, &renewal, Some(Cadence::Monthly));
        assert_eq!(
            outcome,
            TransitionOutcome::Apply {
                status: EntitlementStatus::Active,
                expires_at: Some(ts("2026-09-01T00:00:00Z")),
            }
        );
    }

    #[test]
    fn test_cadence_inference_used_without_cadence() {
        let current = state(EntitlementStatus::Pending, None, None);
        let semiannual_amount = event(
            GatewayEventType::PaymentReceived,
            "2026-03-01T00:00:00Z",
            Some(Decimal::new(19900, 2)),
        );

        let outcome = plan_transition(&current, &semiannual_amount, None);
        assert_eq!(
            outcome,
            TransitionOutcome::Apply {
                status: EntitlementStatus::Active,
                expires_at: Some(ts("2026-09-01T00:00:00Z")),
            }
        );
    }

    #[test]
    fn test_cadence_beats_amount_inference() {
        let current = state(EntitlementStatus::Pending, None, None);
        let confirm = event(
            GatewayEventType::PaymentReceived,
            "2026-03-01T00:00:00Z",
            Some(Decimal::new(19900, 2)),
        );

        // Authoritative cadence says monthly even though the amount sits in
        // the semiannual band.
        let outcome = plan_transition(&current, &confirm, Some(Cadence::Monthly));
        assert_eq!(
            outcome,
            TransitionOutcome::Apply {
                status: EntitlementStatus::Active,
                expires_at: Some(ts("2026-04-01T00:00:00Z")),
            }
        );
    }

    // ========================================================================
    // Ordering and Idempotency Tests
    // ========================================================================

    #[test]
    fn test_identical_replay_is_noop() {
        let current = state(
            EntitlementStatus::Active,
            Some("2026-04-01T10:00:00Z"),
            Some("2026-03-01T10:00:00Z"),
        );
        let replay = event(GatewayEventType::PaymentReceived, "2026-03-01T10:00:00Z", None);

        assert_eq!(
            plan_transition(&current, &replay, Some(Cadence::Monthly)),
            TransitionOutcome::NoOp
        );
    }

    #[test]
    fn test_late_overdue_does_not_clobber_newer_active() {
        let current = state(
            EntitlementStatus::Active,
            Some("2026-05-01T00:00:00Z"),
            Some("2026-04-01T00:00:00Z"),
        );
        let late_overdue = event(GatewayEventType::PaymentOverdue, "2026-03-20T00:00:00Z", None);

        assert_eq!(
            plan_transition(&current, &late_overdue, Some(Cadence::Monthly)),
            TransitionOutcome::Rejected(RejectReason::StaleEvent)
        );
    }

    #[test]
    fn test_stale_confirmation_cannot_resurrect_cancelled() {
        let current = state(
            EntitlementStatus::Cancelled,
            Some("2026-05-01T00:00:00Z"),
            Some("2026-04-15T00:00:00Z"),
        );
        // Replay of the original activation from before the cancel.
        let stale = event(GatewayEventType::PaymentConfirmed, "2026-04-01T00:00:00Z", None);

        assert_eq!(
            plan_transition(&current, &stale, Some(Cadence::Monthly)),
            TransitionOutcome::Rejected(RejectReason::StaleEvent)
        );
    }

    #[test]
    fn test_genuine_renewal_resurrects_cancelled() {
        let current = state(
            EntitlementStatus::Cancelled,
            Some("2026-05-01T00:00:00Z"),
            Some("2026-04-15T00:00:00Z"),
        );
        let renewal = event(GatewayEventType::PaymentReceived, "2026-05-02T00:00:00Z", None);

        let outcome = plan_transition(&current, &renewal, Some(Cadence::Monthly));
        assert_eq!(
            outcome,
            TransitionOutcome::Apply {
                status: EntitlementStatus::Active,
                expires_at: Some(ts("2026-06-02T00:00:00Z")),
            }
        );
    }

    #[test]
    fn test_overdue_on_cancelled_is_rejected() {
        let current = state(
            EntitlementStatus::Cancelled,
            Some("2026-05-01T00:00:00Z"),
            Some("2026-04-15T00:00:00Z"),
        );
        let overdue = event(GatewayEventType::PaymentOverdue, "2026-05-20T00:00:00Z", None);

        assert_eq!(
            plan_transition(&current, &overdue, Some(Cadence::Monthly)),
            TransitionOutcome::Rejected(RejectReason::TerminalState)
        );
    }

    #[test]
    fn test_overdue_from_pending_has_no_edge() {
        let current = state(EntitlementStatus::Pending, None, None);
        let overdue = event(GatewayEventType::PaymentOverdue, "2026-03-10T00:00:00Z", None);

        assert_eq!(
            plan_transition(&current, &overdue, Some(Cadence::Monthly)),
            TransitionOutcome::Rejected(RejectReason::InvalidTransition)
        );
    }

    #[test]
    fn test_cancel_from_pending_applies() {
        let current = state(EntitlementStatus::Pending, None, None);
        let deleted = event(GatewayEventType::PaymentDeleted, "2026-03-10T00:00:00Z", None);

        assert_eq!(
            plan_transition(&current, &deleted, Some(Cadence::Monthly)),
            TransitionOutcome::Apply {
                status: EntitlementStatus::Cancelled,
                expires_at: None,
            }
        );
    }

    #[test]
    fn test_unknown_event_is_noop() {
        let current = state(EntitlementStatus::Active, Some("2026-05-01T00:00:00Z"), None);
        let unknown = event(GatewayEventType::Unknown, "2026-04-20T00:00:00Z", None);

        assert_eq!(
            plan_transition(&current, &unknown, Some(Cadence::Monthly)),
            TransitionOutcome::NoOp
        );
    }

    // ========================================================================
    // Expiry Sweep Tests
    // ========================================================================

    #[test]
    fn test_expiry_after_grace_lapses() {
        let current = state(
            EntitlementStatus::Overdue,
            Some("2026-03-01T00:00:00Z"),
            Some("2026-03-01T00:00:00Z"),
        );

        let outcome = plan_expiry(&current, ts("2026-04-15T00:00:00Z"));
        assert_eq!(
            outcome,
            Some(TransitionOutcome::Apply {
                status: EntitlementStatus::Expired,
                expires_at: Some(ts("2026-03-01T00:00:00Z")),
            })
        );
    }

    #[test]
    fn test_no_expiry_within_grace() {
        let current = state(
            EntitlementStatus::Overdue,
            Some("2026-03-01T00:00:00Z"),
            Some("2026-03-01T00:00:00Z"),
        );
        assert_eq!(plan_expiry(&current, ts("2026-03-20T00:00:00Z")), None);
    }

    #[test]
    fn test_no_expiry_for_active() {
        let current = state(EntitlementStatus::Active, Some("2026-03-01T00:00:00Z"), None);
        assert_eq!(plan_expiry(&current, ts("2026-06-01T00:00:00Z")), None);
    }

    // ========================================================================
    // Inference Band Tests
    // ========================================================================

    #[test]
    fn test_price_bands() {
        assert_eq!(infer_period_months(Decimal::new(3990, 2)), 1);
        assert_eq!(infer_period_months(Decimal::new(14999, 2)), 1);
        assert_eq!(infer_period_months(Decimal::new(15000, 2)), 6);
        assert_eq!(infer_period_months(Decimal::new(19900, 2)), 6);
        assert_eq!(infer_period_months(Decimal::new(29999, 2)), 6);
        assert_eq!(infer_period_months(Decimal::new(30000, 2)), 12);
    }

    #[test]
    fn test_resolve_period_defaults_to_one_month() {
        assert_eq!(resolve_period_months(None, None), 1);
    }

    // ========================================================================
    // Property Tests
    // ========================================================================

    fn arb_status() -> impl Strategy<Value = EntitlementStatus> {
        prop_oneof![
            Just(EntitlementStatus::Pending),
            Just(EntitlementStatus::Active),
            Just(EntitlementStatus::Overdue),
            Just(EntitlementStatus::Cancelled),
            Just(EntitlementStatus::Expired),
        ]
    }

    fn arb_event_type() -> impl Strategy<Value = GatewayEventType> {
        prop_oneof![
            Just(GatewayEventType::PaymentConfirmed),
            Just(GatewayEventType::PaymentReceived),
            Just(GatewayEventType::PaymentOverdue),
            Just(GatewayEventType::PaymentDeleted),
            Just(GatewayEventType::PaymentRefunded),
            Just(GatewayEventType::SubscriptionReceived),
            Just(GatewayEventType::SubscriptionOverdue),
            Just(GatewayEventType::SubscriptionCancelled),
        ]
    }

    fn apply(current: &EntitlementState, outcome: TransitionOutcome, at: DateTime<Utc>)
    -> EntitlementState {
        match outcome {
            TransitionOutcome::Apply { status, expires_at } => EntitlementState {
                status,
                expires_at,
                last_event_at: Some(at),
            },
            _ => *current,
        }
    }

    proptest! {
        /// Replaying any event against the state it produced is a no-op or
        /// a rejection; it never writes again.
        #[test]
        fn prop_transition_is_idempotent(
            status in arb_status(),
            event_type in arb_event_type(),
            offset_hours in 0i64..10_000,
        ) {
            let base = ts("2026-01-01T00:00:00Z");
            let current = EntitlementState {
                status,
                expires_at: Some(base),
                last_event_at: Some(base),
            };
            let ev = WebhookEvent {
                event_type,
                gateway_payment_id: None,
                gateway_subscription_id: None,
                gateway_customer_id: None,
                external_reference: None,
                amount: None,
                event_timestamp: base + TimeDelta::hours(offset_hours),
                raw_status: None,
            };

            let first = plan_transition(&current, &ev, Some(Cadence::Monthly));
            let settled = apply(&current, first, ev.event_timestamp);
            let replay = plan_transition(&settled, &ev, Some(Cadence::Monthly));
            let replay_applies = matches!(replay, TransitionOutcome::Apply { .. });
            prop_assert!(!replay_applies);
        }

        /// An event older than the watermark never changes state.
        #[test]
        fn prop_stale_events_never_apply(
            status in arb_status(),
            event_type in arb_event_type(),
            age_hours in 1i64..10_000,
        ) {
            let watermark = ts("2026-06-01T00:00:00Z");
            let current = EntitlementState {
                status,
                expires_at: Some(ts("2026-07-01T00:00:00Z")),
                last_event_at: Some(watermark),
            };
            let ev = WebhookEvent {
                event_type,
                gateway_payment_id: None,
                gateway_subscription_id: None,
                gateway_customer_id: None,
                external_reference: None,
                amount: None,
                event_timestamp: watermark - TimeDelta::hours(age_hours),
                raw_status: None,
            };

            let outcome = plan_transition(&current, &ev, Some(Cadence::Monthly));
            let outcome_applies = matches!(outcome, TransitionOutcome::Apply { .. });
            prop_assert!(!outcome_applies);
        }
    }
}

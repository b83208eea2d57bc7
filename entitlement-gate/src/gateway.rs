//! Payment gateway webhook payload model.
//!
//! The gateway delivers events at least once, in no particular order, over
//! `POST /webhooks/payment-gateway`. The wire shape is modeled as a closed
//! tagged union with an explicit [`GatewayEventType::Unknown`] variant so an
//! unrecognized event type deserializes instead of failing the whole body.
//! Field names on the wire are the gateway's camelCase.
//!
//! Payloads are normalized into the ephemeral [`WebhookEvent`] before any
//! business logic sees them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{GateError, Result};
use crate::model::{GatewayCustomerId, GatewaySubscriptionId};

/// Event types the gateway is known to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayEventType {
    /// Card payment confirmed synchronously or asynchronously.
    PaymentConfirmed,
    /// Asynchronous payment (boleto, PIX) settled.
    PaymentReceived,
    /// Payment missed its due date.
    PaymentOverdue,
    /// Payment record deleted on the gateway.
    PaymentDeleted,
    /// Payment refunded.
    PaymentRefunded,
    /// Subscription-level charge settled.
    SubscriptionReceived,
    /// Subscription-level charge missed its due date.
    SubscriptionOverdue,
    /// Subscription cancelled on the gateway.
    SubscriptionCancelled,
    /// Any event type this crate does not recognize. Acknowledged and
    /// dropped, never an error.
    #[serde(other)]
    Unknown,
}

impl GatewayEventType {
    /// True for `SUBSCRIPTION_*` events, which key directly off the gateway
    /// subscription id and are the stronger identity signal.
    #[must_use]
    pub fn is_subscription_scoped(self) -> bool {
        matches!(
            self,
            Self::SubscriptionReceived | Self::SubscriptionOverdue | Self::SubscriptionCancelled
        )
    }

    /// Collapses the event type into its reconciliation category.
    #[must_use]
    pub fn category(self) -> EventCategory {
        match self {
            Self::PaymentConfirmed | Self::PaymentReceived | Self::SubscriptionReceived => {
                EventCategory::Confirmed
            }
            Self::PaymentOverdue | Self::SubscriptionOverdue => EventCategory::Overdue,
            Self::PaymentDeleted | Self::PaymentRefunded | Self::SubscriptionCancelled => {
                EventCategory::Cancelled
            }
            Self::Unknown => EventCategory::Unknown,
        }
    }
}

/// What a gateway event means for local lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    /// Money arrived: activate or renew.
    Confirmed,
    /// Money is late: flag, do not revoke.
    Overdue,
    /// The entitlement ended on the gateway side: cancel.
    Cancelled,
    /// Unrecognized event type: drop after acknowledging.
    Unknown,
}

/// Payment sub-object of the wire payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    /// Gateway payment id.
    pub id: Option<String>,
    /// Gateway subscription this payment belongs to, when recurring.
    pub subscription: Option<String>,
    /// Gateway customer id.
    pub customer: Option<String>,
    /// Paid amount.
    pub value: Option<Decimal>,
    /// Raw gateway status string, kept for logging only.
    pub status: Option<String>,
    /// Checkout reference of the form `{kind}_{principal_uuid}_{timestamp}`.
    pub external_reference: Option<String>,
    /// Timestamp the gateway assigned to the underlying payment event.
    pub payment_date: Option<DateTime<Utc>>,
}

/// Subscription sub-object of the wire payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPayload {
    /// Gateway subscription id.
    pub id: Option<String>,
    /// Gateway customer id.
    pub customer: Option<String>,
    /// Raw gateway status string.
    pub status: Option<String>,
    /// Checkout reference, when the subscription was created with one.
    pub external_reference: Option<String>,
}

/// Raw webhook notification as delivered by the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayNotification {
    /// Event type. Absence makes the whole notification malformed.
    pub event: Option<GatewayEventType>,
    /// Timestamp the gateway created the event, when provided.
    pub date_created: Option<DateTime<Utc>>,
    /// Payment details for `PAYMENT_*` events.
    #[serde(default)]
    pub payment: Option<PaymentPayload>,
    /// Subscription details for `SUBSCRIPTION_*` events.
    #[serde(default)]
    pub subscription: Option<SubscriptionPayload>,
}

/// Normalized, ephemeral view of one gateway event.
///
/// `event_timestamp` is the gateway's embedded timestamp, never the local
/// receipt time; it is the value compared against record watermarks to keep
/// transitions monotonic under out-of-order delivery.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    /// Original wire event type.
    pub event_type: GatewayEventType,
    /// Gateway payment id, for payment-scoped events.
    pub gateway_payment_id: Option<String>,
    /// Gateway subscription id, the strongest identity signal.
    pub gateway_subscription_id: Option<GatewaySubscriptionId>,
    /// Gateway customer id, the weakest identity signal.
    pub gateway_customer_id: Option<GatewayCustomerId>,
    /// Checkout reference embedding the principal UUID.
    pub external_reference: Option<String>,
    /// Paid amount, when the event carries one.
    pub amount: Option<Decimal>,
    /// Embedded event timestamp.
    pub event_timestamp: DateTime<Utc>,
    /// Raw gateway status string, logged verbatim.
    pub raw_status: Option<String>,
}

impl WebhookEvent {
    /// Normalizes a wire notification.
    ///
    /// `received_at` is used as the event timestamp only when the gateway
    /// supplied none; that degrades ordering guarantees for this one event
    /// and is logged at debug level by the reconciler.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::MalformedEvent`] when the `event` field is
    /// missing, the one case the server answers with a 400, which the
    /// gateway never retries. A notification that parses but carries no
    /// payment or subscription object normalizes to an event with no
    /// identity signals; resolution then reports it unresolved and the
    /// delivery is acknowledged.
    pub fn from_notification(
        notification: GatewayNotification,
        received_at: DateTime<Utc>,
    ) -> Result<Self> {
        let event_type = notification
            .event
            .ok_or_else(|| GateError::MalformedEvent("missing event type".into()))?;

        let payment = notification.payment.unwrap_or_default();
        let subscription = notification.subscription.unwrap_or_default();

        // Subscription-scoped events name the subscription directly;
        // payment-scoped events reference it through the payment object.
        let gateway_subscription_id = if event_type.is_subscription_scoped() {
            subscription.id.clone().or(payment.subscription.clone())
        } else {
            payment.subscription.clone().or(subscription.id.clone())
        }
        .map(GatewaySubscriptionId::new);

        let gateway_customer_id = payment
            .customer
            .clone()
            .or(subscription.customer.clone())
            .map(GatewayCustomerId::new);

        let event_timestamp = notification
            .date_created
            .or(payment.payment_date)
            .unwrap_or(received_at);

        Ok(Self {
            event_type,
            gateway_payment_id: payment.id,
            gateway_subscription_id,
            gateway_customer_id,
            external_reference: payment.external_reference.or(subscription.external_reference),
            amount: payment.value,
            event_timestamp,
            raw_status: payment.status.or(subscription.status),
        })
    }

    /// Reconciliation category of this event.
    #[must_use]
    pub fn category(&self) -> EventCategory {
        self.event_type.category()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> GatewayNotification {
        serde_json::from_str(raw).expect("notification should parse")
    }

    // ========================================================================
    // Event Type Tests
    // ========================================================================

    #[test]
    fn test_event_type_wire_names() {
        let parsed: GatewayEventType = serde_json::from_str("\"PAYMENT_CONFIRMED\"").unwrap();
        assert_eq!(parsed, GatewayEventType::PaymentConfirmed);

        let parsed: GatewayEventType = serde_json::from_str("\"SUBSCRIPTION_CANCELLED\"").unwrap();
        assert_eq!(parsed, GatewayEventType::SubscriptionCancelled);
    }

    #[test]
    fn test_unrecognized_event_type_maps_to_unknown() {
        let parsed: GatewayEventType =
            serde_json::from_str("\"PAYMENT_CHARGEBACK_REQUESTED\"").unwrap();
        assert_eq!(parsed, GatewayEventType::Unknown);
        assert_eq!(parsed.category(), EventCategory::Unknown);
    }

    #[test]
    fn test_category_mapping() {
        assert_eq!(GatewayEventType::PaymentReceived.category(), EventCategory::Confirmed);
        assert_eq!(GatewayEventType::SubscriptionReceived.category(), EventCategory::Confirmed);
        assert_eq!(GatewayEventType::PaymentOverdue.category(), EventCategory::Overdue);
        assert_eq!(GatewayEventType::PaymentRefunded.category(), EventCategory::Cancelled);
        assert_eq!(GatewayEventType::PaymentDeleted.category(), EventCategory::Cancelled);
    }

    #[test]
    fn test_subscription_scoped_classification() {
        assert!(GatewayEventType::SubscriptionOverdue.is_subscription_scoped());
        assert!(!GatewayEventType::PaymentOverdue.is_subscription_scoped());
    }

    // ========================================================================
    // Normalization Tests
    // ========================================================================

    #[test]
    fn test_normalize_payment_event() {
        let notification = parse(
            r#"{
                "event": "PAYMENT_RECEIVED",
                "dateCreated": "2026-03-01T10:00:00Z",
                "payment": {
                    "id": "pay_1",
                    "subscription": "gwsub_9",
                    "customer": "cus_5",
                    "value": 39.90,
                    "status": "RECEIVED",
                    "externalReference": "individual_8f14e45f-ceea-4a7b-9c2e-27f1a3b4c5d6_1709290000"
                }
            }"#,
        );

        let event = WebhookEvent::from_notification(notification, Utc::now()).unwrap();
        assert_eq!(event.event_type, GatewayEventType::PaymentReceived);
        assert_eq!(event.gateway_payment_id.as_deref(), Some("pay_1"));
        assert_eq!(event.gateway_subscription_id.unwrap().as_str(), "gwsub_9");
        assert_eq!(event.gateway_customer_id.unwrap().as_str(), "cus_5");
        assert_eq!(event.amount, Some(Decimal::new(3990, 2)));
        assert_eq!(
            event.event_timestamp,
            "2026-03-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(event.raw_status.as_deref(), Some("RECEIVED"));
    }

    #[test]
    fn test_normalize_subscription_event_prefers_subscription_id() {
        let notification = parse(
            r#"{
                "event": "SUBSCRIPTION_OVERDUE",
                "subscription": { "id": "gwsub_3", "status": "OVERDUE" }
            }"#,
        );

        let event = WebhookEvent::from_notification(notification, Utc::now()).unwrap();
        assert_eq!(event.gateway_subscription_id.as_ref().unwrap().as_str(), "gwsub_3");
        assert_eq!(event.category(), EventCategory::Overdue);
    }

    #[test]
    fn test_missing_event_type_is_malformed() {
        let notification = parse(r#"{ "payment": { "id": "pay_1" } }"#);
        let result = WebhookEvent::from_notification(notification, Utc::now());
        assert!(matches!(result.unwrap_err(), GateError::MalformedEvent(_)));
    }

    #[test]
    fn test_notification_without_objects_normalizes_with_no_signals() {
        // Parseable but carrying nothing to resolve against; must not be
        // treated as malformed, the gateway would retry a non-2xx forever.
        let notification = parse(r#"{ "event": "PAYMENT_CONFIRMED" }"#);
        let event = WebhookEvent::from_notification(notification, Utc::now()).unwrap();
        assert_eq!(event.event_type, GatewayEventType::PaymentConfirmed);
        assert!(event.gateway_subscription_id.is_none());
        assert!(event.gateway_customer_id.is_none());
        assert!(event.external_reference.is_none());
    }

    #[test]
    fn test_missing_timestamp_falls_back_to_receipt_time() {
        let notification = parse(
            r#"{ "event": "PAYMENT_CONFIRMED", "payment": { "id": "pay_2" } }"#,
        );
        let received_at = Utc::now();
        let event = WebhookEvent::from_notification(notification, received_at).unwrap();
        assert_eq!(event.event_timestamp, received_at);
    }

    #[test]
    fn test_unknown_event_still_normalizes() {
        let notification = parse(
            r#"{ "event": "PAYMENT_SPLIT_DIVERGENCE", "payment": { "id": "pay_3" } }"#,
        );
        let event = WebhookEvent::from_notification(notification, Utc::now()).unwrap();
        assert_eq!(event.event_type, GatewayEventType::Unknown);
    }
}

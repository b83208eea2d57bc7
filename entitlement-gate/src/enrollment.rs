//! Checkout-side record creation and user-initiated cancellation.
//!
//! Records enter the store here and are mutated afterwards only by the
//! reconciler, with one exception: an explicit user cancel, which is
//! locally authoritative. Telling the gateway about the cancel is a
//! best-effort concern of the outbound client, which lives outside this
//! crate; local state never waits for it.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::audit::{ReconcileEvent, ReconcileEventType, audit_log};
use crate::error::{GateError, Result};
use crate::model::{
    AssistantId, Cadence, EntitlementStatus, GatewayCustomerId, GatewaySubscriptionId, Package,
    PackageId, PackageSize, PrincipalId, Subscription, SubscriptionId,
};
use crate::pricing::{EntitlementKind, PriceTable};
use crate::store::Store;

/// How the checkout is paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMethod {
    /// Card, charged synchronously at checkout.
    Card,
    /// Boleto, settled asynchronously.
    Boleto,
    /// PIX, settled asynchronously.
    Pix,
}

impl PaymentMethod {
    /// Status a fresh record starts in.
    ///
    /// Card checkouts charge synchronously and start active; boleto and
    /// PIX wait for the gateway's settlement event.
    #[must_use]
    pub fn initial_status(self) -> EntitlementStatus {
        match self {
            Self::Card => EntitlementStatus::Active,
            Self::Boleto | Self::Pix => EntitlementStatus::Pending,
        }
    }
}

/// Who requested a cancellation, recorded in the audit log.
#[derive(Debug, Clone)]
pub enum Actor {
    /// The owning principal, self-service.
    Principal(PrincipalId),
    /// A support operator acting on the account.
    Operator(String),
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Principal(id) => write!(f, "principal {id}"),
            Self::Operator(name) => write!(f, "operator {name}"),
        }
    }
}

/// Checkout request for an individual subscription.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    /// Buying principal.
    pub principal_id: PrincipalId,
    /// Assistant being unlocked.
    pub assistant_id: AssistantId,
    /// Billing cadence.
    pub cadence: Cadence,
    /// Payment method chosen at checkout.
    pub payment_method: PaymentMethod,
    /// Gateway subscription id, when the gateway returned one synchronously.
    pub gateway_subscription_id: Option<GatewaySubscriptionId>,
    /// Gateway customer id.
    pub gateway_customer_id: Option<GatewayCustomerId>,
}

/// Checkout request for a package.
#[derive(Debug, Clone)]
pub struct NewPackage {
    /// Buying principal.
    pub principal_id: PrincipalId,
    /// Package size; `assistant_ids` must have exactly this many entries.
    pub size: PackageSize,
    /// Assistants the seats unlock, one per seat.
    pub assistant_ids: Vec<AssistantId>,
    /// Billing cadence.
    pub cadence: Cadence,
    /// Payment method chosen at checkout.
    pub payment_method: PaymentMethod,
    /// Gateway subscription id covering the whole package.
    pub gateway_subscription_id: Option<GatewaySubscriptionId>,
    /// Gateway customer id.
    pub gateway_customer_id: Option<GatewayCustomerId>,
}

fn checkout_reference(kind: &str, principal_id: &PrincipalId, now: DateTime<Utc>) -> String {
    format!("{kind}_{principal_id}_{}", now.timestamp())
}

/// Creates an individual subscription at checkout.
///
/// Card checkouts start active with a full paid period; boleto and PIX
/// start pending with no expiry until the gateway confirms settlement.
///
/// # Errors
///
/// Returns [`GateError::DuplicateEntitlement`] when the principal already
/// has a live subscription for the assistant, or
/// [`GateError::PricingUnavailable`] when the price table has no entry.
pub fn create_subscription<S: Store, P: PriceTable>(
    store: &S,
    prices: &P,
    request: NewSubscription,
    now: DateTime<Utc>,
) -> Result<Subscription> {
    let amount = prices.price(EntitlementKind::Individual, request.cadence)?;
    let status = request.payment_method.initial_status();
    let expires_at = (status == EntitlementStatus::Active)
        .then(|| request.cadence.expiry_from(now));

    let record = Subscription {
        id: SubscriptionId::new(Uuid::new_v4().to_string())?,
        external_reference: Some(checkout_reference("individual", &request.principal_id, now)),
        principal_id: request.principal_id,
        assistant_id: request.assistant_id,
        cadence: request.cadence,
        amount,
        status,
        gateway_subscription_id: request.gateway_subscription_id,
        gateway_customer_id: request.gateway_customer_id,
        expires_at,
        package_id: None,
        created_at: now,
        last_event_at: None,
        version: 0,
    };

    store.insert_subscription(record.clone())?;
    tracing::info!(
        subscription_id = %record.id,
        principal_id = %record.principal_id,
        status = %record.status,
        "subscription created at checkout"
    );
    Ok(record)
}

/// Creates a package and exactly `size` child subscriptions atomically.
///
/// # Errors
///
/// Returns [`GateError::InvalidOperation`] when the seat list does not
/// match the package size, [`GateError::DuplicateEntitlement`] when the
/// same assistant is listed twice, plus the same errors as
/// [`create_subscription`] for any seat.
pub fn create_package<S: Store, P: PriceTable>(
    store: &S,
    prices: &P,
    request: NewPackage,
    now: DateTime<Utc>,
) -> Result<(Package, Vec<Subscription>)> {
    if request.assistant_ids.len() != request.size.seats() {
        return Err(GateError::InvalidOperation(format!(
            "package of {} needs exactly {} assistants, got {}",
            request.size.seats(),
            request.size.seats(),
            request.assistant_ids.len()
        )));
    }
    // Two seats for one assistant would break the one-live-subscription
    // rule the moment both are written.
    let mut seen = std::collections::HashSet::new();
    for assistant_id in &request.assistant_ids {
        if !seen.insert(assistant_id) {
            return Err(GateError::DuplicateEntitlement {
                principal_id: request.principal_id.to_string(),
                assistant_id: assistant_id.to_string(),
            });
        }
    }

    let total_amount = prices.price(EntitlementKind::Package(request.size), request.cadence)?;
    let status = request.payment_method.initial_status();
    let expires_at = (status == EntitlementStatus::Active)
        .then(|| request.cadence.expiry_from(now));
    let seat_amount = total_amount / rust_decimal::Decimal::from(request.size.seats() as u64);

    let package = Package {
        id: PackageId::new(Uuid::new_v4().to_string())?,
        external_reference: Some(checkout_reference("package", &request.principal_id, now)),
        principal_id: request.principal_id.clone(),
        size: request.size,
        cadence: request.cadence,
        total_amount,
        status,
        gateway_subscription_id: request.gateway_subscription_id,
        gateway_customer_id: request.gateway_customer_id.clone(),
        expires_at,
        created_at: now,
        last_event_at: None,
        version: 0,
    };

    let children: Vec<Subscription> = request
        .assistant_ids
        .iter()
        .map(|assistant_id| {
            Ok(Subscription {
                id: SubscriptionId::new(Uuid::new_v4().to_string())?,
                principal_id: request.principal_id.clone(),
                assistant_id: assistant_id.clone(),
                cadence: request.cadence,
                amount: seat_amount,
                status,
                // Children carry no gateway ids of their own; the parent
                // package is what the gateway bills.
                gateway_subscription_id: None,
                gateway_customer_id: request.gateway_customer_id.clone(),
                external_reference: None,
                expires_at,
                package_id: Some(package.id.clone()),
                created_at: now,
                last_event_at: None,
                version: 0,
            })
        })
        .collect::<Result<_>>()?;

    store.insert_package(package.clone(), children.clone())?;
    tracing::info!(
        package_id = %package.id,
        principal_id = %package.principal_id,
        seats = children.len(),
        status = %package.status,
        "package created at checkout"
    );
    Ok((package, children))
}

/// Cancels a subscription on behalf of a user or operator.
///
/// Locally authoritative: the record is cancelled regardless of what the
/// gateway believes, and only a genuine later renewal can resurrect it.
/// Cancelling an already terminal record is a no-op that returns the
/// stored record unchanged.
///
/// Package seats cannot be cancelled individually: the parent package is
/// billed as one unit and every confirmed parent event cascades its status
/// back onto the seats, which would quietly undo a lone seat cancel. Use
/// [`cancel_package`] instead; the error names the parent.
///
/// # Errors
///
/// Returns [`GateError::NotFound`] for an unknown id,
/// [`GateError::InvalidOperation`] for a package seat, or
/// [`GateError::WriteConflict`] if the record kept changing under bounded
/// retries.
pub fn cancel<S: Store>(
    store: &S,
    subscription_id: &SubscriptionId,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<Subscription> {
    // Reconciler deliveries may race this write; a few re-reads settle it.
    let mut last_error = None;
    for _ in 0..3 {
        let record = store
            .subscription(subscription_id)?
            .ok_or_else(|| GateError::NotFound(format!("subscription {subscription_id}")))?;

        if let Some(package_id) = &record.package_id {
            return Err(GateError::InvalidOperation(format!(
                "subscription {subscription_id} is a seat of package {package_id}; \
                 cancel the package instead"
            )));
        }

        if record.status.is_terminal() {
            return Ok(record);
        }

        let from = record.status;
        let mut updated = record.clone();
        updated.status = EntitlementStatus::Cancelled;
        updated.last_event_at = Some(now);

        match store.cas_subscription(record.version, updated) {
            Ok(written) => {
                audit_log(
                    &ReconcileEvent::new(
                        ReconcileEventType::SubscriptionCancelled,
                        Uuid::new_v4(),
                    )
                    .with_record(format!("subscription {}", written.id))
                    .with_statuses(from.to_string(), written.status.to_string())
                    .with_reason(format!("cancelled by {actor}")),
                );
                return Ok(written);
            }
            Err(error) if crate::retry::is_retryable(&error) => last_error = Some(error),
            Err(error) => return Err(error),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        GateError::InvalidOperation("cancel retry loop exited without error".into())
    }))
}

/// Cancels a package and every seat with it, atomically.
///
/// Same local authority as [`cancel`]; the parent and all children move to
/// cancelled in one cascade so no seat can be left live or resurrected by
/// a later parent event replay.
///
/// # Errors
///
/// Returns [`GateError::NotFound`] for an unknown id, or
/// [`GateError::WriteConflict`] if the records kept changing under bounded
/// retries.
pub fn cancel_package<S: Store>(
    store: &S,
    package_id: &PackageId,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<Package> {
    let mut last_error = None;
    for _ in 0..3 {
        let package = store
            .package(package_id)?
            .ok_or_else(|| GateError::NotFound(format!("package {package_id}")))?;

        if package.status.is_terminal() {
            return Ok(package);
        }

        let from = package.status;
        let mut updated = package.clone();
        updated.status = EntitlementStatus::Cancelled;
        updated.last_event_at = Some(now);

        let child_updates = store
            .children_of(package_id)?
            .into_iter()
            .map(|child| {
                let mut next = child.clone();
                next.status = EntitlementStatus::Cancelled;
                next.last_event_at = Some(now);
                (child.version, next)
            })
            .collect();

        match store.cascade_package(package.version, updated.clone(), child_updates) {
            Ok(()) => {
                updated.version = package.version + 1;
                audit_log(
                    &ReconcileEvent::new(ReconcileEventType::SubscriptionCancelled, Uuid::new_v4())
                        .with_record(format!("package {}", updated.id))
                        .with_statuses(from.to_string(), updated.status.to_string())
                        .with_reason(format!("cancelled by {actor}")),
                );
                return Ok(updated);
            }
            Err(error) if crate::retry::is_retryable(&error) => last_error = Some(error),
            Err(error) => return Err(error),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        GateError::InvalidOperation("cancel retry loop exited without error".into())
    }))
}

//! Webhook reconciliation pipeline.
//!
//! One entry point, [`Reconciler::handle`], takes a raw gateway
//! notification and drives it through normalization, identity resolution,
//! transition planning, and a conditional write. Deliveries are
//! at-least-once and unordered, so every stage is built to be replayed:
//! planning is pure, writes are compare-and-swap, and losing a write race
//! means re-reading and re-planning from scratch.
//!
//! Only a malformed body is an error. Every other outcome, including an
//! event that matches nothing local, is acknowledged so the gateway stops
//! redelivering; the outcome is recorded in the returned [`Ack`] and in
//! the audit log.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::audit::{ReconcileEvent, ReconcileEventType, audit_log};
use crate::error::{GateError, Result};
use crate::gateway::{EventCategory, GatewayNotification, WebhookEvent};
use crate::identity::{IdentityResolver, ResolvedIdentity};
use crate::lifecycle::{EntitlementState, TransitionOutcome, plan_expiry, plan_transition};
use crate::model::{EntitlementStatus, Package, Subscription};
use crate::retry::{RetryPolicy, is_retryable, retry_conflicts};
use crate::store::Store;

/// What a delivery amounted to. Informational; every variant is a 200.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A lifecycle transition was written.
    Applied,
    /// The store already reflected the event.
    NoOp,
    /// The transition was refused as stale, terminal, or edge-less.
    Rejected,
    /// No local record or principal matched. Expected on a shared gateway.
    Unresolved,
    /// Unrecognized event type, dropped.
    Skipped,
    /// Retries were exhausted or the store misbehaved; flagged for manual
    /// reconciliation.
    Flagged,
}

impl std::fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Applied => "applied",
            Self::NoOp => "no_op",
            Self::Rejected => "rejected",
            Self::Unresolved => "unresolved",
            Self::Skipped => "skipped",
            Self::Flagged => "flagged",
        };
        f.write_str(s)
    }
}

/// Acknowledgement for one delivery.
#[derive(Debug, Clone)]
pub struct Ack {
    /// Correlation id assigned to the delivery; present in every audit
    /// entry it produced.
    pub request_id: Uuid,
    /// What happened.
    pub outcome: ReconcileOutcome,
}

/// Reconciles gateway deliveries against a store.
#[derive(Debug)]
pub struct Reconciler<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S: Store> Reconciler<S> {
    /// Creates a reconciler with the default retry policy.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { store, retry: RetryPolicy::default() }
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Read access to the underlying store, for callers that share it.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Parses and handles a raw webhook body.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::MalformedEvent`] for an unparseable body; see
    /// [`Reconciler::handle`] for the rest.
    pub async fn handle_json(&self, body: &str, received_at: DateTime<Utc>) -> Result<Ack> {
        let notification: GatewayNotification = serde_json::from_str(body)
            .map_err(|e| GateError::MalformedEvent(format!("unparseable body: {e}")))?;
        self.handle(notification, received_at).await
    }

    /// Handles one gateway notification end to end.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::MalformedEvent`] when the notification is
    /// structurally unusable, which the server surfaces as a 400. All
    /// other conditions are acknowledged and reported in the [`Ack`].
    pub async fn handle(
        &self,
        notification: GatewayNotification,
        received_at: DateTime<Utc>,
    ) -> Result<Ack> {
        let request_id = Uuid::new_v4();
        let event = WebhookEvent::from_notification(notification, received_at)?;

        let mut received = ReconcileEvent::new(ReconcileEventType::EventReceived, request_id)
            .with_gateway_event(format!("{:?}", event.event_type));
        if let Some(id) = &event.gateway_subscription_id {
            received = received.with_gateway_subscription_id(id.as_str());
        }
        if let Some(id) = &event.gateway_customer_id {
            received = received.with_gateway_customer_id(id.as_str());
        }
        audit_log(&received);

        if event.category() == EventCategory::Unknown {
            tracing::info!(
                request_id = %request_id,
                raw_status = event.raw_status.as_deref(),
                "unrecognized gateway event type, acknowledging"
            );
            return Ok(Ack { request_id, outcome: ReconcileOutcome::Skipped });
        }

        let outcome = match self.reconcile(&event, request_id, received_at).await {
            Ok(outcome) => outcome,
            Err(error) if is_retryable(&error) => {
                tracing::warn!(
                    request_id = %request_id,
                    error = %error,
                    "retries exhausted, flagging for manual reconciliation"
                );
                audit_log(
                    &ReconcileEvent::new(
                        ReconcileEventType::ManualReconciliationFlagged,
                        request_id,
                    )
                    .with_reason(error.to_string()),
                );
                ReconcileOutcome::Flagged
            }
            Err(error @ GateError::MalformedEvent(_)) => return Err(error),
            Err(error) => {
                // A store failure mid-reconciliation must not bounce the
                // delivery back to the gateway; it would redeliver forever.
                tracing::error!(
                    request_id = %request_id,
                    error = %error,
                    "reconciliation failed, flagging for manual reconciliation"
                );
                audit_log(
                    &ReconcileEvent::new(
                        ReconcileEventType::ManualReconciliationFlagged,
                        request_id,
                    )
                    .with_reason(error.to_string()),
                );
                ReconcileOutcome::Flagged
            }
        };

        Ok(Ack { request_id, outcome })
    }

    async fn reconcile(
        &self,
        event: &WebhookEvent,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let resolver = IdentityResolver::new(&self.store);
        let Some(resolved) = resolver.resolve(event)? else {
            tracing::warn!(
                request_id = %request_id,
                gateway_subscription_id = event
                    .gateway_subscription_id
                    .as_ref()
                    .map(|id| id.as_str()),
                external_reference = event.external_reference.as_deref(),
                "event matched no local record or principal"
            );
            audit_log(&ReconcileEvent::new(
                ReconcileEventType::IdentityUnresolved,
                request_id,
            ));
            return Ok(ReconcileOutcome::Unresolved);
        };

        match resolved {
            ResolvedIdentity::Subscription(subscription) => {
                if let Some(package_id) = subscription.package_id.clone() {
                    // A seat is never reconciled alone; its parent is
                    // authoritative and carries the cascade.
                    self.reconcile_package(&package_id, event, request_id, now).await
                } else {
                    self.reconcile_subscription(&subscription.id.clone(), event, request_id, now)
                        .await
                }
            }
            ResolvedIdentity::Package(package) => {
                self.reconcile_package(&package.id.clone(), event, request_id, now).await
            }
            ResolvedIdentity::Principal(principal) => {
                // Only the principal is known, typically a first payment
                // racing the checkout write. The best candidate is the
                // principal's most recent record still awaiting payment.
                let Some(pending) = self.store.latest_pending_for_principal(&principal.id)? else {
                    tracing::warn!(
                        request_id = %request_id,
                        principal_id = %principal.id,
                        "principal resolved but no pending record to attach the event to"
                    );
                    audit_log(
                        &ReconcileEvent::new(ReconcileEventType::IdentityUnresolved, request_id)
                            .with_reason("principal has no pending record"),
                    );
                    return Ok(ReconcileOutcome::Unresolved);
                };
                if let Some(package_id) = pending.package_id.clone() {
                    self.reconcile_package(&package_id, event, request_id, now).await
                } else {
                    self.reconcile_subscription(&pending.id.clone(), event, request_id, now).await
                }
            }
        }
    }

    async fn reconcile_subscription(
        &self,
        id: &crate::model::SubscriptionId,
        event: &WebhookEvent,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        retry_conflicts(&self.retry, || async {
            // Re-read inside the retry loop so a lost race re-plans
            // against the winner's state instead of replaying blindly.
            let record = self
                .store
                .subscription(id)?
                .ok_or_else(|| GateError::NotFound(format!("subscription {id}")))?;
            let state = EntitlementState::from(&record);

            match plan_transition(&state, event, Some(record.cadence)) {
                TransitionOutcome::Apply { status, expires_at } => {
                    let updated = apply_to_subscription(&record, event, status, expires_at);
                    let written = self.cas_subscription_audited(&record, updated, request_id)?;
                    audit_log(
                        &ReconcileEvent::new(ReconcileEventType::TransitionApplied, request_id)
                            .with_gateway_event(format!("{:?}", event.event_type))
                            .with_record(format!("subscription {}", written.id))
                            .with_statuses(record.status.to_string(), written.status.to_string()),
                    );
                    Ok(ReconcileOutcome::Applied)
                }
                TransitionOutcome::NoOp => {
                    audit_log(
                        &ReconcileEvent::new(ReconcileEventType::TransitionNoOp, request_id)
                            .with_record(format!("subscription {}", record.id)),
                    );
                    self.sweep_subscription(&record, request_id, now)?;
                    Ok(ReconcileOutcome::NoOp)
                }
                TransitionOutcome::Rejected(reason) => {
                    audit_log(
                        &ReconcileEvent::new(ReconcileEventType::TransitionRejected, request_id)
                            .with_gateway_event(format!("{:?}", event.event_type))
                            .with_record(format!("subscription {}", record.id))
                            .with_reason(reason.to_string()),
                    );
                    self.sweep_subscription(&record, request_id, now)?;
                    Ok(ReconcileOutcome::Rejected)
                }
            }
        })
        .await
    }

    async fn reconcile_package(
        &self,
        id: &crate::model::PackageId,
        event: &WebhookEvent,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        retry_conflicts(&self.retry, || async {
            let package = self
                .store
                .package(id)?
                .ok_or_else(|| GateError::NotFound(format!("package {id}")))?;
            let children = self.store.children_of(id)?;
            let state = EntitlementState::from(&package);

            match plan_transition(&state, event, Some(package.cadence)) {
                TransitionOutcome::Apply { status, expires_at } => {
                    let from = package.status;
                    let mut updated = package.clone();
                    updated.status = status;
                    updated.expires_at = expires_at;
                    updated.last_event_at = Some(event.event_timestamp);
                    backfill_package_ids(&mut updated, event);

                    // Parent is authoritative: every child takes the
                    // parent's new status in the same transaction.
                    let child_updates = children
                        .iter()
                        .map(|child| {
                            let mut next = child.clone();
                            next.status = status;
                            next.last_event_at = Some(event.event_timestamp);
                            if event.category() == EventCategory::Confirmed {
                                next.expires_at = expires_at;
                            }
                            (child.version, next)
                        })
                        .collect();

                    match self.store.cascade_package(package.version, updated, child_updates) {
                        Ok(()) => {}
                        Err(error) if is_retryable(&error) => {
                            audit_log(
                                &ReconcileEvent::new(
                                    ReconcileEventType::WriteConflictRetried,
                                    request_id,
                                )
                                .with_record(format!("package {}", package.id))
                                .with_reason(error.to_string()),
                            );
                            return Err(error);
                        }
                        Err(error) => return Err(error),
                    }

                    audit_log(
                        &ReconcileEvent::new(ReconcileEventType::CascadeApplied, request_id)
                            .with_gateway_event(format!("{:?}", event.event_type))
                            .with_record(format!("package {}", package.id))
                            .with_statuses(from.to_string(), status.to_string()),
                    );
                    Ok(ReconcileOutcome::Applied)
                }
                TransitionOutcome::NoOp => {
                    audit_log(
                        &ReconcileEvent::new(ReconcileEventType::TransitionNoOp, request_id)
                            .with_record(format!("package {}", package.id)),
                    );
                    self.sweep_package(&package, &children, request_id, now)?;
                    Ok(ReconcileOutcome::NoOp)
                }
                TransitionOutcome::Rejected(reason) => {
                    audit_log(
                        &ReconcileEvent::new(ReconcileEventType::TransitionRejected, request_id)
                            .with_gateway_event(format!("{:?}", event.event_type))
                            .with_record(format!("package {}", package.id))
                            .with_reason(reason.to_string()),
                    );
                    self.sweep_package(&package, &children, request_id, now)?;
                    Ok(ReconcileOutcome::Rejected)
                }
            }
        })
        .await
    }

    fn cas_subscription_audited(
        &self,
        before: &Subscription,
        updated: Subscription,
        request_id: Uuid,
    ) -> Result<Subscription> {
        match self.store.cas_subscription(before.version, updated) {
            Ok(written) => Ok(written),
            Err(error) if is_retryable(&error) => {
                audit_log(
                    &ReconcileEvent::new(ReconcileEventType::WriteConflictRetried, request_id)
                        .with_record(format!("subscription {}", before.id))
                        .with_reason(error.to_string()),
                );
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Piggybacked expiry sweep: a delivery that changed nothing still
    /// gives an overdue record past its grace window the chance to expire.
    fn sweep_subscription(
        &self,
        record: &Subscription,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let state = EntitlementState::from(record);
        if let Some(TransitionOutcome::Apply { status, expires_at }) = plan_expiry(&state, now) {
            let mut updated = record.clone();
            updated.status = status;
            updated.expires_at = expires_at;
            let written = self.cas_subscription_audited(record, updated, request_id)?;
            audit_log(
                &ReconcileEvent::new(ReconcileEventType::TransitionApplied, request_id)
                    .with_record(format!("subscription {}", written.id))
                    .with_statuses(record.status.to_string(), written.status.to_string())
                    .with_reason("overdue grace window lapsed"),
            );
        }
        Ok(())
    }

    fn sweep_package(
        &self,
        package: &Package,
        children: &[Subscription],
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let state = EntitlementState::from(package);
        if let Some(TransitionOutcome::Apply { status, expires_at }) = plan_expiry(&state, now) {
            let mut updated = package.clone();
            updated.status = status;
            updated.expires_at = expires_at;
            let child_updates = children
                .iter()
                .map(|child| {
                    let mut next = child.clone();
                    next.status = status;
                    (child.version, next)
                })
                .collect();
            self.store.cascade_package(package.version, updated, child_updates)?;
            audit_log(
                &ReconcileEvent::new(ReconcileEventType::CascadeApplied, request_id)
                    .with_record(format!("package {}", package.id))
                    .with_statuses(package.status.to_string(), status.to_string())
                    .with_reason("overdue grace window lapsed"),
            );
        }
        Ok(())
    }
}

fn apply_to_subscription(
    record: &Subscription,
    event: &WebhookEvent,
    status: EntitlementStatus,
    expires_at: Option<DateTime<Utc>>,
) -> Subscription {
    let mut updated = record.clone();
    updated.status = status;
    updated.expires_at = expires_at;
    updated.last_event_at = Some(event.event_timestamp);
    // First-payment events often arrive before the gateway ids were
    // persisted at checkout; a confirmation is the moment to backfill them
    // so the next event resolves on the strongest signal.
    if event.category() == EventCategory::Confirmed {
        if updated.gateway_subscription_id.is_none() {
            updated.gateway_subscription_id = event.gateway_subscription_id.clone();
        }
        if updated.gateway_customer_id.is_none() {
            updated.gateway_customer_id = event.gateway_customer_id.clone();
        }
    }
    updated
}

fn backfill_package_ids(package: &mut Package, event: &WebhookEvent) {
    if event.category() == EventCategory::Confirmed {
        if package.gateway_subscription_id.is_none() {
            package.gateway_subscription_id = event.gateway_subscription_id.clone();
        }
        if package.gateway_customer_id.is_none() {
            package.gateway_customer_id = event.gateway_customer_id.clone();
        }
    }
}

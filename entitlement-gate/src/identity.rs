//! Maps inbound webhook events to local records or principals.
//!
//! Not every event type carries a stable foreign key, so resolution walks a
//! prioritized fallback chain and stops at the first hit:
//!
//! 1. Exact match on `gateway_subscription_id` against stored subscriptions
//!    and packages. Strongest signal, set at creation.
//! 2. The checkout `external_reference`, either as an exact match against a
//!    stored record or, failing that, by extracting the embedded principal
//!    UUID (`{kind}_{principal_uuid}_{timestamp}`). This covers
//!    first-payment events that can arrive before the gateway subscription
//!    id was persisted.
//! 3. The gateway customer id mapping on the principal, the last resort for
//!    legacy records.
//!
//! A miss is expected noise, not an error: the event may legitimately
//! belong to an unrelated account on the shared gateway.

use uuid::Uuid;

use crate::error::Result;
use crate::gateway::WebhookEvent;
use crate::model::{Package, Principal, PrincipalId, Subscription};
use crate::store::Store;

/// What an event was matched to.
#[derive(Debug, Clone)]
pub enum ResolvedIdentity {
    /// A specific subscription record.
    Subscription(Subscription),
    /// A specific package record.
    Package(Package),
    /// Only the owning principal; the reconciler picks the record.
    Principal(Principal),
}

/// Extracts the 36-character hyphenated principal UUID from a checkout
/// reference of the form `{kind}_{principal_uuid}_{timestamp}`.
///
/// The kind prefix may itself contain underscores, so every segment is
/// tried rather than assuming a fixed position.
#[must_use]
pub fn parse_external_reference(reference: &str) -> Option<Uuid> {
    reference
        .split('_')
        .filter(|segment| segment.len() == 36)
        .find_map(|segment| Uuid::parse_str(segment).ok())
}

/// Resolves events against a store. Stateless; borrow one per call site.
#[derive(Debug)]
pub struct IdentityResolver<'a, S> {
    store: &'a S,
}

impl<'a, S: Store> IdentityResolver<'a, S> {
    /// Creates a resolver over the given store.
    #[must_use]
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Walks the fallback chain. `Ok(None)` means the event matched
    /// nothing local and should be acknowledged and dropped.
    pub fn resolve(&self, event: &WebhookEvent) -> Result<Option<ResolvedIdentity>> {
        // 1. Gateway subscription id, the strongest signal.
        if let Some(gateway_id) = &event.gateway_subscription_id {
            if let Some(subscription) = self.store.find_subscription_by_gateway_id(gateway_id)? {
                tracing::debug!(
                    gateway_subscription_id = gateway_id.as_str(),
                    subscription_id = %subscription.id,
                    "resolved via gateway subscription id"
                );
                return Ok(Some(ResolvedIdentity::Subscription(subscription)));
            }
            if let Some(package) = self.store.find_package_by_gateway_id(gateway_id)? {
                tracing::debug!(
                    gateway_subscription_id = gateway_id.as_str(),
                    package_id = %package.id,
                    "resolved via gateway subscription id"
                );
                return Ok(Some(ResolvedIdentity::Package(package)));
            }
        }

        // 2. Checkout reference: exact record match first, embedded
        //    principal UUID second.
        if let Some(reference) = &event.external_reference {
            if let Some(subscription) =
                self.store.find_subscription_by_external_reference(reference)?
            {
                tracing::debug!(
                    external_reference = reference,
                    subscription_id = %subscription.id,
                    "resolved via external reference"
                );
                return Ok(Some(ResolvedIdentity::Subscription(subscription)));
            }
            if let Some(package) = self.store.find_package_by_external_reference(reference)? {
                tracing::debug!(
                    external_reference = reference,
                    package_id = %package.id,
                    "resolved via external reference"
                );
                return Ok(Some(ResolvedIdentity::Package(package)));
            }
            if let Some(uuid) = parse_external_reference(reference) {
                let principal_id = PrincipalId::new(uuid.to_string())?;
                if let Some(principal) = self.store.principal(&principal_id)? {
                    tracing::debug!(
                        external_reference = reference,
                        principal_id = %principal.id,
                        "resolved via principal uuid in external reference"
                    );
                    return Ok(Some(ResolvedIdentity::Principal(principal)));
                }
            }
        }

        // 3. Customer id mapping, last resort.
        if let Some(customer_id) = &event.gateway_customer_id
            && let Some(principal) = self.store.find_principal_by_customer_id(customer_id)?
        {
            tracing::debug!(
                gateway_customer_id = customer_id.as_str(),
                principal_id = %principal.id,
                "resolved via gateway customer id"
            );
            return Ok(Some(ResolvedIdentity::Principal(principal)));
        }

        Ok(None)
    }
}

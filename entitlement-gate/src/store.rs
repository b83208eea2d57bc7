//! Entitlement store abstraction and the in-memory reference implementation.
//!
//! All coordination between concurrently processed webhook deliveries goes
//! through the store's conditional writes: every mutation is a
//! compare-and-swap on a record's version token, and package cascades are
//! applied as one all-or-nothing operation. There is no other shared
//! mutable state anywhere in the crate.
//!
//! [`MemoryStore`] backs the tests and the bundled server binary. A
//! persistent backend implements the same [`Store`] trait with identical
//! conditional-write semantics.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::error::{GateError, Result};
use crate::model::{
    AssistantId, GatewayCustomerId, GatewaySubscriptionId, Institution, InstitutionId,
    InstitutionalLicense, Membership, Package, PackageId, Principal, PrincipalId, Subscription,
    SubscriptionId,
};

/// One institutional access path of a principal, joined in a single read.
#[derive(Debug, Clone)]
pub struct InstitutionGrant {
    /// The principal's membership record.
    pub membership: Membership,
    /// The institution, when it still exists.
    pub institution: Option<Institution>,
    /// The institution's license, when one was provisioned.
    pub license: Option<InstitutionalLicense>,
}

/// Everything that could grant a principal access, fetched in one store
/// round trip. This is what keeps `has_access_batch` O(1) in store calls.
#[derive(Debug, Clone, Default)]
pub struct PrincipalEntitlements {
    /// All subscriptions owned by the principal, any status.
    pub subscriptions: Vec<Subscription>,
    /// All packages owned by the principal, any status.
    pub packages: Vec<Package>,
    /// Institutional grants via memberships.
    pub institutions: Vec<InstitutionGrant>,
}

/// Persistent store of entitlement records.
///
/// Writes are conditional: `cas_*` succeed only when the caller proves it
/// saw the latest version. Readers get plain snapshots. Implementations
/// must be safe for unbounded concurrent callers.
pub trait Store: Send + Sync {
    /// Fetches a subscription by id.
    fn subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>>;

    /// Fetches a package by id.
    fn package(&self, id: &PackageId) -> Result<Option<Package>>;

    /// Fetches a principal by id.
    fn principal(&self, id: &PrincipalId) -> Result<Option<Principal>>;

    /// Fetches an institution by id.
    fn institution(&self, id: &InstitutionId) -> Result<Option<Institution>>;

    /// Fetches an institution's license.
    fn license(&self, id: &InstitutionId) -> Result<Option<InstitutionalLicense>>;

    /// Finds the subscription holding this gateway subscription id.
    fn find_subscription_by_gateway_id(
        &self,
        id: &GatewaySubscriptionId,
    ) -> Result<Option<Subscription>>;

    /// Finds the package holding this gateway subscription id.
    fn find_package_by_gateway_id(&self, id: &GatewaySubscriptionId) -> Result<Option<Package>>;

    /// Finds the subscription created with this checkout reference.
    fn find_subscription_by_external_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Subscription>>;

    /// Finds the package created with this checkout reference.
    fn find_package_by_external_reference(&self, reference: &str) -> Result<Option<Package>>;

    /// Finds the principal mapped to this gateway customer.
    fn find_principal_by_customer_id(&self, id: &GatewayCustomerId) -> Result<Option<Principal>>;

    /// The principal's live (pending, active, or overdue) subscription for
    /// an assistant, if any. There is at most one by invariant.
    fn live_subscription_for(
        &self,
        principal_id: &PrincipalId,
        assistant_id: &AssistantId,
    ) -> Result<Option<Subscription>>;

    /// The most recently created pending record of a principal, used when a
    /// first-payment event arrives before gateway ids were persisted.
    fn latest_pending_for_principal(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<Option<Subscription>>;

    /// All child subscriptions of a package.
    fn children_of(&self, package_id: &PackageId) -> Result<Vec<Subscription>>;

    /// Inserts a new subscription.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::DuplicateEntitlement`] when the principal
    /// already has a live subscription for the same assistant. The existing
    /// record is never overwritten.
    fn insert_subscription(&self, record: Subscription) -> Result<()>;

    /// Inserts a package together with all of its children, atomically.
    ///
    /// The duplicate-live rule of [`Store::insert_subscription`] applies to
    /// every child, against stored records and against the other children
    /// in the same batch. On any conflict nothing is written.
    fn insert_package(&self, package: Package, children: Vec<Subscription>) -> Result<()>;

    /// Conditionally replaces a subscription.
    ///
    /// `expected_version` must equal the stored version; on success the
    /// record is written with the version bumped and returned.
    ///
    /// # Errors
    ///
    /// [`GateError::WriteConflict`] when another writer got there first,
    /// [`GateError::NotFound`] when the record does not exist.
    fn cas_subscription(&self, expected_version: u64, record: Subscription)
    -> Result<Subscription>;

    /// Conditionally replaces a package. Same contract as
    /// [`Store::cas_subscription`].
    fn cas_package(&self, expected_version: u64, record: Package) -> Result<Package>;

    /// Applies a package update and all child updates as one transaction.
    ///
    /// Either every record is written or none is. A version mismatch on any
    /// participant fails the whole cascade with
    /// [`GateError::WriteConflict`], and a child that does not belong to the
    /// package fails it with [`GateError::CascadeIncomplete`]; both leave the
    /// store untouched so the caller can re-read and retry the cascade as a
    /// whole.
    fn cascade_package(
        &self,
        expected_package_version: u64,
        package: Package,
        children: Vec<(u64, Subscription)>,
    ) -> Result<()>;

    /// Every record that could grant this principal access, in one call.
    fn entitlements_for_principal(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<PrincipalEntitlements>;

    /// Creates or replaces a principal. Provisioning path, unconditional.
    fn upsert_principal(&self, principal: Principal) -> Result<()>;

    /// Creates or replaces an institution. Provisioning path.
    fn upsert_institution(&self, institution: Institution) -> Result<()>;

    /// Creates or replaces an institutional license. Provisioning path.
    fn upsert_license(&self, license: InstitutionalLicense) -> Result<()>;
}

// The reconciler and the access engine usually share one store.
impl<S: Store + ?Sized> Store for std::sync::Arc<S> {
    fn subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>> {
        (**self).subscription(id)
    }

    fn package(&self, id: &PackageId) -> Result<Option<Package>> {
        (**self).package(id)
    }

    fn principal(&self, id: &PrincipalId) -> Result<Option<Principal>> {
        (**self).principal(id)
    }

    fn institution(&self, id: &InstitutionId) -> Result<Option<Institution>> {
        (**self).institution(id)
    }

    fn license(&self, id: &InstitutionId) -> Result<Option<InstitutionalLicense>> {
        (**self).license(id)
    }

    fn find_subscription_by_gateway_id(
        &self,
        id: &GatewaySubscriptionId,
    ) -> Result<Option<Subscription>> {
        (**self).find_subscription_by_gateway_id(id)
    }

    fn find_package_by_gateway_id(&self, id: &GatewaySubscriptionId) -> Result<Option<Package>> {
        (**self).find_package_by_gateway_id(id)
    }

    fn find_subscription_by_external_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Subscription>> {
        (**self).find_subscription_by_external_reference(reference)
    }

    fn find_package_by_external_reference(&self, reference: &str) -> Result<Option<Package>> {
        (**self).find_package_by_external_reference(reference)
    }

    fn find_principal_by_customer_id(&self, id: &GatewayCustomerId) -> Result<Option<Principal>> {
        (**self).find_principal_by_customer_id(id)
    }

    fn live_subscription_for(
        &self,
        principal_id: &PrincipalId,
        assistant_id: &AssistantId,
    ) -> Result<Option<Subscription>> {
        (**self).live_subscription_for(principal_id, assistant_id)
    }

    fn latest_pending_for_principal(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<Option<Subscription>> {
        (**self).latest_pending_for_principal(principal_id)
    }

    fn children_of(&self, package_id: &PackageId) -> Result<Vec<Subscription>> {
        (**self).children_of(package_id)
    }

    fn insert_subscription(&self, record: Subscription) -> Result<()> {
        (**self).insert_subscription(record)
    }

    fn insert_package(&self, package: Package, children: Vec<Subscription>) -> Result<()> {
        (**self).insert_package(package, children)
    }

    fn cas_subscription(
        &self,
        expected_version: u64,
        record: Subscription,
    ) -> Result<Subscription> {
        (**self).cas_subscription(expected_version, record)
    }

    fn cas_package(&self, expected_version: u64, record: Package) -> Result<Package> {
        (**self).cas_package(expected_version, record)
    }

    fn cascade_package(
        &self,
        expected_package_version: u64,
        package: Package,
        children: Vec<(u64, Subscription)>,
    ) -> Result<()> {
        (**self).cascade_package(expected_package_version, package, children)
    }

    fn entitlements_for_principal(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<PrincipalEntitlements> {
        (**self).entitlements_for_principal(principal_id)
    }

    fn upsert_principal(&self, principal: Principal) -> Result<()> {
        (**self).upsert_principal(principal)
    }

    fn upsert_institution(&self, institution: Institution) -> Result<()> {
        (**self).upsert_institution(institution)
    }

    fn upsert_license(&self, license: InstitutionalLicense) -> Result<()> {
        (**self).upsert_license(license)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    packages: HashMap<PackageId, Package>,
    principals: HashMap<PrincipalId, Principal>,
    institutions: HashMap<InstitutionId, Institution>,
    licenses: HashMap<InstitutionId, InstitutionalLicense>,
}

/// In-memory [`Store`] with full conditional-write semantics.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn conflict(entity: String, expected: u64, found: u64) -> GateError {
    GateError::WriteConflict { entity, expected, found }
}

impl Store for MemoryStore {
    fn subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>> {
        Ok(self.read().subscriptions.get(id).cloned())
    }

    fn package(&self, id: &PackageId) -> Result<Option<Package>> {
        Ok(self.read().packages.get(id).cloned())
    }

    fn principal(&self, id: &PrincipalId) -> Result<Option<Principal>> {
        Ok(self.read().principals.get(id).cloned())
    }

    fn institution(&self, id: &InstitutionId) -> Result<Option<Institution>> {
        Ok(self.read().institutions.get(id).cloned())
    }

    fn license(&self, id: &InstitutionId) -> Result<Option<InstitutionalLicense>> {
        Ok(self.read().licenses.get(id).cloned())
    }

    fn find_subscription_by_gateway_id(
        &self,
        id: &GatewaySubscriptionId,
    ) -> Result<Option<Subscription>> {
        Ok(self
            .read()
            .subscriptions
            .values()
            .find(|s| s.gateway_subscription_id.as_ref() == Some(id))
            .cloned())
    }

    fn find_package_by_gateway_id(&self, id: &GatewaySubscriptionId) -> Result<Option<Package>> {
        Ok(self
            .read()
            .packages
            .values()
            .find(|p| p.gateway_subscription_id.as_ref() == Some(id))
            .cloned())
    }

    fn find_subscription_by_external_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Subscription>> {
        Ok(self
            .read()
            .subscriptions
            .values()
            .find(|s| s.external_reference.as_deref() == Some(reference))
            .cloned())
    }

    fn find_package_by_external_reference(&self, reference: &str) -> Result<Option<Package>> {
        Ok(self
            .read()
            .packages
            .values()
            .find(|p| p.external_reference.as_deref() == Some(reference))
            .cloned())
    }

    fn find_principal_by_customer_id(&self, id: &GatewayCustomerId) -> Result<Option<Principal>> {
        Ok(self
            .read()
            .principals
            .values()
            .find(|p| p.gateway_customer_id.as_ref() == Some(id))
            .cloned())
    }

    fn live_subscription_for(
        &self,
        principal_id: &PrincipalId,
        assistant_id: &AssistantId,
    ) -> Result<Option<Subscription>> {
        Ok(self
            .read()
            .subscriptions
            .values()
            .find(|s| {
                s.principal_id == *principal_id
                    && s.assistant_id == *assistant_id
                    && s.status.is_live()
            })
            .cloned())
    }

    fn latest_pending_for_principal(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<Option<Subscription>> {
        Ok(self
            .read()
            .subscriptions
            .values()
            .filter(|s| {
                s.principal_id == *principal_id
                    && s.status == crate::model::EntitlementStatus::Pending
            })
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    fn children_of(&self, package_id: &PackageId) -> Result<Vec<Subscription>> {
        let mut children: Vec<Subscription> = self
            .read()
            .subscriptions
            .values()
            .filter(|s| s.package_id.as_ref() == Some(package_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(children)
    }

    fn insert_subscription(&self, record: Subscription) -> Result<()> {
        let mut state = self.write();
        if state.subscriptions.contains_key(&record.id) {
            return Err(GateError::InvalidOperation(format!(
                "subscription {} already exists",
                record.id
            )));
        }
        let duplicate = state.subscriptions.values().any(|s| {
            s.principal_id == record.principal_id
                && s.assistant_id == record.assistant_id
                && s.status.is_live()
        });
        if duplicate && record.status.is_live() {
            return Err(GateError::DuplicateEntitlement {
                principal_id: record.principal_id.to_string(),
                assistant_id: record.assistant_id.to_string(),
            });
        }
        state.subscriptions.insert(record.id.clone(), record);
        Ok(())
    }

    fn insert_package(&self, package: Package, children: Vec<Subscription>) -> Result<()> {
        let mut state = self.write();
        if state.packages.contains_key(&package.id) {
            return Err(GateError::InvalidOperation(format!(
                "package {} already exists",
                package.id
            )));
        }
        for (n, child) in children.iter().enumerate() {
            if state.subscriptions.contains_key(&child.id) {
                return Err(GateError::InvalidOperation(format!(
                    "subscription {} already exists",
                    child.id
                )));
            }
            // Live duplicates can come from already-stored records or from
            // another seat in this same batch.
            let duplicate = state
                .subscriptions
                .values()
                .map(|s| (&s.principal_id, &s.assistant_id, s.status))
                .chain(
                    children[..n]
                        .iter()
                        .map(|s| (&s.principal_id, &s.assistant_id, s.status)),
                )
                .any(|(principal_id, assistant_id, status)| {
                    *principal_id == child.principal_id
                        && *assistant_id == child.assistant_id
                        && status.is_live()
                });
            if duplicate && child.status.is_live() {
                return Err(GateError::DuplicateEntitlement {
                    principal_id: child.principal_id.to_string(),
                    assistant_id: child.assistant_id.to_string(),
                });
            }
        }
        // Validation passed for every participant; now write all of them.
        state.packages.insert(package.id.clone(), package);
        for child in children {
            state.subscriptions.insert(child.id.clone(), child);
        }
        Ok(())
    }

    fn cas_subscription(
        &self,
        expected_version: u64,
        mut record: Subscription,
    ) -> Result<Subscription> {
        let mut state = self.write();
        let stored = state
            .subscriptions
            .get(&record.id)
            .ok_or_else(|| GateError::NotFound(format!("subscription {}", record.id)))?;
        if stored.version != expected_version {
            return Err(conflict(
                format!("subscription {}", record.id),
                expected_version,
                stored.version,
            ));
        }
        record.version = expected_version + 1;
        state.subscriptions.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    fn cas_package(&self, expected_version: u64, mut record: Package) -> Result<Package> {
        let mut state = self.write();
        let stored = state
            .packages
            .get(&record.id)
            .ok_or_else(|| GateError::NotFound(format!("package {}", record.id)))?;
        if stored.version != expected_version {
            return Err(conflict(
                format!("package {}", record.id),
                expected_version,
                stored.version,
            ));
        }
        record.version = expected_version + 1;
        state.packages.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    fn cascade_package(
        &self,
        expected_package_version: u64,
        mut package: Package,
        children: Vec<(u64, Subscription)>,
    ) -> Result<()> {
        let mut state = self.write();

        // Validate every participant before touching anything, so a version
        // mismatch anywhere leaves the store exactly as it was.
        let stored = state
            .packages
            .get(&package.id)
            .ok_or_else(|| GateError::NotFound(format!("package {}", package.id)))?;
        if stored.version != expected_package_version {
            return Err(conflict(
                format!("package {}", package.id),
                expected_package_version,
                stored.version,
            ));
        }
        for (expected, child) in &children {
            if child.package_id.as_ref() != Some(&package.id) {
                return Err(GateError::CascadeIncomplete(format!(
                    "subscription {} is not a seat of package {}",
                    child.id, package.id
                )));
            }
            let stored = state
                .subscriptions
                .get(&child.id)
                .ok_or_else(|| GateError::NotFound(format!("subscription {}", child.id)))?;
            if stored.version != *expected {
                return Err(conflict(
                    format!("subscription {}", child.id),
                    *expected,
                    stored.version,
                ));
            }
        }

        package.version = expected_package_version + 1;
        state.packages.insert(package.id.clone(), package);
        for (expected, mut child) in children {
            child.version = expected + 1;
            state.subscriptions.insert(child.id.clone(), child);
        }
        Ok(())
    }

    fn entitlements_for_principal(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<PrincipalEntitlements> {
        let state = self.read();
        let subscriptions = state
            .subscriptions
            .values()
            .filter(|s| s.principal_id == *principal_id)
            .cloned()
            .collect();
        let packages = state
            .packages
            .values()
            .filter(|p| p.principal_id == *principal_id)
            .cloned()
            .collect();
        let institutions = state
            .principals
            .get(principal_id)
            .map(|principal| {
                principal
                    .memberships
                    .iter()
                    .map(|membership| InstitutionGrant {
                        membership: membership.clone(),
                        institution: state.institutions.get(&membership.institution_id).cloned(),
                        license: state.licenses.get(&membership.institution_id).cloned(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(PrincipalEntitlements { subscriptions, packages, institutions })
    }

    fn upsert_principal(&self, principal: Principal) -> Result<()> {
        self.write().principals.insert(principal.id.clone(), principal);
        Ok(())
    }

    fn upsert_institution(&self, institution: Institution) -> Result<()> {
        self.write().institutions.insert(institution.id.clone(), institution);
        Ok(())
    }

    fn upsert_license(&self, license: InstitutionalLicense) -> Result<()> {
        self.write().licenses.insert(license.institution_id.clone(), license);
        Ok(())
    }
}

//! Read-only entitlement checks.
//!
//! Answers one question: may this principal use this assistant right now?
//! Three paths can say yes, checked in order of specificity: an individual
//! subscription, a package seat, and an institutional license. The engine
//! never writes; an overdue record past its grace window stops granting
//! here immediately, while the stored status is expired lazily by the
//! reconciler.

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::Result;
use crate::lifecycle::OVERDUE_GRACE_DAYS;
use crate::model::{
    AssistantId, EntitlementStatus, GracePolicy, InstitutionId, PackageId, PrincipalId,
    SubscriptionId,
};
use crate::store::{InstitutionGrant, PrincipalEntitlements, Store};

/// Which path granted access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessVia {
    /// An individual subscription owned by the principal.
    Subscription(SubscriptionId),
    /// A seat in a package owned by the principal.
    PackageSeat(PackageId),
    /// An institutional license through an active membership.
    Institution(InstitutionId),
}

/// Every source that would grant access, independent of which one governs.
/// Callers use this for reporting, e.g. "covered by your school AND a
/// personal subscription".
#[derive(Debug, Clone, Default)]
pub struct AccessReport {
    /// Granting individual subscription, if any.
    pub individual: Option<SubscriptionId>,
    /// Granting package, if any.
    pub package: Option<PackageId>,
    /// Granting institution, if any.
    pub institution: Option<InstitutionId>,
}

/// Outcome of one access check.
#[derive(Debug, Clone)]
pub struct AccessDecision {
    /// Whether access is granted.
    pub granted: bool,
    /// The governing path, the first grant in individual, package,
    /// institution order.
    pub via: Option<AccessVia>,
    /// True when the governing record is overdue and access rides on the
    /// grace policy. Callers may surface a payment reminder.
    pub overdue: bool,
    /// All granting sources, for reporting.
    pub report: AccessReport,
}

/// Read-only access resolver over a store.
#[derive(Debug)]
pub struct AccessEngine<S> {
    store: S,
    policy: GracePolicy,
}

impl<S: Store> AccessEngine<S> {
    /// Creates an engine with the default grace policy.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { store, policy: GracePolicy::default() }
    }

    /// Overrides the grace policy.
    #[must_use]
    pub fn with_grace_policy(mut self, policy: GracePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Checks whether `principal_id` may use `assistant_id` at `now`.
    ///
    /// # Errors
    ///
    /// Propagates store failures; a clean miss is a denial, not an error.
    pub fn has_access(
        &self,
        principal_id: &PrincipalId,
        assistant_id: &AssistantId,
        now: DateTime<Utc>,
    ) -> Result<AccessDecision> {
        let entitlements = self.store.entitlements_for_principal(principal_id)?;
        Ok(self.decide(&entitlements, assistant_id, now))
    }

    /// Checks several assistants for one principal with a single store
    /// round trip.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn has_access_batch(
        &self,
        principal_id: &PrincipalId,
        assistant_ids: &[AssistantId],
        now: DateTime<Utc>,
    ) -> Result<Vec<(AssistantId, AccessDecision)>> {
        let entitlements = self.store.entitlements_for_principal(principal_id)?;
        Ok(assistant_ids
            .iter()
            .map(|assistant_id| {
                (assistant_id.clone(), self.decide(&entitlements, assistant_id, now))
            })
            .collect())
    }

    fn decide(
        &self,
        entitlements: &PrincipalEntitlements,
        assistant_id: &AssistantId,
        now: DateTime<Utc>,
    ) -> AccessDecision {
        let mut report = AccessReport::default();
        let mut individual_overdue = false;
        let mut package_overdue = false;

        // Individual subscription for this exact assistant.
        for subscription in &entitlements.subscriptions {
            if subscription.assistant_id != *assistant_id || subscription.package_id.is_some() {
                continue;
            }
            if self.record_grants(subscription.status, subscription.expires_at, now) {
                report.individual = Some(subscription.id.clone());
                individual_overdue = subscription.status == EntitlementStatus::Overdue;
                break;
            }
        }

        // Package seat. The seat's own status mirrors the parent after
        // every settled cascade, but the parent stays authoritative for
        // the decision.
        for subscription in &entitlements.subscriptions {
            if subscription.assistant_id != *assistant_id {
                continue;
            }
            let Some(package_id) = &subscription.package_id else { continue };
            let Some(package) = entitlements.packages.iter().find(|p| p.id == *package_id)
            else {
                continue;
            };
            if self.record_grants(package.status, package.expires_at, now) {
                report.package = Some(package.id.clone());
                package_overdue = package.status == EntitlementStatus::Overdue;
                break;
            }
        }

        // Institutional license.
        for grant in &entitlements.institutions {
            if self.institution_grants(grant, assistant_id, now) {
                report.institution = Some(grant.membership.institution_id.clone());
                break;
            }
        }

        // The first grant in priority order governs; the full report rides
        // along either way.
        let (via, overdue) = if let Some(id) = &report.individual {
            (Some(AccessVia::Subscription(id.clone())), individual_overdue)
        } else if let Some(id) = &report.package {
            (Some(AccessVia::PackageSeat(id.clone())), package_overdue)
        } else if let Some(id) = &report.institution {
            (Some(AccessVia::Institution(id.clone())), false)
        } else {
            (None, false)
        };

        AccessDecision { granted: via.is_some(), via, overdue, report }
    }

    fn record_grants(
        &self,
        status: EntitlementStatus,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        if !status.grants_access(self.policy) {
            return false;
        }
        // An overdue record keeps its standing only through the grace
        // window past its paid period; the reconciler may not have swept it
        // yet, so the bound is enforced here too. Active records must be
        // strictly within the paid period, and a grant always needs a
        // confirmed expiry on record.
        match status {
            EntitlementStatus::Active => expires_at.is_some_and(|expiry| now < expiry),
            EntitlementStatus::Overdue => expires_at
                .is_some_and(|expiry| now <= expiry + TimeDelta::days(OVERDUE_GRACE_DAYS)),
            _ => false,
        }
    }

    fn institution_grants(
        &self,
        grant: &InstitutionGrant,
        assistant_id: &AssistantId,
        now: DateTime<Utc>,
    ) -> bool {
        if !grant.membership.active {
            return false;
        }
        let Some(institution) = &grant.institution else {
            return false;
        };
        let Some(license) = &grant.license else {
            return false;
        };
        if !license.payment_status.grants_access() {
            return false;
        }
        if now > license.valid_until {
            return false;
        }
        if !institution.enabled_assistants.contains(assistant_id) {
            return false;
        }
        if let Some(cap) = license.max_users
            && institution.active_members > cap
        {
            return false;
        }
        true
    }
}

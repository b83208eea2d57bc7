//! Pricing table consumed at checkout and by the cadence-inference fallback.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::error::{GateError, Result};
use crate::model::{Cadence, PackageSize};

/// What is being priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntitlementKind {
    /// A single-assistant subscription.
    Individual,
    /// A package of subscriptions.
    Package(PackageSize),
}

impl std::fmt::Display for EntitlementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Individual => f.write_str("individual"),
            Self::Package(PackageSize::Three) => f.write_str("package-3"),
            Self::Package(PackageSize::Six) => f.write_str("package-6"),
        }
    }
}

/// Lookup of the amount charged per period for a kind and cadence.
pub trait PriceTable: Send + Sync {
    /// Returns the per-period amount.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::PricingUnavailable`] when no price is
    /// configured for the combination.
    fn price(&self, kind: EntitlementKind, cadence: Cadence) -> Result<Decimal>;
}

/// In-memory price table.
#[derive(Debug, Clone)]
pub struct StaticPriceTable {
    entries: HashMap<(EntitlementKind, Cadence), Decimal>,
}

impl StaticPriceTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Sets the price for one combination, replacing any existing entry.
    #[must_use]
    pub fn with_price(mut self, kind: EntitlementKind, cadence: Cadence, amount: Decimal) -> Self {
        self.entries.insert((kind, cadence), amount);
        self
    }
}

impl Default for StaticPriceTable {
    /// The launch price list.
    fn default() -> Self {
        Self::new()
            .with_price(EntitlementKind::Individual, Cadence::Monthly, Decimal::new(3990, 2))
            .with_price(EntitlementKind::Individual, Cadence::Semiannual, Decimal::new(19900, 2))
            .with_price(
                EntitlementKind::Package(PackageSize::Three),
                Cadence::Monthly,
                Decimal::new(9990, 2),
            )
            .with_price(
                EntitlementKind::Package(PackageSize::Three),
                Cadence::Semiannual,
                Decimal::new(49900, 2),
            )
            .with_price(
                EntitlementKind::Package(PackageSize::Six),
                Cadence::Monthly,
                Decimal::new(17990, 2),
            )
            .with_price(
                EntitlementKind::Package(PackageSize::Six),
                Cadence::Semiannual,
                Decimal::new(89900, 2),
            )
    }
}

impl PriceTable for StaticPriceTable {
    fn price(&self, kind: EntitlementKind, cadence: Cadence) -> Result<Decimal> {
        self.entries.get(&(kind, cadence)).copied().ok_or_else(|| {
            GateError::PricingUnavailable { kind: kind.to_string(), cadence: cadence.to_string() }
        })
    }
}

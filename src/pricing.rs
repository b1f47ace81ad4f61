// 💲 Pricing Resolver - unit price for one record
// Pure function of (record, registry, tariff table).

use rust_decimal::Decimal;

use crate::eligibility::EligibilityRegistry;
use crate::records::ServiceRecord;
use crate::tariff::{PricingTier, TariffTable};

/// Borrowing resolver: holds no state of its own.
#[derive(Debug, Clone, Copy)]
pub struct PricingResolver<'a> {
    table: &'a TariffTable,
    registry: &'a EligibilityRegistry,
}

impl<'a> PricingResolver<'a> {
    pub fn new(table: &'a TariffTable, registry: &'a EligibilityRegistry) -> Self {
        PricingResolver { table, registry }
    }

    /// Tier a patient is billed at
    pub fn tier_for(&self, patient_id: &str) -> PricingTier {
        if self.registry.is_preferential(patient_id) {
            PricingTier::Preferential
        } else {
            PricingTier::Standard
        }
    }

    /// Billable unit price for a record; 0 for unknown procedure codes.
    ///
    /// Physician-variable codes are priced by `physician_name`, falling back
    /// to the code's default entry.
    pub fn resolve(&self, record: &ServiceRecord) -> Decimal {
        let tier = self.tier_for(&record.patient_id);
        self.table
            .price_for_physician(&record.procedure_code, &record.physician_name, tier)
    }

    /// Whether the record's code has no configured price
    pub fn is_unpriced(&self, record: &ServiceRecord) -> bool {
        !self.table.contains(&record.procedure_code)
    }
}

// ============================================================================
// TESTS
// ============================================================================

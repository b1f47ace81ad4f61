// 📊 Aggregation Engine - financial summaries over processed rows
// Grand total = sum of unit_value over ALL rows, bundle rows included.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::records::ProcessedRecord;

/// Label used when a grouping key is blank
pub const UNKNOWN_GROUP: &str = "N/A";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTotals {
    pub session_count: u64,
    pub total_value: Decimal,
}

impl GroupTotals {
    fn add(&mut self, value: Decimal) {
        self.session_count += 1;
        self.total_value += value;
    }
}

/// Group key -> totals, iterated in key order for stable display
pub type Grouping = BTreeMap<String, GroupTotals>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialSummary {
    pub grand_total: Decimal,
    pub record_count: usize,
    pub bundle_count: usize,
    pub violation_count: usize,

    /// grand_total / record_count rounded to cents, 0 for an empty set
    pub average_value: Decimal,

    pub by_company: Grouping,
    pub by_procedure: Grouping,
    pub by_physician: Grouping,

    /// Keyed by "{patient_id} - {patient_name}"
    pub by_patient: Grouping,
}

impl FinancialSummary {
    pub fn summary(&self) -> String {
        format!(
            "{} rows, {} bundles, {} violations, total {}, average {}",
            self.record_count, self.bundle_count, self.violation_count, self.grand_total, self.average_value
        )
    }
}

// ============================================================================
// AGGREGATION ENGINE
// ============================================================================

#[derive(Debug, Default)]
pub struct AggregationEngine;

impl AggregationEngine {
    pub fn new() -> Self {
        AggregationEngine
    }

    pub fn summarize(&self, records: &[ProcessedRecord]) -> FinancialSummary {
        let mut summary = FinancialSummary {
            record_count: records.len(),
            ..FinancialSummary::default()
        };

        for record in records {
            let value = record.unit_value;
            summary.grand_total += value;

            if record.is_bundle_row {
                summary.bundle_count += 1;
            }
            if record.compliance_flag {
                summary.violation_count += 1;
            }

            add_to(&mut summary.by_company, &record.payer_company, value);
            add_to(&mut summary.by_procedure, &record.procedure_name, value);
            add_to(&mut summary.by_physician, &record.physician_name, value);
            add_to(&mut summary.by_patient, &record.patient_label(), value);
        }

        summary.average_value = average(summary.grand_total, summary.record_count);

        tracing::info!(
            rows = summary.record_count,
            bundles = summary.bundle_count,
            total = %summary.grand_total,
            "financial summary computed"
        );

        summary
    }
}

fn add_to(grouping: &mut Grouping, key: &str, value: Decimal) {
    let key = if key.trim().is_empty() { UNKNOWN_GROUP } else { key };
    grouping.entry(key.to_string()).or_default().add(value);
}

fn average(total: Decimal, count: usize) -> Decimal {
    if count == 0 {
        return Decimal::ZERO;
    }
    (total / Decimal::from(count)).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Sum of a grouping's values; equals the grand total for any grouping
pub fn grouping_total(grouping: &Grouping) -> Decimal {
    grouping.values().map(|g| g.total_value).sum()
}

// ============================================================================
// TESTS
// ============================================================================

// 🎼 Billing Orchestrator - one batch run, start to finish
// Fixed order: validate input -> detect bundles -> apply bundles ->
// payer compliance -> aggregate -> insights.
// A failed stage aborts the run; non-fatal findings become RunWarnings.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::aggregation::{AggregationEngine, FinancialSummary};
use crate::bundles::{Bundle, BundleApplier, BundleDetector, GroupingMode};
use crate::compliance::{PayerComplianceValidator, Violation};
use crate::config::BillingRules;
use crate::eligibility::EligibilityRegistry;
use crate::error::{BillingError, Result};
use crate::insights::{BatchInsights, DEFAULT_TOP_N};
use crate::pricing::PricingResolver;
use crate::records::{ProcessedRecord, ServiceRecord};
use crate::tariff::TariffTable;

// ============================================================================
// RESULT TYPES
// ============================================================================

/// Conditions that did not stop the run but that an operator should see
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunWarning {
    /// Roster could not be loaded; everyone was billed at standard prices
    RosterUnavailable { message: String },

    /// Eligible rows left out of monthly bundling for lack of a date
    UndatedEligibleRecords { count: usize },

    /// No eligible row had a date; bundles span the whole batch per patient
    WholePeriodGrouping { eligible_records: usize },

    /// Rows whose procedure code has no tariff entry (billed at 0)
    UnpricedProcedures { records: usize, codes: Vec<String> },
}

impl RunWarning {
    pub fn message(&self) -> String {
        match self {
            RunWarning::RosterUnavailable { message } => {
                format!("eligibility roster unavailable, standard pricing applied to everyone: {}", message)
            }
            RunWarning::UndatedEligibleRecords { count } => {
                format!("{} bundle-eligible records have no usable execution date", count)
            }
            RunWarning::WholePeriodGrouping { eligible_records } => format!(
                "no execution dates found, {} eligible records grouped per patient over the whole period",
                eligible_records
            ),
            RunWarning::UnpricedProcedures { records, codes } => format!(
                "{} records priced at 0, procedure codes without tariff: {}",
                records,
                codes.join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingResult {
    pub rules_version: String,
    pub input_records: usize,
    pub grouping_mode: GroupingMode,

    /// Original rows in input order, followed by one row per bundle
    pub processed_records: Vec<ProcessedRecord>,
    pub summary: FinancialSummary,
    pub bundles: Vec<Bundle>,
    pub violations: Vec<Violation>,
    pub insights: BatchInsights,
    pub warnings: Vec<RunWarning>,
}

impl BillingResult {
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct BillingOrchestrator {
    rules: BillingRules,
    table: TariffTable,
    top_n: usize,
}

impl BillingOrchestrator {
    /// Validates the rules once; every run reuses the same tariff table.
    pub fn new(rules: BillingRules) -> Result<Self> {
        rules.validate()?;
        let table = rules.tariff_table();
        Ok(BillingOrchestrator {
            rules,
            table,
            top_n: DEFAULT_TOP_N,
        })
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }

    pub fn rules(&self) -> &BillingRules {
        &self.rules
    }

    pub fn tariff_table(&self) -> &TariffTable {
        &self.table
    }

    pub fn run(&self, records: &[ServiceRecord], registry: &EligibilityRegistry) -> Result<BillingResult> {
        validate_input(records)?;

        tracing::info!(
            records = records.len(),
            preferential_patients = registry.len(),
            rules = %self.rules.version,
            "billing run started"
        );

        let resolver = PricingResolver::new(&self.table, registry);

        // 1. Bundles
        let detection = BundleDetector::new(&self.rules.bundle, resolver).detect_with_report(records);

        // 2. Pricing with bundled sessions zeroed
        let mut processed = BundleApplier::new(&self.rules.bundle, resolver).apply(records, &detection.bundles);

        // 3. Compliance over the post-bundle set
        let validator = PayerComplianceValidator::new(&self.rules.payers, &self.rules.exempt_payers);
        let violations = validator.annotate(&mut processed);

        // 4. Totals
        let summary = AggregationEngine::new().summarize(&processed);
        let insights = BatchInsights::compute(&processed, &detection.bundles, &self.table, self.top_n);

        let mut warnings = Vec::new();
        if detection.undated_eligible_records > 0 {
            warnings.push(RunWarning::UndatedEligibleRecords {
                count: detection.undated_eligible_records,
            });
        }
        if detection.mode == GroupingMode::WholePeriod && detection.eligible_records > 0 {
            warnings.push(RunWarning::WholePeriodGrouping {
                eligible_records: detection.eligible_records,
            });
        }
        if insights.unpriced_records > 0 {
            tracing::warn!(
                records = insights.unpriced_records,
                codes = ?insights.unpriced_codes,
                "procedure codes without tariff priced at 0"
            );
            warnings.push(RunWarning::UnpricedProcedures {
                records: insights.unpriced_records,
                codes: insights.unpriced_codes.clone(),
            });
        }

        tracing::info!(
            rows = processed.len(),
            bundles = detection.bundles.len(),
            violations = violations.len(),
            total = %summary.grand_total,
            warnings = warnings.len(),
            "billing run finished"
        );

        Ok(BillingResult {
            rules_version: self.rules.version.clone(),
            input_records: records.len(),
            grouping_mode: detection.mode,
            processed_records: processed,
            summary,
            bundles: detection.bundles,
            violations,
            insights,
            warnings,
        })
    }

    /// Run with a roster file; a roster that cannot be read degrades to
    /// standard pricing plus a `RosterUnavailable` warning.
    pub fn run_with_roster(&self, records: &[ServiceRecord], roster: Option<&Path>) -> Result<BillingResult> {
        let (registry, failure) = match roster {
            Some(path) => EligibilityRegistry::load_or_empty(path),
            None => (EligibilityRegistry::empty(), None),
        };

        let mut result = self.run(records, &registry)?;
        if let Some(message) = failure {
            result.warnings.insert(0, RunWarning::RosterUnavailable { message });
        }
        Ok(result)
    }
}

fn validate_input(records: &[ServiceRecord]) -> Result<()> {
    if records.is_empty() {
        return Err(BillingError::EmptyInput);
    }

    for (index, record) in records.iter().enumerate() {
        if record.patient_id.trim().is_empty() {
            return Err(BillingError::MissingField { index, field: "patient_id" });
        }
        if record.procedure_code.trim().is_empty() {
            return Err(BillingError::MissingField { index, field: "procedure_code" });
        }
    }

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::grouping_total;
    use crate::tariff::{PricePair, PricingTier, TariffEntry, TariffPrice};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn session(patient: &str, code: &str, day: u32) -> ServiceRecord {
        ServiceRecord {
            payer_company: "Hapvida".to_string(),
            procedure_code: code.to_string(),
            procedure_name: "FONOAUDIOLOGIA TEA".to_string(),
            physician_name: "ANA".to_string(),
            patient_id: patient.to_string(),
            patient_name: format!("Nome {}", patient),
            execution_date: NaiveDate::from_ymd_opt(2024, 3, day),
            authorized_qty: 1,
            performed_qty: 1,
        }
    }

    /// Rule set with a single "FONO" code, bundle-eligible, 53.12 standard
    fn fono_rules() -> BillingRules {
        let mut rules = BillingRules::builtin();
        rules.tariffs.push(TariffEntry {
            code: "FONO".to_string(),
            name: Some("FONOAUDIOLOGIA TEA".to_string()),
            price: TariffPrice::Flat(PricePair::new(dec!(53.12), dec!(65.00))),
        });
        rules.bundle.eligible_codes.push("FONO".to_string());
        rules
    }

    fn twelve_fono(patient: &str) -> Vec<ServiceRecord> {
        (1..=12).map(|day| session(patient, "FONO", day)).collect()
    }

    #[test]
    fn test_standard_bundle_scenario() {
        let orchestrator = BillingOrchestrator::new(fono_rules()).unwrap();

        let result = orchestrator.run(&twelve_fono("P1"), &EligibilityRegistry::empty()).unwrap();

        assert_eq!(result.bundles.len(), 1);
        assert_eq!(result.bundles[0].session_count, 12);
        assert_eq!(result.bundles[0].tier, PricingTier::Standard);
        assert_eq!(result.bundles[0].bundle_price, dec!(1150.00));

        assert_eq!(result.processed_records.len(), 13);
        assert_eq!(
            result.processed_records.iter().filter(|r| r.unit_value == Decimal::ZERO).count(),
            12
        );
        assert_eq!(result.summary.grand_total, dec!(1150.00));
        assert_eq!(result.grouping_mode, GroupingMode::Monthly);
        assert!(result.violations.is_empty());

        // Every grouping of the post-bundle rows adds up to the grand total
        let summary = &result.summary;
        for grouping in [&summary.by_company, &summary.by_procedure, &summary.by_physician, &summary.by_patient] {
            assert_eq!(grouping_total(grouping), summary.grand_total);
        }
        assert_eq!(summary.by_patient.len(), 1);
    }

    #[test]
    fn test_preferential_bundle_scenario() {
        let orchestrator = BillingOrchestrator::new(fono_rules()).unwrap();
        let registry = EligibilityRegistry::from_ids(["P1"]);

        let result = orchestrator.run(&twelve_fono("P1"), &registry).unwrap();

        assert_eq!(result.bundles[0].tier, PricingTier::Preferential);
        assert_eq!(result.bundles[0].bundle_price, dec!(1600.00));
        assert_eq!(result.summary.grand_total, dec!(1600.00));
    }

    #[test]
    fn test_unlisted_procedure_violation_scenario() {
        let orchestrator = BillingOrchestrator::new(BillingRules::builtin()).unwrap();
        let mut record = session("P1", "61010073", 4);
        record.procedure_name = "UNLISTED PROCEDURE".to_string();

        let result = orchestrator.run(&[record], &EligibilityRegistry::empty()).unwrap();

        assert_eq!(result.violations.len(), 1);
        assert!(result.violations[0].message.contains("Hapvida"));
        assert!(result.violations[0].message.contains("UNLISTED PROCEDURE"));
        assert!(result.processed_records[0].compliance_flag);
        assert_eq!(result.summary.violation_count, 1);
    }

    #[test]
    fn test_bundle_value_counted_once() {
        let orchestrator = BillingOrchestrator::new(BillingRules::builtin()).unwrap();
        let mut records: Vec<ServiceRecord> = (1..=15).map(|d| session("P1", "61010073", d)).collect();
        records.push(session("P2", "61010073", 3));

        let result = orchestrator.run(&records, &EligibilityRegistry::empty()).unwrap();

        let bundle = &result.bundles[0];
        let covered: Decimal = result
            .processed_records
            .iter()
            .filter(|r| r.source_id.map_or(false, |id| bundle.covered_record_ids.contains(&id)))
            .map(|r| r.unit_value)
            .sum();
        let bundle_rows = result.processed_records.iter().filter(|r| r.is_bundle_row).count();

        assert_eq!(covered, Decimal::ZERO);
        assert_eq!(bundle_rows, 1);
        assert_eq!(result.summary.grand_total, dec!(1150.00) + dec!(53.12));
    }

    #[test]
    fn test_pricing_is_stable_across_runs() {
        let orchestrator = BillingOrchestrator::new(BillingRules::builtin()).unwrap();
        let registry = EligibilityRegistry::from_ids(["P2"]);
        let records = vec![session("P1", "61010073", 1), session("P2", "00010014", 2)];

        let first = orchestrator.run(&records, &registry).unwrap();
        let second = orchestrator.run(&records, &registry).unwrap();

        assert_eq!(first.processed_records, second.processed_records);
        assert_eq!(first.summary.grand_total, second.summary.grand_total);
    }

    #[test]
    fn test_empty_input_is_fatal() {
        let orchestrator = BillingOrchestrator::new(BillingRules::builtin()).unwrap();

        let err = orchestrator.run(&[], &EligibilityRegistry::empty()).unwrap_err();
        assert!(matches!(err, BillingError::EmptyInput));
    }

    #[test]
    fn test_blank_patient_id_is_fatal() {
        let orchestrator = BillingOrchestrator::new(BillingRules::builtin()).unwrap();
        let records = vec![session("P1", "61010073", 1), session("  ", "61010073", 2)];

        let err = orchestrator.run(&records, &EligibilityRegistry::empty()).unwrap_err();
        assert!(matches!(err, BillingError::MissingField { index: 1, field: "patient_id" }));
    }

    #[test]
    fn test_invalid_rules_are_rejected() {
        let mut rules = BillingRules::builtin();
        rules.bundle.threshold = 0;

        assert!(matches!(
            BillingOrchestrator::new(rules),
            Err(BillingError::InvalidRules(_))
        ));
    }

    #[test]
    fn test_warnings_for_unpriced_and_undated() {
        let orchestrator = BillingOrchestrator::new(BillingRules::builtin()).unwrap();
        let mut undated = session("P1", "61010073", 1);
        undated.execution_date = None;
        let records = vec![session("P1", "61010073", 2), undated, session("P1", "99999999", 3)];

        let result = orchestrator.run(&records, &EligibilityRegistry::empty()).unwrap();

        assert!(result.warnings.contains(&RunWarning::UndatedEligibleRecords { count: 1 }));
        assert!(result.warnings.contains(&RunWarning::UnpricedProcedures {
            records: 1,
            codes: vec!["99999999".to_string()],
        }));
    }

    #[test]
    fn test_missing_roster_degrades_to_warning() {
        let orchestrator = BillingOrchestrator::new(fono_rules()).unwrap();

        let result = orchestrator
            .run_with_roster(&twelve_fono("P1"), Some(Path::new("/nonexistent/roster.csv")))
            .unwrap();

        assert!(matches!(result.warnings[0], RunWarning::RosterUnavailable { .. }));
        assert_eq!(result.bundles[0].tier, PricingTier::Standard);
    }

    #[test]
    fn test_result_serializes_to_json() {
        let orchestrator = BillingOrchestrator::new(fono_rules()).unwrap();
        let result = orchestrator.run(&twelve_fono("P1"), &EligibilityRegistry::empty()).unwrap();

        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["summary"]["grand_total"], "1150.00");
        assert_eq!(json["bundles"][0]["period_key"], "2024-03");
        assert_eq!(json["grouping_mode"], "monthly");
    }
}

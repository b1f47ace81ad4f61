// 📈 Batch Insights - dashboard figures derived from one run
// Counts over original rows; revenue over all rows (bundle rows by period).

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::bundles::Bundle;
use crate::records::ProcessedRecord;
use crate::tariff::{normalize_code, PricingTier, TariffTable};

/// Default length of the top-N rankings
pub const DEFAULT_TOP_N: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub name: String,
    pub session_count: u64,
    pub total_value: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchInsights {
    pub distinct_payers: usize,
    pub distinct_physicians: usize,
    pub distinct_patients: usize,

    pub first_execution: Option<NaiveDate>,
    pub last_execution: Option<NaiveDate>,

    /// "YYYY-MM" -> billed value
    pub monthly_revenue: BTreeMap<String, Decimal>,

    /// By total value, descending
    pub top_companies: Vec<RankedEntry>,
    pub top_physicians: Vec<RankedEntry>,

    /// By session count, descending
    pub top_procedures: Vec<RankedEntry>,

    pub standard_bundles: usize,
    pub preferential_bundles: usize,

    /// Original rows whose code has no tariff entry
    pub unpriced_records: usize,
    pub unpriced_codes: Vec<String>,
}

impl BatchInsights {
    pub fn compute(
        records: &[ProcessedRecord],
        bundles: &[Bundle],
        table: &TariffTable,
        top_n: usize,
    ) -> Self {
        let originals: Vec<&ProcessedRecord> = records.iter().filter(|r| !r.is_bundle_row).collect();

        let distinct = |field: fn(&ProcessedRecord) -> &str| -> usize {
            originals
                .iter()
                .map(|r| field(r).trim())
                .filter(|v| !v.is_empty())
                .collect::<BTreeSet<_>>()
                .len()
        };

        let dates = originals.iter().filter_map(|r| r.execution_date);
        let first_execution = dates.clone().min();
        let last_execution = dates.max();

        let mut monthly_revenue = BTreeMap::new();
        for record in records {
            if let Some((year, month)) = record.revenue_month() {
                *monthly_revenue
                    .entry(format!("{:04}-{:02}", year, month))
                    .or_insert(Decimal::ZERO) += record.unit_value;
            }
        }

        let mut unpriced_records = 0;
        let mut unpriced_codes = BTreeSet::new();
        for record in &originals {
            if !table.contains(&record.procedure_code) {
                unpriced_records += 1;
                unpriced_codes.insert(normalize_code(&record.procedure_code));
            }
        }

        let count_tier = |tier: PricingTier| bundles.iter().filter(|b| b.tier == tier).count();

        BatchInsights {
            distinct_payers: distinct(|r| r.payer_company.as_str()),
            distinct_physicians: distinct(|r| r.physician_name.as_str()),
            distinct_patients: distinct(|r| r.patient_id.as_str()),
            first_execution,
            last_execution,
            monthly_revenue,
            top_companies: rank(records.iter(), |r| r.payer_company.as_str(), by_value, top_n),
            top_physicians: rank(originals.iter().copied(), |r| r.physician_name.as_str(), by_value, top_n),
            top_procedures: rank(originals.iter().copied(), |r| r.procedure_name.as_str(), by_sessions, top_n),
            standard_bundles: count_tier(PricingTier::Standard),
            preferential_bundles: count_tier(PricingTier::Preferential),
            unpriced_records,
            unpriced_codes: unpriced_codes.into_iter().collect(),
        }
    }
}

fn by_value(a: &RankedEntry, b: &RankedEntry) -> Ordering {
    b.total_value.cmp(&a.total_value).then_with(|| a.name.cmp(&b.name))
}

fn by_sessions(a: &RankedEntry, b: &RankedEntry) -> Ordering {
    b.session_count.cmp(&a.session_count).then_with(|| a.name.cmp(&b.name))
}

fn rank<'a>(
    records: impl Iterator<Item = &'a ProcessedRecord>,
    key: fn(&ProcessedRecord) -> &str,
    order: fn(&RankedEntry, &RankedEntry) -> Ordering,
    top_n: usize,
) -> Vec<RankedEntry> {
    let mut totals: HashMap<&'a str, (u64, Decimal)> = HashMap::new();
    for record in records {
        let name = key(record).trim();
        if name.is_empty() {
            continue;
        }
        let entry = totals.entry(name).or_insert((0, Decimal::ZERO));
        entry.0 += 1;
        entry.1 += record.unit_value;
    }

    let mut ranked: Vec<RankedEntry> = totals
        .into_iter()
        .map(|(name, (session_count, total_value))| RankedEntry {
            name: name.to_string(),
            session_count,
            total_value,
        })
        .collect();
    ranked.sort_by(order);
    ranked.truncate(top_n);
    ranked
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundles::PeriodKey;
    use crate::config::BillingRules;
    use rust_decimal_macros::dec;

    fn row(company: &str, code: &str, physician: &str, patient: &str, date: Option<(i32, u32, u32)>, value: Decimal) -> ProcessedRecord {
        ProcessedRecord {
            source_id: Some(0),
            payer_company: company.to_string(),
            procedure_code: code.to_string(),
            procedure_name: format!("PROC {}", code),
            physician_name: physician.to_string(),
            patient_id: patient.to_string(),
            patient_name: String::new(),
            execution_date: date.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            authorized_qty: 1,
            performed_qty: 1,
            unit_value: value,
            is_bundle_row: false,
            bundle_tier: None,
            bundle_period: None,
            compliance_flag: false,
            compliance_reason: None,
        }
    }

    fn bundle_row(patient: &str, period: PeriodKey, value: Decimal) -> ProcessedRecord {
        let mut r = row("PACOTE", "PACOTE", "SISTEMA", patient, None, value);
        r.source_id = None;
        r.is_bundle_row = true;
        r.bundle_tier = Some(PricingTier::Standard);
        r.bundle_period = Some(period);
        r
    }

    fn bundle(tier: PricingTier) -> Bundle {
        Bundle {
            patient_id: "P1".to_string(),
            patient_name: String::new(),
            period_key: PeriodKey::month(2024, 3),
            session_count: 12,
            tier,
            bundle_price: dec!(1150.00),
            covered_record_ids: BTreeSet::new(),
        }
    }

    #[test]
    fn test_distinct_counts_ignore_bundle_rows() {
        let table = BillingRules::builtin().tariff_table();
        let rows = vec![
            row("Hapvida", "61010073", "ANA", "P1", Some((2024, 3, 1)), dec!(0)),
            row("Notredame", "61010073", "BIA", "P2", Some((2024, 4, 9)), dec!(53.12)),
            bundle_row("P1", PeriodKey::month(2024, 3), dec!(1150.00)),
        ];

        let insights = BatchInsights::compute(&rows, &[], &table, DEFAULT_TOP_N);

        assert_eq!(insights.distinct_payers, 2);
        assert_eq!(insights.distinct_physicians, 2);
        assert_eq!(insights.distinct_patients, 2);
        assert_eq!(insights.first_execution, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(insights.last_execution, NaiveDate::from_ymd_opt(2024, 4, 9));
    }

    #[test]
    fn test_monthly_revenue_attributes_bundles_to_period() {
        let table = BillingRules::builtin().tariff_table();
        let rows = vec![
            row("Hapvida", "61010073", "ANA", "P1", Some((2024, 3, 1)), dec!(0)),
            row("Hapvida", "60010363", "ANA", "P2", Some((2024, 3, 2)), dec!(100.00)),
            row("Hapvida", "60010363", "ANA", "P2", None, dec!(100.00)),
            bundle_row("P1", PeriodKey::month(2024, 3), dec!(1150.00)),
            bundle_row("P3", PeriodKey::WholePeriod, dec!(1150.00)),
        ];

        let insights = BatchInsights::compute(&rows, &[], &table, DEFAULT_TOP_N);

        assert_eq!(insights.monthly_revenue.len(), 1);
        assert_eq!(insights.monthly_revenue["2024-03"], dec!(1250.00));
    }

    #[test]
    fn test_rankings_and_truncation() {
        let table = BillingRules::builtin().tariff_table();
        let rows = vec![
            row("A", "60010363", "X", "P1", None, dec!(100.00)),
            row("B", "60010142", "Y", "P1", None, dec!(800.00)),
            row("C", "60010363", "Y", "P1", None, dec!(100.00)),
        ];

        let insights = BatchInsights::compute(&rows, &[], &table, 2);

        assert_eq!(insights.top_companies.len(), 2);
        assert_eq!(insights.top_companies[0].name, "B");
        assert_eq!(insights.top_companies[1].name, "A");
        assert_eq!(insights.top_physicians[0].name, "Y");
        assert_eq!(insights.top_physicians[0].total_value, dec!(900.00));
        assert_eq!(insights.top_procedures[0].name, "PROC 60010363");
        assert_eq!(insights.top_procedures[0].session_count, 2);
    }

    #[test]
    fn test_bundle_tiers_and_unpriced_codes() {
        let table = BillingRules::builtin().tariff_table();
        let rows = vec![
            row("Hapvida", "99.99.999-9", "ANA", "P1", None, dec!(0)),
            row("Hapvida", "99999999", "ANA", "P1", None, dec!(0)),
            row("Hapvida", "61010073", "ANA", "P1", None, dec!(53.12)),
        ];
        let bundles = vec![
            bundle(PricingTier::Standard),
            bundle(PricingTier::Preferential),
            bundle(PricingTier::Preferential),
        ];

        let insights = BatchInsights::compute(&rows, &bundles, &table, DEFAULT_TOP_N);

        assert_eq!(insights.standard_bundles, 1);
        assert_eq!(insights.preferential_bundles, 2);
        assert_eq!(insights.unpriced_records, 2);
        assert_eq!(insights.unpriced_codes, vec!["99999999".to_string()]);
    }
}

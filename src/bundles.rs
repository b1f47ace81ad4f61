// 📦 Bundle Engine - monthly session bundling ("pacote")
// Detector: (patient, month) groups with >= threshold eligible sessions.
// Applier: zeroes covered sessions and appends one bundle row per bundle.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::config::BundlePolicy;
use crate::pricing::PricingResolver;
use crate::records::{normalize_patient_id, ProcessedRecord, RecordId, ServiceRecord};
use crate::tariff::{normalize_code, PricingTier};

/// Physician name written on synthetic bundle rows
pub const BUNDLE_PHYSICIAN: &str = "SISTEMA";

// ============================================================================
// PERIOD KEY
// ============================================================================

/// Calendar month of a bundle, or the whole batch when no date was usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeriodKey {
    Month { year: i32, month: u32 },
    WholePeriod,
}

impl PeriodKey {
    pub fn month(year: i32, month: u32) -> Self {
        PeriodKey::Month { year, month }
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodKey::Month { year, month } => write!(f, "{:04}-{:02}", year, month),
            PeriodKey::WholePeriod => f.write_str("whole-period"),
        }
    }
}

impl FromStr for PeriodKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "whole-period" {
            return Ok(PeriodKey::WholePeriod);
        }
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| format!("invalid period key: {}", s))?;
        let year: i32 = year.parse().map_err(|_| format!("invalid year in {}", s))?;
        let month: u32 = month.parse().map_err(|_| format!("invalid month in {}", s))?;
        if !(1..=12).contains(&month) {
            return Err(format!("month out of range in {}", s));
        }
        Ok(PeriodKey::Month { year, month })
    }
}

impl Serialize for PeriodKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeriodKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// BUNDLE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub patient_id: String,
    pub patient_name: String,
    pub period_key: PeriodKey,

    /// Sum of performed quantity over the covered rows (>= threshold)
    pub session_count: i64,

    pub tier: PricingTier,
    pub bundle_price: Decimal,

    /// Source rows absorbed by this bundle
    pub covered_record_ids: BTreeSet<RecordId>,
}

/// How eligible rows were partitioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingMode {
    /// (patient, calendar month)
    Monthly,

    /// No eligible row had a usable date: one group per patient
    WholePeriod,
}

/// Detector output plus the counters operators need to spot date problems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleDetection {
    pub bundles: Vec<Bundle>,
    pub mode: GroupingMode,

    /// Rows with an eligible code and performed quantity > 0
    pub eligible_records: usize,

    /// Eligible rows left out of monthly grouping for lack of a date
    pub undated_eligible_records: usize,

    pub groups_evaluated: usize,
}

#[derive(Debug)]
struct SessionGroup {
    patient_name: String,
    sessions: i64,
    ids: BTreeSet<RecordId>,
}

// ============================================================================
// BUNDLE DETECTOR
// ============================================================================

pub struct BundleDetector<'a> {
    policy: &'a BundlePolicy,
    resolver: PricingResolver<'a>,
    eligible_codes: HashSet<String>,
}

impl<'a> BundleDetector<'a> {
    pub fn new(policy: &'a BundlePolicy, resolver: PricingResolver<'a>) -> Self {
        let eligible_codes = policy
            .eligible_codes
            .iter()
            .map(|c| normalize_code(c))
            .collect();

        BundleDetector {
            policy,
            resolver,
            eligible_codes,
        }
    }

    /// Whether a row can count toward a bundle at all
    pub fn is_eligible(&self, record: &ServiceRecord) -> bool {
        record.performed_qty > 0 && self.eligible_codes.contains(&normalize_code(&record.procedure_code))
    }

    /// Bundles for the batch, ordered by (patient, period)
    pub fn detect(&self, records: &[ServiceRecord]) -> Vec<Bundle> {
        self.detect_with_report(records).bundles
    }

    pub fn detect_with_report(&self, records: &[ServiceRecord]) -> BundleDetection {
        let eligible: Vec<(RecordId, &ServiceRecord)> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| self.is_eligible(r))
            .collect();

        let mode = if eligible.iter().any(|(_, r)| r.execution_date.is_some()) {
            GroupingMode::Monthly
        } else {
            GroupingMode::WholePeriod
        };

        let mut undated = 0usize;
        let mut groups: BTreeMap<(String, PeriodKey), SessionGroup> = BTreeMap::new();

        for (id, record) in &eligible {
            let period = match (mode, record.execution_month()) {
                (GroupingMode::Monthly, Some((year, month))) => PeriodKey::month(year, month),
                (GroupingMode::Monthly, None) => {
                    undated += 1;
                    continue;
                }
                (GroupingMode::WholePeriod, _) => PeriodKey::WholePeriod,
            };

            let group = groups
                .entry((normalize_patient_id(&record.patient_id), period))
                .or_insert_with(|| SessionGroup {
                    patient_name: record.patient_name.clone(),
                    sessions: 0,
                    ids: BTreeSet::new(),
                });
            group.sessions = group.sessions.saturating_add(record.performed_qty);
            group.ids.insert(*id);
        }

        if mode == GroupingMode::WholePeriod && !eligible.is_empty() {
            tracing::warn!(
                eligible = eligible.len(),
                "no eligible record has a usable execution date, grouping by patient over the whole period"
            );
        }
        if undated > 0 {
            tracing::warn!(undated, "eligible records without execution date left out of monthly bundling");
        }

        let groups_evaluated = groups.len();
        let prices = self.policy.prices();
        let mut bundles = Vec::new();

        for ((patient_id, period_key), group) in groups {
            if group.sessions < self.policy.threshold {
                continue;
            }

            let tier = self.resolver.tier_for(&patient_id);
            let bundle_price = prices.for_tier(tier);

            tracing::info!(
                patient = %patient_id,
                period = %period_key,
                sessions = group.sessions,
                tier = %tier,
                price = %bundle_price,
                "bundle detected"
            );

            bundles.push(Bundle {
                patient_id,
                patient_name: group.patient_name,
                period_key,
                session_count: group.sessions,
                tier,
                bundle_price,
                covered_record_ids: group.ids,
            });
        }

        tracing::info!(
            eligible = eligible.len(),
            groups = groups_evaluated,
            bundles = bundles.len(),
            "bundle detection finished"
        );

        BundleDetection {
            bundles,
            mode,
            eligible_records: eligible.len(),
            undated_eligible_records: undated,
            groups_evaluated,
        }
    }
}

// ============================================================================
// BUNDLE APPLIER
// ============================================================================

pub struct BundleApplier<'a> {
    policy: &'a BundlePolicy,
    resolver: PricingResolver<'a>,
}

impl<'a> BundleApplier<'a> {
    pub fn new(policy: &'a BundlePolicy, resolver: PricingResolver<'a>) -> Self {
        BundleApplier { policy, resolver }
    }

    /// Price every record, zero the bundled ones, append one row per bundle.
    ///
    /// Output length is always `records.len() + bundles.len()`; original rows
    /// keep their input order and bundle rows follow in bundle order.
    pub fn apply(&self, records: &[ServiceRecord], bundles: &[Bundle]) -> Vec<ProcessedRecord> {
        let covered: HashSet<RecordId> = bundles
            .iter()
            .flat_map(|b| b.covered_record_ids.iter().copied())
            .collect();

        let mut processed: Vec<ProcessedRecord> = Vec::with_capacity(records.len() + bundles.len());

        for (id, record) in records.iter().enumerate() {
            let value = if covered.contains(&id) {
                Decimal::ZERO
            } else {
                self.resolver.resolve(record)
            };
            processed.push(ProcessedRecord::from_source(id, record, value));
        }

        processed.extend(bundles.iter().map(|b| self.bundle_row(b)));

        tracing::debug!(
            rows = processed.len(),
            zeroed = covered.len(),
            bundle_rows = bundles.len(),
            "bundles applied"
        );

        processed
    }

    fn bundle_row(&self, bundle: &Bundle) -> ProcessedRecord {
        ProcessedRecord {
            source_id: None,
            payer_company: self.policy.sentinel_payer.clone(),
            procedure_code: self.policy.sentinel_code.clone(),
            procedure_name: format!("Bundle {} sessions - {}", bundle.session_count, bundle.tier),
            physician_name: BUNDLE_PHYSICIAN.to_string(),
            patient_id: bundle.patient_id.clone(),
            patient_name: bundle.patient_name.clone(),
            execution_date: None,
            authorized_qty: bundle.session_count,
            performed_qty: bundle.session_count,
            unit_value: bundle.bundle_price,
            is_bundle_row: true,
            bundle_tier: Some(bundle.tier),
            bundle_period: Some(bundle.period_key),
            compliance_flag: false,
            compliance_reason: None,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

// 🔎 Record Filter - select the slice of a batch to bill
// Produces a new owned batch; the caller's records are left as they are.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{BillingError, Result};
use crate::records::{normalize_patient_id, ServiceRecord};

/// All criteria are optional and combine with AND.
///
/// Text criteria match trimmed and case-insensitively. Date bounds are
/// inclusive; once any bound is set, rows without a usable date are dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub payer_company: Option<String>,
    #[serde(default)]
    pub procedure_name: Option<String>,
    #[serde(default)]
    pub physician_name: Option<String>,

    /// Restrict to a patient cohort; empty means everyone
    #[serde(default)]
    pub patients: Vec<String>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn between(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    pub fn payer(mut self, payer: impl Into<String>) -> Self {
        self.payer_company = Some(payer.into());
        self
    }

    pub fn procedure(mut self, procedure: impl Into<String>) -> Self {
        self.procedure_name = Some(procedure.into());
        self
    }

    pub fn physician(mut self, physician: impl Into<String>) -> Self {
        self.physician_name = Some(physician.into());
        self
    }

    pub fn cohort<I, S>(mut self, patients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patients = patients.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.start_date.is_none()
            && self.end_date.is_none()
            && is_blank(&self.payer_company)
            && is_blank(&self.procedure_name)
            && is_blank(&self.physician_name)
            && self.patients.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(BillingError::InvalidFilter(format!(
                    "start date {} is after end date {}",
                    start, end
                )));
            }
        }
        Ok(())
    }

    pub fn apply(&self, records: &[ServiceRecord]) -> Result<Vec<ServiceRecord>> {
        self.validate()?;

        let cohort: HashSet<String> = self.patients.iter().map(|p| normalize_patient_id(p)).collect();

        let selected: Vec<ServiceRecord> = records
            .iter()
            .filter(|r| self.matches_dates(r))
            .filter(|r| text_matches(&self.payer_company, &r.payer_company))
            .filter(|r| text_matches(&self.procedure_name, &r.procedure_name))
            .filter(|r| text_matches(&self.physician_name, &r.physician_name))
            .filter(|r| cohort.is_empty() || cohort.contains(&normalize_patient_id(&r.patient_id)))
            .cloned()
            .collect();

        tracing::info!(
            input = records.len(),
            selected = selected.len(),
            "record filter applied"
        );

        Ok(selected)
    }

    fn matches_dates(&self, record: &ServiceRecord) -> bool {
        if self.start_date.is_none() && self.end_date.is_none() {
            return true;
        }
        match record.execution_date {
            Some(date) => {
                self.start_date.map_or(true, |start| date >= start)
                    && self.end_date.map_or(true, |end| date <= end)
            }
            None => false,
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

fn text_matches(wanted: &Option<String>, actual: &str) -> bool {
    match wanted.as_deref().map(str::trim) {
        None | Some("") => true,
        Some(w) => w.eq_ignore_ascii_case(actual.trim()),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record(payer: &str, physician: &str, patient: &str, date: Option<(i32, u32, u32)>) -> ServiceRecord {
        ServiceRecord {
            payer_company: payer.to_string(),
            procedure_code: "61010073".to_string(),
            procedure_name: "FONOAUDIOLOGIA TEA".to_string(),
            physician_name: physician.to_string(),
            patient_id: patient.to_string(),
            patient_name: String::new(),
            execution_date: date.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            authorized_qty: 1,
            performed_qty: 1,
        }
    }

    fn batch() -> Vec<ServiceRecord> {
        vec![
            record("Hapvida", "ANA", "P1", Some((2024, 3, 1))),
            record("Hapvida", "BIA", "P2", Some((2024, 3, 31))),
            record("Notredame", "ANA", "P1", Some((2024, 4, 1))),
            record("Notredame", "ANA", "P3", None),
        ]
    }

    #[test]
    fn test_empty_filter_keeps_everything() {
        let filter = RecordFilter::new();
        assert!(filter.is_empty());
        assert_eq!(filter.apply(&batch()).unwrap().len(), 4);
    }

    #[test]
    fn test_date_bounds_are_inclusive_and_drop_undated() {
        let filter = RecordFilter::new().between(
            NaiveDate::from_ymd_opt(2024, 3, 1),
            NaiveDate::from_ymd_opt(2024, 3, 31),
        );

        let selected = filter.apply(&batch()).unwrap();

        assert_eq!(selected.len(), 2);
        assert!(selected.iter().all(|r| r.payer_company == "Hapvida"));
    }

    #[test]
    fn test_text_criteria_are_case_insensitive() {
        let filter = RecordFilter::new().payer(" notredame ").physician("ana");

        let selected = filter.apply(&batch()).unwrap();

        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_patient_cohort() {
        let filter = RecordFilter::new().cohort(["P1"]);

        let selected = filter.apply(&batch()).unwrap();

        assert_eq!(selected.len(), 2);
        assert!(selected.iter().all(|r| r.patient_id == "P1"));
    }

    #[test]
    fn test_cohort_matches_spreadsheet_ids() {
        let records = vec![record("Hapvida", "ANA", "123.0", None), record("Hapvida", "ANA", "124", None)];

        let selected = RecordFilter::new().cohort([" 123 "]).apply(&records).unwrap();

        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].patient_id, "123.0");
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let filter = RecordFilter::new().between(
            NaiveDate::from_ymd_opt(2024, 4, 1),
            NaiveDate::from_ymd_opt(2024, 3, 1),
        );

        let err = filter.apply(&batch()).unwrap_err();
        assert!(matches!(err, BillingError::InvalidFilter(_)));
    }

    #[test]
    fn test_input_is_not_modified() {
        let records = batch();
        let snapshot = records.clone();

        let _ = RecordFilter::new().payer("Hapvida").apply(&records).unwrap();

        assert_eq!(records, snapshot);
    }
}

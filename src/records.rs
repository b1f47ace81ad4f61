// 🧾 Service Records - production entries in, billable rows out
// Source rows are read-only; every stage derives NEW rows from them.

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

use crate::bundles::PeriodKey;
use crate::tariff::PricingTier;

/// Position of a source row inside the batch handed to the engine.
pub type RecordId = usize;

/// Date layouts accepted for `execution_date`, most specific first.
const DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y"];

// ============================================================================
// SERVICE RECORD (input)
// ============================================================================

/// One executed or authorized service unit.
///
/// Field aliases match the `producao` table column names so CSV exports of
/// that table deserialize directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    #[serde(alias = "empresa")]
    pub payer_company: String,

    #[serde(alias = "procedimento_codigo")]
    pub procedure_code: String,

    #[serde(alias = "procedimento_nome")]
    pub procedure_name: String,

    #[serde(alias = "medico_nome", default)]
    pub physician_name: String,

    #[serde(alias = "usuario_codigo")]
    pub patient_id: String,

    #[serde(alias = "usuario_nome", default)]
    pub patient_name: String,

    /// Day/month/year text in the source; anything unparseable becomes None
    #[serde(alias = "data_execucao", default, deserialize_with = "de_execution_date")]
    pub execution_date: Option<NaiveDate>,

    #[serde(alias = "qtde_autorizada", default, deserialize_with = "de_quantity")]
    pub authorized_qty: i64,

    #[serde(alias = "qtde_realizada", default, deserialize_with = "de_quantity")]
    pub performed_qty: i64,
}

impl ServiceRecord {
    /// Calendar month of execution, if the date parsed
    pub fn execution_month(&self) -> Option<(i32, u32)> {
        self.execution_date.map(|d| (d.year(), d.month()))
    }

    /// Key used by the per-patient grouping: "{patient_id} - {patient_name}"
    pub fn patient_label(&self) -> String {
        format!("{} - {}", normalize_patient_id(&self.patient_id), self.patient_name)
    }
}

/// Canonical patient id used for roster lookups, bundling and grouping.
///
/// Trims whitespace and undoes the spreadsheet habit of writing numeric ids
/// as "12345.0". Anything else is kept as written.
pub fn normalize_patient_id(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.strip_suffix(".0") {
        Some(stem) if !stem.is_empty() && stem.chars().all(|c| c.is_ascii_digit()) => {
            stem.to_string()
        }
        _ => trimmed.to_string(),
    }
}

/// Parse an execution date the way the production exports write it.
///
/// Accepts `dd/mm/yyyy` (canonical), ISO `yyyy-mm-dd` and `dd-mm-yyyy`; a
/// trailing time component is ignored. Returns None for anything else.
pub fn parse_execution_date(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    // "05/03/2024 00:00:00" -> "05/03/2024"
    let date_part = trimmed.split_whitespace().next().unwrap_or(trimmed);
    let date_part = date_part.split('T').next().unwrap_or(date_part);

    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DateRepr {
    Date(NaiveDate),
    Text(String),
}

fn de_execution_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<DateRepr> = Option::deserialize(deserializer)?;
    Ok(match raw {
        Some(DateRepr::Date(date)) => Some(date),
        Some(DateRepr::Text(text)) => parse_execution_date(&text),
        None => None,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QuantityRepr {
    Int(i64),
    Float(f64),
    Text(String),
}

/// Quantities arrive as integers, floats ("12.0") or blank cells.
fn de_quantity<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<QuantityRepr> = Option::deserialize(deserializer)?;
    Ok(match raw {
        Some(QuantityRepr::Int(n)) => n,
        Some(QuantityRepr::Float(f)) if f.is_finite() => f.trunc() as i64,
        Some(QuantityRepr::Float(_)) => 0,
        Some(QuantityRepr::Text(text)) => parse_quantity(&text),
        None => 0,
    })
}

/// Lenient integer parse: blank or garbage -> 0, "3.0" -> 3
pub fn parse_quantity(text: &str) -> i64 {
    let trimmed = text.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        return n;
    }
    match trimmed.replace(',', ".").parse::<f64>() {
        Ok(f) if f.is_finite() => f.trunc() as i64,
        _ => 0,
    }
}

// ============================================================================
// PROCESSED RECORD (output)
// ============================================================================

/// A billable row produced by a run.
///
/// Original rows keep their source fields and `source_id`; synthetic bundle
/// rows have `source_id == None` and `is_bundle_row == true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub source_id: Option<RecordId>,
    pub payer_company: String,
    pub procedure_code: String,
    pub procedure_name: String,
    pub physician_name: String,
    pub patient_id: String,
    pub patient_name: String,
    pub execution_date: Option<NaiveDate>,
    pub authorized_qty: i64,
    pub performed_qty: i64,

    /// Billable value of the row (0 when absorbed into a bundle)
    pub unit_value: Decimal,

    pub is_bundle_row: bool,
    pub bundle_tier: Option<PricingTier>,

    /// Period the bundle covers (bundle rows only)
    pub bundle_period: Option<PeriodKey>,

    /// Set when the row violates the payer's approved-procedure rules
    pub compliance_flag: bool,
    pub compliance_reason: Option<String>,
}

impl ProcessedRecord {
    /// Derive an output row from a source row with its resolved value
    pub fn from_source(id: RecordId, record: &ServiceRecord, unit_value: Decimal) -> Self {
        ProcessedRecord {
            source_id: Some(id),
            payer_company: record.payer_company.clone(),
            procedure_code: record.procedure_code.clone(),
            procedure_name: record.procedure_name.clone(),
            physician_name: record.physician_name.clone(),
            patient_id: normalize_patient_id(&record.patient_id),
            patient_name: record.patient_name.clone(),
            execution_date: record.execution_date,
            authorized_qty: record.authorized_qty,
            performed_qty: record.performed_qty,
            unit_value,
            is_bundle_row: false,
            bundle_tier: None,
            bundle_period: None,
            compliance_flag: false,
            compliance_reason: None,
        }
    }

    pub fn patient_label(&self) -> String {
        format!("{} - {}", normalize_patient_id(&self.patient_id), self.patient_name)
    }

    /// Month the row's value belongs to: execution month for original rows,
    /// the bundle period for bundle rows.
    pub fn revenue_month(&self) -> Option<(i32, u32)> {
        match (&self.bundle_period, self.execution_date) {
            (Some(PeriodKey::Month { year, month }), _) => Some((*year, *month)),
            (Some(PeriodKey::WholePeriod), _) => None,
            (None, Some(date)) => Some((date.year(), date.month())),
            (None, None) => None,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

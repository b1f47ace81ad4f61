// 🗄️ Run Store - billing runs persisted to SQLite
// One row per run plus one row per processed record. Runs are immutable
// once saved; re-running a batch creates a new run with the same digest.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::str::FromStr;

use crate::bundles::PeriodKey;
use crate::orchestrator::BillingResult;
use crate::records::{ProcessedRecord, ServiceRecord};
use crate::tariff::PricingTier;

pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_COMPLETED_WITH_WARNINGS: &str = "completed_with_warnings";

/// Where a run's input came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub records_source: String,
    pub roster_source: Option<String>,

    /// sha256 over the input rows, identical batches share a digest
    pub input_digest: String,
}

impl RunMetadata {
    pub fn new(records_source: impl Into<String>, roster_source: Option<String>, records: &[ServiceRecord]) -> Self {
        RunMetadata {
            records_source: records_source.into(),
            roster_source,
            input_digest: input_digest(records),
        }
    }
}

pub fn input_digest(records: &[ServiceRecord]) -> String {
    let mut hasher = Sha256::new();
    for r in records {
        hasher.update(format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}\n",
            r.payer_company,
            r.procedure_code,
            r.procedure_name,
            r.physician_name,
            r.patient_id,
            r.patient_name,
            r.execution_date.map(|d| d.to_string()).unwrap_or_default(),
            r.authorized_qty,
            r.performed_qty
        ));
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub rules_version: String,
    pub records_source: String,
    pub roster_source: Option<String>,
    pub input_digest: String,
    pub input_records: usize,
    pub processed_records: usize,
    pub bundle_count: usize,
    pub violation_count: usize,
    pub grand_total: Decimal,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRun {
    pub summary: RunSummary,
    pub result: BillingResult,
}

// ============================================================================
// STORE
// ============================================================================

pub struct RunStore {
    conn: Connection,
}

impl RunStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open run store: {:?}", path.as_ref()))?;
        setup_database(&conn)?;
        Ok(RunStore { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(RunStore { conn })
    }

    /// Persist a finished run; returns the new run id
    pub fn save(&mut self, result: &BillingResult, metadata: &RunMetadata) -> Result<String> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let status = if result.has_warnings() {
            STATUS_COMPLETED_WITH_WARNINGS
        } else {
            STATUS_COMPLETED
        };
        let result_json = serde_json::to_string(result).context("Failed to serialize billing result")?;

        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO billing_runs (
                run_id, created_at, rules_version, records_source, roster_source,
                input_digest, input_records, processed_records, bundle_count,
                violation_count, grand_total, status, result_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                run_id,
                created_at.to_rfc3339(),
                result.rules_version,
                metadata.records_source,
                metadata.roster_source,
                metadata.input_digest,
                result.input_records as i64,
                result.processed_records.len() as i64,
                result.summary.bundle_count as i64,
                result.summary.violation_count as i64,
                result.summary.grand_total.to_string(),
                status,
                result_json,
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO processed_records (
                    run_id, row_index, source_id, payer_company, procedure_code,
                    procedure_name, physician_name, patient_id, patient_name,
                    execution_date, authorized_qty, performed_qty, unit_value,
                    is_bundle_row, bundle_tier, bundle_period, compliance_flag,
                    compliance_reason
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            )?;

            for (row_index, r) in result.processed_records.iter().enumerate() {
                stmt.execute(params![
                    run_id,
                    row_index as i64,
                    r.source_id.map(|id| id as i64),
                    r.payer_company,
                    r.procedure_code,
                    r.procedure_name,
                    r.physician_name,
                    r.patient_id,
                    r.patient_name,
                    r.execution_date.map(|d| d.to_string()),
                    r.authorized_qty,
                    r.performed_qty,
                    r.unit_value.to_string(),
                    r.is_bundle_row,
                    r.bundle_tier.map(|t| t.as_str()),
                    r.bundle_period.map(|p| p.to_string()),
                    r.compliance_flag,
                    r.compliance_reason,
                ])?;
            }
        }

        tx.commit()?;

        tracing::info!(
            run_id = %run_id,
            rows = result.processed_records.len(),
            status,
            "billing run saved"
        );

        Ok(run_id)
    }

    /// Most recent first
    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut stmt = self.conn.prepare(&format!("SELECT {} FROM billing_runs ORDER BY created_at DESC", SUMMARY_COLUMNS))?;
        let runs = stmt
            .query_map([], summary_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<StoredRun>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {}, result_json FROM billing_runs WHERE run_id = ?1", SUMMARY_COLUMNS),
                [run_id],
                |row| Ok((summary_from_row(row)?, row.get::<_, String>(12)?)),
            )
            .optional()?;

        match row {
            Some((summary, json)) => {
                let result: BillingResult = serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt result payload for run {}", run_id))?;
                Ok(Some(StoredRun { summary, result }))
            }
            None => Ok(None),
        }
    }

    /// Processed rows of a run in their original order
    pub fn processed_records(&self, run_id: &str) -> Result<Vec<ProcessedRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT source_id, payer_company, procedure_code, procedure_name,
                    physician_name, patient_id, patient_name, execution_date,
                    authorized_qty, performed_qty, unit_value, is_bundle_row,
                    bundle_tier, bundle_period, compliance_flag, compliance_reason
             FROM processed_records
             WHERE run_id = ?1
             ORDER BY row_index",
        )?;

        let raw = stmt
            .query_map([run_id], |row| {
                Ok(RawRecord {
                    source_id: row.get(0)?,
                    payer_company: row.get(1)?,
                    procedure_code: row.get(2)?,
                    procedure_name: row.get(3)?,
                    physician_name: row.get(4)?,
                    patient_id: row.get(5)?,
                    patient_name: row.get(6)?,
                    execution_date: row.get(7)?,
                    authorized_qty: row.get(8)?,
                    performed_qty: row.get(9)?,
                    unit_value: row.get(10)?,
                    is_bundle_row: row.get(11)?,
                    bundle_tier: row.get(12)?,
                    bundle_period: row.get(13)?,
                    compliance_flag: row.get(14)?,
                    compliance_reason: row.get(15)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        raw.into_iter().map(RawRecord::into_processed).collect()
    }

    /// Returns false when no such run exists
    pub fn delete_run(&mut self, run_id: &str) -> Result<bool> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM processed_records WHERE run_id = ?1", [run_id])?;
        let deleted = tx.execute("DELETE FROM billing_runs WHERE run_id = ?1", [run_id])?;
        tx.commit()?;

        if deleted > 0 {
            tracing::info!(run_id, "billing run deleted");
        }
        Ok(deleted > 0)
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL keeps readers unblocked while a run is being saved
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS billing_runs (
            run_id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL,
            rules_version TEXT NOT NULL,
            records_source TEXT NOT NULL,
            roster_source TEXT,
            input_digest TEXT NOT NULL,
            input_records INTEGER NOT NULL,
            processed_records INTEGER NOT NULL,
            bundle_count INTEGER NOT NULL,
            violation_count INTEGER NOT NULL,
            grand_total TEXT NOT NULL,
            status TEXT NOT NULL,
            result_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS processed_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL REFERENCES billing_runs(run_id),
            row_index INTEGER NOT NULL,
            source_id INTEGER,
            payer_company TEXT NOT NULL,
            procedure_code TEXT NOT NULL,
            procedure_name TEXT NOT NULL,
            physician_name TEXT NOT NULL,
            patient_id TEXT NOT NULL,
            patient_name TEXT NOT NULL,
            execution_date TEXT,
            authorized_qty INTEGER NOT NULL,
            performed_qty INTEGER NOT NULL,
            unit_value TEXT NOT NULL,
            is_bundle_row INTEGER NOT NULL,
            bundle_tier TEXT,
            bundle_period TEXT,
            compliance_flag INTEGER NOT NULL,
            compliance_reason TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_processed_run ON processed_records(run_id, row_index)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_runs_digest ON billing_runs(input_digest)",
        [],
    )?;

    Ok(())
}

const SUMMARY_COLUMNS: &str = "run_id, created_at, rules_version, records_source, roster_source,
        input_digest, input_records, processed_records, bundle_count,
        violation_count, grand_total, status";

fn summary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunSummary> {
    let created_at: String = row.get(1)?;
    let grand_total: String = row.get(10)?;

    Ok(RunSummary {
        run_id: row.get(0)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(1, e))?,
        rules_version: row.get(2)?,
        records_source: row.get(3)?,
        roster_source: row.get(4)?,
        input_digest: row.get(5)?,
        input_records: row.get::<_, i64>(6)? as usize,
        processed_records: row.get::<_, i64>(7)? as usize,
        bundle_count: row.get::<_, i64>(8)? as usize,
        violation_count: row.get::<_, i64>(9)? as usize,
        grand_total: Decimal::from_str(&grand_total).map_err(|e| conversion_error(10, e))?,
        status: row.get(11)?,
    })
}

fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

/// Column values as stored, converted after the statement is done
struct RawRecord {
    source_id: Option<i64>,
    payer_company: String,
    procedure_code: String,
    procedure_name: String,
    physician_name: String,
    patient_id: String,
    patient_name: String,
    execution_date: Option<String>,
    authorized_qty: i64,
    performed_qty: i64,
    unit_value: String,
    is_bundle_row: bool,
    bundle_tier: Option<String>,
    bundle_period: Option<String>,
    compliance_flag: bool,
    compliance_reason: Option<String>,
}

impl RawRecord {
    fn into_processed(self) -> Result<ProcessedRecord> {
        let execution_date = self
            .execution_date
            .map(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d"))
            .transpose()
            .context("Stored execution_date is not ISO formatted")?;
        let unit_value = Decimal::from_str(&self.unit_value)
            .with_context(|| format!("Stored unit_value {:?} is not a decimal", self.unit_value))?;
        let bundle_tier = match self.bundle_tier.as_deref() {
            Some("standard") => Some(PricingTier::Standard),
            Some("preferential") => Some(PricingTier::Preferential),
            Some(other) => anyhow::bail!("Unknown bundle tier {:?}", other),
            None => None,
        };
        let bundle_period = self
            .bundle_period
            .map(|p| p.parse::<PeriodKey>())
            .transpose()
            .map_err(anyhow::Error::msg)?;

        Ok(ProcessedRecord {
            source_id: self.source_id.map(|id| id as usize),
            payer_company: self.payer_company,
            procedure_code: self.procedure_code,
            procedure_name: self.procedure_name,
            physician_name: self.physician_name,
            patient_id: self.patient_id,
            patient_name: self.patient_name,
            execution_date,
            authorized_qty: self.authorized_qty,
            performed_qty: self.performed_qty,
            unit_value,
            is_bundle_row: self.is_bundle_row,
            bundle_tier,
            bundle_period,
            compliance_flag: self.compliance_flag,
            compliance_reason: self.compliance_reason,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

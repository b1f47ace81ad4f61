// 📥 Ingestion - production records from CSV exports or the `producao` table
// Loaders check the shape first and fail with MissingColumns before reading
// a single row.

use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use std::collections::HashSet;
use std::path::Path;

use crate::eligibility::EligibilityRegistry;
use crate::error::{BillingError, Result};
use crate::records::{normalize_patient_id, parse_execution_date, parse_quantity, ServiceRecord};

/// Table holding production entries in the clinic database
pub const PRODUCTION_TABLE: &str = "producao";

/// Columns the engine reads, paired with the English header also accepted
/// in CSV input.
pub const REQUIRED_COLUMNS: &[(&str, &str)] = &[
    ("empresa", "payer_company"),
    ("data_execucao", "execution_date"),
    ("usuario_codigo", "patient_id"),
    ("usuario_nome", "patient_name"),
    ("medico_nome", "physician_name"),
    ("procedimento_codigo", "procedure_code"),
    ("procedimento_nome", "procedure_name"),
    ("qtde_autorizada", "authorized_qty"),
    ("qtde_realizada", "performed_qty"),
];

fn missing_columns<'a>(present: impl IntoIterator<Item = &'a str>, allow_english: bool) -> Vec<String> {
    let present: HashSet<String> = present.into_iter().map(|c| c.trim().to_lowercase()).collect();
    REQUIRED_COLUMNS
        .iter()
        .filter(|(pt, en)| !(present.contains(*pt) || (allow_english && present.contains(*en))))
        .map(|(pt, _)| pt.to_string())
        .collect()
}

// ============================================================================
// CSV
// ============================================================================

pub fn load_records_csv<P: AsRef<Path>>(path: P) -> Result<Vec<ServiceRecord>> {
    let path = path.as_ref();
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)?;

    let headers = rdr.headers()?.clone();
    let missing = missing_columns(headers.iter(), true);
    if !missing.is_empty() {
        return Err(BillingError::MissingColumns {
            source_name: path.display().to_string(),
            columns: missing,
        });
    }

    // Header case varies between exports; serde matches exact names
    let normalized: csv::StringRecord = headers.iter().map(|h| h.trim().to_lowercase()).collect();
    rdr.set_headers(normalized);

    let mut records = Vec::new();
    for result in rdr.deserialize() {
        let mut record: ServiceRecord = result?;
        record.patient_id = normalize_patient_id(&record.patient_id);
        records.push(record);
    }

    tracing::info!(path = %path.display(), records = records.len(), "loaded records from CSV");
    Ok(records)
}

// ============================================================================
// SQLITE
// ============================================================================

/// Read the `producao` table, ordered by execution date then patient.
pub fn load_records_sqlite<P: AsRef<Path>>(path: P) -> Result<Vec<ServiceRecord>> {
    let path = path.as_ref();
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let records = read_production_table(&conn, &path.display().to_string())?;

    tracing::info!(path = %path.display(), records = records.len(), "loaded records from SQLite");
    Ok(records)
}

pub fn read_production_table(conn: &Connection, source_name: &str) -> Result<Vec<ServiceRecord>> {
    let table_exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [PRODUCTION_TABLE],
        |row| row.get(0),
    )?;
    if !table_exists {
        return Err(BillingError::MissingColumns {
            source_name: format!("{} (no table {})", source_name, PRODUCTION_TABLE),
            columns: REQUIRED_COLUMNS.iter().map(|(pt, _)| pt.to_string()).collect(),
        });
    }

    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", PRODUCTION_TABLE))?;
    let columns: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<_, _>>()?;
    let missing = missing_columns(columns.iter().map(String::as_str), false);
    if !missing.is_empty() {
        return Err(BillingError::MissingColumns {
            source_name: source_name.to_string(),
            columns: missing,
        });
    }

    let mut stmt = conn.prepare(
        "SELECT empresa, procedimento_codigo, procedimento_nome, medico_nome,
                usuario_codigo, usuario_nome, data_execucao, qtde_autorizada, qtde_realizada
         FROM producao
         ORDER BY data_execucao, usuario_codigo",
    )?;

    let records = stmt
        .query_map([], |row| {
            Ok(ServiceRecord {
                payer_company: value_text(row.get(0)?),
                procedure_code: value_text(row.get(1)?),
                procedure_name: value_text(row.get(2)?),
                physician_name: value_text(row.get(3)?),
                patient_id: normalize_patient_id(&value_text(row.get(4)?)),
                patient_name: value_text(row.get(5)?),
                execution_date: parse_execution_date(&value_text(row.get(6)?)),
                authorized_qty: value_quantity(row.get(7)?),
                performed_qty: value_quantity(row.get(8)?),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(records)
}

/// Column affinity in these databases is loose: ids and codes show up as
/// integers, reals or text.
fn value_text(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(n) => n.to_string(),
        Value::Real(f) if f.fract() == 0.0 => format!("{}", f as i64),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => s.trim().to_string(),
        Value::Blob(_) => String::new(),
    }
}

fn value_quantity(value: Value) -> i64 {
    match value {
        Value::Integer(n) => n,
        Value::Real(f) if f.is_finite() => f.trunc() as i64,
        Value::Text(s) => parse_quantity(&s),
        _ => 0,
    }
}

// ============================================================================
// ROSTER
// ============================================================================

/// Patient ids entitled to preferential pricing, from CSV
pub fn load_roster_csv<P: AsRef<Path>>(path: P) -> anyhow::Result<EligibilityRegistry> {
    EligibilityRegistry::from_csv(path)
}

/// Roster from CSV or an Excel workbook, chosen by extension
pub fn load_roster<P: AsRef<Path>>(path: P) -> anyhow::Result<EligibilityRegistry> {
    EligibilityRegistry::from_path(path)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::io::Write;

    const HEADER: &str = "empresa,servico,data_execucao,usuario_codigo,usuario_nome,medico_nome,procedimento_codigo,procedimento_nome,qtde_autorizada,qtde_realizada";

    fn csv_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    fn production_db(conn: &Connection, with_performed: bool) {
        let performed = if with_performed { ", qtde_realizada REAL" } else { "" };
        conn.execute_batch(&format!(
            "CREATE TABLE producao (
                empresa TEXT, servico TEXT, data_execucao TEXT, usuario_codigo INTEGER,
                usuario_nome TEXT, medico_nome TEXT, procedimento_codigo TEXT,
                procedimento_nome TEXT, qtde_autorizada INTEGER{}
            );",
            performed
        ))
        .unwrap();
    }

    #[test]
    fn test_load_csv_with_producao_headers() {
        let file = csv_file(&format!(
            "{}\nHapvida,TEA,05/03/2024,123,Ana,DRA X,61.01.007-3,FONOAUDIOLOGIA TEA,1,1\nHapvida,TEA,,124,Bia,DRA X,61010073,FONOAUDIOLOGIA TEA,1,0\n",
            HEADER
        ));

        let records = load_records_csv(file.path()).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].patient_id, "123");
        assert_eq!(records[0].execution_date, NaiveDate::from_ymd_opt(2024, 3, 5));
        assert_eq!(records[1].execution_date, None);
        assert_eq!(records[1].performed_qty, 0);
    }

    #[test]
    fn test_load_csv_accepts_uppercase_headers() {
        let file = csv_file(&format!(
            "{}\nHapvida,TEA,05/03/2024,123,Ana,DRA X,61010073,FONOAUDIOLOGIA TEA,1,1\n",
            HEADER.to_uppercase()
        ));

        let records = load_records_csv(file.path()).unwrap();
        assert_eq!(records[0].payer_company, "Hapvida");
    }

    #[test]
    fn test_load_csv_reports_missing_columns() {
        let file = csv_file("empresa,usuario_codigo\nHapvida,1\n");

        let err = load_records_csv(file.path()).unwrap_err();

        match err {
            BillingError::MissingColumns { columns, .. } => {
                assert!(columns.contains(&"procedimento_codigo".to_string()));
                assert!(!columns.contains(&"empresa".to_string()));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_read_production_table_orders_rows() {
        let conn = Connection::open_in_memory().unwrap();
        production_db(&conn, true);
        conn.execute_batch(
            "INSERT INTO producao VALUES ('Hapvida','TEA','2024-03-09',2,'Bia','DRA X','61010073','FONOAUDIOLOGIA TEA',1,1.0);
             INSERT INTO producao VALUES ('Hapvida','TEA','2024-03-01',7,'Ana','DRA X','61010073','FONOAUDIOLOGIA TEA',1,2.0);",
        )
        .unwrap();

        let records = read_production_table(&conn, "test").unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].patient_id, "7");
        assert_eq!(records[0].performed_qty, 2);
        assert_eq!(records[1].execution_date, NaiveDate::from_ymd_opt(2024, 3, 9));
    }

    #[test]
    fn test_missing_table_and_columns() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(matches!(
            read_production_table(&conn, "empty"),
            Err(BillingError::MissingColumns { .. })
        ));

        production_db(&conn, false);
        match read_production_table(&conn, "partial") {
            Err(BillingError::MissingColumns { columns, .. }) => {
                assert_eq!(columns, vec!["qtde_realizada".to_string()]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_spreadsheet_ids_match_across_records_and_roster() {
        use crate::{BillingOrchestrator, BillingRules, PricingResolver};
        use rust_decimal_macros::dec;

        let records = csv_file(&format!(
            "{}\nHapvida,TEA,05/03/2024,123.0,Ana,DRA X,61010073,FONOAUDIOLOGIA TEA,1,1\n",
            HEADER
        ));
        let roster = csv_file("usuario_codigo\n123.0\n");

        let records = load_records_csv(records.path()).unwrap();
        let registry = load_roster_csv(roster.path()).unwrap();
        assert_eq!(records[0].patient_id, "123");

        let table = BillingRules::builtin().tariff_table();
        assert_eq!(PricingResolver::new(&table, &registry).resolve(&records[0]), dec!(65.00));

        let orchestrator = BillingOrchestrator::new(BillingRules::builtin()).unwrap();
        let result = orchestrator.run(&records, &registry).unwrap();
        assert_eq!(result.summary.grand_total, dec!(65.00));
    }

    #[test]
    fn test_sqlite_text_ids_are_normalized() {
        let conn = Connection::open_in_memory().unwrap();
        production_db(&conn, true);
        conn.execute_batch(
            "INSERT INTO producao VALUES ('Hapvida','TEA','2024-03-01',' 55.0 ','Ana','DRA X','61010073','FONOAUDIOLOGIA TEA',1,1.0);",
        )
        .unwrap();

        let records = read_production_table(&conn, "test").unwrap();
        assert_eq!(records[0].patient_id, "55");
    }

    #[test]
    fn test_load_roster_by_extension() {
        let file = csv_file("codigo\n9\n");
        assert!(load_roster(file.path()).unwrap().is_preferential("9.0"));
    }

    #[test]
    fn test_load_roster_csv() {
        let file = csv_file("usuario_codigo\n123\n");
        let registry = load_roster_csv(file.path()).unwrap();
        assert!(registry.is_preferential("123"));
    }
}

// 🎫 Eligibility Registry - patients entitled to preferential pricing
// Built once per run from an external roster, never mutated afterwards.

use anyhow::{anyhow, Context as AnyhowContext, Result};
use calamine::{open_workbook_auto, Data, Range, Reader};
use std::collections::HashSet;
use std::path::Path;

use crate::records::normalize_patient_id;

/// Header names accepted for the patient id column, in priority order
pub const ROSTER_ID_COLUMNS: &[&str] = &[
    "usuario_codigo",
    "codigo_usuario",
    "codigo",
    "usuario",
    "cod_usuario",
    "patient_id",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EligibilityRegistry {
    patients: HashSet<String>,
}

impl EligibilityRegistry {
    /// Empty registry: everyone resolves to standard pricing
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from patient identifiers; blanks are dropped, ids are normalized
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patients = ids
            .into_iter()
            .map(|id| normalize_patient_id(id.as_ref()))
            .filter(|id| !id.is_empty())
            .collect();
        EligibilityRegistry { patients }
    }

    /// Load patient ids from a roster CSV.
    ///
    /// The id column is the first header matching [`ROSTER_ID_COLUMNS`]
    /// (case-insensitive). A roster without such a header is an error.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path.as_ref())
            .with_context(|| format!("Failed to open roster: {:?}", path.as_ref()))?;

        let headers: Vec<String> = rdr
            .headers()
            .context("Failed to read roster header")?
            .iter()
            .map(|h| h.trim().to_lowercase())
            .collect();

        let column = id_column(&headers).map_err(|e| anyhow!("Roster {:?} has {}", path.as_ref(), e))?;

        let mut ids = Vec::new();
        for (line, row) in rdr.records().enumerate() {
            let row = row.with_context(|| format!("Failed to read roster row {}", line + 2))?;
            if let Some(id) = row.get(column) {
                ids.push(id.to_string());
            }
        }

        let registry = Self::from_ids(ids);
        tracing::info!(patients = registry.len(), "loaded eligibility roster");
        Ok(registry)
    }

    /// Load a roster from the first sheet of an Excel workbook (.xlsx/.xls).
    pub fn from_excel<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut workbook = open_workbook_auto(path)
            .with_context(|| format!("Failed to open roster workbook: {:?}", path))?;
        let sheet = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| anyhow!("Roster workbook {:?} has no sheets", path))?
            .with_context(|| format!("Failed to read first sheet of {:?}", path))?;

        let registry = Self::from_sheet(&sheet).with_context(|| format!("Roster {:?}", path))?;
        tracing::info!(patients = registry.len(), "loaded eligibility roster from workbook");
        Ok(registry)
    }

    /// Roster from a worksheet whose first row holds the headers
    pub fn from_sheet(sheet: &Range<Data>) -> Result<Self> {
        let mut rows = sheet.rows();
        let headers: Vec<String> = rows
            .next()
            .map(|row| row.iter().map(|c| cell_text(c).to_lowercase()).collect())
            .unwrap_or_default();
        let column = id_column(&headers)?;

        let ids = rows.filter_map(|row| row.get(column)).map(cell_text);
        Ok(Self::from_ids(ids))
    }

    /// Load a roster by file extension: workbooks via [`Self::from_excel`],
    /// anything else as CSV.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match extension.as_deref() {
            Some(ext) if EXCEL_EXTENSIONS.contains(&ext) => Self::from_excel(path),
            _ => Self::from_csv(path),
        }
    }

    /// Load a roster, falling back to an empty registry on failure.
    ///
    /// Returns the failure message alongside so callers can surface it as a
    /// warning instead of crashing the run.
    pub fn load_or_empty<P: AsRef<Path>>(path: P) -> (Self, Option<String>) {
        match Self::from_path(path.as_ref()) {
            Ok(registry) => (registry, None),
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::warn!(error = %message, "roster unavailable, no patient gets preferential pricing");
                (Self::empty(), Some(message))
            }
        }
    }

    pub fn is_preferential(&self, patient_id: &str) -> bool {
        self.patients.contains(&normalize_patient_id(patient_id))
    }

    pub fn len(&self) -> usize {
        self.patients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
    }

    /// Sorted ids, for display and persistence
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.patients.iter().cloned().collect();
        ids.sort();
        ids
    }
}

/// Roster workbook extensions
pub const EXCEL_EXTENSIONS: &[&str] = &["xlsx", "xls", "xlsm", "ods"];

/// First header matching [`ROSTER_ID_COLUMNS`], headers already lowercased
fn id_column(headers: &[String]) -> Result<usize> {
    ROSTER_ID_COLUMNS
        .iter()
        .find_map(|wanted| headers.iter().position(|h| h.trim() == *wanted))
        .ok_or_else(|| {
            anyhow!(
                "no patient id column (expected one of: {})",
                ROSTER_ID_COLUMNS.join(", ")
            )
        })
}

/// Numeric cells come back as floats; whole numbers lose the ".0"
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Int(n) => n.to_string(),
        Data::Float(f) if f.is_finite() && f.fract() == 0.0 => format!("{}", *f as i64),
        other => other.to_string(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

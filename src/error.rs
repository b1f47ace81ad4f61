// ❗ Billing Errors - fatal conditions for a run
// Configuration gaps and malformed dates are NOT errors; they surface as
// zero prices, compliance violations or RunWarning values instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("no service records to process")]
    EmptyInput,

    #[error("record {index}: required field `{field}` is empty")]
    MissingField { index: usize, field: &'static str },

    #[error("{source_name}: missing required columns: {}", columns.join(", "))]
    MissingColumns {
        source_name: String,
        columns: Vec<String>,
    },

    #[error("invalid billing rules: {0}")]
    InvalidRules(String),

    #[error("invalid record filter: {0}")]
    InvalidFilter(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, BillingError>;

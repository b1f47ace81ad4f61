// SAVI Billing - Core Library
// TEA therapy billing rules: pricing, monthly bundles, payer compliance,
// financial aggregation. Used by the CLI, the API server and tests.

pub mod error;
pub mod records;
pub mod tariff;
pub mod config;       // Rules as data: tariffs, bundle policy, payer lists
pub mod eligibility;  // Preferential-pricing roster
pub mod pricing;
pub mod bundles;      // Bundle detection + application
pub mod compliance;
pub mod aggregation;
pub mod insights;
pub mod filter;
pub mod orchestrator;
pub mod ingest;
pub mod store;        // Run persistence (SQLite + WAL)
pub mod export;

// Re-export commonly used types
pub use error::{BillingError, Result};
pub use records::{
    ServiceRecord, ProcessedRecord, RecordId,
    normalize_patient_id, parse_execution_date, parse_quantity,
};
pub use tariff::{
    TariffTable, TariffEntry, TariffPrice, PricePair, PricingTier,
    normalize_code,
};
pub use config::{BillingRules, BundlePolicy};
pub use eligibility::EligibilityRegistry;
pub use pricing::PricingResolver;
pub use bundles::{
    Bundle, BundleDetector, BundleApplier, BundleDetection,
    GroupingMode, PeriodKey,
};
pub use compliance::{
    PayerComplianceValidator, ComplianceStatus, Violation, ViolationReason,
};
pub use aggregation::{AggregationEngine, FinancialSummary, GroupTotals};
pub use insights::{BatchInsights, RankedEntry};
pub use filter::RecordFilter;
pub use orchestrator::{BillingOrchestrator, BillingResult, RunWarning};
pub use ingest::{load_records_csv, load_records_sqlite, load_roster, load_roster_csv};
pub use store::{RunStore, RunMetadata, RunSummary, StoredRun};
pub use export::{write_processed_csv, format_brl, format_percentage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

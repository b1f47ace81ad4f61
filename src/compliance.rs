// ✅ Payer Compliance - approved-procedure lists per payer company
// Every row lands in exactly one bucket: compliant, procedure not approved,
// or payer not configured.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::records::{ProcessedRecord, RecordId};

// ============================================================================
// VIOLATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationReason {
    /// Payer has a list and the procedure is not on it
    ProcedureNotApproved,

    /// Payer has no list at all
    PayerNotConfigured,
}

impl ViolationReason {
    pub fn code(&self) -> &'static str {
        match self {
            ViolationReason::ProcedureNotApproved => "procedure_not_approved",
            ViolationReason::PayerNotConfigured => "payer_not_configured",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Compliant,
    Violation(ViolationReason),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Position of the row in the processed record set
    pub row_index: usize,

    /// Source row, None for synthetic rows
    pub source_id: Option<RecordId>,

    pub payer_company: String,
    pub procedure_name: String,
    pub patient_id: String,
    pub patient_name: String,
    pub execution_date: Option<NaiveDate>,

    pub reason: ViolationReason,

    /// Human-readable description naming payer and procedure
    pub message: String,
}

// ============================================================================
// VALIDATOR
// ============================================================================

pub struct PayerComplianceValidator {
    approved: HashMap<String, HashSet<String>>,
    exempt: HashSet<String>,
}

impl PayerComplianceValidator {
    pub fn new(payers: &BTreeMap<String, Vec<String>>, exempt_payers: &[String]) -> Self {
        let approved = payers
            .iter()
            .map(|(payer, procedures)| {
                (
                    payer.trim().to_string(),
                    procedures.iter().map(|p| p.trim().to_string()).collect(),
                )
            })
            .collect();
        let exempt = exempt_payers.iter().map(|p| p.trim().to_string()).collect();

        PayerComplianceValidator { approved, exempt }
    }

    pub fn classify(&self, payer_company: &str, procedure_name: &str) -> ComplianceStatus {
        let payer = payer_company.trim();
        if self.exempt.contains(payer) {
            return ComplianceStatus::Compliant;
        }

        match self.approved.get(payer) {
            Some(procedures) if procedures.contains(procedure_name.trim()) => ComplianceStatus::Compliant,
            Some(_) => ComplianceStatus::Violation(ViolationReason::ProcedureNotApproved),
            None => ComplianceStatus::Violation(ViolationReason::PayerNotConfigured),
        }
    }

    /// Violations in row order
    pub fn validate(&self, records: &[ProcessedRecord]) -> Vec<Violation> {
        let violations: Vec<Violation> = records
            .iter()
            .enumerate()
            .filter_map(|(row_index, record)| {
                match self.classify(&record.payer_company, &record.procedure_name) {
                    ComplianceStatus::Compliant => None,
                    ComplianceStatus::Violation(reason) => Some(Violation {
                        row_index,
                        source_id: record.source_id,
                        payer_company: record.payer_company.clone(),
                        procedure_name: record.procedure_name.clone(),
                        patient_id: record.patient_id.clone(),
                        patient_name: record.patient_name.clone(),
                        execution_date: record.execution_date,
                        reason,
                        message: describe(reason, &record.payer_company, &record.procedure_name),
                    }),
                }
            })
            .collect();

        let unconfigured = violations
            .iter()
            .filter(|v| v.reason == ViolationReason::PayerNotConfigured)
            .count();
        tracing::info!(
            rows = records.len(),
            violations = violations.len(),
            unconfigured_payer = unconfigured,
            "payer compliance validated"
        );

        violations
    }

    /// Validate and copy the outcome onto each row's compliance fields
    pub fn annotate(&self, records: &mut [ProcessedRecord]) -> Vec<Violation> {
        let violations = self.validate(records);
        for violation in &violations {
            if let Some(row) = records.get_mut(violation.row_index) {
                row.compliance_flag = true;
                row.compliance_reason = Some(violation.message.clone());
            }
        }
        violations
    }
}

fn describe(reason: ViolationReason, payer: &str, procedure: &str) -> String {
    match reason {
        ViolationReason::ProcedureNotApproved => {
            format!("Procedure \"{}\" not approved for payer \"{}\"", procedure, payer)
        }
        ViolationReason::PayerNotConfigured => format!("Payer \"{}\" not configured", payer),
    }
}

// ============================================================================
// TESTS
// ============================================================================

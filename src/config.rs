// ⚙️ Billing Rules - versioned rule set loaded from JSON
// Tariffs, bundle policy and payer approval lists live here, not in code.

use anyhow::{Context as AnyhowContext, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use crate::error::BillingError;
use crate::tariff::{normalize_code, PricePair, TariffEntry, TariffPrice, TariffTable};

/// Minimum eligible sessions in one period for a bundle
pub const DEFAULT_BUNDLE_THRESHOLD: i64 = 12;

/// Flat price of a standard-tier bundle
pub const DEFAULT_STANDARD_BUNDLE_PRICE: Decimal = dec!(1150.00);

/// Flat price of a preferential-tier bundle
pub const DEFAULT_PREFERENTIAL_BUNDLE_PRICE: Decimal = dec!(1600.00);

/// Payer name written on synthetic bundle rows
pub const BUNDLE_SENTINEL_PAYER: &str = "PACOTE";
pub const BUNDLE_SENTINEL_CODE: &str = "PACOTE";

// ============================================================================
// BUNDLE POLICY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundlePolicy {
    /// Sessions (sum of performed quantity) needed to form a bundle
    #[serde(default = "default_threshold")]
    pub threshold: i64,

    /// Procedure codes whose sessions count toward a bundle
    pub eligible_codes: Vec<String>,

    pub standard_price: Decimal,
    pub preferential_price: Decimal,

    /// Payer company written on bundle rows
    #[serde(default = "default_sentinel")]
    pub sentinel_payer: String,

    /// Procedure code written on bundle rows
    #[serde(default = "default_sentinel_code")]
    pub sentinel_code: String,
}

fn default_threshold() -> i64 {
    DEFAULT_BUNDLE_THRESHOLD
}

fn default_sentinel() -> String {
    BUNDLE_SENTINEL_PAYER.to_string()
}

fn default_sentinel_code() -> String {
    BUNDLE_SENTINEL_CODE.to_string()
}

impl BundlePolicy {
    pub fn with_threshold(mut self, threshold: i64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn prices(&self) -> PricePair {
        PricePair::new(self.standard_price, self.preferential_price)
    }
}

// ============================================================================
// BILLING RULES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingRules {
    /// Rule-set version label, e.g. "v2"
    pub version: String,

    #[serde(default)]
    pub description: Option<String>,

    pub tariffs: Vec<TariffEntry>,

    pub bundle: BundlePolicy,

    /// Payer company -> procedure names it accepts
    #[serde(default)]
    pub payers: BTreeMap<String, Vec<String>>,

    /// Payers that are never reported as violations (bundle sentinel)
    #[serde(default = "default_exempt_payers")]
    pub exempt_payers: Vec<String>,
}

fn default_exempt_payers() -> Vec<String> {
    vec![BUNDLE_SENTINEL_PAYER.to_string()]
}

impl BillingRules {
    /// Load rules from a JSON file and validate them
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read rules file: {:?}", path.as_ref()))?;

        let rules: BillingRules =
            serde_json::from_str(&content).context("Failed to parse billing rules JSON")?;

        rules
            .validate()
            .with_context(|| format!("Rejected rules file: {:?}", path.as_ref()))?;

        tracing::info!(
            version = %rules.version,
            tariffs = rules.tariffs.len(),
            payers = rules.payers.len(),
            "loaded billing rules"
        );

        Ok(rules)
    }

    /// Reject rule sets the engine cannot apply consistently
    pub fn validate(&self) -> std::result::Result<(), BillingError> {
        if self.bundle.threshold < 1 {
            return Err(BillingError::InvalidRules(format!(
                "bundle threshold must be at least 1, got {}",
                self.bundle.threshold
            )));
        }

        if self.bundle.standard_price < Decimal::ZERO || self.bundle.preferential_price < Decimal::ZERO {
            return Err(BillingError::InvalidRules(
                "bundle prices must not be negative".to_string(),
            ));
        }

        let mut seen: HashMap<String, &str> = HashMap::new();
        for entry in &self.tariffs {
            let code = normalize_code(&entry.code);
            if code.is_empty() {
                return Err(BillingError::InvalidRules("tariff with empty code".to_string()));
            }
            if let Some(previous) = seen.insert(code.clone(), &entry.code) {
                return Err(BillingError::InvalidRules(format!(
                    "codes {:?} and {:?} both normalize to {}",
                    previous, entry.code, code
                )));
            }

            let pairs: Vec<&PricePair> = match &entry.price {
                TariffPrice::Flat(pair) => vec![pair],
                TariffPrice::ByPhysician {
                    physicians,
                    default,
                } => physicians.values().chain(std::iter::once(default)).collect(),
            };
            if pairs
                .iter()
                .any(|p| p.standard < Decimal::ZERO || p.preferential < Decimal::ZERO)
            {
                return Err(BillingError::InvalidRules(format!(
                    "negative price for code {}",
                    entry.code
                )));
            }
        }

        Ok(())
    }

    pub fn tariff_table(&self) -> TariffTable {
        TariffTable::from_entries(&self.tariffs)
    }

    /// Current rule set: digit-only codes, per-physician price for 00010014.
    pub fn builtin() -> Self {
        let tea = PricePair::new(dec!(53.12), dec!(65.00));

        let mut physicians = HashMap::new();
        physicians.insert(
            "MARCELO FARIA DE MORAES BRAGA".to_string(),
            PricePair::new(dec!(80.00), dec!(80.00)),
        );
        physicians.insert(
            "RAFAEL ELIAN ALVARES".to_string(),
            PricePair::new(dec!(150.00), dec!(180.00)),
        );

        let flat = |code: &str, name: &str, pair: PricePair| TariffEntry {
            code: code.to_string(),
            name: Some(name.to_string()),
            price: TariffPrice::Flat(pair),
        };

        let tariffs = vec![
            flat("60010150", "CONSULTA/SESSAO PSICOPEDAGOGIA - TEA", tea),
            flat("62010204", "SESSAO DE FISIOTERAPIA PARA TEA", tea),
            flat("62010212", "SESSAO MUSICOTERAPIA", tea),
            flat("65010035", "CONSULTA/SESSAO NUTRICAO TEA", tea),
            flat("60010126", "PSICOTERAPIA TEA", tea),
            flat("61010073", "FONOAUDIOLOGIA TEA", tea),
            flat("62010123", "TERAPIA OCUPACIONAL TEA", tea),
            TariffEntry {
                code: "00010014".to_string(),
                name: Some("PSIQUIATRIA DA INFANCIA / NEURO PEDIATRIA".to_string()),
                price: TariffPrice::ByPhysician {
                    physicians,
                    default: PricePair::new(dec!(150.00), dec!(180.00)),
                },
            },
            flat(
                "60010142",
                "TESTE NEUROPSICOLOGICO",
                PricePair::new(dec!(800.00), dec!(800.00)),
            ),
            flat(
                "60010363",
                "CONSULTA/SESSAO DE NEUROPSICOLOGIA",
                PricePair::new(dec!(100.00), dec!(100.00)),
            ),
            flat("50001213", "MUSICOTERAPIA - POR SESSAO", tea),
            flat(
                "10101012",
                "CONSULTA EM CONSULTORIO (NO HORARIO NORMAL OU PREESTABELECIDO)",
                PricePair::new(dec!(150.00), dec!(180.00)),
            ),
        ];

        let bundle = BundlePolicy {
            threshold: DEFAULT_BUNDLE_THRESHOLD,
            eligible_codes: [
                "61010073", "60010126", "62010123", "62010204", "62010212", "60010150", "50001213",
            ]
            .iter()
            .map(|c| c.to_string())
            .collect(),
            standard_price: DEFAULT_STANDARD_BUNDLE_PRICE,
            preferential_price: DEFAULT_PREFERENTIAL_BUNDLE_PRICE,
            sentinel_payer: BUNDLE_SENTINEL_PAYER.to_string(),
            sentinel_code: BUNDLE_SENTINEL_CODE.to_string(),
        };

        let tea_therapies: Vec<String> = [
            "PSICOTERAPIA TEA",
            "TERAPIA OCUPACIONAL TEA",
            "FONOAUDIOLOGIA TEA",
            "CONSULTA/SESSAO PSICOPEDAGOGIA - TEA",
            "SESSAO DE FISIOTERAPIA PARA TEA",
            "SESSAO MUSICOTERAPIA",
            "CONSULTA/ SESSAO NUTRICAO TEA",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let neuro: Vec<String> = vec![
            "TESTE NEUROPSICOLOGICO".to_string(),
            "CONSULTA/SESSAO DE NEUROPSICOLOGIA".to_string(),
        ];
        let office: Vec<String> = vec![
            "CONSULTA EM CONSULTORIO".to_string(),
            "CONSULTA EM CONSULTORIO (NO HORARIO NORMAL OU PREESTABELECIDO)".to_string(),
        ];

        let mut payers = BTreeMap::new();
        payers.insert("Hapvida".to_string(), tea_therapies.clone());
        payers.insert("Notredame".to_string(), tea_therapies);
        payers.insert("Hapvida_neuro".to_string(), neuro.clone());
        payers.insert("Notredame_neuro".to_string(), neuro);
        payers.insert("Hapvida_libelula".to_string(), office.clone());
        payers.insert("Notredame_libelula".to_string(), office);

        BillingRules {
            version: "v2".to_string(),
            description: Some("Digit-only procedure codes, per-physician pricing for 00010014".to_string()),
            tariffs,
            bundle,
            payers,
            exempt_payers: default_exempt_payers(),
        }
    }
}

impl Default for BillingRules {
    fn default() -> Self {
        Self::builtin()
    }
}

// ============================================================================
// TESTS
// ============================================================================

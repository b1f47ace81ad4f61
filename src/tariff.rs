// 🏷️ Tariff Table - Prices as Data
// Procedure code -> {standard, preferential} price pair, with one shape that
// varies by physician. Codes are matched in normalized (digits-only) form.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// PRICING TIER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PricingTier {
    /// Default tier ("comum")
    Standard,

    /// Patients on the eligibility roster ("especial")
    Preferential,
}

impl PricingTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingTier::Standard => "standard",
            PricingTier::Preferential => "preferential",
        }
    }
}

impl fmt::Display for PricingTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// PRICE SHAPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePair {
    pub standard: Decimal,
    pub preferential: Decimal,
}

impl PricePair {
    pub fn new(standard: Decimal, preferential: Decimal) -> Self {
        PricePair {
            standard,
            preferential,
        }
    }

    pub fn for_tier(&self, tier: PricingTier) -> Decimal {
        match tier {
            PricingTier::Standard => self.standard,
            PricingTier::Preferential => self.preferential,
        }
    }
}

/// Exactly one shape applies per procedure code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TariffPrice {
    /// Same price pair whoever performs the procedure
    Flat(PricePair),

    /// Price pair chosen by physician name; `default` covers unknown names
    ByPhysician {
        physicians: HashMap<String, PricePair>,
        default: PricePair,
    },
}

/// One configured tariff line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TariffEntry {
    /// Procedure code in any format ("60.01.015-0" or "60010150")
    pub code: String,

    /// Display name, informational only
    #[serde(default)]
    pub name: Option<String>,

    pub price: TariffPrice,
}

/// Strip everything but ASCII digits so formatted and digit-only codes match.
///
/// "60.01.015-0" -> "60010150". A code with no digits at all is kept as its
/// trimmed uppercase text so sentinel codes like "PACOTE" stay distinct.
pub fn normalize_code(code: &str) -> String {
    let digits: String = code.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        code.trim().to_uppercase()
    } else {
        digits
    }
}

fn normalize_physician(name: &str) -> String {
    name.trim().to_uppercase()
}

// ============================================================================
// TARIFF TABLE
// ============================================================================

/// Immutable lookup table built from configuration.
#[derive(Debug, Clone, Default)]
pub struct TariffTable {
    entries: HashMap<String, TariffPrice>,
}

impl TariffTable {
    /// Build the table, normalizing codes and physician names.
    ///
    /// A later entry for the same normalized code replaces an earlier one.
    pub fn from_entries(entries: &[TariffEntry]) -> Self {
        let mut table = HashMap::new();

        for entry in entries {
            let price = match &entry.price {
                TariffPrice::Flat(pair) => TariffPrice::Flat(*pair),
                TariffPrice::ByPhysician {
                    physicians,
                    default,
                } => TariffPrice::ByPhysician {
                    physicians: physicians
                        .iter()
                        .map(|(name, pair)| (normalize_physician(name), *pair))
                        .collect(),
                    default: *default,
                },
            };
            table.insert(normalize_code(&entry.code), price);
        }

        TariffTable { entries: table }
    }

    /// Whether the code has any configured price
    pub fn contains(&self, procedure_code: &str) -> bool {
        self.entries.contains_key(&normalize_code(procedure_code))
    }

    /// Whether the code's price depends on the physician
    pub fn is_physician_variable(&self, procedure_code: &str) -> bool {
        matches!(
            self.entries.get(&normalize_code(procedure_code)),
            Some(TariffPrice::ByPhysician { .. })
        )
    }

    /// Price for a code and tier; 0 when the code is unknown.
    ///
    /// For a physician-variable code this returns the `default` pair's price.
    pub fn price_for(&self, procedure_code: &str, tier: PricingTier) -> Decimal {
        self.price_for_physician(procedure_code, "", tier)
    }

    /// Price for a code, physician and tier; 0 when the code is unknown.
    pub fn price_for_physician(
        &self,
        procedure_code: &str,
        physician_name: &str,
        tier: PricingTier,
    ) -> Decimal {
        match self.entries.get(&normalize_code(procedure_code)) {
            Some(TariffPrice::ByPhysician {
                physicians,
                default,
            }) => physicians
                .get(&normalize_physician(physician_name))
                .unwrap_or(default)
                .for_tier(tier),
            Some(TariffPrice::Flat(pair)) => pair.for_tier(tier),
            None => Decimal::ZERO,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn flat(code: &str, standard: Decimal, preferential: Decimal) -> TariffEntry {
        TariffEntry {
            code: code.to_string(),
            name: None,
            price: TariffPrice::Flat(PricePair::new(standard, preferential)),
        }
    }

    fn neuro_entry() -> TariffEntry {
        let mut physicians = HashMap::new();
        physicians.insert(
            "Marcelo Faria de Moraes Braga".to_string(),
            PricePair::new(dec!(80.00), dec!(80.00)),
        );
        TariffEntry {
            code: "00010014".to_string(),
            name: Some("PSIQUIATRIA DA INFANCIA / NEURO PEDIATRIA".to_string()),
            price: TariffPrice::ByPhysician {
                physicians,
                default: PricePair::new(dec!(150.00), dec!(180.00)),
            },
        }
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code("60.01.015-0"), "60010150");
        assert_eq!(normalize_code("60010150"), "60010150");
        assert_eq!(normalize_code(" pacote "), "PACOTE");
    }

    #[test]
    fn test_formatted_and_digit_codes_resolve_identically() {
        let table = TariffTable::from_entries(&[flat("61.01.007-3", dec!(53.12), dec!(65.00))]);

        assert_eq!(table.price_for("61010073", PricingTier::Standard), dec!(53.12));
        assert_eq!(table.price_for("61.01.007-3", PricingTier::Preferential), dec!(65.00));
    }

    #[test]
    fn test_unknown_code_is_zero() {
        let table = TariffTable::from_entries(&[flat("61010073", dec!(53.12), dec!(65.00))]);

        assert_eq!(table.price_for("99999999", PricingTier::Standard), Decimal::ZERO);
        assert!(!table.contains("99999999"));
    }

    #[test]
    fn test_physician_variable_code() {
        let table = TariffTable::from_entries(&[neuro_entry()]);

        assert!(table.is_physician_variable("00.01.001-4"));
        assert_eq!(
            table.price_for_physician("00010014", "MARCELO FARIA DE MORAES BRAGA", PricingTier::Preferential),
            dec!(80.00)
        );
        // unknown physician falls back to default
        assert_eq!(
            table.price_for_physician("00010014", "OUTRO MEDICO", PricingTier::Preferential),
            dec!(180.00)
        );
        assert_eq!(table.price_for("00010014", PricingTier::Standard), dec!(150.00));
    }

    #[test]
    fn test_later_entry_wins() {
        let table = TariffTable::from_entries(&[
            flat("60.01.014-2", dec!(700.00), dec!(700.00)),
            flat("60010142", dec!(800.00), dec!(800.00)),
        ]);

        assert_eq!(table.len(), 1);
        assert_eq!(table.price_for("60010142", PricingTier::Standard), dec!(800.00));
    }

    #[test]
    fn test_tariff_entry_json_shapes() {
        let json = r#"[
            {"code": "61010073", "price": {"kind": "flat", "standard": "53.12", "preferential": "65.00"}},
            {"code": "00010014", "price": {"kind": "by_physician",
                "physicians": {"RAFAEL ELIAN ALVARES": {"standard": "150.00", "preferential": "180.00"}},
                "default": {"standard": "150.00", "preferential": "180.00"}}}
        ]"#;

        let entries: Vec<TariffEntry> = serde_json::from_str(json).unwrap();
        let table = TariffTable::from_entries(&entries);

        assert_eq!(table.len(), 2);
        assert!(table.is_physician_variable("00010014"));
        assert!(!table.is_physician_variable("61010073"));
    }
}

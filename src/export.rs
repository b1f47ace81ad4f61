// 📤 Export - processed rows to CSV and money/percent display formats

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::io::Write;

use crate::error::Result;
use crate::records::ProcessedRecord;

/// Flat CSV row; optional fields become empty cells
#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    source_id: Option<usize>,
    empresa: &'a str,
    data_execucao: String,
    usuario_codigo: &'a str,
    usuario_nome: &'a str,
    medico_nome: &'a str,
    procedimento_codigo: &'a str,
    procedimento_nome: &'a str,
    qtde_autorizada: i64,
    qtde_realizada: i64,
    valor_unitario: String,
    pacote: bool,
    pacote_tipo: Option<&'static str>,
    pacote_periodo: Option<String>,
    inconsistencia: bool,
    motivo_inconsistencia: Option<&'a str>,
}

impl<'a> From<&'a ProcessedRecord> for ExportRow<'a> {
    fn from(r: &'a ProcessedRecord) -> Self {
        ExportRow {
            source_id: r.source_id,
            empresa: &r.payer_company,
            data_execucao: r
                .execution_date
                .map(|d| d.format("%d/%m/%Y").to_string())
                .unwrap_or_default(),
            usuario_codigo: &r.patient_id,
            usuario_nome: &r.patient_name,
            medico_nome: &r.physician_name,
            procedimento_codigo: &r.procedure_code,
            procedimento_nome: &r.procedure_name,
            qtde_autorizada: r.authorized_qty,
            qtde_realizada: r.performed_qty,
            valor_unitario: r.unit_value.round_dp(2).to_string(),
            pacote: r.is_bundle_row,
            pacote_tipo: r.bundle_tier.map(|t| t.as_str()),
            pacote_periodo: r.bundle_period.map(|p| p.to_string()),
            inconsistencia: r.compliance_flag,
            motivo_inconsistencia: r.compliance_reason.as_deref(),
        }
    }
}

/// Write processed rows as CSV with `producao`-style headers
pub fn write_processed_csv<W: Write>(records: &[ProcessedRecord], writer: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for record in records {
        wtr.serialize(ExportRow::from(record))?;
    }
    wtr.flush()?;

    tracing::debug!(rows = records.len(), "processed records exported");
    Ok(())
}

/// Brazilian currency: `R$ 1.150,00`, negatives as `-R$ 10,00`
pub fn format_brl(value: Decimal) -> String {
    let rounded = value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let sign = if rounded.is_sign_negative() && !rounded.is_zero() { "-" } else { "" };
    let text = format!("{:.2}", rounded.abs());
    let (units, cents) = text.split_once('.').unwrap_or((text.as_str(), "00"));

    format!("{}R$ {},{}", sign, group_thousands(units), cents)
}

/// `12.5` -> `12,5%`
pub fn format_percentage(value: Decimal) -> String {
    let rounded = value.round_dp_with_strategy(1, RoundingStrategy::MidpointAwayFromZero);
    format!("{:.1}%", rounded).replace('.', ",")
}

fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push('.');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundles::PeriodKey;
    use crate::tariff::PricingTier;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn row() -> ProcessedRecord {
        ProcessedRecord {
            source_id: Some(3),
            payer_company: "Hapvida".to_string(),
            procedure_code: "61010073".to_string(),
            procedure_name: "FONOAUDIOLOGIA TEA".to_string(),
            physician_name: "ANA".to_string(),
            patient_id: "P1".to_string(),
            patient_name: "Paciente, Um".to_string(),
            execution_date: NaiveDate::from_ymd_opt(2024, 3, 5),
            authorized_qty: 1,
            performed_qty: 1,
            unit_value: dec!(53.12),
            is_bundle_row: false,
            bundle_tier: None,
            bundle_period: None,
            compliance_flag: false,
            compliance_reason: None,
        }
    }

    #[test]
    fn test_format_brl() {
        assert_eq!(format_brl(dec!(1150)), "R$ 1.150,00");
        assert_eq!(format_brl(dec!(53.12)), "R$ 53,12");
        assert_eq!(format_brl(dec!(1234567.891)), "R$ 1.234.567,89");
        assert_eq!(format_brl(Decimal::ZERO), "R$ 0,00");
        assert_eq!(format_brl(dec!(-10)), "-R$ 10,00");
    }

    #[test]
    fn test_format_percentage() {
        assert_eq!(format_percentage(dec!(12.5)), "12,5%");
        assert_eq!(format_percentage(dec!(33.333)), "33,3%");
        assert_eq!(format_percentage(dec!(100)), "100,0%");
    }

    #[test]
    fn test_write_processed_csv() {
        let mut bundle = row();
        bundle.source_id = None;
        bundle.is_bundle_row = true;
        bundle.execution_date = None;
        bundle.unit_value = dec!(1150.00);
        bundle.bundle_tier = Some(PricingTier::Standard);
        bundle.bundle_period = Some(PeriodKey::month(2024, 3));

        let mut out = Vec::new();
        write_processed_csv(&[row(), bundle], &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("source_id,empresa,data_execucao"));
        assert!(lines[1].contains("05/03/2024"));
        assert!(lines[1].contains("\"Paciente, Um\""));
        assert!(lines[1].contains(",53.12,"));
        assert!(lines[2].starts_with(",Hapvida,,"));
        assert!(lines[2].contains(",1150.00,true,standard,2024-03,false,"));
    }
}

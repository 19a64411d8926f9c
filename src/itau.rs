//! Itaú credit-card invoices.
//!
//! The PDF is reduced to plain text and read as a sequence of statement
//! blocks: a `dd/mm` line, one or more description lines, an optional
//! installment line (`NN/NN`) and a BRL amount. Invoices carry no
//! transaction ids, so ids are synthesized from the payment date and the
//! block's position in the document.

use std::sync::OnceLock;

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{Result, TallyError};
use crate::models::{parse_amount_cents, StandardRecord};
use crate::sources::SourceKind;

fn day_month_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{1,2})/(\d{1,2})$").expect("day/month regex"))
}

fn amount_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^-?\s*(?:R\$\s*)?\d{1,3}(?:\.\d{3})*,\d{2}$").expect("amount regex")
    })
}

fn payment_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)vencimento\D*(\d{2}/\d{2}/\d{4})").expect("payment date regex")
    })
}

fn total_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)total\s+desta\s+fatura\s*(?:r\$)?\s*(-?[\d\.]+,\d{2})").expect("total regex")
    })
}

/// Parsed invoice: payment date, declared total (charges positive) and the
/// statements in document order with ids already assigned.
#[derive(Debug, Clone)]
pub struct Invoice {
    pub payment_date: NaiveDate,
    pub declared_total_cents: Option<i64>,
    pub records: Vec<StandardRecord>,
}

impl Invoice {
    /// Sum of the parsed statements in invoice sign (charges positive).
    pub fn parsed_total_cents(&self) -> i64 {
        -self.records.iter().map(|r| r.amount_cents).sum::<i64>()
    }

    /// Compare the declared total with the parsed sum. A mismatch is logged,
    /// never fatal: partial extraction still yields usable rows.
    pub fn check_total(&self) -> bool {
        let Some(declared) = self.declared_total_cents else {
            debug!(payment_date = %self.payment_date, "invoice total not found, skipping check");
            return true;
        };
        let parsed = self.parsed_total_cents();
        if parsed != declared {
            warn!(
                payment_date = %self.payment_date,
                declared = %crate::models::format_cents(declared),
                parsed = %crate::models::format_cents(parsed),
                "invoice total mismatch"
            );
            return false;
        }
        true
    }
}

fn squeeze(line: &str) -> String {
    line.chars().filter(|c| !c.is_whitespace()).collect()
}

fn as_amount(line: &str) -> Option<i64> {
    let line = line.trim();
    if !amount_re().is_match(line) {
        return None;
    }
    parse_amount_cents(line)
}

fn as_day_month(line: &str) -> Option<(u32, u32)> {
    let squeezed = squeeze(line);
    let caps = day_month_re().captures(&squeezed)?;
    let day = caps[1].parse().ok()?;
    let month = caps[2].parse().ok()?;
    Some((day, month))
}

/// Statement dates carry no year: months after the payment month belong to
/// the previous year (December purchases on a January invoice).
fn statement_date(day: u32, month: u32, payment_date: NaiveDate) -> Option<NaiveDate> {
    let year = if month > payment_date.month() {
        payment_date.year() - 1
    } else {
        payment_date.year()
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Parse the extracted text of an invoice.
pub fn parse_text(text: &str) -> Result<Invoice> {
    let payment_date = payment_date_re()
        .captures(text)
        .and_then(|c| NaiveDate::parse_from_str(&c[1], "%d/%m/%Y").ok())
        .ok_or_else(|| TallyError::Pdf("invoice payment date (Vencimento) not found".into()))?;
    let declared_total_cents = total_re()
        .captures(text)
        .and_then(|c| parse_amount_cents(&c[1]));

    let lines: Vec<&str> = text
        .split(['\n', '\u{000C}'])
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let mut records = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let Some((day, month)) = as_day_month(lines[i]) else {
            i += 1;
            continue;
        };

        let mut j = i + 1;
        let mut description: Vec<&str> = Vec::new();
        let mut installment: Option<String> = None;
        let mut amount: Option<i64> = None;
        while j < lines.len() {
            if let Some(value) = as_amount(lines[j]) {
                amount = Some(value);
                break;
            }
            if as_day_month(lines[j]).is_some() {
                if let Some(value) = lines.get(j + 1).and_then(|l| as_amount(l)) {
                    installment = Some(squeeze(lines[j]));
                    amount = Some(value);
                    j += 1;
                    break;
                }
                // A new date line before any amount: this block is broken.
                break;
            }
            description.push(lines[j]);
            j += 1;
        }

        let (Some(amount), false) = (amount, description.is_empty()) else {
            i += 1;
            continue;
        };
        let Some(transaction_date) = statement_date(day, month, payment_date) else {
            debug!(line = lines[i], "skipping statement with impossible date");
            i = j + 1;
            continue;
        };

        let mut joined = description.join(" ");
        if let Some(installment) = installment {
            joined.push(' ');
            joined.push_str(&installment);
        }
        let mut record = StandardRecord {
            id: String::new(),
            transaction_date,
            payment_date: Some(payment_date),
            description: joined,
            amount_cents: -amount,
            source: SourceKind::ItauCreditCard,
        };
        record.id = SourceKind::ItauCreditCard.generate_id(&record, records.len() + 1)?;
        records.push(record);
        i = j + 1;
    }

    Ok(Invoice {
        payment_date,
        declared_total_cents,
        records,
    })
}

#[cfg(feature = "pdf")]
pub fn parse_pdf(path: &std::path::Path) -> Result<Vec<StandardRecord>> {
    let text = pdf_extract::extract_text(path)
        .map_err(|e| TallyError::Pdf(format!("{}: {e}", path.display())))?;
    let invoice = parse_text(&text)?;
    invoice.check_total();
    debug!(
        file = %path.display(),
        statements = invoice.records.len(),
        "parsed Itaú invoice"
    );
    Ok(invoice.records)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVOICE: &str = "\
Resumo da fatura
Vencimento: 15/03/2025
Total desta fatura
R$ 1.285,90
Lançamentos: compras e saques
20/02
IFOOD *RESTAURANTE
SAO PAULO
45,90
28/12
DELL COMPUTADORES
12/12
1.250,00
\u{000C}03/03
ESTORNO LOJA
-10,00
";

    #[test]
    fn test_parse_text_blocks_in_order() {
        let invoice = parse_text(INVOICE).unwrap();
        assert_eq!(invoice.payment_date, NaiveDate::from_ymd_opt(2025, 3, 15).unwrap());
        assert_eq!(invoice.records.len(), 3);

        let first = &invoice.records[0];
        assert_eq!(first.id, "2025-03-001");
        assert_eq!(first.description, "IFOOD *RESTAURANTE SAO PAULO");
        assert_eq!(first.amount_cents, -4590);
        assert_eq!(first.transaction_date, NaiveDate::from_ymd_opt(2025, 2, 20).unwrap());

        let dell = &invoice.records[1];
        assert_eq!(dell.id, "2025-03-002");
        assert_eq!(dell.description, "DELL COMPUTADORES 12/12");
        assert_eq!(dell.amount_cents, -125000);
        assert_eq!(dell.transaction_date, NaiveDate::from_ymd_opt(2024, 12, 28).unwrap());

        let refund = &invoice.records[2];
        assert_eq!(refund.id, "2025-03-003");
        assert_eq!(refund.amount_cents, 1000);
    }

    #[test]
    fn test_total_check() {
        let invoice = parse_text(INVOICE).unwrap();
        assert_eq!(invoice.declared_total_cents, Some(128590));
        assert!(invoice.check_total());

        let off = INVOICE.replace("R$ 1.285,90", "R$ 1.300,00");
        let invoice = parse_text(&off).unwrap();
        assert!(!invoice.check_total());
    }

    #[test]
    fn test_missing_payment_date_is_an_error() {
        let text = INVOICE.replace("Vencimento: 15/03/2025", "");
        assert!(matches!(parse_text(&text), Err(TallyError::Pdf(_))));
    }

    #[test]
    fn test_block_without_amount_is_skipped() {
        let text = "Vencimento 10/01/2025\n05/01\nTARIFA\n06/01\nPADARIA\n12,00\n";
        let invoice = parse_text(text).unwrap();
        assert_eq!(invoice.records.len(), 1);
        assert_eq!(invoice.records[0].description, "PADARIA");
        assert_eq!(invoice.records[0].id, "2025-01-001");
    }
}

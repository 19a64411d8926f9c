use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::Datelike;
use sha2::{Digest, Sha256};

use crate::error::{Result, TallyError};
use crate::models::{parse_amount_cents, parse_date, StandardRecord, StandardRow};

/// Header of the standard CSV every parser emits.
pub const STANDARD_COLUMNS: [&str; 6] = [
    "id",
    "transaction_date",
    "payment_date",
    "description",
    "amount",
    "account",
];

/// How a source identifies its transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdStrategy {
    /// Institution-issued reference, passed through.
    Native,
    /// `yyyy-mm-NNN` from the invoice payment date and document order.
    PaymentSequence,
    /// SHA-256 of the row content, for exports with neither.
    ContentHash,
}

// ---------------------------------------------------------------------------
// Source kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKind {
    ItauCreditCard,
    NubankCredit,
    NubankChecking,
}

pub const ALL_SOURCES: &[SourceKind] = &[
    SourceKind::ItauCreditCard,
    SourceKind::NubankCredit,
    SourceKind::NubankChecking,
];

impl SourceKind {
    pub fn key(&self) -> &'static str {
        match self {
            Self::ItauCreditCard => "itau_cc",
            Self::NubankCredit => "nubank_cc",
            Self::NubankChecking => "nubank_chk",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ItauCreditCard => "Itaú Credit Card",
            Self::NubankCredit => "Nubank Credit Card",
            Self::NubankChecking => "Nubank Checking",
        }
    }

    pub fn id_strategy(&self) -> IdStrategy {
        match self {
            Self::ItauCreditCard => IdStrategy::PaymentSequence,
            Self::NubankCredit => IdStrategy::ContentHash,
            Self::NubankChecking => IdStrategy::Native,
        }
    }

    pub fn standard_columns(&self) -> &'static [&'static str] {
        &STANDARD_COLUMNS
    }

    /// Whether `file_path` looks like a raw export of this source.
    pub fn detect(&self, file_path: &Path) -> bool {
        match self {
            Self::ItauCreditCard => has_extension(file_path, "pdf"),
            Self::NubankCredit => {
                has_extension(file_path, "csv")
                    && read_header(file_path).is_some_and(|h| is_nubank_credit_header(&h))
            }
            Self::NubankChecking => {
                has_extension(file_path, "csv")
                    && read_header(file_path).is_some_and(|h| is_nubank_checking_header(&h))
            }
        }
    }

    /// Parse a raw export into standard records, in document order.
    pub fn parse(&self, file_path: &Path) -> Result<Vec<StandardRecord>> {
        match self {
            #[cfg(feature = "pdf")]
            Self::ItauCreditCard => crate::itau::parse_pdf(file_path),
            #[cfg(not(feature = "pdf"))]
            Self::ItauCreditCard => Err(TallyError::Pdf(format!(
                "built without PDF support, cannot read {}",
                file_path.display()
            ))),
            Self::NubankCredit => parse_nubank_credit(file_path),
            Self::NubankChecking => parse_nubank_checking(file_path),
        }
    }

    /// Derive the uniqueness key for `record`, the `sequence_index`-th (1-based)
    /// transaction of its document. A non-empty record id is always kept.
    ///
    /// Only one instrument per billing month is supported for
    /// `PaymentSequence` sources: two cards of the same kind in the same month
    /// produce the same ids.
    pub fn generate_id(&self, record: &StandardRecord, sequence_index: usize) -> Result<String> {
        if !record.id.is_empty() {
            return Ok(record.id.clone());
        }
        match self.id_strategy() {
            IdStrategy::PaymentSequence => {
                let payment = record.payment_date.ok_or_else(|| {
                    TallyError::MissingPaymentDate(format!(
                        "{} transaction #{sequence_index} ({})",
                        self.key(),
                        record.description
                    ))
                })?;
                Ok(sequence_id(payment.year(), payment.month(), sequence_index))
            }
            IdStrategy::Native | IdStrategy::ContentHash => Ok(content_hash_id(record)),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for SourceKind {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self> {
        get_by_key(s).ok_or_else(|| TallyError::UnknownSource(s.to_string()))
    }
}

pub fn get_by_key(key: &str) -> Option<SourceKind> {
    ALL_SOURCES.iter().find(|s| s.key() == key.trim()).copied()
}

/// Pick the parser for a raw export: detection first, then file name hints.
pub fn get_for_file(file_path: &Path) -> Option<SourceKind> {
    if let Some(kind) = ALL_SOURCES.iter().find(|s| s.detect(file_path)) {
        return Some(*kind);
    }
    source_from_file_name(file_path)
}

pub fn sequence_id(year: i32, month: u32, sequence_index: usize) -> String {
    format!("{year:04}-{month:02}-{sequence_index:03}")
}

fn content_hash_id(record: &StandardRecord) -> String {
    let payment = record.payment_date.map(|d| d.to_string()).unwrap_or_default();
    let parts = [
        record.source.key().to_string(),
        record.transaction_date.to_string(),
        payment,
        record.description.clone(),
        record.amount_cents.to_string(),
    ];
    let mut hasher = Sha256::new();
    hasher.update(parts.join("|").as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Resolve a source from file name conventions (`itau_*.csv`, `nubank_conta.csv`).
pub fn source_from_file_name(file_path: &Path) -> Option<SourceKind> {
    let name = file_path.file_name()?.to_str()?.to_lowercase();
    if name.contains("itau") {
        return Some(SourceKind::ItauCreditCard);
    }
    if name.contains("nubank") || name.starts_with("nu_") || name.starts_with("nu-") {
        if ["conta", "checking", "chk", "account"].iter().any(|t| name.contains(t)) {
            return Some(SourceKind::NubankChecking);
        }
        return Some(SourceKind::NubankCredit);
    }
    None
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn has_extension(file_path: &Path, ext: &str) -> bool {
    file_path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn normalize_header(value: &str) -> String {
    crate::canonical::canonicalize(value).replace(' ', "")
}

fn read_header(file_path: &Path) -> Option<Vec<String>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(file_path)
        .ok()?;
    let record = rdr.records().next()?.ok()?;
    Some(record.iter().map(normalize_header).collect())
}

fn is_nubank_credit_header(header: &[String]) -> bool {
    header.iter().any(|h| h == "title") && header.iter().any(|h| h == "amount")
}

fn is_nubank_checking_header(header: &[String]) -> bool {
    header.iter().any(|h| h == "identificador") && header.iter().any(|h| h == "valor")
}

fn column(header: &[String], names: &[&str]) -> Option<usize> {
    header.iter().position(|h| names.contains(&h.as_str()))
}

fn open_csv(file_path: &Path) -> Result<(Vec<String>, csv::Reader<std::fs::File>)> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(file_path)?;
    let header = rdr.headers()?.iter().map(normalize_header).collect();
    Ok((header, rdr))
}

// ---------------------------------------------------------------------------
// Nubank credit card: date,title,amount (positive = charge)
// ---------------------------------------------------------------------------

fn parse_nubank_credit(file_path: &Path) -> Result<Vec<StandardRecord>> {
    let (header, mut rdr) = open_csv(file_path)?;
    let (Some(idx_date), Some(idx_title), Some(idx_amount)) = (
        column(&header, &["date", "data"]),
        column(&header, &["title", "descricao", "description"]),
        column(&header, &["amount", "valor"]),
    ) else {
        return Err(TallyError::Validation(format!(
            "{} is not a Nubank credit card export",
            file_path.display()
        )));
    };

    let mut records = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let (Some(date), Some(amount)) = (
            record.get(idx_date).and_then(parse_date),
            record.get(idx_amount).and_then(parse_amount_cents),
        ) else {
            continue;
        };
        let description = record.get(idx_title).unwrap_or("").trim().to_string();
        if description.is_empty() {
            continue;
        }
        records.push(StandardRecord {
            id: String::new(),
            transaction_date: date,
            payment_date: None,
            description,
            amount_cents: -amount,
            source: SourceKind::NubankCredit,
        });
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Nubank checking: Data,Valor,Identificador,Descrição (signed cash flow)
// ---------------------------------------------------------------------------

fn parse_nubank_checking(file_path: &Path) -> Result<Vec<StandardRecord>> {
    let (header, mut rdr) = open_csv(file_path)?;
    let (Some(idx_date), Some(idx_amount), Some(idx_desc)) = (
        column(&header, &["data", "date"]),
        column(&header, &["valor", "amount"]),
        column(&header, &["descricao", "description"]),
    ) else {
        return Err(TallyError::Validation(format!(
            "{} is not a Nubank checking export",
            file_path.display()
        )));
    };
    let idx_id = column(&header, &["identificador", "id"]);

    let mut records = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let (Some(date), Some(amount)) = (
            record.get(idx_date).and_then(parse_date),
            record.get(idx_amount).and_then(parse_amount_cents),
        ) else {
            continue;
        };
        let description = record.get(idx_desc).unwrap_or("").trim().to_string();
        if description.is_empty() {
            continue;
        }
        let id = idx_id
            .and_then(|i| record.get(i))
            .unwrap_or("")
            .trim()
            .to_string();
        records.push(StandardRecord {
            id,
            transaction_date: date,
            payment_date: None,
            description,
            amount_cents: amount,
            source: SourceKind::NubankChecking,
        });
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Standard CSV output
// ---------------------------------------------------------------------------

/// Append `records` to the standard CSV at `output`, skipping ids already
/// present. Ids are generated first, so re-running a parse is a no-op.
/// Returns the number of rows written.
pub fn write_standard_csv(output: &Path, records: &[StandardRecord]) -> Result<usize> {
    let mut existing = std::collections::HashSet::new();
    let has_rows = std::fs::metadata(output).is_ok_and(|m| m.len() > 0);
    if has_rows {
        let mut rdr = csv::ReaderBuilder::new().flexible(true).from_path(output)?;
        for result in rdr.records() {
            if let Some(id) = result?.get(0) {
                existing.insert(id.to_string());
            }
        }
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(output)?;
    let mut wtr = csv::Writer::from_writer(file);
    if !has_rows {
        let header = records
            .first()
            .map_or(STANDARD_COLUMNS.as_slice(), |r| r.source.standard_columns());
        wtr.write_record(header)?;
    }

    let mut written = 0usize;
    for (i, record) in records.iter().enumerate() {
        let id = record.source.generate_id(record, i + 1)?;
        if !existing.insert(id.clone()) {
            continue;
        }
        let row = StandardRow {
            id,
            ..StandardRow::from(record)
        };
        wtr.write_record([
            &row.id,
            &row.transaction_date,
            &row.payment_date,
            &row.description,
            &row.amount,
            &row.account,
        ])?;
        written += 1;
    }
    wtr.flush()?;
    Ok(written)
}

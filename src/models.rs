use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TallyError};
use crate::sources::SourceKind;

/// One row of the standard CSV before validation. Every parser writes this
/// shape and the importer reads it back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StandardRow {
    pub id: String,
    pub transaction_date: String,
    pub payment_date: String,
    pub description: String,
    pub amount: String,
    pub account: String,
}

/// Validated record in the standard format. Amounts are signed cents,
/// outflows negative.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardRecord {
    pub id: String,
    pub transaction_date: NaiveDate,
    pub payment_date: Option<NaiveDate>,
    pub description: String,
    pub amount_cents: i64,
    pub source: SourceKind,
}

impl StandardRow {
    pub fn validate(&self, source: SourceKind) -> Result<StandardRecord> {
        let description = self.description.trim();
        if description.is_empty() {
            return Err(TallyError::Validation("missing description".into()));
        }
        if self.amount.trim().is_empty() {
            return Err(TallyError::Validation("missing amount".into()));
        }
        let amount_cents = parse_amount_cents(&self.amount)
            .ok_or_else(|| TallyError::Validation(format!("malformed amount '{}'", self.amount.trim())))?;
        if self.transaction_date.trim().is_empty() {
            return Err(TallyError::Validation("missing transaction_date".into()));
        }
        let transaction_date = parse_date(&self.transaction_date).ok_or_else(|| {
            TallyError::Validation(format!("malformed transaction_date '{}'", self.transaction_date.trim()))
        })?;
        let payment_date = if self.payment_date.trim().is_empty() {
            None
        } else {
            Some(parse_date(&self.payment_date).ok_or_else(|| {
                TallyError::Validation(format!("malformed payment_date '{}'", self.payment_date.trim()))
            })?)
        };
        Ok(StandardRecord {
            id: self.id.trim().to_string(),
            transaction_date,
            payment_date,
            description: description.to_string(),
            amount_cents,
            source,
        })
    }
}

impl From<&StandardRecord> for StandardRow {
    fn from(record: &StandardRecord) -> Self {
        Self {
            id: record.id.clone(),
            transaction_date: record.transaction_date.to_string(),
            payment_date: record.payment_date.map(|d| d.to_string()).unwrap_or_default(),
            description: record.description.clone(),
            amount: format_cents(record.amount_cents),
            account: record.source.key().to_string(),
        }
    }
}

/// Persisted transaction row.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: i64,
    pub raw_import_id: String,
    pub source: SourceKind,
    pub transaction_date: NaiveDate,
    pub payment_date: Option<NaiveDate>,
    pub description: String,
    pub canonical_description: String,
    pub amount_cents: i64,
    pub currency: String,
    pub category: Option<String>,
    pub imported_at: String,
    /// Comma-separated tags copied from the cache entry that categorized it.
    pub tags: Option<String>,
}

/// Provenance of a cached category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategorySource {
    Exact,
    Search,
    Ai,
    Manual,
}

impl CategorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Search => "search",
            Self::Ai => "ai",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for CategorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CategorySource {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "exact" => Ok(Self::Exact),
            "search" => Ok(Self::Search),
            "ai" => Ok(Self::Ai),
            "manual" => Ok(Self::Manual),
            other => Err(TallyError::Other(format!("unknown category source '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub canonical_description: String,
    pub category: String,
    pub source: CategorySource,
    pub confidence: Option<f64>,
    pub updated_at: String,
    #[serde(default)]
    pub tags: Option<String>,
}

/// A cache entry parked by recanonicalization because its new key collides
/// with entries carrying a different category.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConflict {
    pub canonical_description: String,
    pub previous_key: String,
    pub category: String,
    pub source: CategorySource,
    pub confidence: Option<f64>,
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// Field parsing
// ---------------------------------------------------------------------------

/// Parse a signed decimal in either `1.234,56` or `1,234.56` notation into
/// cents. Parenthesized values are negative. Extra fractional digits round
/// half away from zero.
pub fn parse_amount_cents(raw: &str) -> Option<i64> {
    fn strip_currency(s: &str) -> String {
        s.trim_start_matches("R$").trim_start_matches('$').to_string()
    }

    let mut s: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '"')
        .collect();
    s = strip_currency(&s);

    let mut negative = false;
    if let Some(inner) = s.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        negative = true;
        s = inner.to_string();
    }
    if let Some(rest) = s.strip_prefix('-') {
        negative = !negative;
        s = rest.to_string();
    } else if let Some(rest) = s.strip_prefix('+') {
        s = rest.to_string();
    }
    s = strip_currency(&s);

    let normalized = match (s.rfind(','), s.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => s.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => s.replace(',', ""),
        (Some(_), None) => s.replace(',', "."),
        _ => s,
    };

    let (int_part, frac_part) = match normalized.split_once('.') {
        Some((i, f)) => (i, f),
        None => (normalized.as_str(), ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit()) || !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = if int_part.is_empty() { 0 } else { int_part.parse().ok()? };
    let frac: i64 = match frac_part.len() {
        0 => 0,
        1 => frac_part.parse::<i64>().ok()? * 10,
        2 => frac_part.parse().ok()?,
        _ => {
            let kept: i64 = frac_part[..2].parse().ok()?;
            if frac_part.as_bytes()[2] >= b'5' {
                kept + 1
            } else {
                kept
            }
        }
    };
    let cents = whole.checked_mul(100)?.checked_add(frac)?;
    Some(if negative { -cents } else { cents })
}

/// Join tags as stored in the `tags` columns; `None` when there are none.
pub fn join_tags(tags: &[String]) -> Option<String> {
    let kept: Vec<&str> = tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()).collect();
    (!kept.is_empty()).then(|| kept.join(", "))
}

pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// ISO dates, then day-first `dd/mm/yyyy` and `dd/mm/yy`. Slash dates that
/// are not valid day-first are retried month-first (`03/25/2025`).
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.contains('-') {
        return NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok();
    }
    let (day_first, month_first) = match raw.rsplit('/').next() {
        Some(year) if year.len() == 2 => ("%d/%m/%y", "%m/%d/%y"),
        _ => ("%d/%m/%Y", "%m/%d/%Y"),
    };
    NaiveDate::parse_from_str(raw, day_first)
        .or_else(|_| NaiveDate::parse_from_str(raw, month_first))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(date: &str, desc: &str, amount: &str) -> StandardRow {
        StandardRow {
            transaction_date: date.into(),
            description: desc.into(),
            amount: amount.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_amount_cents() {
        assert_eq!(parse_amount_cents("-1234.56"), Some(-123456));
        assert_eq!(parse_amount_cents("1.234,56"), Some(123456));
        assert_eq!(parse_amount_cents("1,234.56"), Some(123456));
        assert_eq!(parse_amount_cents("12,3"), Some(1230));
        assert_eq!(parse_amount_cents("- 2.249,00"), Some(-224900));
        assert_eq!(parse_amount_cents("(50.00)"), Some(-5000));
        assert_eq!(parse_amount_cents("R$ 9.356,73"), Some(935673));
        assert_eq!(parse_amount_cents("-R$ 10,00"), Some(-1000));
        assert_eq!(parse_amount_cents("0"), Some(0));
    }

    #[test]
    fn test_parse_amount_cents_rejects_garbage() {
        assert_eq!(parse_amount_cents(""), None);
        assert_eq!(parse_amount_cents("abc"), None);
        assert_eq!(parse_amount_cents("1.2.3,4,5"), None);
    }

    #[test]
    fn test_parse_amount_cents_rounds_extra_digits() {
        assert_eq!(parse_amount_cents("1.234"), Some(123));
        assert_eq!(parse_amount_cents("1.235"), Some(124));
        assert_eq!(parse_amount_cents("-0,999"), Some(-100));
        assert_eq!(parse_amount_cents("10,1249"), Some(1012));
    }

    #[test]
    fn test_join_tags() {
        assert_eq!(join_tags(&["food".into(), " delivery ".into()]), Some("food, delivery".into()));
        assert_eq!(join_tags(&[" ".into()]), None);
        assert_eq!(join_tags(&[]), None);
    }

    #[test]
    fn test_format_cents() {
        assert_eq!(format_cents(-123456), "-1234.56");
        assert_eq!(format_cents(5), "0.05");
        assert_eq!(format_cents(-5), "-0.05");
        assert_eq!(format_cents(0), "0.00");
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 3, 15);
        assert_eq!(parse_date("2025-03-15"), expected);
        assert_eq!(parse_date("15/03/2025"), expected);
        assert_eq!(parse_date("15/03/25"), expected);
        assert_eq!(parse_date("03/15/2025"), expected);
        assert_eq!(parse_date("03/15/25"), expected);
        assert_eq!(parse_date("04/03/2025"), NaiveDate::from_ymd_opt(2025, 3, 4));
        assert_eq!(parse_date("31/02/2025"), None);
        assert_eq!(parse_date("nope"), None);
    }

    #[test]
    fn test_validate_ok() {
        let mut r = row("15/03/2025", "  IFOOD ", "-12,50");
        r.payment_date = "2025-04-10".into();
        let rec = r.validate(SourceKind::ItauCreditCard).unwrap();
        assert_eq!(rec.description, "IFOOD");
        assert_eq!(rec.amount_cents, -1250);
        assert_eq!(rec.payment_date, NaiveDate::from_ymd_opt(2025, 4, 10));
        assert!(rec.id.is_empty());
    }

    #[test]
    fn test_validate_reports_field() {
        let err = row("2025-03-15", " ", "1.00").validate(SourceKind::NubankCredit).unwrap_err();
        assert!(err.to_string().contains("missing description"));
        let err = row("2025-03-15", "X", "").validate(SourceKind::NubankCredit).unwrap_err();
        assert!(err.to_string().contains("missing amount"));
        let err = row("2025-13-15", "X", "1.00").validate(SourceKind::NubankCredit).unwrap_err();
        assert!(err.to_string().contains("malformed transaction_date"));
    }

    #[test]
    fn test_category_source_roundtrip() {
        for s in [CategorySource::Exact, CategorySource::Search, CategorySource::Ai, CategorySource::Manual] {
            assert_eq!(s.as_str().parse::<CategorySource>().unwrap(), s);
        }
        assert!("robot".parse::<CategorySource>().is_err());
    }
}

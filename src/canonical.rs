//! Description canonicalization.
//!
//! The canonical form is the categorization cache key. Any change to
//! [`canonicalize`] must be followed by `tally category recanon`, otherwise
//! existing cache entries stop matching freshly imported rows.

use std::sync::OnceLock;

use regex::Regex;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

fn installment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{1,3}\s*/\s*\d{1,3}").expect("installment regex"))
}

fn punctuation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\p{L}\p{N}\s]").expect("punctuation regex"))
}

fn strip_marks(value: &str) -> String {
    value.nfkd().filter(|c| !is_combining_mark(*c)).collect()
}

fn trailing_numbers_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(^|\D)(?:\d{1,2}\s+)+\d{1,2}\s*$").expect("trailing numbers regex")
    })
}

fn is_single_letter(token: &str) -> bool {
    let mut chars = token.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c.is_alphabetic())
}

/// Join runs of two or more single-letter tokens: `a c l odonto` -> `acl odonto`.
fn join_spaced_letters(tokens: Vec<&str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tokens.len());
    let mut run: Vec<&str> = Vec::new();
    for token in tokens {
        if is_single_letter(token) {
            run.push(token);
            continue;
        }
        if !run.is_empty() {
            out.push(run.concat());
            run.clear();
        }
        out.push(token.to_string());
    }
    if !run.is_empty() {
        out.push(run.concat());
    }
    out
}

/// Normalize a raw transaction description into its cache key.
///
/// Idempotent: `canonicalize(&canonicalize(x)) == canonicalize(x)`.
pub fn canonicalize(description: &str) -> String {
    let folded = strip_marks(&strip_marks(description).to_lowercase());
    let without_installments = installment_re().replace_all(&folded, " ");
    let spaced = punctuation_re().replace_all(&without_installments, " ");
    // Spaced installment suffix as printed by PDF extraction. Only the digits
    // go; the word they are glued to stays: "saud03 04" -> "saud".
    let trimmed = trailing_numbers_re().replace(&spaced, "$1");

    join_spaced_letters(trimmed.split_whitespace().collect()).join(" ")
}

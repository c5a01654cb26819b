//! Identifier normalization and column-width helpers.

use crate::defaults::{TRUNCATION_INDICATOR, UNKNOWN_TITLE_PREFIX};

/// Normalize an ISSN to its 8-character unpunctuated form.
///
/// Accepts `NNNNNNNX` or `NNNN-NNNX`; the check character is upper-cased.
/// Anything else yields `None`.
pub fn to_unpunctuated_issn(issn: &str) -> Option<String> {
    let trimmed = issn.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    let compact: Vec<char> = match chars.len() {
        8 => chars,
        9 if chars[4] == '-' => chars
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != 4)
            .map(|(_, c)| *c)
            .collect(),
        _ => return None,
    };
    let (body, check) = compact.split_at(7);
    let mut out: String = body.iter().collect();
    out.extend(check[0].to_uppercase());
    Some(out)
}

/// Normalize an ISBN by removing hyphens; only 10- or 13-character results survive.
pub fn to_unpunctuated_isbn(isbn: &str) -> Option<String> {
    let compact: String = isbn.trim().chars().filter(|c| *c != '-').collect();
    match compact.chars().count() {
        10 | 13 => Some(compact),
        _ => None,
    }
}

/// Fit `value` into `max` characters, marking truncation with the indicator.
pub fn truncate_varchar(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let mut out: String = value.chars().take(max - 1).collect();
    out.push(TRUNCATION_INDICATOR);
    out
}

/// Whether a value was produced by [`truncate_varchar`] cutting it short.
pub fn is_truncated(value: &str) -> bool {
    value.ends_with(TRUNCATION_INDICATOR)
}

/// Trim `value`, drop it when empty, and fit it into `max` characters.
pub fn fit(value: Option<&str>, max: usize) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(truncate_varchar(trimmed, max))
    }
}

/// Remove a leading `doi:` scheme (any case) from a DOI.
pub fn strip_doi_prefix(doi: &str) -> &str {
    let trimmed = doi.trim();
    match trimmed.get(..4) {
        Some(prefix) if prefix.eq_ignore_ascii_case("doi:") => trimmed[4..].trim_start(),
        _ => trimmed,
    }
}

/// Synthesize a publication title from whatever identifier is available.
///
/// Identifiers are tried in order isbn, eisbn, issn, eissn, journal id; when
/// none is present the title is made unique by `now_millis`.
pub fn synthesize_unknown_title(
    isbn: Option<&str>,
    eisbn: Option<&str>,
    issn: Option<&str>,
    eissn: Option<&str>,
    journal_id: Option<&str>,
    now_millis: i64,
) -> String {
    let candidates = [
        ("isbn", isbn),
        ("eisbn", eisbn),
        ("issn", issn),
        ("eissn", eissn),
        ("journalId", journal_id),
    ];
    for (label, value) in candidates {
        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            return format!("{UNKNOWN_TITLE_PREFIX}/{label}={value}");
        }
    }
    format!("{UNKNOWN_TITLE_PREFIX}/id={now_millis}")
}

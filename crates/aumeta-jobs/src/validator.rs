//! Cross-checks extracted records against the reference catalog.
//!
//! Mismatches never fail a task; they are reported as warnings, and a task
//! reports each distinct warning once through its [`WarningLog`].

use std::collections::HashSet;

use aumeta_core::metadata_util::{to_unpunctuated_isbn, to_unpunctuated_issn};
use aumeta_core::{ExtractedRecord, ReferenceRecord};

/// Warnings about `record` relative to the catalog's `reference` data.
///
/// `au_name` names the AU in messages. Identifier, title and ISSN-slot checks
/// are skipped for bulk content, whose catalog entry carries no per-title data.
pub fn validate(
    record: &ExtractedRecord,
    reference: &ReferenceRecord,
    au_name: &str,
    bulk_content: bool,
) -> Vec<String> {
    let title_known = !bulk_content && !reference.bulk_content;
    let mut warnings = Vec::new();
    let mut warn = |message: String| {
        if !warnings.contains(&message) {
            warnings.push(message);
        }
    };

    let (ref_title, ref_isbn, ref_issn, ref_eissn) = if title_known {
        (
            reference.journal_title.as_deref(),
            reference.isbn.as_deref(),
            reference.print_issn.as_deref(),
            reference.eissn.as_deref(),
        )
    } else {
        (None, None, None, None)
    };

    if let Some(title) = ref_title {
        match record.publication_title.as_deref() {
            None => warn(format!(
                "tdb title  is {title} for {au_name} -- metadata title is missing"
            )),
            Some(md) if md != title => warn(format!(
                "tdb title {title} for {au_name} -- does not match metadata journal title {md}"
            )),
            Some(_) => {}
        }
    }

    match (ref_isbn, record.isbn.as_deref()) {
        (Some(tdb), None) => warn(format!(
            "using tdb isbn {tdb} for {au_name} -- metadata isbn missing"
        )),
        (Some(tdb), Some(md)) if !same_isbn(tdb, md) => warn(format!(
            "also using tdb isbn {tdb} for {au_name} -- different than metadata isbn: {md}"
        )),
        (None, Some(md)) if title_known => warn(format!(
            "tdb isbn missing for {au_name} -- should be: {md}"
        )),
        _ => {}
    }

    let md_issn = record.issn.as_deref();
    let md_eissn = record.eissn.as_deref();

    // A value the catalog lists in one ISSN slot but the metadata reports in
    // the other is the same transposition whichever slot is examined.
    let print_as_eissn = |tdb: &str| format!(
        "tdb print issn {tdb} for {au_name} -- reported by metadata as eissn"
    );
    let eissn_as_print = |tdb: &str| format!(
        "tdb eissn {tdb} for {au_name} -- reported by metadata as print issn"
    );

    match ref_issn {
        Some(tdb) => {
            if md_issn.is_none() && md_eissn.is_some_and(|e| same_issn(tdb, e)) {
                warn(print_as_eissn(tdb));
            } else if md_issn.map_or(true, |md| !same_issn(tdb, md)) {
                match md_issn {
                    None => warn(format!(
                        "using tdb print issn {tdb} for {au_name} -- metadata print issn is missing"
                    )),
                    Some(md) => warn(format!(
                        "also using tdb print issn {tdb} for {au_name} -- different than metadata print issn: {md}"
                    )),
                }
            }
        }
        None => {
            if let Some(md) = md_issn {
                match ref_eissn {
                    Some(tdb) if same_issn(tdb, md) => warn(eissn_as_print(tdb)),
                    _ if title_known => warn(format!(
                        "tdb issn missing for {au_name} -- should be: {md}"
                    )),
                    _ => {}
                }
            }
        }
    }

    match ref_eissn {
        Some(tdb) => {
            if md_eissn.is_none() && md_issn.is_some_and(|p| same_issn(tdb, p)) {
                warn(eissn_as_print(tdb));
            } else if md_eissn.map_or(true, |md| !same_issn(tdb, md)) {
                match md_eissn {
                    None => warn(format!(
                        "using tdb eissn {tdb} for {au_name} -- metadata eissn is missing"
                    )),
                    Some(md) => warn(format!(
                        "also using tdb eissn {tdb} for {au_name} -- different than metadata eissn: {md}"
                    )),
                }
            }
        }
        None => {
            if let Some(md) = md_eissn {
                match ref_issn {
                    Some(tdb) if same_issn(tdb, md) => warn(print_as_eissn(tdb)),
                    _ if title_known => warn(format!(
                        "tdb eissn missing for {au_name} -- should be: {md}"
                    )),
                    _ => {}
                }
            }
        }
    }

    if let Some(year) = record.pub_year.as_deref() {
        if !reference.includes_year(year) {
            match reference.year.as_deref() {
                Some(tdb) => warn(format!(
                    "tdb year {tdb} for {au_name} -- does not match metadata year {year}"
                )),
                None => warn(format!(
                    "tdb year missing for {au_name} -- should include year {year}"
                )),
            }
        }
    }

    warnings
}

fn same_issn(a: &str, b: &str) -> bool {
    match (to_unpunctuated_issn(a), to_unpunctuated_issn(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a.trim() == b.trim(),
    }
}

fn same_isbn(a: &str, b: &str) -> bool {
    match (to_unpunctuated_isbn(a), to_unpunctuated_isbn(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a.trim() == b.trim(),
    }
}

/// Messages already reported by one task.
#[derive(Debug, Default)]
pub struct WarningLog {
    seen: HashSet<String>,
}

impl WarningLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `message`; true the first time it is seen.
    pub fn record(&mut self, message: &str) -> bool {
        if self.seen.contains(message) {
            return false;
        }
        self.seen.insert(message.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

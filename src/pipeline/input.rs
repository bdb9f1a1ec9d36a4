//! Input preparation: turn user-supplied entries into page references.
//!
//! Entries arrive from a form, a text file or the command line. Before a
//! batch starts they are filtered (blank sources dropped), numbered by their
//! position, and given a display name. The resulting [`PageReference`]s are
//! immutable for the rest of the run.

use crate::error::BatchError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One user-supplied `{displayName, sourceUrl}` pair, before filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageEntry {
    #[serde(default, alias = "fileName", alias = "displayName")]
    pub display_name: String,
    #[serde(default, alias = "pdfHtmlUrl", alias = "sourceUrl", alias = "url")]
    pub source_url: String,
}

impl PageEntry {
    pub fn new(display_name: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            source_url: source_url.into(),
        }
    }

    /// Entry with no display name; one is assigned from its position.
    pub fn url(source_url: impl Into<String>) -> Self {
        Self::new("", source_url)
    }
}

/// A page submitted to a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageReference {
    /// 0-based position in the filtered batch.
    pub id: usize,
    pub source_url: String,
    pub display_name: String,
}

impl PageReference {
    /// 1-based position, used in names and progress events.
    pub fn page_num(&self) -> usize {
        self.id + 1
    }
}

/// Check if the input string looks like an HTTP(S) URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Filter blank sources and number the survivors.
///
/// # Errors
/// [`BatchError::NoInput`] when nothing is left after filtering.
pub fn prepare_references(entries: Vec<PageEntry>) -> Result<Vec<PageReference>, BatchError> {
    let submitted = entries.len();
    let references: Vec<PageReference> = entries
        .into_iter()
        .filter(|e| !e.source_url.trim().is_empty())
        .enumerate()
        .map(|(id, e)| {
            let display_name = match e.display_name.trim() {
                "" => format!("page_{}", id + 1),
                name => name.to_string(),
            };
            PageReference {
                id,
                source_url: normalise_url(e.source_url.trim()),
                display_name,
            }
        })
        .collect();

    if references.is_empty() {
        return Err(BatchError::NoInput);
    }
    debug!(
        "Prepared {} page references ({} blank entries dropped)",
        references.len(),
        submitted - references.len()
    );
    Ok(references)
}

/// Prefix scheme-less hosts with `https://`; anything else is left alone.
fn normalise_url(source: &str) -> String {
    if is_url(source) || source.contains("://") {
        source.to_string()
    } else {
        format!("https://{source}")
    }
}

/// Parse a single `NAME=URL` or bare `URL` argument.
///
/// The split happens at the first `=` only when what follows it is an
/// HTTP(S) URL, so query strings inside a bare URL are left intact.
pub fn parse_entry(raw: &str) -> PageEntry {
    let raw = raw.trim();
    if let Some((name, url)) = raw.split_once('=') {
        if !name.contains("://") && is_url(url.trim()) {
            return PageEntry::new(name.trim(), url.trim());
        }
    }
    PageEntry::url(raw)
}

/// Split pasted text with one entry per line, dropping blank lines.
pub fn split_url_list(text: &str) -> Vec<PageEntry> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(parse_entry)
        .collect()
}

static RE_TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*\]\s*$").unwrap());

/// Parse a JSON array of `{"fileName": …, "pdfHtmlUrl": …}` objects.
///
/// `displayName`/`sourceUrl`/`url` are accepted as aliases and a trailing
/// comma before the closing bracket is tolerated.
pub fn parse_entries_json(text: &str) -> Result<Vec<PageEntry>, BatchError> {
    let cleaned = RE_TRAILING_COMMA.replace(text.trim(), "]");
    let value: serde_json::Value =
        serde_json::from_str(&cleaned).map_err(|e| BatchError::InvalidInput {
            input: preview(text),
            reason: format!("invalid JSON: {e}"),
        })?;
    if !value.is_array() {
        return Err(BatchError::InvalidInput {
            input: preview(text),
            reason: "input must be an array of objects".into(),
        });
    }
    serde_json::from_value(value).map_err(|e| BatchError::InvalidInput {
        input: preview(text),
        reason: e.to_string(),
    })
}

/// Parse an input file: JSON when it starts with `[`, a line list otherwise.
pub fn parse_entries(text: &str) -> Result<Vec<PageEntry>, BatchError> {
    if text.trim_start().starts_with('[') {
        parse_entries_json(text)
    } else {
        Ok(split_url_list(text))
    }
}

fn preview(text: &str) -> String {
    let t = text.trim();
    match t.char_indices().nth(40) {
        Some((idx, _)) => format!("{}…", &t[..idx]),
        None => t.to_string(),
    }
}

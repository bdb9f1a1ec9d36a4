//! Result types produced by a batch run.

use crate::error::PageError;
use crate::pipeline::input::PageReference;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which strategy produced an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureStrategy {
    /// Content read straight from the isolated rendering context.
    Direct,
    /// Content retrieved through the intermediary and rewritten.
    Proxied,
    /// Synthetic page documenting why no content could be captured.
    Placeholder,
}

impl fmt::Display for CaptureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaptureStrategy::Direct => "direct",
            CaptureStrategy::Proxied => "proxied",
            CaptureStrategy::Placeholder => "placeholder",
        };
        f.write_str(s)
    }
}

/// A rendered PDF document for one page reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdfArtifact {
    /// Archive entry name, unique within the batch (ordinal-prefixed).
    pub name: String,
    /// Raw PDF bytes.
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub strategy: CaptureStrategy,
    /// Why real content could not be captured; set for placeholders only.
    pub fallback_reason: Option<String>,
}

/// Outcome of rendering one page reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RenderOutcome {
    Success { artifact: PdfArtifact },
    Failure { reason: PageError },
}

/// Exactly one per submitted [`PageReference`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderResult {
    pub reference: PageReference,
    pub outcome: RenderOutcome,
}

impl RenderResult {
    pub fn artifact(&self) -> Option<&PdfArtifact> {
        match &self.outcome {
            RenderOutcome::Success { artifact } => Some(artifact),
            RenderOutcome::Failure { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RenderOutcome::Success { .. })
    }
}

/// The downloadable output of a run: a zip archive or a bare PDF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivePayload {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub suggested_filename: String,
    /// `application/zip` or `application/pdf`.
    pub content_type: String,
}

impl ArchivePayload {
    pub fn is_archive(&self) -> bool {
        self.content_type == "application/zip"
    }
}

/// Aggregate statistics for a completed run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    pub total_pages: usize,
    pub direct_pages: usize,
    pub proxied_pages: usize,
    pub placeholder_pages: usize,
    pub failed_pages: usize,
    pub render_duration_ms: u64,
    pub archive_duration_ms: u64,
    /// Wall-clock time from submit to done.
    pub total_duration_ms: u64,
}

impl BatchStats {
    /// Tally strategies over a settled result set.
    pub fn tally(results: &[RenderResult]) -> Self {
        let mut stats = BatchStats {
            total_pages: results.len(),
            ..Default::default()
        };
        for r in results {
            match r.artifact().map(|a| a.strategy) {
                Some(CaptureStrategy::Direct) => stats.direct_pages += 1,
                Some(CaptureStrategy::Proxied) => stats.proxied_pages += 1,
                Some(CaptureStrategy::Placeholder) => stats.placeholder_pages += 1,
                None => stats.failed_pages += 1,
            }
        }
        stats
    }

    /// Pages that carry real (non-placeholder) content.
    pub fn captured_pages(&self) -> usize {
        self.direct_pages + self.proxied_pages
    }
}

/// Make `name` safe to use as a file or archive entry name.
///
/// Path separators, reserved characters and control characters become `_`;
/// leading and trailing dots and spaces are dropped. A name with nothing
/// left becomes `page`.
pub fn sanitise_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = replaced.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if trimmed.is_empty() {
        "page".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Everything a completed run hands back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutput {
    pub payload: ArchivePayload,
    /// One slot per submitted reference, in submission order.
    pub results: Vec<RenderResult>,
    pub stats: BatchStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(ordinal: usize, strategy: Option<CaptureStrategy>) -> RenderResult {
        let reference = PageReference {
            id: ordinal,
            source_url: format!("https://example.com/{ordinal}"),
            display_name: format!("page_{}", ordinal + 1),
        };
        let outcome = match strategy {
            Some(strategy) => RenderOutcome::Success {
                artifact: PdfArtifact {
                    name: format!("{ordinal:02}.pdf"),
                    bytes: b"%PDF-1.7".to_vec(),
                    strategy,
                    fallback_reason: None,
                },
            },
            None => RenderOutcome::Failure {
                reason: PageError::ArtifactFailed {
                    detail: "out of memory".into(),
                },
            },
        };
        RenderResult { reference, outcome }
    }

    #[test]
    fn tally_counts_each_strategy() {
        let results = vec![
            result(0, Some(CaptureStrategy::Direct)),
            result(1, Some(CaptureStrategy::Proxied)),
            result(2, Some(CaptureStrategy::Placeholder)),
            result(3, None),
        ];
        let stats = BatchStats::tally(&results);
        assert_eq!(stats.total_pages, 4);
        assert_eq!(stats.direct_pages, 1);
        assert_eq!(stats.proxied_pages, 1);
        assert_eq!(stats.placeholder_pages, 1);
        assert_eq!(stats.failed_pages, 1);
        assert_eq!(stats.captured_pages(), 2);
    }

    #[test]
    fn stats_serialise_to_json() {
        let stats = BatchStats::tally(&[result(0, Some(CaptureStrategy::Direct))]);
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"direct_pages\":1"));
    }

    #[test]
    fn sanitise_replaces_reserved_characters() {
        assert_eq!(sanitise_filename("Q1/Q2: \"draft\""), "Q1_Q2_ _draft_");
        assert_eq!(sanitise_filename("  ..report.. "), "report");
        assert_eq!(sanitise_filename("../"), "_");
        assert_eq!(sanitise_filename(" . "), "page");
        assert_eq!(sanitise_filename("salary sheets"), "salary sheets");
    }

    #[test]
    fn strategy_display() {
        assert_eq!(CaptureStrategy::Placeholder.to_string(), "placeholder");
    }
}

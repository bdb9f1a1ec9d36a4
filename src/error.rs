//! Error types for the webpdf-batch library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`BatchError`] — **Fatal**: the batch cannot proceed at all (no input,
//!   a run already in flight, nothing survived to archive). Returned as
//!   `Err(BatchError)` from the orchestrator and the `render_batch*` functions.
//!
//! * [`PageError`] — **Non-fatal**: a single page could not be captured
//!   (cross-origin isolation, retrieval failure, timeout). These never escape
//!   the render stage; they are absorbed into a placeholder PDF whose text
//!   documents the reason. Only [`PageError::ArtifactFailed`] can appear in a
//!   [`crate::output::RenderOutcome::Failure`].

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the webpdf-batch library.
///
/// Page-level failures use [`PageError`] and are degraded to placeholder
/// artifacts rather than propagated here.
#[derive(Debug, Error)]
pub enum BatchError {
    // ── Precondition errors ───────────────────────────────────────────────
    /// Every submitted entry had a blank source reference.
    #[error("No page references to render.\nProvide at least one non-blank URL.")]
    NoInput,

    /// A run is already in flight on this orchestrator.
    #[error("A batch is already running (state: {state}).\nWait for it to finish or cancel it first.")]
    Busy { state: String },

    /// An entry list could not be parsed.
    #[error("Invalid input '{input}': {reason}")]
    InvalidInput { input: String, reason: String },

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// The archive stage was handed zero artifacts.
    #[error("No PDFs were generated for {total} page references; nothing to archive")]
    EmptyBatch { total: usize },

    /// The run was cancelled before the archive stage.
    #[error("Batch cancelled after {settled}/{total} pages settled")]
    Cancelled { settled: usize, total: usize },

    /// The zip writer failed while building the archive.
    #[error("Failed to build archive: {0}")]
    Archive(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<zip::result::ZipError> for BatchError {
    fn from(e: zip::result::ZipError) -> Self {
        BatchError::Archive(e.to_string())
    }
}

/// A non-fatal error for a single page reference.
///
/// The first three variants are recovered inside the page renderer by moving
/// on to the next strategy. Their display text becomes the reason printed on
/// the placeholder page.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// The rendering context loaded the page but its content cannot be inspected.
    #[error("Access denied for {url}: {detail}")]
    AccessDenied { url: String, detail: String },

    /// The intermediary retrieval returned a non-2xx status or a network error.
    #[error("Failed to fetch content for {url}: {detail}")]
    FetchFailed { url: String, detail: String },

    /// No content became available within the wait budget.
    #[error("Timeout loading {url} after {secs}s")]
    RenderTimeout { url: String, secs: u64 },

    /// The PDF document itself could not be constructed.
    #[error("PDF construction failed: {detail}")]
    ArtifactFailed { detail: String },
}

impl PageError {
    /// Short reason suitable for a placeholder page or a log line.
    pub fn reason(&self) -> String {
        match self {
            PageError::AccessDenied { detail, .. } => format!("Access denied: {detail}"),
            PageError::FetchFailed { detail, .. } => {
                format!("Failed to fetch content: {detail}")
            }
            PageError::RenderTimeout { .. } => "Timeout loading webpage".to_string(),
            PageError::ArtifactFailed { detail } => format!("PDF construction failed: {detail}"),
        }
    }
}

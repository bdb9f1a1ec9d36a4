//! Archive stage: pack the batch's artifacts into one zip payload.
//!
//! ## Progress
//!
//! `archive_percent` is split in two phases:
//!
//! * **Register** (0 → 80): every entry is added and its bytes deflated in
//!   64 KiB chunks. Progress advances by input bytes consumed, so each
//!   completed entry lands on its share of the 80 and large entries still
//!   move the bar while they compress.
//! * **Finalize** (80 → 100): the central directory is written (95) and the
//!   finished archive is read back to confirm every entry is present (100).
//!
//! Entries carry a fixed modification time, so identical artifacts always
//! produce an identical archive.

use crate::error::BatchError;
use crate::output::{sanitise_filename, ArchivePayload, PdfArtifact};
use crate::progress::ProgressTracker;
use std::io::{Cursor, Write};
use std::sync::Arc;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const CHUNK: usize = 64 * 1024;
const REGISTER_WEIGHT: f64 = 80.0;
const FLUSHED: f64 = 95.0;

pub const ZIP_CONTENT_TYPE: &str = "application/zip";

/// Builds the downloadable archive for one batch.
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    label: String,
    compression_level: i64,
}

impl ArchiveBuilder {
    /// `label` names multi-entry archives (`<label>.zip`); `compression_level`
    /// is the DEFLATE level, clamped to 0–9.
    pub fn new(label: impl Into<String>, compression_level: i64) -> Self {
        Self {
            label: label.into(),
            compression_level: compression_level.clamp(0, 9),
        }
    }

    /// Zip `artifacts` in the given order.
    ///
    /// Entry names must already be unique; the coordinator's ordinal prefix
    /// guarantees that.
    ///
    /// # Errors
    /// - [`BatchError::EmptyBatch`] when `artifacts` is empty
    /// - [`BatchError::Archive`] when the zip writer fails
    pub fn build_archive(
        &self,
        artifacts: &[PdfArtifact],
        progress: &ProgressTracker,
    ) -> Result<ArchivePayload, BatchError> {
        if artifacts.is_empty() {
            return Err(BatchError::EmptyBatch { total: 0 });
        }
        if let Some(cb) = progress.callback() {
            cb.on_archive_start(artifacts.len());
        }
        info!(
            "Archiving {} PDFs (deflate level {})",
            artifacts.len(),
            self.compression_level
        );

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(self.compression_level))
            .last_modified_time(zip::DateTime::default());

        // ── Phase 1: register entries ────────────────────────────────────
        let total_bytes: usize = artifacts.iter().map(|a| a.bytes.len()).sum();
        let mut consumed = 0usize;
        let mut writer = ZipWriter::new(Cursor::new(Vec::with_capacity(total_bytes / 2)));

        for (i, artifact) in artifacts.iter().enumerate() {
            writer.start_file(artifact.name.as_str(), options)?;
            for chunk in artifact.bytes.chunks(CHUNK) {
                writer
                    .write_all(chunk)
                    .map_err(|e| BatchError::Archive(format!("{}: {e}", artifact.name)))?;
                consumed += chunk.len();
                progress.advance_archive(register_percent(consumed, total_bytes, i + 1, artifacts.len()));
            }
            // Entries with no bytes still count once registered.
            progress.advance_archive(register_percent(consumed, total_bytes, i + 1, artifacts.len()));
            debug!("Registered {} ({} bytes)", artifact.name, artifact.bytes.len());
        }

        // ── Phase 2: finalize ────────────────────────────────────────────
        let bytes = writer.finish()?.into_inner();
        progress.advance_archive(FLUSHED);

        let entries = ZipArchive::new(Cursor::new(bytes.as_slice()))?.len();
        if entries != artifacts.len() {
            return Err(BatchError::Archive(format!(
                "archive holds {} entries, expected {}",
                entries,
                artifacts.len()
            )));
        }
        progress.advance_archive(100.0);

        let payload = ArchivePayload {
            suggested_filename: self.suggested_filename(artifacts),
            content_type: ZIP_CONTENT_TYPE.to_string(),
            bytes,
        };
        info!(
            "Archive {} ready ({} bytes)",
            payload.suggested_filename,
            payload.bytes.len()
        );
        Ok(payload)
    }

    /// Run [`ArchiveBuilder::build_archive`] on the blocking pool.
    pub async fn build_archive_blocking(
        &self,
        artifacts: Vec<PdfArtifact>,
        progress: Arc<ProgressTracker>,
    ) -> Result<ArchivePayload, BatchError> {
        let builder = self.clone();
        tokio::task::spawn_blocking(move || builder.build_archive(&artifacts, &progress))
            .await
            .map_err(|e| BatchError::Internal(format!("Archive task panicked: {}", e)))?
    }

    /// `<label>.zip` for several entries, the single entry's own stem otherwise.
    fn suggested_filename(&self, artifacts: &[PdfArtifact]) -> String {
        match artifacts {
            [only] => {
                let stem = only.name.strip_suffix(".pdf").unwrap_or(&only.name);
                format!("{}.zip", sanitise_filename(stem))
            }
            _ => format!("{}.zip", sanitise_filename(&self.label)),
        }
    }
}

/// Phase-1 percentage: by bytes when there are any, by entry count otherwise.
fn register_percent(consumed: usize, total_bytes: usize, registered: usize, entries: usize) -> f64 {
    let fraction = if total_bytes == 0 {
        registered as f64 / entries as f64
    } else {
        consumed as f64 / total_bytes as f64
    };
    fraction * REGISTER_WEIGHT
}

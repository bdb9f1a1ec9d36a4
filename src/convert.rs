//! One-shot entry points.
//!
//! These wrap a fresh [`PipelineOrchestrator`] per call. Keep an orchestrator
//! around instead when you need to poll progress, cancel a run, or reject
//! overlapping submissions.

use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::orchestrator::PipelineOrchestrator;
use crate::output::{ArchivePayload, BatchOutput, BatchStats};
use crate::pipeline::input::PageEntry;
use std::path::{Path, PathBuf};
use tracing::info;

/// Render a batch of pages and return the payload in memory.
///
/// This is the primary entry point for the library.
///
/// # Arguments
/// * `entries` — `{display name, source URL}` pairs; blank sources are dropped
/// * `config` — Batch configuration
///
/// # Returns
/// `Ok(BatchOutput)` on success, even if some pages degraded to placeholders
/// (check `output.stats.placeholder_pages`).
///
/// # Errors
/// Returns `Err(BatchError)` only for batch-level failures:
/// - No non-blank entries
/// - No artifact produced at all
pub async fn render_batch(
    entries: Vec<PageEntry>,
    config: &BatchConfig,
) -> Result<BatchOutput, BatchError> {
    PipelineOrchestrator::new(config.clone())
        .submit(entries)
        .await
}

/// Render a batch and write the payload to disk.
///
/// `output` may be a directory (existing, or given with a trailing
/// separator), in which case the payload's suggested filename is used inside
/// it, or an exact file path.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub async fn render_batch_to_file(
    entries: Vec<PageEntry>,
    output: impl AsRef<Path>,
    config: &BatchConfig,
) -> Result<(PathBuf, BatchStats), BatchError> {
    let out = render_batch(entries, config).await?;
    let path = write_payload(&out.payload, output.as_ref()).await?;
    Ok((path, out.stats))
}

/// Write `payload` atomically to `output` (see [`render_batch_to_file`] for
/// how the target path is resolved). Returns the path written.
pub async fn write_payload(payload: &ArchivePayload, output: &Path) -> Result<PathBuf, BatchError> {
    let path = resolve_output_path(output, &payload.suggested_filename).await;
    let write_err = |source: std::io::Error| BatchError::OutputWriteFailed {
        path: path.clone(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    tokio::fs::write(&tmp_path, &payload.bytes)
        .await
        .map_err(write_err)?;
    tokio::fs::rename(&tmp_path, &path).await.map_err(write_err)?;

    info!("Wrote {} ({} bytes)", path.display(), payload.bytes.len());
    Ok(path)
}

async fn resolve_output_path(output: &Path, suggested: &str) -> PathBuf {
    let trailing_sep = output
        .as_os_str()
        .to_string_lossy()
        .ends_with(std::path::MAIN_SEPARATOR);
    let is_dir = tokio::fs::metadata(output)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if trailing_sep || is_dir {
        output.join(suggested)
    } else {
        output.to_path_buf()
    }
}

/// Synchronous wrapper around [`render_batch`].
///
/// Creates a temporary tokio runtime internally.
pub fn render_batch_sync(
    entries: Vec<PageEntry>,
    config: &BatchConfig,
) -> Result<BatchOutput, BatchError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| BatchError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(render_batch(entries, config))
}

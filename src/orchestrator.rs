//! End-to-end driver: render stage, then archive stage.
//!
//! ```text
//!          submit            all settled          payload ready
//!   Idle ─────────▶ Rendering ──────────▶ Archiving ─────────▶ Done
//!                       │                     │
//!                       └──── cancelled ──────┴──── EmptyBatch ─▶ Failed
//! ```
//!
//! One run at a time per orchestrator. `Done` and `Failed` are resting
//! states: a later submit starts a fresh run from either. A submit while
//! `Rendering` or `Archiving` is rejected with [`BatchError::Busy`].
//!
//! The orchestrator owns the run's [`ProgressTracker`]; callers can poll it
//! through [`PipelineOrchestrator::progress`] from any task while a run is
//! in flight.

use crate::config::{BatchConfig, SingleItemPolicy};
use crate::error::BatchError;
use crate::output::{sanitise_filename, ArchivePayload, BatchOutput, BatchStats, RenderResult};
use crate::pipeline::archive::ArchiveBuilder;
use crate::pipeline::coordinator::RenderCoordinator;
use crate::pipeline::input::{prepare_references, PageEntry, PageReference};
use crate::pipeline::render::PageRenderer;
use crate::progress::{BatchProgress, ProgressTracker};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

pub const PDF_CONTENT_TYPE: &str = "application/pdf";

/// Lifecycle of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Idle,
    Rendering,
    Archiving,
    Done,
    Failed,
}

impl PipelineState {
    /// True while a run is in flight.
    pub fn is_active(self) -> bool {
        matches!(self, PipelineState::Rendering | PipelineState::Archiving)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Idle => "idle",
            PipelineState::Rendering => "rendering",
            PipelineState::Archiving => "archiving",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Cancels whichever run is in flight on the orchestrator it came from.
#[derive(Clone)]
pub struct CancelHandle {
    token: Arc<Mutex<CancellationToken>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}

/// Drives one batch at a time from submitted entries to a payload.
pub struct PipelineOrchestrator {
    config: BatchConfig,
    state: Arc<Mutex<PipelineState>>,
    progress: Arc<ProgressTracker>,
    cancel: Arc<Mutex<CancellationToken>>,
}

impl PipelineOrchestrator {
    pub fn new(config: BatchConfig) -> Self {
        let progress = Arc::new(ProgressTracker::new(config.progress_callback.clone()));
        Self {
            config,
            state: Arc::new(Mutex::new(PipelineState::Idle)),
            progress,
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current progress of the active (or last) run.
    pub fn progress(&self) -> BatchProgress {
        self.progress.snapshot()
    }

    /// Cancel the run in flight, if any. New pages stop launching, pages in
    /// flight finish and release their contexts, and the archive stage is
    /// skipped. The run then fails with [`BatchError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel_handle().cancel();
    }

    /// A handle that can cancel runs from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: Arc::clone(&self.cancel),
        }
    }

    /// Run one batch end to end.
    ///
    /// # Returns
    /// `Ok(BatchOutput)` once the payload is built, even if some pages
    /// degraded to placeholders (check `output.stats.placeholder_pages`).
    ///
    /// `Done` and `Failed` are resting states: a finished or failed run does
    /// not block the next submit, which starts from a reset tracker.
    ///
    /// # Errors
    /// - [`BatchError::Busy`] while another run is `Rendering` or `Archiving`
    ///   (including one whose submit future was dropped but whose pages are
    ///   still releasing their contexts)
    /// - [`BatchError::NoInput`] when every entry has a blank source
    /// - [`BatchError::Cancelled`] when [`Self::cancel`] was called
    /// - [`BatchError::EmptyBatch`] when no page produced an artifact
    pub async fn submit(&self, entries: Vec<PageEntry>) -> Result<BatchOutput, BatchError> {
        let total_start = Instant::now();

        // ── Step 1: Preconditions ────────────────────────────────────────
        let (refs, token) = self.begin(entries)?;
        let tasks = TaskTracker::new();
        let run = RunGuard {
            state: Arc::clone(&self.state),
            tasks: tasks.clone(),
        };
        let total = refs.len();
        info!("Starting batch of {} pages", total);

        // ── Step 2: Render stage ─────────────────────────────────────────
        let renderer = PageRenderer::from_config(&self.config).inspect_err(|_| {
            run.set(PipelineState::Failed);
        })?;
        let coordinator =
            RenderCoordinator::new(renderer, self.config.concurrency).with_task_tracker(tasks);

        let render_start = Instant::now();
        let results = coordinator
            .run_batch(&refs, &self.config.options, &self.progress, &token)
            .await
            .inspect_err(|e| warn!("Render stage ended early: {}", e))?;
        let render_duration_ms = render_start.elapsed().as_millis() as u64;

        if token.is_cancelled() {
            info!("Batch cancelled before archiving");
            run.set(PipelineState::Failed);
            return Err(BatchError::Cancelled {
                settled: total,
                total,
            });
        }

        // ── Step 3: Archive stage ────────────────────────────────────────
        run.set(PipelineState::Archiving);
        let archive_start = Instant::now();
        let payload = match self.package(&refs, &results).await {
            Ok(p) => p,
            Err(e) => {
                warn!("Archive stage failed: {}", e);
                run.set(PipelineState::Failed);
                return Err(e);
            }
        };
        let archive_duration_ms = archive_start.elapsed().as_millis() as u64;

        // ── Step 4: Stats ────────────────────────────────────────────────
        let stats = BatchStats {
            render_duration_ms,
            archive_duration_ms,
            total_duration_ms: total_start.elapsed().as_millis() as u64,
            ..BatchStats::tally(&results)
        };
        run.set(PipelineState::Done);

        if let Some(cb) = self.progress.callback() {
            cb.on_batch_complete(stats.total_pages, stats.captured_pages());
        }
        info!(
            "Batch done: {} pages ({} direct, {} proxied, {} placeholder, {} failed) in {}ms → {}",
            stats.total_pages,
            stats.direct_pages,
            stats.proxied_pages,
            stats.placeholder_pages,
            stats.failed_pages,
            stats.total_duration_ms,
            payload.suggested_filename
        );

        Ok(BatchOutput {
            payload,
            results,
            stats,
        })
    }

    /// Check for a run in flight, prepare references and enter `Rendering`
    /// under one lock so two submits cannot both start.
    fn begin(
        &self,
        entries: Vec<PageEntry>,
    ) -> Result<(Vec<PageReference>, CancellationToken), BatchError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_active() {
            return Err(BatchError::Busy {
                state: state.to_string(),
            });
        }
        let refs = prepare_references(entries)?;

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        self.progress.reset();
        *state = PipelineState::Rendering;
        Ok((refs, token))
    }

    /// Turn settled results into the downloadable payload.
    async fn package(
        &self,
        refs: &[PageReference],
        results: &[RenderResult],
    ) -> Result<ArchivePayload, BatchError> {
        let artifacts: Vec<_> = results
            .iter()
            .filter_map(|r| r.artifact().cloned())
            .collect();

        if let ([reference], SingleItemPolicy::BarePdf) = (refs, self.config.single_item_policy) {
            let artifact = artifacts
                .into_iter()
                .next()
                .ok_or(BatchError::EmptyBatch { total: 1 })?;
            self.progress.advance_archive(100.0);
            return Ok(ArchivePayload {
                bytes: artifact.bytes,
                suggested_filename: format!("{}.pdf", sanitise_filename(&reference.display_name)),
                content_type: PDF_CONTENT_TYPE.to_string(),
            });
        }

        ArchiveBuilder::new(&self.config.label, self.config.compression_level)
            .build_archive_blocking(artifacts, Arc::clone(&self.progress))
            .await
            .map_err(|e| match e {
                BatchError::EmptyBatch { .. } => BatchError::EmptyBatch { total: refs.len() },
                other => other,
            })
    }
}

/// Marks the run failed if `submit` returns early or its future is dropped
/// mid-run.
///
/// The state leaves `Rendering` only after every page task of the run is
/// gone, so a new submit stays `Busy` until their contexts are released.
struct RunGuard {
    state: Arc<Mutex<PipelineState>>,
    tasks: TaskTracker,
}

impl RunGuard {
    fn set(&self, next: PipelineState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

fn fail_if_active(state: &Mutex<PipelineState>) {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.is_active() {
        *state = PipelineState::Failed;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_active()
        {
            return;
        }

        self.tasks.close();
        if self.tasks.is_empty() {
            fail_if_active(&self.state);
            return;
        }

        match Handle::try_current() {
            Ok(handle) => {
                warn!(
                    "Batch dropped mid-run; waiting for {} page tasks to release their contexts",
                    self.tasks.len()
                );
                let state = Arc::clone(&self.state);
                let tasks = self.tasks.clone();
                handle.spawn(async move {
                    tasks.wait().await;
                    fail_if_active(&state);
                });
            }
            // Outside a runtime the aborted tasks can never be polled again.
            Err(_) => fail_if_active(&self.state),
        }
    }
}

//! Batch progress: two independent percentages plus an event callback.
//!
//! [`ProgressTracker`] is the single mutable object shared by the concurrent
//! render tasks and the archive stage. Each percentage lives in its own
//! atomic, render tasks only ever write `render_percent` and the archive
//! stage (which starts after rendering settles) only ever writes
//! `archive_percent`, so readers never need a lock.
//!
//! Callers consume progress in either of two ways:
//!
//! * **Polling** — [`ProgressTracker::snapshot`] returns the current
//!   [`BatchProgress`] at any cadence.
//! * **Subscribing** — inject an [`Arc<dyn BatchProgressCallback>`] via
//!   [`crate::config::BatchConfigBuilder::progress_callback`]. Callbacks are
//!   invoked inline and must return quickly; the pipeline never waits on a
//!   consumer.
//!
//! # Example
//!
//! ```rust
//! use webpdf_batch::{BatchProgressCallback, BatchConfig};
//! use std::sync::{Arc, Mutex};
//!
//! struct Recorder(Mutex<Vec<f64>>);
//!
//! impl BatchProgressCallback for Recorder {
//!     fn on_render_progress(&self, percent: f64) {
//!         self.0.lock().unwrap().push(percent);
//!     }
//! }
//!
//! let config = BatchConfig::builder()
//!     .progress_callback(Arc::new(Recorder(Mutex::new(Vec::new()))))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::CaptureStrategy;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Called by the pipeline as pages settle and stages advance.
///
/// Implementations must be `Send + Sync`: page events arrive concurrently
/// from up to `concurrency` render tasks. All methods have default no-op
/// implementations so callers only override what they care about.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once when the render stage starts.
    fn on_batch_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called when a page acquires a render slot.
    ///
    /// # Arguments
    /// * `page_num` — 1-indexed position in the batch
    fn on_page_start(&self, page_num: usize, total_pages: usize, source_url: &str) {
        let _ = (page_num, total_pages, source_url);
    }

    /// Called when a page settles with an artifact (real or placeholder).
    fn on_page_complete(&self, page_num: usize, total_pages: usize, strategy: CaptureStrategy) {
        let _ = (page_num, total_pages, strategy);
    }

    /// Called when a page settles without an artifact.
    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let _ = (page_num, total_pages, error);
    }

    /// Called every time `render_percent` advances.
    fn on_render_progress(&self, percent: f64) {
        let _ = percent;
    }

    /// Called once before the first archive entry is registered.
    fn on_archive_start(&self, entries: usize) {
        let _ = entries;
    }

    /// Called every time `archive_percent` advances.
    fn on_archive_progress(&self, percent: f64) {
        let _ = percent;
    }

    /// Called once after the payload has been produced.
    fn on_batch_complete(&self, total_pages: usize, captured_pages: usize) {
        let _ = (total_pages, captured_pages);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::BatchConfig`].
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;

/// Point-in-time view of a run's progress.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Share of page references settled, 0–100.
    pub render_percent: f64,
    /// Share of the archive built, 0–100.
    pub archive_percent: f64,
}

/// Lock-free owner of the two progress percentages of a run.
pub struct ProgressTracker {
    render: AtomicU64,
    archive: AtomicU64,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    pub fn new(callback: Option<ProgressCallback>) -> Self {
        Self {
            render: AtomicU64::new(0f64.to_bits()),
            archive: AtomicU64::new(0f64.to_bits()),
            callback,
        }
    }

    /// Zero both percentages at the start of a run.
    pub fn reset(&self) {
        self.render.store(0f64.to_bits(), Ordering::SeqCst);
        self.archive.store(0f64.to_bits(), Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> BatchProgress {
        BatchProgress {
            render_percent: f64::from_bits(self.render.load(Ordering::SeqCst)),
            archive_percent: f64::from_bits(self.archive.load(Ordering::SeqCst)),
        }
    }

    /// Raise `render_percent`; lower values are ignored.
    pub fn advance_render(&self, percent: f64) {
        if let Some(p) = raise(&self.render, percent) {
            if let Some(cb) = &self.callback {
                cb.on_render_progress(p);
            }
        }
    }

    /// Raise `archive_percent`; lower values are ignored.
    pub fn advance_archive(&self, percent: f64) {
        if let Some(p) = raise(&self.archive, percent) {
            if let Some(cb) = &self.callback {
                cb.on_archive_progress(p);
            }
        }
    }

    /// The injected callback, if any.
    pub fn callback(&self) -> Option<&ProgressCallback> {
        self.callback.as_ref()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Monotonic store of `percent` clamped to [0, 100]. Returns the new value
/// when it actually advanced.
fn raise(slot: &AtomicU64, percent: f64) -> Option<f64> {
    if percent.is_nan() {
        return None;
    }
    let target = percent.clamp(0.0, 100.0);
    let mut current = slot.load(Ordering::SeqCst);
    loop {
        if f64::from_bits(current) >= target {
            return None;
        }
        match slot.compare_exchange_weak(
            current,
            target.to_bits(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => return Some(target),
            Err(actual) => current = actual,
        }
    }
}

/// Percentage of `done` out of `total`; an empty total counts as complete.
pub fn percent_of(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    done as f64 * 100.0 / total as f64
}

//! Render stage: bounded fan-out of page references to [`PageRenderer`]s.
//!
//! At most `concurrency` pages are in flight; the rest wait in the queue
//! until a slot frees. Each page runs in its own task inside a [`JoinSet`],
//! so dropping the batch aborts every page still in flight and its
//! rendering context is released. A panic in one renderer settles that page
//! as a failure instead of tearing down the batch. Results land in slots
//! indexed by reference ordinal, so the output order never depends on
//! completion order.

use crate::config::RenderOptions;
use crate::error::{BatchError, PageError};
use crate::output::{RenderOutcome, RenderResult};
use crate::pipeline::input::PageReference;
use crate::pipeline::render::PageRenderer;
use crate::progress::{percent_of, ProgressTracker};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Runs the render stage of one batch.
#[derive(Clone)]
pub struct RenderCoordinator {
    renderer: PageRenderer,
    concurrency: usize,
    tasks: TaskTracker,
}

impl RenderCoordinator {
    pub fn new(renderer: PageRenderer, concurrency: usize) -> Self {
        Self {
            renderer,
            concurrency: concurrency.max(1),
            tasks: TaskTracker::new(),
        }
    }

    /// Register every page task on `tasks`, so a caller can wait until all
    /// of them are gone, aborted ones included.
    pub fn with_task_tracker(mut self, tasks: TaskTracker) -> Self {
        self.tasks = tasks;
        self
    }

    /// Render every reference and return one result per reference, in
    /// reference order.
    ///
    /// `render_percent` on `progress` advances on every settlement and reaches
    /// 100 exactly when the last page settles. Once `cancel` fires no new page
    /// is started; pages already in flight run to completion. Dropping the
    /// returned future aborts the pages in flight instead.
    ///
    /// # Errors
    /// - [`BatchError::Cancelled`] when cancellation left pages unsettled
    /// - [`BatchError::Internal`] when a page task was aborted from outside
    pub async fn run_batch(
        &self,
        refs: &[PageReference],
        opts: &RenderOptions,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<Vec<RenderResult>, BatchError> {
        let total = refs.len();
        let width = ordinal_width(total);
        let opts = Arc::new(opts.clone());
        let callback = progress.callback().cloned();

        info!(
            "Rendering {} pages (concurrency {})",
            total, self.concurrency
        );
        if let Some(cb) = &callback {
            cb.on_batch_start(total);
        }

        let mut slots: Vec<Option<RenderResult>> = vec![None; total];
        let mut settled = 0usize;
        let mut queue = refs.iter();
        let mut in_flight: JoinSet<RenderResult> = JoinSet::new();

        loop {
            while in_flight.len() < self.concurrency && !cancel.is_cancelled() {
                let Some(reference) = queue.next() else {
                    break;
                };
                if let Some(cb) = &callback {
                    cb.on_page_start(reference.page_num(), total, &reference.source_url);
                }
                in_flight.spawn(self.tasks.track_future(render_page(
                    self.renderer.clone(),
                    reference.clone(),
                    Arc::clone(&opts),
                )));
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let mut result = joined
                .map_err(|e| BatchError::Internal(format!("render task did not finish: {e}")))?;

            let page_num = result.reference.page_num();
            match &mut result.outcome {
                RenderOutcome::Success { artifact } => {
                    artifact.name = entry_name(page_num, width, &artifact.name);
                    if let Some(cb) = &callback {
                        cb.on_page_complete(page_num, total, artifact.strategy);
                    }
                }
                RenderOutcome::Failure { reason } => {
                    if let Some(cb) = &callback {
                        cb.on_page_error(page_num, total, &reason.to_string());
                    }
                }
            }

            settled += 1;
            progress.advance_render(percent_of(settled, total));
            debug!("Settled {}/{} (page {})", settled, total, page_num);

            match slots.get_mut(result.reference.id) {
                Some(slot) => *slot = Some(result),
                None => {
                    return Err(BatchError::Internal(format!(
                        "page reference id {} out of range for {} pages",
                        result.reference.id, total
                    )))
                }
            }
        }

        if settled < total {
            info!("Render stage cancelled after {}/{} pages", settled, total);
            return Err(BatchError::Cancelled { settled, total });
        }

        Ok(slots.into_iter().flatten().collect())
    }
}

/// Render one page, settling a panic as that page's failure.
async fn render_page(
    renderer: PageRenderer,
    reference: PageReference,
    opts: Arc<RenderOptions>,
) -> RenderResult {
    let rendered = AssertUnwindSafe(renderer.render(&reference, &opts))
        .catch_unwind()
        .await;
    match rendered {
        Ok(result) => result,
        Err(panic) => {
            let detail = format!("render task panicked: {}", panic_message(panic.as_ref()));
            warn!("Page {}: {}", reference.page_num(), detail);
            RenderResult {
                reference,
                outcome: RenderOutcome::Failure {
                    reason: PageError::ArtifactFailed { detail },
                },
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Digits used for the ordinal prefix: at least two, more for large batches.
fn ordinal_width(total: usize) -> usize {
    total.to_string().len().max(2)
}

/// `<NN>_<base>`, unique within a batch because ordinals are.
fn entry_name(page_num: usize, width: usize, base: &str) -> String {
    format!("{page_num:0width$}_{base}")
}

//! Page rendering: one page reference in, one [`RenderResult`] out.
//!
//! ## Fallback chain
//!
//! ```text
//! ┌──────────────┐ AccessDenied ┌───────────────┐ FetchFailed ┌─────────────┐
//! │ direct       │─────────────▶│ proxied fetch │────────────▶│ placeholder │
//! │ capture      │              │ + rewrite     │             │             │
//! └──────────────┘              └───────────────┘             └─────────────┘
//!        └───────────── wait budget exceeded (RenderTimeout) ───────▲
//! ```
//!
//! The first two strategies run inside a single wait budget, and so does
//! loading the images of whichever one succeeded. A directly captured page
//! resolves image sources against its final URL. A proxied page only loads
//! absolute sources, which is what the root-relative rewrite produces.
//! Whatever the chain ends with, the page is composed into a PDF; only a
//! composer failure on the placeholder itself produces
//! [`RenderOutcome::Failure`].
//!
//! ## Why spawn_blocking?
//!
//! PDF composition is CPU-bound (layout, deflate). It runs on the blocking
//! pool so the async workers keep driving the other pages' network I/O.

use crate::config::{BatchConfig, RenderOptions};
use crate::error::{BatchError, PageError};
use crate::output::{sanitise_filename, CaptureStrategy, PdfArtifact, RenderOutcome, RenderResult};
use crate::pipeline::compose::{placeholder_page, LopdfComposer, PageComposer};
use crate::pipeline::context::{ContextGuard, ContextProvider, HttpContextProvider};
use crate::pipeline::extract::{extract_page, Block, CapturedPage};
use crate::pipeline::input::PageReference;
use crate::pipeline::retrieve::{ProxyRetriever, Retriever};
use crate::pipeline::rewrite::rewrite_root_relative;
use futures::future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Renders single page references through the ordered fallback chain.
///
/// Cheap to share: every collaborator is behind an `Arc`.
#[derive(Clone)]
pub struct PageRenderer {
    contexts: Arc<dyn ContextProvider>,
    retriever: Arc<dyn Retriever>,
    composer: Arc<dyn PageComposer>,
    wait_budget: Duration,
}

impl PageRenderer {
    pub fn new(
        contexts: Arc<dyn ContextProvider>,
        retriever: Arc<dyn Retriever>,
        composer: Arc<dyn PageComposer>,
        wait_budget: Duration,
    ) -> Self {
        Self {
            contexts,
            retriever,
            composer,
            wait_budget,
        }
    }

    /// Build a renderer from `config`, filling in the built-in collaborators
    /// for any that were not injected.
    pub fn from_config(config: &BatchConfig) -> Result<Self, BatchError> {
        let contexts: Arc<dyn ContextProvider> = match &config.context_provider {
            Some(p) => Arc::clone(p),
            None => Arc::new(
                HttpContextProvider::new(config.fetch_timeout_secs)
                    .map_err(|e| BatchError::Internal(format!("HTTP client: {e}")))?,
            ),
        };
        let retriever: Arc<dyn Retriever> = match &config.retriever {
            Some(r) => Arc::clone(r),
            None => Arc::new(
                ProxyRetriever::new(
                    config.proxy_template.clone(),
                    config.fetch_timeout_secs,
                    config.max_retries,
                    config.retry_backoff_ms,
                )
                .map_err(|e| BatchError::Internal(format!("HTTP client: {e}")))?,
            ),
        };
        let composer: Arc<dyn PageComposer> = match &config.composer {
            Some(c) => Arc::clone(c),
            None => Arc::new(LopdfComposer),
        };
        Ok(Self::new(
            contexts,
            retriever,
            composer,
            Duration::from_secs(config.render_timeout_secs),
        ))
    }

    /// Render one reference. Always settles with exactly one result; the wait
    /// for real content is bounded by the wait budget.
    ///
    /// The artifact is named `<display name>.pdf`; the coordinator prefixes
    /// the ordinal.
    pub async fn render(&self, reference: &PageReference, opts: &RenderOptions) -> RenderResult {
        let url = reference.source_url.as_str();
        let name = format!("{}.pdf", sanitise_filename(&reference.display_name));

        let captured = match tokio::time::timeout(self.wait_budget, self.capture(url)).await {
            Ok(result) => result,
            Err(_) => Err(PageError::RenderTimeout {
                url: url.to_string(),
                secs: self.wait_budget.as_secs(),
            }),
        };

        let fallback_reason = match captured {
            Ok((page, strategy)) => match self.compose(page, opts).await {
                Ok(bytes) => {
                    debug!("Page {} captured ({})", reference.page_num(), strategy);
                    return success(reference, name, bytes, strategy, None);
                }
                Err(e) => e.reason(),
            },
            Err(e) => e.reason(),
        };
        warn!(
            "Page {} ({}) degraded to placeholder: {}",
            reference.page_num(),
            url,
            fallback_reason
        );

        match self.compose(placeholder_page(url, &fallback_reason), opts).await {
            Ok(bytes) => success(
                reference,
                name,
                bytes,
                CaptureStrategy::Placeholder,
                Some(fallback_reason),
            ),
            Err(e) => {
                warn!("Page {} placeholder failed: {}", reference.page_num(), e);
                RenderResult {
                    reference: reference.clone(),
                    outcome: RenderOutcome::Failure { reason: e },
                }
            }
        }
    }

    // ── Strategies ───────────────────────────────────────────────────────

    async fn capture(&self, url: &str) -> Result<(CapturedPage, CaptureStrategy), PageError> {
        match self.capture_direct(url).await {
            Ok((mut page, final_url)) => {
                let base = Url::parse(&final_url).ok();
                self.load_images(&mut page, base.as_ref()).await;
                return Ok((page, CaptureStrategy::Direct));
            }
            Err(e) => debug!("Direct capture of {} failed: {}", url, e),
        }
        let mut page = self.capture_proxied(url).await?;
        self.load_images(&mut page, None).await;
        Ok((page, CaptureStrategy::Proxied))
    }

    /// Returns the page and the URL it was loaded from after redirects.
    async fn capture_direct(&self, url: &str) -> Result<(CapturedPage, String), PageError> {
        let denied = |detail: String| PageError::AccessDenied {
            url: url.to_string(),
            detail,
        };
        // Released on every exit path, including the timeout dropping this future.
        let mut context = ContextGuard::new(self.contexts.acquire()?);
        let document = context.load(url).await?;
        let page = extract_page(&document.html).map_err(denied)?;
        if page.is_empty() {
            return Err(denied("document has no visible content".into()));
        }
        Ok((page, document.final_url))
    }

    async fn capture_proxied(&self, url: &str) -> Result<CapturedPage, PageError> {
        let failed = |detail: String| PageError::FetchFailed {
            url: url.to_string(),
            detail,
        };
        let raw = self.retriever.fetch(url).await?;
        let html = match Url::parse(url) {
            Ok(page_url) => rewrite_root_relative(&raw, &page_url).map_err(failed)?,
            Err(_) => raw,
        };
        let page = extract_page(&html).map_err(failed)?;
        if page.is_empty() {
            return Err(failed("retrieved content is empty".into()));
        }
        Ok(page)
    }

    /// Fill in the bytes of the page's images. Sources that do not resolve to
    /// an http(s) URL, and loads that fail, keep their alternative text.
    async fn load_images(&self, page: &mut CapturedPage, base: Option<&Url>) {
        let wanted: Vec<(usize, Url)> = page
            .blocks
            .iter()
            .enumerate()
            .filter_map(|(i, block)| match block {
                Block::Image(image) => resolve_src(&image.src, base).map(|u| (i, u)),
                _ => None,
            })
            .take(MAX_IMAGES_PER_PAGE)
            .collect();
        if wanted.is_empty() {
            return;
        }

        let loaded =
            future::join_all(wanted.iter().map(|(_, u)| self.retriever.fetch_resource(u.as_str())))
                .await;
        for ((index, src), result) in wanted.into_iter().zip(loaded) {
            match (result, page.blocks.get_mut(index)) {
                (Ok(bytes), Some(Block::Image(image))) => image.data = Some(bytes),
                (Err(e), _) => debug!("Image {} not loaded: {}", src, e),
                _ => {}
            }
        }
    }

    async fn compose(&self, page: CapturedPage, opts: &RenderOptions) -> Result<Vec<u8>, PageError> {
        let composer = Arc::clone(&self.composer);
        let opts = opts.clone();
        tokio::task::spawn_blocking(move || composer.compose(&page, &opts))
            .await
            .map_err(|e| PageError::ArtifactFailed {
                detail: format!("compose task panicked: {e}"),
            })?
    }
}

/// Most images loaded for a single page.
const MAX_IMAGES_PER_PAGE: usize = 16;

/// Absolute http(s) URL for an image `src`, joined onto `base` when given.
fn resolve_src(src: &str, base: Option<&Url>) -> Option<Url> {
    let url = match base {
        Some(base) => base.join(src).ok()?,
        None => Url::parse(src).ok()?,
    };
    matches!(url.scheme(), "http" | "https").then_some(url)
}

fn success(
    reference: &PageReference,
    name: String,
    bytes: Vec<u8>,
    strategy: CaptureStrategy,
    fallback_reason: Option<String>,
) -> RenderResult {
    RenderResult {
        reference: reference.clone(),
        outcome: RenderOutcome::Success {
            artifact: PdfArtifact {
                name,
                bytes,
                strategy,
                fallback_reason,
            },
        },
    }
}

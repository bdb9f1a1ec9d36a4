//! Isolated rendering contexts used by the direct-capture strategy.
//!
//! A [`ContextProvider`] hands out one [`RenderContext`] per render attempt.
//! The renderer wraps it in a [`ContextGuard`] so the context is disposed on
//! every exit path: success, error, timeout, a panic, or the page task being
//! aborted because its batch was dropped.
//!
//! [`HttpContextProvider`] is the built-in context. It loads the page over
//! HTTP with no cookie store and refuses documents a browser would not let a
//! foreign frame inspect (`X-Frame-Options`, CSP `frame-ancestors`), reporting
//! them as [`PageError::AccessDenied`] so the proxied strategy takes over.

use crate::error::PageError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, CONTENT_SECURITY_POLICY, CONTENT_TYPE};
use std::time::Duration;
use tracing::debug;

/// A document loaded by a rendering context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedDocument {
    /// URL after redirects.
    pub final_url: String,
    pub html: String,
}

/// One isolated context able to load a page and expose its content.
#[async_trait]
pub trait RenderContext: Send {
    /// Load `url` and return its inspectable content.
    ///
    /// # Errors
    /// [`PageError::AccessDenied`] when the content cannot be inspected.
    async fn load(&mut self, url: &str) -> Result<LoadedDocument, PageError>;

    /// Release everything the context holds. Called exactly once.
    fn dispose(&mut self) {}
}

/// Hands out fresh rendering contexts.
pub trait ContextProvider: Send + Sync {
    fn acquire(&self) -> Result<Box<dyn RenderContext>, PageError>;
}

/// Scoped ownership of a [`RenderContext`]; disposes it on drop.
pub struct ContextGuard {
    inner: Option<Box<dyn RenderContext>>,
}

impl ContextGuard {
    pub fn new(context: Box<dyn RenderContext>) -> Self {
        Self {
            inner: Some(context),
        }
    }

    pub async fn load(&mut self, url: &str) -> Result<LoadedDocument, PageError> {
        match self.inner.as_mut() {
            Some(ctx) => ctx.load(url).await,
            None => Err(PageError::AccessDenied {
                url: url.to_string(),
                detail: "rendering context already released".into(),
            }),
        }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(mut ctx) = self.inner.take() {
            ctx.dispose();
        }
    }
}

// ── HTTP context ─────────────────────────────────────────────────────────

/// Built-in provider: plain HTTP loads, no shared cookies or cache.
pub struct HttpContextProvider {
    client: reqwest::Client,
}

impl HttpContextProvider {
    pub fn new(timeout_secs: u64) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("webpdf-batch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl ContextProvider for HttpContextProvider {
    fn acquire(&self) -> Result<Box<dyn RenderContext>, PageError> {
        Ok(Box::new(HttpContext {
            client: Some(self.client.clone()),
        }))
    }
}

struct HttpContext {
    client: Option<reqwest::Client>,
}

#[async_trait]
impl RenderContext for HttpContext {
    async fn load(&mut self, url: &str) -> Result<LoadedDocument, PageError> {
        let denied = |detail: String| PageError::AccessDenied {
            url: url.to_string(),
            detail,
        };
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| denied("context disposed".into()))?;

        let response = client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                denied("load timed out".into())
            } else {
                denied(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(denied(format!("HTTP {status}")));
        }
        if let Some(reason) = framing_refusal(response.headers()) {
            return Err(denied(reason));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !content_type.is_empty() && !content_type.contains("html") && !content_type.starts_with("text/") {
            return Err(denied(format!("content type '{content_type}' is not a document")));
        }

        let final_url = response.url().to_string();
        let html = response.text().await.map_err(|e| denied(e.to_string()))?;
        if html.trim().is_empty() {
            return Err(denied("document is empty".into()));
        }
        debug!("Loaded {} directly ({} bytes)", final_url, html.len());
        Ok(LoadedDocument { final_url, html })
    }

    fn dispose(&mut self) {
        self.client = None;
    }
}

static RE_FRAME_ANCESTORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)frame-ancestors\s+([^;]*)").unwrap());

/// Reason the document refuses to be inspected by a foreign context, if any.
fn framing_refusal(headers: &HeaderMap) -> Option<String> {
    if let Some(xfo) = headers.get("x-frame-options").and_then(|v| v.to_str().ok()) {
        let xfo = xfo.trim().to_ascii_uppercase();
        if xfo == "DENY" || xfo == "SAMEORIGIN" {
            return Some(format!("X-Frame-Options: {xfo}"));
        }
    }
    let csp = headers
        .get(CONTENT_SECURITY_POLICY)
        .and_then(|v| v.to_str().ok())?;
    let sources = RE_FRAME_ANCESTORS.captures(csp)?[1].trim().to_ascii_lowercase();
    if sources == "'none'" || sources == "'self'" {
        Some(format!("frame-ancestors {sources}"))
    } else {
        None
    }
}

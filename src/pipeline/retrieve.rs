//! Remote retrieval used by the proxied-fetch strategy.
//!
//! The pipeline only sees the [`Retriever`] trait: a URL goes in, raw text
//! (or a [`PageError::FetchFailed`]) comes out. [`ProxyRetriever`] is the
//! built-in implementation; tests and embedders inject their own through
//! [`crate::config::BatchConfigBuilder::retriever`].
//!
//! ## Retry Strategy
//!
//! Public intermediaries are rate-limited and flaky under concurrent load.
//! Network errors, 429 and 5xx responses are retried with exponential
//! backoff (`retry_backoff_ms * 2^(attempt-1)`). Other 4xx responses are
//! final. The page renderer's wait budget still bounds the total time spent.
//!
//! ## Resources
//!
//! Images referenced by a captured page are loaded with
//! [`Retriever::fetch_resource`] straight from their own origin, once, with
//! no retry. A failed image only costs the page its picture.

use crate::error::PageError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Fetches the raw content of a page through some retrieval path.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return the body of `url` as text.
    ///
    /// # Errors
    /// [`PageError::FetchFailed`] on a non-2xx status or a network error.
    async fn fetch(&self, url: &str) -> Result<String, PageError>;

    /// Return the raw bytes of a resource (an image) referenced by a page.
    ///
    /// The default refuses, so pages keep the alternative text instead.
    async fn fetch_resource(&self, url: &str) -> Result<Vec<u8>, PageError> {
        Err(PageError::FetchFailed {
            url: url.to_string(),
            detail: "resource loading not supported".into(),
        })
    }
}

/// Largest resource body accepted by [`ProxyRetriever::fetch_resource`].
pub const MAX_RESOURCE_BYTES: u64 = 8 * 1024 * 1024;

/// Retrieves pages through a URL-templated intermediary such as
/// `https://api.allorigins.win/raw?url={url}`.
pub struct ProxyRetriever {
    client: reqwest::Client,
    template: String,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl ProxyRetriever {
    pub fn new(
        template: impl Into<String>,
        timeout_secs: u64,
        max_retries: u32,
        retry_backoff_ms: u64,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("webpdf-batch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            template: template.into(),
            max_retries,
            retry_backoff_ms,
        })
    }

    /// Intermediary URL for `url`.
    pub fn proxied_url(&self, url: &str) -> String {
        proxied_url(&self.template, url)
    }
}

/// Substitute the percent-encoded `url` into `template`.
pub fn proxied_url(template: &str, url: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(url.as_bytes()).collect();
    template.replace("{url}", &encoded)
}

/// Outcome of a single retrieval attempt.
enum Attempt {
    Done(String),
    Retry(String),
    Fail(String),
}

impl ProxyRetriever {
    async fn attempt(&self, target: &str) -> Attempt {
        let response = match self.client.get(target).send().await {
            Ok(r) => r,
            Err(e) => return Attempt::Retry(e.to_string()),
        };
        let status = response.status();
        if !status.is_success() {
            let detail = format!("HTTP {status}");
            return if status.is_server_error() || status.as_u16() == 429 {
                Attempt::Retry(detail)
            } else {
                Attempt::Fail(detail)
            };
        }
        match response.text().await {
            Ok(body) => Attempt::Done(body),
            Err(e) => Attempt::Retry(e.to_string()),
        }
    }
}

#[async_trait]
impl Retriever for ProxyRetriever {
    async fn fetch(&self, url: &str) -> Result<String, PageError> {
        let target = self.proxied_url(url);
        let mut last_err = String::from("Unknown error");

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "Fetch {}: retry {}/{} after {}ms",
                    url, attempt, self.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.attempt(&target).await {
                Attempt::Done(body) => {
                    debug!("Fetched {} via intermediary ({} bytes)", url, body.len());
                    return Ok(body);
                }
                Attempt::Retry(detail) => last_err = detail,
                Attempt::Fail(detail) => {
                    return Err(PageError::FetchFailed {
                        url: url.to_string(),
                        detail,
                    })
                }
            }
        }

        Err(PageError::FetchFailed {
            url: url.to_string(),
            detail: last_err,
        })
    }

    async fn fetch_resource(&self, url: &str) -> Result<Vec<u8>, PageError> {
        let failed = |detail: String| PageError::FetchFailed {
            url: url.to_string(),
            detail,
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {status}")));
        }
        if response
            .content_length()
            .is_some_and(|n| n > MAX_RESOURCE_BYTES)
        {
            return Err(failed(format!("larger than {MAX_RESOURCE_BYTES} bytes")));
        }
        let body = response.bytes().await.map_err(|e| failed(e.to_string()))?;
        if body.len() as u64 > MAX_RESOURCE_BYTES {
            return Err(failed(format!("larger than {MAX_RESOURCE_BYTES} bytes")));
        }
        debug!("Fetched resource {} ({} bytes)", url, body.len());
        Ok(body.to_vec())
    }
}

//! Configuration types for batch page rendering.
//!
//! All batch behaviour is controlled through [`BatchConfig`], built via its
//! [`BatchConfigBuilder`]. The per-page layout knobs live in a separate
//! [`RenderOptions`] value because they are shared read-only by every
//! concurrent renderer in a batch, while the rest of the config only matters
//! to the coordinator and the archive stage.

use crate::error::BatchError;
use crate::pipeline::compose::PageComposer;
use crate::pipeline::context::ContextProvider;
use crate::pipeline::retrieve::Retriever;
use crate::progress::ProgressCallback;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Default intermediary used by the proxied-fetch strategy.
pub const DEFAULT_PROXY_TEMPLATE: &str = "https://api.allorigins.win/raw?url={url}";

/// Configuration for one batch run.
///
/// Built via [`BatchConfig::builder()`] or using [`BatchConfig::default()`].
///
/// # Example
/// ```rust
/// use webpdf_batch::{BatchConfig, PageSize, Orientation};
///
/// let config = BatchConfig::builder()
///     .page_size(PageSize::Letter)
///     .orientation(Orientation::Landscape)
///     .margin("0.5in")
///     .unwrap()
///     .concurrency(2)
///     .label("salary sheets")
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 2);
/// ```
#[derive(Clone)]
pub struct BatchConfig {
    /// Page layout shared by every renderer in the batch.
    pub options: RenderOptions,

    /// Maximum number of pages rendered at the same time. Default: 4.
    ///
    /// Each active page holds one isolated rendering context. Four matches the
    /// typical per-host connection ceiling of browsers and keeps memory flat
    /// on batches of hundreds of pages.
    pub concurrency: usize,

    /// Wait budget for real content to become available, in seconds. Default: 15.
    ///
    /// Covers the direct capture and the proxied fetch together. When it runs
    /// out the page degrades to a placeholder.
    pub render_timeout_secs: u64,

    /// Per-request timeout of the built-in HTTP context and retriever. Default: 30.
    pub fetch_timeout_secs: u64,

    /// Retries of a transient retrieval failure. Default: 2.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    pub retry_backoff_ms: u64,

    /// Label used for the archive filename (`<label>.zip`). Default: "pdfs".
    pub label: String,

    /// What to deliver when the batch contains exactly one reference.
    pub single_item_policy: SingleItemPolicy,

    /// URL template of the retrieval intermediary; `{url}` is replaced by the
    /// percent-encoded page URL. Ignored when `retriever` is set.
    pub proxy_template: String,

    /// DEFLATE level for archive entries, 0–9. Default: 9.
    pub compression_level: i64,

    /// Pre-constructed context provider. `None` selects [`crate::pipeline::context::HttpContextProvider`].
    pub context_provider: Option<Arc<dyn ContextProvider>>,

    /// Pre-constructed retriever. `None` selects [`crate::pipeline::retrieve::ProxyRetriever`].
    pub retriever: Option<Arc<dyn Retriever>>,

    /// Pre-constructed PDF composer. `None` selects [`crate::pipeline::compose::LopdfComposer`].
    pub composer: Option<Arc<dyn PageComposer>>,

    /// Receives page and stage events as the batch progresses.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            options: RenderOptions::default(),
            concurrency: 4,
            render_timeout_secs: 15,
            fetch_timeout_secs: 30,
            max_retries: 2,
            retry_backoff_ms: 500,
            label: "pdfs".to_string(),
            single_item_policy: SingleItemPolicy::default(),
            proxy_template: DEFAULT_PROXY_TEMPLATE.to_string(),
            compression_level: 9,
            context_provider: None,
            retriever: None,
            composer: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for BatchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchConfig")
            .field("options", &self.options)
            .field("concurrency", &self.concurrency)
            .field("render_timeout_secs", &self.render_timeout_secs)
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("label", &self.label)
            .field("single_item_policy", &self.single_item_policy)
            .field("proxy_template", &self.proxy_template)
            .field("compression_level", &self.compression_level)
            .field(
                "context_provider",
                &self.context_provider.as_ref().map(|_| "<dyn ContextProvider>"),
            )
            .field("retriever", &self.retriever.as_ref().map(|_| "<dyn Retriever>"))
            .field("composer", &self.composer.as_ref().map(|_| "<dyn PageComposer>"))
            .finish()
    }
}

impl BatchConfig {
    /// Create a new builder for `BatchConfig`.
    pub fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`BatchConfig`].
#[derive(Debug)]
pub struct BatchConfigBuilder {
    config: BatchConfig,
}

impl BatchConfigBuilder {
    pub fn options(mut self, options: RenderOptions) -> Self {
        self.config.options = options;
        self
    }

    pub fn page_size(mut self, size: PageSize) -> Self {
        self.config.options.page_size = size;
        self
    }

    pub fn orientation(mut self, orientation: Orientation) -> Self {
        self.config.options.orientation = orientation;
        self
    }

    /// Set the margin from a dimension string such as `"10mm"` or `"0.5in"`.
    pub fn margin(mut self, margin: &str) -> Result<Self, BatchError> {
        self.config.options.margin = margin.parse()?;
        Ok(self)
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn render_timeout_secs(mut self, secs: u64) -> Self {
        self.config.render_timeout_secs = secs;
        self
    }

    pub fn fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.fetch_timeout_secs = secs;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.config.label = label.into();
        self
    }

    pub fn single_item_policy(mut self, policy: SingleItemPolicy) -> Self {
        self.config.single_item_policy = policy;
        self
    }

    pub fn proxy_template(mut self, template: impl Into<String>) -> Self {
        self.config.proxy_template = template.into();
        self
    }

    pub fn compression_level(mut self, level: i64) -> Self {
        self.config.compression_level = level.clamp(0, 9);
        self
    }

    pub fn context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.config.context_provider = Some(provider);
        self
    }

    pub fn retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.config.retriever = Some(retriever);
        self
    }

    pub fn composer(mut self, composer: Arc<dyn PageComposer>) -> Self {
        self.config.composer = Some(composer);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<BatchConfig, BatchError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(BatchError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.render_timeout_secs == 0 {
            return Err(BatchError::InvalidConfig(
                "Render timeout must be at least 1 second".into(),
            ));
        }
        if c.retriever.is_none() && !c.proxy_template.contains("{url}") {
            return Err(BatchError::InvalidConfig(format!(
                "Proxy template '{}' has no {{url}} placeholder",
                c.proxy_template
            )));
        }
        if c.label.trim().is_empty() {
            return Err(BatchError::InvalidConfig("Archive label must not be blank".into()));
        }
        Ok(self.config)
    }
}

// ── Render options ───────────────────────────────────────────────────────

/// Page layout applied to every artifact of a batch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RenderOptions {
    pub page_size: PageSize,
    pub orientation: Orientation,
    pub margin: Margin,
}

impl RenderOptions {
    /// Media box `(width, height)` in PDF points after applying orientation.
    pub fn page_dimensions_pt(&self) -> (f32, f32) {
        let (w, h) = self.page_size.dimensions_pt();
        match self.orientation {
            Orientation::Portrait => (w, h),
            Orientation::Landscape => (h, w),
        }
    }
}

/// Paper size of the generated PDFs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PageSize {
    /// 210 × 297 mm (default).
    #[default]
    A4,
    /// 8.5 × 11 in.
    Letter,
    /// 8.5 × 14 in.
    Legal,
}

impl PageSize {
    /// Portrait `(width, height)` in points.
    pub fn dimensions_pt(self) -> (f32, f32) {
        match self {
            PageSize::A4 => (595.0, 842.0),
            PageSize::Letter => (612.0, 792.0),
            PageSize::Legal => (612.0, 1008.0),
        }
    }
}

impl FromStr for PageSize {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "a4" => Ok(PageSize::A4),
            "letter" => Ok(PageSize::Letter),
            "legal" => Ok(PageSize::Legal),
            other => Err(BatchError::InvalidConfig(format!(
                "Unknown page size '{other}' (expected A4, Letter or Legal)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Portrait,
    Landscape,
}

impl FromStr for Orientation {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "portrait" | "p" => Ok(Orientation::Portrait),
            "landscape" | "l" => Ok(Orientation::Landscape),
            other => Err(BatchError::InvalidConfig(format!(
                "Unknown orientation '{other}' (expected portrait or landscape)"
            ))),
        }
    }
}

/// Unit of a [`Margin`] dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginUnit {
    Mm,
    Cm,
    In,
    Pt,
    Px,
}

impl MarginUnit {
    fn as_str(self) -> &'static str {
        match self {
            MarginUnit::Mm => "mm",
            MarginUnit::Cm => "cm",
            MarginUnit::In => "in",
            MarginUnit::Pt => "pt",
            MarginUnit::Px => "px",
        }
    }
}

/// Page margin parsed from a CSS-like dimension string.
///
/// A bare number is read as millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Margin {
    pub value: f32,
    pub unit: MarginUnit,
}

impl Margin {
    /// Margin converted to PDF points (1/72 in).
    pub fn to_points(self) -> f32 {
        match self.unit {
            MarginUnit::Mm => self.value * 72.0 / 25.4,
            MarginUnit::Cm => self.value * 72.0 / 2.54,
            MarginUnit::In => self.value * 72.0,
            MarginUnit::Pt => self.value,
            MarginUnit::Px => self.value * 0.75,
        }
    }
}

impl Default for Margin {
    fn default() -> Self {
        Self {
            value: 10.0,
            unit: MarginUnit::Mm,
        }
    }
}

static RE_DIMENSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+(?:\.\d+)?)\s*(mm|cm|in|pt|px)?$").unwrap());

impl FromStr for Margin {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().to_lowercase();
        let invalid = || BatchError::InvalidConfig(format!("Invalid margin '{s}' (e.g. 10mm, 0.5in)"));
        let caps = RE_DIMENSION.captures(&trimmed).ok_or_else(invalid)?;
        let value: f32 = caps[1].parse().map_err(|_| invalid())?;
        let unit = match caps.get(2).map(|m| m.as_str()) {
            None | Some("mm") => MarginUnit::Mm,
            Some("cm") => MarginUnit::Cm,
            Some("in") => MarginUnit::In,
            Some("pt") => MarginUnit::Pt,
            Some("px") => MarginUnit::Px,
            Some(_) => return Err(invalid()),
        };
        Ok(Margin { value, unit })
    }
}

impl TryFrom<String> for Margin {
    type Error = BatchError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Margin> for String {
    fn from(m: Margin) -> Self {
        m.to_string()
    }
}

impl fmt::Display for Margin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit.as_str())
    }
}

/// Delivery policy for a batch containing exactly one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SingleItemPolicy {
    /// Deliver the PDF itself as `<display name>.pdf` (default).
    #[default]
    BarePdf,
    /// Always deliver a zip archive, even for one entry.
    Archive,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = BatchConfig::default();
        assert_eq!(c.concurrency, 4);
        assert_eq!(c.render_timeout_secs, 15);
        assert_eq!(c.label, "pdfs");
        assert_eq!(c.compression_level, 9);
        assert_eq!(c.single_item_policy, SingleItemPolicy::BarePdf);
        assert_eq!(c.options.margin.to_string(), "10mm");
    }

    #[test]
    fn concurrency_is_clamped_to_one() {
        let c = BatchConfig::builder().concurrency(0).build().unwrap();
        assert_eq!(c.concurrency, 1);
    }

    #[test]
    fn proxy_template_requires_placeholder() {
        let err = BatchConfig::builder()
            .proxy_template("https://proxy.example/")
            .build()
            .unwrap_err();
        assert!(matches!(err, BatchError::InvalidConfig(_)));
    }

    #[test]
    fn margin_units_convert_to_points() {
        let close = |a: f32, b: f32| (a - b).abs() < 0.01;
        assert!(close("10mm".parse::<Margin>().unwrap().to_points(), 28.35));
        assert!(close("1cm".parse::<Margin>().unwrap().to_points(), 28.35));
        assert!(close("0.5in".parse::<Margin>().unwrap().to_points(), 36.0));
        assert!(close("12pt".parse::<Margin>().unwrap().to_points(), 12.0));
        assert!(close("16px".parse::<Margin>().unwrap().to_points(), 12.0));
        // Bare numbers are millimetres.
        assert!(close("10".parse::<Margin>().unwrap().to_points(), 28.35));
    }

    #[test]
    fn margin_rejects_garbage() {
        assert!("ten mm".parse::<Margin>().is_err());
        assert!("-5mm".parse::<Margin>().is_err());
        assert!("5em".parse::<Margin>().is_err());
    }

    #[test]
    fn landscape_swaps_dimensions() {
        let opts = RenderOptions {
            page_size: PageSize::Legal,
            orientation: Orientation::Landscape,
            margin: Margin::default(),
        };
        assert_eq!(opts.page_dimensions_pt(), (1008.0, 612.0));
    }

    #[test]
    fn parses_size_and_orientation_case_insensitively() {
        assert_eq!("letter".parse::<PageSize>().unwrap(), PageSize::Letter);
        assert_eq!("A4".parse::<PageSize>().unwrap(), PageSize::A4);
        assert_eq!(
            "Landscape".parse::<Orientation>().unwrap(),
            Orientation::Landscape
        );
        assert!("tabloid".parse::<PageSize>().is_err());
    }

    #[test]
    fn render_options_serialise_margin_as_string() {
        let json = serde_json::to_string(&RenderOptions::default()).unwrap();
        assert!(json.contains("\"10mm\""), "got: {json}");
        let back: RenderOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, RenderOptions::default());
    }
}

//! # webpdf-batch
//!
//! Render batches of web pages to PDF documents and bundle them into a
//! single zip archive.
//!
//! ## Why this crate?
//!
//! Saving a few dozen pages (pay slips, invoices, report views) as PDFs one
//! by one is slow and fragile: some pages refuse to be embedded by a foreign
//! context, some servers are slow, and a single failure should not sink the
//! whole batch. This crate renders every page through an ordered fallback
//! chain, so each submitted page always yields a PDF (real content or a
//! placeholder that states why), and hands back one downloadable payload.
//!
//! ## Pipeline Overview
//!
//! ```text
//! entries
//!  │
//!  ├─ 1. Input     drop blank sources, number pages, default names
//!  ├─ 2. Render    ≤ N concurrent pages, each: direct ▸ proxied ▸ placeholder
//!  │               (15 s wait budget, contexts released on every path)
//!  ├─ 3. Collect   results slotted by ordinal, render % per settlement
//!  ├─ 4. Archive   deflate level 9, archive % by bytes, then finalize
//!  └─ 5. Output    <label>.zip, or <name>.pdf for a single page
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use webpdf_batch::{render_batch, BatchConfig, PageEntry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BatchConfig::builder().label("statements").build()?;
//!     let entries = vec![
//!         PageEntry::new("january", "https://example.com/statement/1"),
//!         PageEntry::new("february", "https://example.com/statement/2"),
//!     ];
//!     let output = render_batch(entries, &config).await?;
//!     std::fs::write(&output.payload.suggested_filename, &output.payload.bytes)?;
//!     eprintln!(
//!         "{} pages, {} placeholders",
//!         output.stats.total_pages, output.stats.placeholder_pages
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `webpdf` binary (clap + indicatif + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! webpdf-batch = { version = "0.1", default-features = false }
//! ```
//!
//! ## Swapping collaborators
//!
//! The rendering context, the retrieval intermediary and the PDF composer are
//! all traits ([`ContextProvider`], [`Retriever`], [`PageComposer`]). Inject
//! your own through [`BatchConfigBuilder`] to use a headless browser, a
//! private proxy, or deterministic stubs in tests.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    BatchConfig, BatchConfigBuilder, Margin, MarginUnit, Orientation, PageSize, RenderOptions,
    SingleItemPolicy, DEFAULT_PROXY_TEMPLATE,
};
pub use convert::{render_batch, render_batch_sync, render_batch_to_file, write_payload};
pub use error::{BatchError, PageError};
pub use orchestrator::{CancelHandle, PipelineOrchestrator, PipelineState};
pub use output::{
    ArchivePayload, BatchOutput, BatchStats, CaptureStrategy, PdfArtifact, RenderOutcome,
    RenderResult,
};
pub use pipeline::compose::{LopdfComposer, PageComposer};
pub use pipeline::context::{ContextProvider, HttpContextProvider, LoadedDocument, RenderContext};
pub use pipeline::input::{parse_entries, parse_entries_json, split_url_list, PageEntry, PageReference};
pub use pipeline::retrieve::{ProxyRetriever, Retriever};
pub use progress::{BatchProgress, BatchProgressCallback, NoopProgressCallback, ProgressCallback};

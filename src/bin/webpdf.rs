//! CLI binary for webpdf-batch.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `BatchConfig`, drives one batch and writes the payload.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use webpdf_batch::pipeline::input::parse_entry;
use webpdf_batch::{
    parse_entries, write_payload, BatchConfig, BatchProgressCallback, CaptureStrategy,
    Orientation, PageEntry, PageSize, PipelineOrchestrator, ProgressCallback, SingleItemPolicy,
    DEFAULT_PROXY_TEMPLATE,
};

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar for rendering, one for archiving, and
/// a log line per settled page. Pages settle out of order.
struct CliProgressCallback {
    render: ProgressBar,
    archive: ProgressBar,
    placeholders: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let multi = MultiProgress::new();
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold:>9}  [{bar:40.green/238}] {pos:>3}%  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        let render = multi.add(ProgressBar::new(100));
        render.set_style(style.clone());
        render.set_prefix("Rendering");
        render.enable_steady_tick(Duration::from_millis(80));

        let archive = multi.add(ProgressBar::new(100));
        archive.set_style(style);
        archive.set_prefix("Archiving");
        archive.set_message(dim("waiting"));

        Arc::new(Self {
            render,
            archive,
            placeholders: AtomicUsize::new(0),
        })
    }

    fn clear(&self) {
        self.render.finish_and_clear();
        self.archive.finish_and_clear();
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_pages: usize) {
        self.render
            .set_message(format!("{} pages", bold(&total_pages.to_string())));
    }

    fn on_page_complete(&self, page_num: usize, total_pages: usize, strategy: CaptureStrategy) {
        let mark = match strategy {
            CaptureStrategy::Direct => green("✓"),
            CaptureStrategy::Proxied => cyan("✓"),
            CaptureStrategy::Placeholder => {
                self.placeholders.fetch_add(1, Ordering::Relaxed);
                yellow("◌")
            }
        };
        self.render.println(format!(
            "  {} Page {:>3}/{:<3}  {}",
            mark,
            page_num,
            total_pages,
            dim(&strategy.to_string()),
        ));
    }

    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let msg = if error.chars().count() > 80 {
            format!("{}…", error.chars().take(77).collect::<String>())
        } else {
            error.to_string()
        };
        self.render.println(format!(
            "  {} Page {:>3}/{:<3}  {}",
            red("✗"),
            page_num,
            total_pages,
            red(&msg),
        ));
    }

    fn on_render_progress(&self, percent: f64) {
        self.render.set_position(percent.round() as u64);
    }

    fn on_archive_start(&self, entries: usize) {
        self.render.finish();
        self.archive.enable_steady_tick(Duration::from_millis(80));
        self.archive.set_message(format!("{} entries", entries));
    }

    fn on_archive_progress(&self, percent: f64) {
        self.archive.set_position(percent.round() as u64);
    }

    fn on_batch_complete(&self, total_pages: usize, captured_pages: usize) {
        self.clear();
        let placeholders = self.placeholders.load(Ordering::Relaxed);
        let failed = total_pages.saturating_sub(captured_pages + placeholders);

        if placeholders == 0 && failed == 0 {
            eprintln!(
                "{} {} pages captured",
                green("✔"),
                bold(&captured_pages.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} pages captured  ({} placeholders, {} failed)",
                cyan("⚠"),
                bold(&captured_pages.to_string()),
                total_pages,
                yellow(&placeholders.to_string()),
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Two named pages into ./pdfs.zip
  webpdf january=https://example.com/slip/1 february=https://example.com/slip/2

  # Read entries from a file (one NAME=URL per line, or a JSON array)
  webpdf --input slips.json --label salary-slips -o out/

  # A single page is delivered as a bare PDF unless --archive-single is set
  webpdf invoice=https://example.com/invoice/42 -o invoice.pdf

  # Landscape Letter with a 0.5in margin, 8 pages at a time
  webpdf --page-size letter --orientation landscape --margin 0.5in -c 8 --input urls.txt

  # JSON summary of the run on stdout
  webpdf --json --input slips.json > summary.json

INPUT FORMATS:
  Lines   NAME=URL or a bare URL per line; blank lines and # comments skipped
  JSON    [{"fileName": "january", "pdfHtmlUrl": "https://…"}, …]

CAPTURE CHAIN (per page, within the --timeout budget):
  direct       load the page in an isolated context and read its content
  proxied      fetch through the retrieval intermediary (--proxy), rewrite links
  placeholder  a PDF that records the URL and why capture failed

ENVIRONMENT VARIABLES:
  WEBPDF_INPUT, WEBPDF_OUTPUT, WEBPDF_LABEL, WEBPDF_CONCURRENCY,
  WEBPDF_TIMEOUT, WEBPDF_PROXY, WEBPDF_MAX_RETRIES, WEBPDF_PAGE_SIZE,
  WEBPDF_ORIENTATION, WEBPDF_MARGIN, WEBPDF_ARCHIVE_SINGLE, WEBPDF_JSON,
  WEBPDF_NO_PROGRESS, WEBPDF_VERBOSE, WEBPDF_QUIET
  RUST_LOG      Override the log filter (e.g. RUST_LOG=webpdf_batch=debug)
"#;

/// Render web pages to PDF and bundle them into one zip archive.
#[derive(Parser, Debug)]
#[command(
    name = "webpdf",
    version,
    about = "Render web pages to PDF and bundle them into one zip archive",
    long_about = "Render a batch of web pages to PDF documents with bounded concurrency. \
Each page is captured directly when possible, through a retrieval intermediary otherwise, \
and as a placeholder PDF explaining the failure as a last resort. The PDFs are packaged \
into a single zip archive.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Pages as NAME=URL or bare URL.
    entries: Vec<String>,

    /// Read entries from a file (line list or JSON array). Use - for stdin.
    #[arg(short, long, env = "WEBPDF_INPUT")]
    input: Option<PathBuf>,

    /// Output file or directory. Defaults to the suggested filename in the
    /// current directory.
    #[arg(short, long, env = "WEBPDF_OUTPUT")]
    output: Option<PathBuf>,

    /// Archive name (without .zip) for multi-page batches.
    #[arg(short, long, env = "WEBPDF_LABEL", default_value = "pdfs")]
    label: String,

    /// Paper size: a4, letter, legal.
    #[arg(long, env = "WEBPDF_PAGE_SIZE", default_value = "a4")]
    page_size: String,

    /// Orientation: portrait, landscape.
    #[arg(long, env = "WEBPDF_ORIENTATION", default_value = "portrait")]
    orientation: String,

    /// Page margin (e.g. 10mm, 1cm, 0.5in, 36pt).
    #[arg(long, env = "WEBPDF_MARGIN", default_value = "10mm")]
    margin: String,

    /// Number of pages rendered at the same time.
    #[arg(short, long, env = "WEBPDF_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Per-page wait budget in seconds.
    #[arg(short, long, env = "WEBPDF_TIMEOUT", default_value_t = 15)]
    timeout: u64,

    /// Retrieval intermediary URL template; {url} is replaced by the encoded
    /// page URL.
    #[arg(long, env = "WEBPDF_PROXY", default_value = DEFAULT_PROXY_TEMPLATE)]
    proxy: String,

    /// Retries for the intermediary fetch.
    #[arg(long, env = "WEBPDF_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Deliver a zip even when the batch has a single page.
    #[arg(long, env = "WEBPDF_ARCHIVE_SINGLE")]
    archive_single: bool,

    /// Print a JSON summary (stats and per-page results) on stdout.
    #[arg(long, env = "WEBPDF_JSON")]
    json: bool,

    /// Disable progress bars.
    #[arg(long, env = "WEBPDF_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "WEBPDF_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "WEBPDF_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The bars carry the per-page feedback, so library INFO logs are muted
    // while they are shown.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Collect entries ──────────────────────────────────────────────────
    let entries = collect_entries(&cli).await?;

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb = show_progress.then(CliProgressCallback::new);
    let config = build_config(
        &cli,
        progress_cb.clone().map(|cb| cb as ProgressCallback),
    )?;

    // ── Run batch ────────────────────────────────────────────────────────
    let orchestrator = PipelineOrchestrator::new(config);
    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = orchestrator.submit(entries).await;
    if let Some(cb) = &progress_cb {
        cb.clear();
    }
    let output = result.context("Batch failed")?;

    let target = cli
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(&output.payload.suggested_filename));
    let path = write_payload(&output.payload, &target)
        .await
        .context("Failed to write payload")?;

    // ── Summary ──────────────────────────────────────────────────────────
    if cli.json {
        let summary = serde_json::json!({
            "output": path,
            "payload": &output.payload,
            "stats": &output.stats,
            "results": &output.results,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?
        );
    } else if !cli.quiet {
        let stats = &output.stats;
        eprintln!(
            "{}  {}/{} pages  {}ms  →  {}",
            if stats.placeholder_pages + stats.failed_pages == 0 {
                green("✔")
            } else {
                cyan("⚠")
            },
            stats.captured_pages(),
            stats.total_pages,
            stats.total_duration_ms,
            bold(&path.display().to_string()),
        );
        eprintln!(
            "   {} direct  /  {} proxied  /  {} placeholder  /  {} failed",
            dim(&stats.direct_pages.to_string()),
            dim(&stats.proxied_pages.to_string()),
            dim(&stats.placeholder_pages.to_string()),
            dim(&stats.failed_pages.to_string()),
        );
    }

    Ok(())
}

/// Positional entries first, then the `--input` file in its own order.
async fn collect_entries(cli: &Cli) -> Result<Vec<PageEntry>> {
    let mut entries: Vec<PageEntry> = cli.entries.iter().map(|raw| parse_entry(raw)).collect();

    if let Some(ref path) = cli.input {
        let text = if path.as_os_str() == "-" {
            tokio::task::spawn_blocking(|| io::read_to_string(io::stdin()))
                .await
                .context("stdin reader panicked")?
                .context("Failed to read entries from stdin")?
        } else {
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read entries from {:?}", path))?
        };
        entries.extend(parse_entries(&text).context("Invalid input file")?);
    }

    if entries.is_empty() {
        anyhow::bail!("No entries given. Pass NAME=URL arguments or --input <file>.");
    }
    Ok(entries)
}

/// Map CLI args to `BatchConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<BatchConfig> {
    let page_size: PageSize = cli.page_size.parse().context("Invalid --page-size")?;
    let orientation: Orientation = cli.orientation.parse().context("Invalid --orientation")?;
    let policy = if cli.archive_single {
        SingleItemPolicy::Archive
    } else {
        SingleItemPolicy::BarePdf
    };

    let mut builder = BatchConfig::builder()
        .page_size(page_size)
        .orientation(orientation)
        .margin(&cli.margin)
        .context("Invalid --margin")?
        .label(cli.label.clone())
        .concurrency(cli.concurrency)
        .render_timeout_secs(cli.timeout)
        .max_retries(cli.max_retries)
        .proxy_template(cli.proxy.clone())
        .single_item_policy(policy);

    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

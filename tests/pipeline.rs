//! Integration tests for the batch pipeline.
//!
//! Most tests drive [`PipelineOrchestrator`] with scripted collaborators
//! injected through the config builder, so they are deterministic and need
//! no network. The URL of each stub page decides how it behaves:
//!
//! | URL contains | direct capture       | proxied fetch |
//! |--------------|----------------------|---------------|
//! | `denied`     | access denied        | succeeds      |
//! | `down`       | access denied        | HTTP 502      |
//! | `hang`       | never resolves       | succeeds      |
//! | `gate`       | waits for a permit   | succeeds      |
//! | anything else| succeeds             | succeeds      |
//!
//! The live test at the bottom is gated behind `E2E_ENABLED`.
//!
//! Run with:
//!   cargo test --test pipeline -- --nocapture

use async_trait::async_trait;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use webpdf_batch::pipeline::extract::CapturedPage;
use webpdf_batch::{
    BatchConfig, BatchError, BatchOutput, BatchProgressCallback, CaptureStrategy,
    ContextProvider, LoadedDocument, LopdfComposer, PageComposer, PageEntry, PageError,
    PipelineOrchestrator, PipelineState, RenderContext, RenderOptions, RenderOutcome, Retriever,
    SingleItemPolicy,
};
use zip::ZipArchive;

// ── Scripted collaborators ───────────────────────────────────────────────────

#[derive(Default)]
struct Counters {
    acquired: AtomicUsize,
    disposed: AtomicUsize,
    peak: AtomicUsize,
}

impl Counters {
    fn live(&self) -> usize {
        let disposed = self.disposed.load(Ordering::SeqCst);
        self.acquired.load(Ordering::SeqCst) - disposed
    }
}

struct ScriptedContexts {
    counters: Arc<Counters>,
    gate: Arc<Semaphore>,
}

impl ScriptedContexts {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            counters: Arc::new(Counters::default()),
            gate: Arc::new(Semaphore::new(0)),
        })
    }

    fn open_gate(&self) {
        self.gate.add_permits(1_000);
    }
}

impl ContextProvider for ScriptedContexts {
    fn acquire(&self) -> Result<Box<dyn RenderContext>, PageError> {
        let c = &self.counters;
        c.acquired.fetch_add(1, Ordering::SeqCst);
        c.peak.fetch_max(c.live(), Ordering::SeqCst);
        Ok(Box::new(ScriptedContext {
            counters: Arc::clone(&self.counters),
            gate: Arc::clone(&self.gate),
        }))
    }
}

struct ScriptedContext {
    counters: Arc<Counters>,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl RenderContext for ScriptedContext {
    async fn load(&mut self, url: &str) -> Result<LoadedDocument, PageError> {
        if url.contains("hang") {
            std::future::pending::<()>().await;
        }
        if url.contains("gate") {
            let _permit = self.gate.acquire().await;
        }
        if url.contains("denied") || url.contains("down") {
            return Err(PageError::AccessDenied {
                url: url.to_string(),
                detail: "cross-origin frame".into(),
            });
        }
        Ok(LoadedDocument {
            final_url: url.to_string(),
            html: page_html("Direct", url),
        })
    }

    fn dispose(&mut self) {
        self.counters.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

struct ScriptedRetriever;

#[async_trait]
impl Retriever for ScriptedRetriever {
    async fn fetch(&self, url: &str) -> Result<String, PageError> {
        if url.contains("down") {
            return Err(PageError::FetchFailed {
                url: url.to_string(),
                detail: "HTTP 502 Bad Gateway".into(),
            });
        }
        Ok(page_html("Proxied", url))
    }
}

/// Delegates to [`LopdfComposer`] but refuses any page mentioning `poison`,
/// placeholders included.
struct PoisonComposer;

impl PageComposer for PoisonComposer {
    fn compose(&self, page: &CapturedPage, opts: &RenderOptions) -> Result<Vec<u8>, PageError> {
        if page.blocks.iter().any(|b| b.text().contains("poison")) {
            return Err(PageError::ArtifactFailed {
                detail: "font table exhausted".into(),
            });
        }
        LopdfComposer.compose(page, opts)
    }
}

#[derive(Default)]
struct Recorder {
    render: Mutex<Vec<f64>>,
    archive: Mutex<Vec<f64>>,
}

impl BatchProgressCallback for Recorder {
    fn on_render_progress(&self, percent: f64) {
        self.render.lock().unwrap().push(percent);
    }

    fn on_archive_progress(&self, percent: f64) {
        self.archive.lock().unwrap().push(percent);
    }
}

// ── Test helpers ─────────────────────────────────────────────────────────────

fn page_html(kind: &str, url: &str) -> String {
    format!("<html><head><title>{kind}</title></head><body><h1>{kind}</h1><p>{url}</p></body></html>")
}

fn builder(contexts: &Arc<ScriptedContexts>) -> webpdf_batch::BatchConfigBuilder {
    BatchConfig::builder()
        .context_provider(contexts.clone())
        .retriever(Arc::new(ScriptedRetriever))
}

fn entries(urls: &[(&str, &str)]) -> Vec<PageEntry> {
    urls.iter()
        .map(|(name, url)| PageEntry::new(*name, *url))
        .collect()
}

fn zip_entries(output: &BatchOutput) -> Vec<(String, Vec<u8>)> {
    let mut zip = ZipArchive::new(Cursor::new(output.payload.bytes.clone())).unwrap();
    (0..zip.len())
        .map(|i| {
            let mut file = zip.by_index(i).unwrap();
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes).unwrap();
            (file.name().to_string(), bytes)
        })
        .collect()
}

fn assert_loadable_pdf(bytes: &[u8], context: &str) {
    assert!(bytes.starts_with(b"%PDF-"), "[{context}] missing PDF header");
    let doc = lopdf::Document::load_mem(bytes)
        .unwrap_or_else(|e| panic!("[{context}] lopdf could not load the PDF: {e}"));
    assert!(!doc.get_pages().is_empty(), "[{context}] PDF has no pages");
}

async fn wait_until(mut ready: impl FnMut() -> bool) {
    for _ in 0..500 {
        if ready() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn three_direct_pages_make_a_three_entry_archive() {
    let contexts = ScriptedContexts::new();
    let recorder = Arc::new(Recorder::default());
    let config = builder(&contexts)
        .concurrency(4)
        .progress_callback(recorder.clone())
        .build()
        .unwrap();
    let orchestrator = PipelineOrchestrator::new(config);

    let output = orchestrator
        .submit(entries(&[
            ("january", "https://example.com/1"),
            ("february", "https://example.com/2"),
            ("march", "https://example.com/3"),
        ]))
        .await
        .unwrap();

    assert!(output.payload.is_archive());
    assert_eq!(output.payload.suggested_filename, "pdfs.zip");
    assert!(output.results.iter().all(|r| r.is_success()));
    assert_eq!(output.stats.direct_pages, 3);

    let files = zip_entries(&output);
    let names: Vec<&str> = files.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["01_january.pdf", "02_february.pdf", "03_march.pdf"]);
    for (name, bytes) in &files {
        assert_loadable_pdf(bytes, name);
    }

    let render = recorder.render.lock().unwrap().clone();
    assert_eq!(render.last(), Some(&100.0));
    assert!(render.windows(2).all(|w| w[0] < w[1]), "{render:?}");
    assert_eq!(recorder.archive.lock().unwrap().last(), Some(&100.0));
    assert_eq!(orchestrator.state(), PipelineState::Done);
    assert_eq!(orchestrator.progress().archive_percent, 100.0);
}

#[tokio::test]
async fn single_denied_page_is_proxied_and_delivered_bare() {
    let contexts = ScriptedContexts::new();
    let config = builder(&contexts).build().unwrap();

    let output = PipelineOrchestrator::new(config)
        .submit(entries(&[("statement", "https://bank.example/denied")]))
        .await
        .unwrap();

    assert!(!output.payload.is_archive());
    assert_eq!(output.payload.suggested_filename, "statement.pdf");
    assert_eq!(output.payload.content_type, "application/pdf");
    assert_eq!(output.stats.proxied_pages, 1);
    let artifact = output.results[0].artifact().unwrap();
    assert_eq!(artifact.strategy, CaptureStrategy::Proxied);
    assert_eq!(artifact.bytes, output.payload.bytes);
    assert_loadable_pdf(&output.payload.bytes, "statement");
}

#[tokio::test]
async fn single_page_can_be_forced_into_an_archive() {
    let contexts = ScriptedContexts::new();
    let config = builder(&contexts)
        .single_item_policy(SingleItemPolicy::Archive)
        .build()
        .unwrap();

    let output = PipelineOrchestrator::new(config)
        .submit(entries(&[("statement", "https://bank.example/1")]))
        .await
        .unwrap();

    assert!(output.payload.is_archive());
    assert_eq!(zip_entries(&output).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn timeouts_degrade_to_placeholders_without_failing_the_batch() {
    let contexts = ScriptedContexts::new();
    let config = builder(&contexts)
        .concurrency(2)
        .render_timeout_secs(15)
        .build()
        .unwrap();

    let output = PipelineOrchestrator::new(config)
        .submit(entries(&[
            ("a", "https://example.com/a"),
            ("b", "https://example.com/hang/b"),
            ("c", "https://example.com/c"),
            ("d", "https://example.com/hang/d"),
            ("e", "https://example.com/e"),
        ]))
        .await
        .unwrap();

    assert_eq!(zip_entries(&output).len(), 5);
    assert_eq!(output.stats.direct_pages, 3);
    assert_eq!(output.stats.placeholder_pages, 2);
    for i in [1, 3] {
        let artifact = output.results[i].artifact().unwrap();
        assert_eq!(artifact.strategy, CaptureStrategy::Placeholder);
        assert_eq!(
            artifact.fallback_reason.as_deref(),
            Some("Timeout loading webpage")
        );
    }
    assert_eq!(contexts.counters.live(), 0, "timed-out contexts leaked");
}

#[tokio::test]
async fn empty_submission_is_rejected_before_rendering() {
    let contexts = ScriptedContexts::new();
    let orchestrator = PipelineOrchestrator::new(builder(&contexts).build().unwrap());

    let err = orchestrator.submit(Vec::new()).await.unwrap_err();
    assert!(matches!(err, BatchError::NoInput));

    let err = orchestrator
        .submit(vec![PageEntry::url("   "), PageEntry::url("")])
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::NoInput));
    assert_eq!(orchestrator.state(), PipelineState::Idle);
    assert_eq!(contexts.counters.acquired.load(Ordering::SeqCst), 0);
}

// ── Ordering, naming and idempotence ─────────────────────────────────────────

#[tokio::test]
async fn duplicate_names_get_unique_entries_in_submission_order() {
    let contexts = ScriptedContexts::new();
    let config = builder(&contexts).concurrency(3).build().unwrap();

    let urls: Vec<(String, String)> = (0..12)
        .map(|i| {
            let url = if i % 3 == 0 {
                format!("https://example.com/denied/{i}")
            } else {
                format!("https://example.com/{i}")
            };
            ("payslip".to_string(), url)
        })
        .collect();
    let submitted: Vec<PageEntry> = urls
        .iter()
        .map(|(name, url)| PageEntry::new(name.clone(), url.clone()))
        .collect();

    let output = PipelineOrchestrator::new(config)
        .submit(submitted)
        .await
        .unwrap();

    let sources: Vec<&str> = output
        .results
        .iter()
        .map(|r| r.reference.source_url.as_str())
        .collect();
    let expected: Vec<&str> = urls.iter().map(|(_, u)| u.as_str()).collect();
    assert_eq!(sources, expected);

    let names: Vec<String> = zip_entries(&output).into_iter().map(|(n, _)| n).collect();
    let expected: Vec<String> = (1..=12).map(|i| format!("{i:02}_payslip.pdf")).collect();
    assert_eq!(names, expected);
    assert_eq!(output.stats.proxied_pages, 4);
    assert!(contexts.counters.peak.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn same_input_renders_identical_pdfs() {
    let batch = || {
        entries(&[
            ("one", "https://example.com/1"),
            ("two", "https://example.com/denied/2"),
            ("three", "https://example.com/down/3"),
        ])
    };
    let contexts = ScriptedContexts::new();
    let orchestrator = PipelineOrchestrator::new(builder(&contexts).build().unwrap());

    let first = orchestrator.submit(batch()).await.unwrap();
    let second = orchestrator.submit(batch()).await.unwrap();

    for (a, b) in first.results.iter().zip(&second.results) {
        assert_eq!(a.artifact().unwrap().bytes, b.artifact().unwrap().bytes);
    }
    assert_eq!(first.payload.bytes, second.payload.bytes);
}

#[tokio::test]
async fn unreachable_page_gets_a_placeholder_naming_the_fetch_error() {
    let contexts = ScriptedContexts::new();
    let output = PipelineOrchestrator::new(builder(&contexts).build().unwrap())
        .submit(entries(&[
            ("ok", "https://example.com/1"),
            ("gone", "https://example.com/down/2"),
        ]))
        .await
        .unwrap();

    let artifact = output.results[1].artifact().unwrap();
    assert_eq!(artifact.strategy, CaptureStrategy::Placeholder);
    assert_eq!(
        artifact.fallback_reason.as_deref(),
        Some("Failed to fetch content: HTTP 502 Bad Gateway")
    );
    assert_loadable_pdf(&artifact.bytes, "placeholder");
}

// ── Fault injection ──────────────────────────────────────────────────────────

#[tokio::test]
async fn artifact_failure_is_isolated_to_its_page() {
    let contexts = ScriptedContexts::new();
    let config = builder(&contexts)
        .composer(Arc::new(PoisonComposer))
        .build()
        .unwrap();

    let output = PipelineOrchestrator::new(config)
        .submit(entries(&[
            ("a", "https://example.com/1"),
            ("b", "https://example.com/poison"),
            ("c", "https://example.com/3"),
        ]))
        .await
        .unwrap();

    assert!(matches!(
        output.results[1].outcome,
        RenderOutcome::Failure {
            reason: PageError::ArtifactFailed { .. }
        }
    ));
    assert_eq!(output.stats.failed_pages, 1);
    let names: Vec<String> = zip_entries(&output).into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, ["01_a.pdf", "03_c.pdf"]);
}

#[tokio::test]
async fn batch_with_no_artifacts_is_an_empty_batch() {
    let contexts = ScriptedContexts::new();
    let config = builder(&contexts)
        .composer(Arc::new(PoisonComposer))
        .build()
        .unwrap();
    let orchestrator = PipelineOrchestrator::new(config);

    let err = orchestrator
        .submit(entries(&[
            ("a", "https://example.com/poison/1"),
            ("b", "https://example.com/poison/2"),
        ]))
        .await
        .unwrap_err();

    assert!(matches!(err, BatchError::EmptyBatch { total: 2 }));
    assert_eq!(orchestrator.state(), PipelineState::Failed);
}

// ── Run control ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn second_submit_is_busy_while_a_run_is_in_flight() {
    let contexts = ScriptedContexts::new();
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        builder(&contexts).concurrency(2).build().unwrap(),
    ));

    let run = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            orchestrator
                .submit(entries(&[("slow", "https://example.com/gate/1")]))
                .await
        }
    });
    wait_until(|| contexts.counters.acquired.load(Ordering::SeqCst) == 1).await;

    assert_eq!(orchestrator.state(), PipelineState::Rendering);
    let err = orchestrator
        .submit(entries(&[("other", "https://example.com/2")]))
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::Busy { .. }));

    contexts.open_gate();
    let output = run.await.unwrap().unwrap();
    assert_eq!(output.payload.suggested_filename, "slow.pdf");
    assert_eq!(orchestrator.state(), PipelineState::Done);
}

#[tokio::test]
async fn cancel_stops_new_pages_and_releases_contexts() {
    let contexts = ScriptedContexts::new();
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        builder(&contexts).concurrency(2).build().unwrap(),
    ));
    let cancel = orchestrator.cancel_handle();

    let run = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            let batch: Vec<PageEntry> = (1..=5)
                .map(|i| PageEntry::new(format!("p{i}"), format!("https://example.com/gate/{i}")))
                .collect();
            orchestrator.submit(batch).await
        }
    });
    wait_until(|| contexts.counters.acquired.load(Ordering::SeqCst) == 2).await;

    cancel.cancel();
    contexts.open_gate();
    let err = run.await.unwrap().unwrap_err();

    match err {
        BatchError::Cancelled { settled, total } => {
            assert_eq!(total, 5);
            assert!(settled < total, "settled {settled}");
        }
        other => panic!("expected Cancelled, got {other:?}"),
    }
    // Unsettled pages keep the render figure short of complete.
    assert!(orchestrator.progress().render_percent < 100.0);
    assert_eq!(contexts.counters.acquired.load(Ordering::SeqCst), 2);
    assert_eq!(contexts.counters.live(), 0);
    assert_eq!(orchestrator.state(), PipelineState::Failed);
    assert_eq!(orchestrator.progress().archive_percent, 0.0);

    // The orchestrator accepts a new run after a cancelled one.
    let output = orchestrator
        .submit(entries(&[("again", "https://example.com/1")]))
        .await
        .unwrap();
    assert_eq!(output.stats.direct_pages, 1);
}

#[tokio::test]
async fn dropped_submit_releases_contexts_before_leaving_rendering() {
    let contexts = ScriptedContexts::new();
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        builder(&contexts).concurrency(2).build().unwrap(),
    ));

    let run = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            let batch: Vec<PageEntry> = (1..=3)
                .map(|i| PageEntry::new(format!("g{i}"), format!("https://example.com/gate/{i}")))
                .collect();
            orchestrator.submit(batch).await
        }
    });
    wait_until(|| contexts.counters.acquired.load(Ordering::SeqCst) == 2).await;

    run.abort();
    assert!(run.await.unwrap_err().is_cancelled());

    // The run may only look settled once no context is alive.
    wait_until(|| {
        let state = orchestrator.state();
        let live = contexts.counters.live();
        assert!(
            state.is_active() || live == 0,
            "state {state} with {live} live contexts"
        );
        !state.is_active()
    })
    .await;
    assert_eq!(orchestrator.state(), PipelineState::Failed);
    assert_eq!(contexts.counters.live(), 0);
    assert_eq!(contexts.counters.acquired.load(Ordering::SeqCst), 2);

    let output = orchestrator
        .submit(entries(&[("again", "https://example.com/1")]))
        .await
        .unwrap();
    assert_eq!(output.stats.direct_pages, 1);
}

#[tokio::test]
async fn render_batch_to_file_writes_the_suggested_name() {
    let contexts = ScriptedContexts::new();
    let config = builder(&contexts).label("salary").build().unwrap();
    let dir = tempfile::tempdir().unwrap();

    let (path, stats) = webpdf_batch::render_batch_to_file(
        entries(&[
            ("a", "https://example.com/1"),
            ("b", "https://example.com/2"),
        ]),
        dir.path(),
        &config,
    )
    .await
    .unwrap();

    assert_eq!(path, dir.path().join("salary.zip"));
    assert_eq!(stats.total_pages, 2);
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(ZipArchive::new(Cursor::new(bytes)).unwrap().len(), 2);
}

// ── Live network ─────────────────────────────────────────────────────────────

/// Skip this test unless E2E_ENABLED is set.
macro_rules! e2e_skip_unless_enabled {
    () => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP — set E2E_ENABLED=1 to run live tests");
            return;
        }
    }};
}

#[tokio::test]
async fn live_batch_against_public_pages() {
    e2e_skip_unless_enabled!();

    let config = BatchConfig::builder()
        .concurrency(2)
        .label("live")
        .build()
        .unwrap();
    let output = webpdf_batch::render_batch(
        entries(&[
            ("example", "https://example.com/"),
            ("rfc", "https://www.rfc-editor.org/rfc/rfc1951.html"),
        ]),
        &config,
    )
    .await
    .unwrap();

    println!("stats: {:?}", output.stats);
    for (name, bytes) in zip_entries(&output) {
        assert_loadable_pdf(&bytes, &name);
    }
    assert_eq!(output.stats.total_pages, 2);
    assert_eq!(output.stats.failed_pages, 0);
}

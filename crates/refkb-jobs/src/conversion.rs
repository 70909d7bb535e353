//! Full-text conversion runs.
//!
//! Every attachment is classified (excluded, over the page limit, cached, or
//! admitted) before any side effect. Admitted items run through the
//! [`ConversionEngine`] in a private work directory and are promoted into
//! `out_dir` only once the engine has succeeded.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use regex::{Captures, Regex};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use refkb_core::defaults::{
    CONVERT_MAX_CONCURRENT, FORCE_REBUILD, IMAGES_DIR_NAME, PAGES_MAX, WORK_DIR_PREFIX,
};
use refkb_core::{
    fulltext_file_name, is_convertible_content_type, parse_fulltext_file_name, sanitize_filename,
    ConversionEngine, ConversionOutcome, ConversionResult, EngineOutput, Error, ItemId,
    MetadataRecord, PageCounter, Result, RunSummary,
};
use refkb_db::write_atomic;

/// Configuration for conversion runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionConfig {
    /// Page ceiling. `None` disables the page check entirely.
    pub pages_max: Option<u32>,
    /// Reconvert even when a document already exists.
    pub force_rebuild: bool,
    /// Number of items converted at once; 1 is sequential.
    pub max_concurrent: usize,
    /// Per-item bound on the engine call.
    pub engine_timeout: Option<Duration>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            pages_max: Some(PAGES_MAX),
            force_rebuild: FORCE_REBUILD,
            max_concurrent: CONVERT_MAX_CONCURRENT,
            engine_timeout: None,
        }
    }
}

impl ConversionConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `PDF_PAGES_MAX` | `100` | Page ceiling; `0` or `none` disables it |
    /// | `PDF_FORCE_REBUILD` | `false` | Reconvert cached documents |
    /// | `CONVERT_MAX_CONCURRENT` | `1` | Parallel conversions |
    /// | `CONVERT_ENGINE_TIMEOUT_SECS` | unset | Per-item engine timeout |
    pub fn from_env() -> Self {
        let pages_max = match std::env::var("PDF_PAGES_MAX") {
            Ok(v) if v.trim() == "0" || v.trim().eq_ignore_ascii_case("none") => None,
            Ok(v) => Some(v.trim().parse::<u32>().unwrap_or(PAGES_MAX)),
            Err(_) => Some(PAGES_MAX),
        };

        let force_rebuild = std::env::var("PDF_FORCE_REBUILD")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(FORCE_REBUILD);

        let max_concurrent = std::env::var("CONVERT_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(CONVERT_MAX_CONCURRENT)
            .max(1);

        let engine_timeout = std::env::var("CONVERT_ENGINE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Self {
            pages_max,
            force_rebuild,
            max_concurrent,
            engine_timeout,
        }
    }

    pub fn with_pages_max(mut self, pages_max: Option<u32>) -> Self {
        self.pages_max = pages_max;
        self
    }

    pub fn with_force_rebuild(mut self, force_rebuild: bool) -> Self {
        self.force_rebuild = force_rebuild;
        self
    }

    /// Set the number of parallel conversions (at least 1).
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_engine_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.engine_timeout = timeout;
        self
    }
}

/// One attachment to convert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionItem {
    pub attachment_id: ItemId,
    pub source_path: Option<PathBuf>,
    pub content_type: Option<String>,
    /// Paper title, used for the document's file name.
    pub title: String,
}

impl ConversionItem {
    /// Build an item from a metadata record; `None` for papers without attachments.
    pub fn from_record(record: &MetadataRecord) -> Option<Self> {
        Some(Self {
            attachment_id: record.attachment_id?,
            source_path: record
                .attachment_fullpath
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            content_type: record.content_type.clone(),
            title: record.paper_title.clone(),
        })
    }

    pub fn is_convertible(&self) -> bool {
        is_convertible_content_type(self.content_type.as_deref())
    }
}

/// Conversion items for every attachment in `records`, in record order.
pub fn items_from_records(records: &[MetadataRecord]) -> Vec<ConversionItem> {
    records.iter().filter_map(ConversionItem::from_record).collect()
}

/// Result of the page-count pre-check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCheck {
    /// No page limit configured, or the item never reaches the check.
    NotChecked,
    Pages(u32),
    /// The page count could not be read (corrupt or unreadable source).
    Unreadable(String),
}

/// Admission decision for one item, made before anything is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Exclude,
    Fail(String),
    PageLimit { pages: u32, max: u32 },
    Cached(PathBuf),
    Convert,
}

/// Classify an item.
///
/// Precedence: content type, cache, source presence, page limit. An existing
/// document is reused without consulting the source unless `force_rebuild`
/// is set.
pub fn classify(
    item: &ConversionItem,
    page_check: &PageCheck,
    cached: Option<&Path>,
    config: &ConversionConfig,
) -> Admission {
    if !item.is_convertible() {
        return Admission::Exclude;
    }
    if let Some(path) = cached.filter(|_| !config.force_rebuild) {
        return Admission::Cached(path.to_path_buf());
    }
    if item.source_path.is_none() {
        return Admission::Fail("attachment has no resolvable file path".to_string());
    }
    if let Some(max) = config.pages_max {
        match page_check {
            PageCheck::Pages(pages) if *pages > max => {
                return Admission::PageLimit { pages: *pages, max };
            }
            PageCheck::Unreadable(detail) => {
                return Admission::Fail(format!("page count unreadable: {}", detail));
            }
            _ => {}
        }
    }
    Admission::Convert
}

/// Outcome of a conversion run.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionReport {
    pub results: BTreeMap<ItemId, ConversionResult>,
    pub summary: RunSummary,
}

impl ConversionReport {
    pub fn result(&self, attachment_id: ItemId) -> Option<&ConversionResult> {
        self.results.get(&attachment_id)
    }
}

/// Availability of the external tools behind a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ToolHealth {
    pub engine: bool,
    pub page_counter: bool,
}

/// Drives conversion runs over a batch of attachments.
pub struct ConversionOrchestrator {
    engine: Arc<dyn ConversionEngine>,
    page_counter: Arc<dyn PageCounter>,
    config: ConversionConfig,
}

impl ConversionOrchestrator {
    pub fn new(
        engine: Arc<dyn ConversionEngine>,
        page_counter: Arc<dyn PageCounter>,
        config: ConversionConfig,
    ) -> Self {
        Self {
            engine,
            page_counter,
            config,
        }
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    /// Check that the engine and page counter can run.
    pub async fn health_check(&self) -> ToolHealth {
        let engine = self.engine.health_check().await.unwrap_or(false);
        let page_counter = self.page_counter.health_check().await.unwrap_or(false);
        info!(
            subsystem = "convert",
            engine = self.engine.name(),
            engine_available = engine,
            page_counter_available = page_counter,
            "Tool health check"
        );
        ToolHealth {
            engine,
            page_counter,
        }
    }

    /// Convert a batch of attachments into `out_dir`.
    ///
    /// Items run in the order given. Per-item failures are recorded and the
    /// run continues. When `shutdown` flips to `true`, in-flight items finish
    /// and everything not yet started is reported as not processed.
    ///
    /// Only errors preparing `out_dir` abort the run.
    pub async fn convert_all(
        &self,
        items: Vec<ConversionItem>,
        out_dir: &Path,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> Result<ConversionReport> {
        let started_at = Utc::now();
        let start = Instant::now();

        prepare_out_dir(out_dir)?;
        let items = dedup_items(items);
        let total = items.len();
        let worker = Worker {
            engine: self.engine.clone(),
            page_counter: self.page_counter.clone(),
            config: self.config.clone(),
            out_dir: out_dir.to_path_buf(),
            cache: Arc::new(scan_cache(out_dir)?),
        };

        info!(
            subsystem = "convert",
            op = "convert_all",
            total,
            out_dir = %out_dir.display(),
            pages_max = ?self.config.pages_max,
            force_rebuild = self.config.force_rebuild,
            max_concurrent = self.config.max_concurrent,
            engine = self.engine.name(),
            "Starting conversion run"
        );

        let results = if self.config.max_concurrent <= 1 {
            run_sequential(&worker, items, shutdown.as_ref()).await
        } else {
            run_pool(&worker, items, shutdown.as_ref(), self.config.max_concurrent).await
        };

        let mut summary = RunSummary::new(started_at);
        for result in results.values() {
            summary.record(result);
        }
        summary.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            subsystem = "convert",
            op = "convert_all",
            total = summary.total,
            converted = summary.converted,
            skipped_cached = summary.skipped_cached,
            skipped_page_limit = summary.skipped_page_limit,
            excluded = summary.excluded,
            failed = summary.failed,
            not_processed = summary.not_processed,
            duration_ms = summary.duration_ms,
            "Conversion run complete"
        );

        Ok(ConversionReport { results, summary })
    }

    /// Convert one attachment into `out_dir`.
    pub async fn convert_single(
        &self,
        item: ConversionItem,
        out_dir: &Path,
    ) -> Result<ConversionResult> {
        prepare_out_dir(out_dir)?;
        let worker = Worker {
            engine: self.engine.clone(),
            page_counter: self.page_counter.clone(),
            config: self.config.clone(),
            out_dir: out_dir.to_path_buf(),
            cache: Arc::new(scan_cache(out_dir)?),
        };
        Ok(worker.process(1, 1, item).await)
    }
}

fn is_cancelled(shutdown: Option<&watch::Receiver<bool>>) -> bool {
    shutdown.map(|rx| *rx.borrow()).unwrap_or(false)
}

fn not_processed(attachment_id: ItemId) -> ConversionResult {
    ConversionResult::new(attachment_id, ConversionOutcome::NotProcessed)
        .with_detail("run cancelled before the item started")
}

async fn run_sequential(
    worker: &Worker,
    items: Vec<ConversionItem>,
    shutdown: Option<&watch::Receiver<bool>>,
) -> BTreeMap<ItemId, ConversionResult> {
    let total = items.len();
    let mut results = BTreeMap::new();
    for (index, item) in items.into_iter().enumerate() {
        let id = item.attachment_id;
        let result = if is_cancelled(shutdown) {
            not_processed(id)
        } else {
            worker.process(index + 1, total, item).await
        };
        results.insert(id, result);
    }
    results
}

async fn run_pool(
    worker: &Worker,
    items: Vec<ConversionItem>,
    shutdown: Option<&watch::Receiver<bool>>,
    max_concurrent: usize,
) -> BTreeMap<ItemId, ConversionResult> {
    let total = items.len();
    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    let mut tasks = JoinSet::new();
    let mut dispatched = Vec::new();
    let mut results = BTreeMap::new();

    for (index, item) in items.into_iter().enumerate() {
        let id = item.attachment_id;
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                results.insert(id, not_processed(id));
                continue;
            }
        };
        if is_cancelled(shutdown) {
            results.insert(id, not_processed(id));
            continue;
        }

        dispatched.push(id);
        let worker = worker.clone();
        tasks.spawn(async move {
            let _permit = permit;
            worker.process(index + 1, total, item).await
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => {
                results.insert(result.attachment_id, result);
            }
            Err(e) => error!(subsystem = "convert", error = %e, "Conversion task panicked"),
        }
    }

    for id in dispatched {
        results
            .entry(id)
            .or_insert_with(|| ConversionResult::failed(id, "conversion task panicked"));
    }
    results
}

/// Keep the first occurrence of every attachment id.
fn dedup_items(items: Vec<ConversionItem>) -> Vec<ConversionItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| {
            let first = seen.insert(item.attachment_id);
            if !first {
                warn!(
                    subsystem = "convert",
                    attachment_id = item.attachment_id,
                    "Duplicate attachment in batch, keeping the first"
                );
            }
            first
        })
        .collect()
}

/// Create `out_dir` and its image directory and clear work directories left
/// behind by an interrupted run.
fn prepare_out_dir(out_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(out_dir.join(IMAGES_DIR_NAME))?;
    for entry in std::fs::read_dir(out_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if entry.path().is_dir() && name.to_string_lossy().starts_with(WORK_DIR_PREFIX) {
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => debug!(
                    subsystem = "convert",
                    path = %entry.path().display(),
                    "Removed leftover work directory"
                ),
                Err(e) => warn!(
                    subsystem = "convert",
                    path = %entry.path().display(),
                    error = %e,
                    "Failed to remove leftover work directory"
                ),
            }
        }
    }
    Ok(())
}

/// Existing documents in `out_dir`, keyed by attachment id.
fn scan_cache(out_dir: &Path) -> Result<HashMap<ItemId, Vec<PathBuf>>> {
    let mut cache: HashMap<ItemId, Vec<PathBuf>> = HashMap::new();
    for entry in std::fs::read_dir(out_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(id) = parse_fulltext_file_name(&entry.file_name().to_string_lossy()) else {
            continue;
        };
        cache.entry(id).or_default().push(path);
    }
    for paths in cache.values_mut() {
        paths.sort();
    }
    debug!(
        subsystem = "convert",
        cached = cache.len(),
        out_dir = %out_dir.display(),
        "Scanned existing documents"
    );
    Ok(cache)
}

/// Per-item processing state shared by all tasks of a run.
#[derive(Clone)]
struct Worker {
    engine: Arc<dyn ConversionEngine>,
    page_counter: Arc<dyn PageCounter>,
    config: ConversionConfig,
    out_dir: PathBuf,
    cache: Arc<HashMap<ItemId, Vec<PathBuf>>>,
}

impl Worker {
    async fn process(&self, index: usize, total: usize, item: ConversionItem) -> ConversionResult {
        let start = Instant::now();
        let id = item.attachment_id;
        let final_path = self.out_dir.join(fulltext_file_name(id, &item.title));
        let cached: &[PathBuf] = self.cache.get(&id).map(Vec::as_slice).unwrap_or(&[]);
        let preferred = cached
            .iter()
            .find(|p| **p == final_path)
            .or_else(|| cached.first());

        let page_check = if preferred.is_some() && !self.config.force_rebuild {
            PageCheck::NotChecked
        } else {
            self.page_check(&item).await
        };
        let admission = classify(
            &item,
            &page_check,
            preferred.map(PathBuf::as_path),
            &self.config,
        );
        debug!(
            subsystem = "convert",
            attachment_id = id,
            page_check = ?page_check,
            admission = ?admission,
            "Admission decision"
        );

        let pages = match page_check {
            PageCheck::Pages(pages) => Some(pages),
            _ => None,
        };

        let result = match admission {
            Admission::Exclude => ConversionResult::new(id, ConversionOutcome::Excluded)
                .with_detail(format!(
                    "content type {} is not convertible",
                    item.content_type.as_deref().unwrap_or("(none)")
                )),
            Admission::Fail(detail) => ConversionResult::failed(id, detail).with_page_count(pages),
            Admission::PageLimit { pages, max } => {
                ConversionResult::new(id, ConversionOutcome::SkippedPageLimit)
                    .with_page_count(Some(pages))
                    .with_detail(format!("{} pages exceeds the limit of {}", pages, max))
            }
            Admission::Cached(path) => ConversionResult::new(id, ConversionOutcome::SkippedCached)
                .with_output_path(path)
                .with_page_count(pages),
            Admission::Convert => match self.run_engine(&item, &final_path).await {
                Ok(()) => {
                    remove_stale(id, cached, &final_path);
                    ConversionResult::new(id, ConversionOutcome::Converted)
                        .with_output_path(final_path)
                        .with_page_count(pages)
                }
                Err(e) => ConversionResult::failed(id, e.to_string()).with_page_count(pages),
            },
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match result.outcome {
            ConversionOutcome::Failed => warn!(
                subsystem = "convert",
                attachment_id = id,
                index,
                total,
                outcome = %result.outcome,
                error = result.detail.as_deref().unwrap_or(""),
                duration_ms,
                "Conversion failed"
            ),
            _ => info!(
                subsystem = "convert",
                attachment_id = id,
                index,
                total,
                outcome = %result.outcome,
                duration_ms,
                "Attachment processed"
            ),
        }
        result
    }

    async fn page_check(&self, item: &ConversionItem) -> PageCheck {
        if self.config.pages_max.is_none() || !item.is_convertible() {
            return PageCheck::NotChecked;
        }
        let Some(source) = item.source_path.as_deref() else {
            return PageCheck::NotChecked;
        };
        match self.page_counter.page_count(source).await {
            Ok(pages) => PageCheck::Pages(pages),
            Err(e) => PageCheck::Unreadable(e.to_string()),
        }
    }

    /// Run the engine in a private work directory and promote its output.
    async fn run_engine(&self, item: &ConversionItem, final_path: &Path) -> Result<()> {
        let source = item
            .source_path
            .as_deref()
            .ok_or_else(|| Error::Conversion("attachment has no file path".to_string()))?;

        let work_dir = tempfile::Builder::new()
            .prefix(&format!("{}{}_", WORK_DIR_PREFIX, item.attachment_id))
            .tempdir_in(&self.out_dir)?;

        let convert = self
            .engine
            .convert(source, self.config.pages_max, work_dir.path());
        let output = match self.config.engine_timeout {
            Some(timeout) => tokio::time::timeout(timeout, convert).await.map_err(|_| {
                Error::Conversion(format!(
                    "conversion engine timed out after {}s",
                    timeout.as_secs()
                ))
            })??,
            None => convert.await?,
        };

        promote(&output, item.attachment_id, final_path, &self.out_dir)
    }
}

/// Write engine output into `out_dir`: images under `images/` with an
/// `<attachment_id>_` prefix, then the markdown with rewritten references.
fn promote(
    output: &EngineOutput,
    attachment_id: ItemId,
    final_path: &Path,
    out_dir: &Path,
) -> Result<()> {
    if output.markdown.trim().is_empty() {
        return Err(Error::Conversion(
            "conversion engine produced an empty document".to_string(),
        ));
    }

    let images_dir = out_dir.join(IMAGES_DIR_NAME);
    let mut renames = HashMap::new();
    for image in &output.images {
        let name = format!("{}_{}", attachment_id, sanitize_filename(&image.file_name));
        write_atomic(&images_dir.join(&name), &image.data)?;
        renames.insert(image.file_name.clone(), name);
    }

    let markdown = rewrite_image_refs(&output.markdown, &renames)?;
    write_atomic(final_path, markdown.as_bytes())?;
    debug!(
        subsystem = "convert",
        attachment_id,
        path = %final_path.display(),
        image_count = renames.len(),
        "Promoted document"
    );
    Ok(())
}

/// Rewrite `images/<name>` references to the prefixed names in `renames`.
/// References to images that were not extracted are left alone.
pub fn rewrite_image_refs(markdown: &str, renames: &HashMap<String, String>) -> Result<String> {
    if renames.is_empty() {
        return Ok(markdown.to_string());
    }
    // The directory name must start a path segment: `thumbimages/` is not ours.
    let pattern = format!(
        r#"(^|[\s("'/=\[]){}/([^\s)\]"'<>]+)"#,
        regex::escape(IMAGES_DIR_NAME)
    );
    let re = Regex::new(&pattern).map_err(|e| Error::Internal(e.to_string()))?;
    let rewritten = re.replace_all(markdown, |caps: &Captures| match renames.get(&caps[2]) {
        Some(name) => format!("{}{}/{}", &caps[1], IMAGES_DIR_NAME, name),
        None => caps[0].to_string(),
    });
    Ok(rewritten.into_owned())
}

/// Remove documents for `attachment_id` written under an older title.
fn remove_stale(attachment_id: ItemId, cached: &[PathBuf], final_path: &Path) {
    for path in cached.iter().filter(|p| p.as_path() != final_path) {
        match std::fs::remove_file(path) {
            Ok(()) => info!(
                subsystem = "convert",
                attachment_id,
                path = %path.display(),
                "Removed stale document"
            ),
            Err(e) => warn!(
                subsystem = "convert",
                attachment_id,
                path = %path.display(),
                error = %e,
                "Failed to remove stale document"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use refkb_core::ExtractedImage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Reads the page count from the file's content; anything else is corrupt.
    struct StubCounter;

    #[async_trait]
    impl PageCounter for StubCounter {
        async fn page_count(&self, source: &Path) -> Result<u32> {
            let content = std::fs::read_to_string(source)?;
            content
                .trim()
                .parse::<u32>()
                .map_err(|_| Error::Conversion(format!("{} is corrupt", source.display())))
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    #[derive(Default)]
    struct StubEngine {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Option<Duration>,
        budgets: Mutex<Vec<Option<u32>>>,
        cancel_after_first: Option<watch::Sender<bool>>,
    }

    impl StubEngine {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConversionEngine for StubEngine {
        async fn convert(
            &self,
            source: &Path,
            page_budget: Option<u32>,
            work_dir: &Path,
        ) -> Result<EngineOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.budgets.lock().unwrap().push(page_budget);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if let Some(tx) = &self.cancel_after_first {
                let _ = tx.send(true);
            }

            assert!(work_dir.is_dir());
            let stem = source.file_stem().unwrap().to_string_lossy().into_owned();
            if stem.contains("broken") {
                return Err(Error::Conversion("engine crashed".to_string()));
            }
            Ok(EngineOutput {
                markdown: format!(
                    "# {}\n\n![](images/fig1.jpg)\n\n![](images/missing.png)\n",
                    stem
                ),
                images: vec![ExtractedImage {
                    file_name: "fig1.jpg".to_string(),
                    data: b"jpeg".to_vec(),
                }],
            })
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        fn name(&self) -> &str {
            "stub"
        }
    }

    struct Fixture {
        dir: TempDir,
        engine: Arc<StubEngine>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_engine(StubEngine::default())
        }

        fn with_engine(engine: StubEngine) -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                engine: Arc::new(engine),
            }
        }

        fn out_dir(&self) -> PathBuf {
            self.dir.path().join("fulltexts")
        }

        /// A PDF whose content is its page count.
        fn pdf(&self, id: ItemId, name: &str, pages: &str, title: &str) -> ConversionItem {
            let path = self.dir.path().join(format!("{}.pdf", name));
            std::fs::write(&path, pages).unwrap();
            ConversionItem {
                attachment_id: id,
                source_path: Some(path),
                content_type: Some("application/pdf".to_string()),
                title: title.to_string(),
            }
        }

        fn orchestrator(&self, config: ConversionConfig) -> ConversionOrchestrator {
            ConversionOrchestrator::new(self.engine.clone(), Arc::new(StubCounter), config)
        }

        fn documents(&self, id: ItemId) -> Vec<PathBuf> {
            let mut docs: Vec<PathBuf> = std::fs::read_dir(self.out_dir())
                .unwrap()
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| {
                    parse_fulltext_file_name(&p.file_name().unwrap().to_string_lossy())
                        == Some(id)
                })
                .collect();
            docs.sort();
            docs
        }
    }

    fn item(id: ItemId, content_type: Option<&str>, source: Option<&str>) -> ConversionItem {
        ConversionItem {
            attachment_id: id,
            source_path: source.map(PathBuf::from),
            content_type: content_type.map(String::from),
            title: "A paper".to_string(),
        }
    }

    #[test]
    fn test_classify_precedence() {
        let config = ConversionConfig::default();
        let pdf = Some("application/pdf");
        let cached = Path::new("/out/1_a_paper.md");

        assert_eq!(
            classify(&item(1, Some("text/html"), Some("/a")), &PageCheck::Pages(500), Some(cached), &config),
            Admission::Exclude
        );
        assert_eq!(
            classify(&item(1, None, Some("/a")), &PageCheck::NotChecked, None, &config),
            Admission::Exclude
        );
        assert!(matches!(
            classify(&item(1, pdf, None), &PageCheck::NotChecked, None, &config),
            Admission::Fail(_)
        ));
        assert_eq!(
            classify(&item(1, pdf, None), &PageCheck::NotChecked, Some(cached), &config),
            Admission::Cached(cached.to_path_buf())
        );
        assert_eq!(
            classify(&item(1, pdf, Some("/a")), &PageCheck::Pages(150), Some(cached), &config),
            Admission::Cached(cached.to_path_buf())
        );
        assert_eq!(
            classify(&item(1, pdf, Some("/a")), &PageCheck::Pages(150), None, &config),
            Admission::PageLimit { pages: 150, max: 100 }
        );
        assert!(matches!(
            classify(&item(1, pdf, Some("/a")), &PageCheck::Unreadable("bad".into()), None, &config),
            Admission::Fail(_)
        ));
        assert_eq!(
            classify(&item(1, pdf, Some("/a")), &PageCheck::Pages(100), Some(cached), &config),
            Admission::Cached(cached.to_path_buf())
        );
        assert_eq!(
            classify(&item(1, pdf, Some("/a")), &PageCheck::Pages(10), None, &config),
            Admission::Convert
        );
    }

    #[test]
    fn test_classify_force_rebuild_and_no_limit() {
        let pdf = Some("application/pdf");
        let cached = Path::new("/out/1_a_paper.md");
        let forced = ConversionConfig::default().with_force_rebuild(true);
        assert_eq!(
            classify(&item(1, pdf, Some("/a")), &PageCheck::Pages(10), Some(cached), &forced),
            Admission::Convert
        );
        assert_eq!(
            classify(&item(1, pdf, Some("/a")), &PageCheck::Pages(150), Some(cached), &forced),
            Admission::PageLimit { pages: 150, max: 100 }
        );
        assert!(matches!(
            classify(&item(1, pdf, None), &PageCheck::NotChecked, Some(cached), &forced),
            Admission::Fail(_)
        ));

        let unlimited = ConversionConfig::default().with_pages_max(None);
        assert_eq!(
            classify(&item(1, pdf, Some("/a")), &PageCheck::Pages(5000), None, &unlimited),
            Admission::Convert
        );
    }

    #[test]
    fn test_rewrite_image_refs() {
        let renames = HashMap::from([("fig1.jpg".to_string(), "95_fig1.jpg".to_string())]);
        let md = "![](images/fig1.jpg) and <img src=\"images/fig1.jpg\"> and ![](images/other.png)";
        assert_eq!(
            rewrite_image_refs(md, &renames).unwrap(),
            "![](images/95_fig1.jpg) and <img src=\"images/95_fig1.jpg\"> and ![](images/other.png)"
        );
    }

    #[test]
    fn test_rewrite_image_refs_requires_segment_start() {
        let renames = HashMap::from([("fig1.jpg".to_string(), "95_fig1.jpg".to_string())]);
        let md = "images/fig1.jpg\n![](./images/fig1.jpg) [x](images/fig1.jpg) ![](thumbimages/fig1.jpg)";
        assert_eq!(
            rewrite_image_refs(md, &renames).unwrap(),
            "images/95_fig1.jpg\n![](./images/95_fig1.jpg) [x](images/95_fig1.jpg) ![](thumbimages/fig1.jpg)"
        );
    }

    #[test]
    fn test_items_from_records_skip_bare_papers() {
        let record = |attachment_id: Option<ItemId>, fullpath: Option<&str>| MetadataRecord {
            paper_id: 1,
            paper_key: "K".into(),
            paper_title: "Soil carbon".into(),
            authors: String::new(),
            collection_names: String::new(),
            paper_date_added: String::new(),
            paper_date_modified: String::new(),
            attachment_id,
            attachment_key: None,
            attachment_path: None,
            attachment_fullpath: fullpath.map(String::from),
            content_type: Some("application/pdf".into()),
            link_mode: None,
            attachment_date_added: None,
        };
        let items = items_from_records(&[
            record(None, None),
            record(Some(7), Some("/a.pdf")),
            record(Some(8), Some("")),
        ]);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].attachment_id, 7);
        assert_eq!(items[0].source_path, Some(PathBuf::from("/a.pdf")));
        assert_eq!(items[0].title, "Soil carbon");
        assert_eq!(items[1].source_path, None);
    }

    #[tokio::test]
    async fn test_over_page_limit_is_skipped_without_output() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(ConversionConfig::default());
        let items = vec![fx.pdf(94, "long", "150", "Long review")];

        let report = orchestrator.convert_all(items, &fx.out_dir(), None).await.unwrap();

        let result = report.result(94).unwrap();
        assert_eq!(result.outcome, ConversionOutcome::SkippedPageLimit);
        assert_eq!(result.page_count, Some(150));
        assert!(fx.documents(94).is_empty());
        assert_eq!(fx.engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_over_page_limit_leaves_existing_document_untouched() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.out_dir()).unwrap();
        let existing = fx.out_dir().join(fulltext_file_name(94, "Long review"));
        std::fs::write(&existing, "earlier conversion").unwrap();

        let orchestrator = fx.orchestrator(ConversionConfig::default().with_force_rebuild(true));
        let items = vec![fx.pdf(94, "long", "150", "Long review")];
        let report = orchestrator.convert_all(items, &fx.out_dir(), None).await.unwrap();

        let result = report.result(94).unwrap();
        assert_eq!(result.outcome, ConversionOutcome::SkippedPageLimit);
        assert_eq!(result.page_count, Some(150));
        assert_eq!(fx.documents(94), vec![existing.clone()]);
        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "earlier conversion");
        assert_eq!(fx.engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_cached_document_with_missing_source_is_skipped() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.out_dir()).unwrap();
        let existing = fx.out_dir().join(fulltext_file_name(95, "Soil"));
        std::fs::write(&existing, "converted last week").unwrap();

        let item = fx.pdf(95, "moved", "10", "Soil");
        std::fs::remove_file(item.source_path.as_deref().unwrap()).unwrap();

        let orchestrator = fx.orchestrator(ConversionConfig::default());
        let report = orchestrator.convert_all(vec![item], &fx.out_dir(), None).await.unwrap();

        let result = report.result(95).unwrap();
        assert_eq!(result.outcome, ConversionOutcome::SkippedCached);
        assert_eq!(result.output_path.as_deref(), Some(existing.as_path()));
        assert_eq!(report.summary.failed, 0);
        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "converted last week");
        assert_eq!(fx.engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_admitted_item_is_converted_with_images() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(ConversionConfig::default());
        let items = vec![fx.pdf(95, "short", "10", "Soil Carbon Dynamics")];

        let report = orchestrator.convert_all(items, &fx.out_dir(), None).await.unwrap();

        let result = report.result(95).unwrap();
        assert_eq!(result.outcome, ConversionOutcome::Converted);
        let expected = fx.out_dir().join(fulltext_file_name(95, "Soil Carbon Dynamics"));
        assert_eq!(result.output_path.as_deref(), Some(expected.as_path()));
        assert_eq!(fx.documents(95), vec![expected.clone()]);

        let markdown = std::fs::read_to_string(&expected).unwrap();
        assert!(markdown.contains("![](images/95_fig1.jpg)"));
        assert!(markdown.contains("![](images/missing.png)"));
        assert_eq!(
            std::fs::read(fx.out_dir().join("images/95_fig1.jpg")).unwrap(),
            b"jpeg"
        );
        assert_eq!(*fx.engine.budgets.lock().unwrap(), vec![Some(100)]);

        // Work directories never survive a run.
        let leftovers = std::fs::read_dir(fx.out_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(WORK_DIR_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_cached_document_is_left_unchanged() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.out_dir()).unwrap();
        let existing = fx.out_dir().join(fulltext_file_name(95, "Soil Carbon"));
        std::fs::write(&existing, "hand edited").unwrap();

        let orchestrator = fx.orchestrator(ConversionConfig::default());
        let report = orchestrator
            .convert_all(vec![fx.pdf(95, "short", "10", "Soil Carbon")], &fx.out_dir(), None)
            .await
            .unwrap();

        assert_eq!(report.result(95).unwrap().outcome, ConversionOutcome::SkippedCached);
        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "hand edited");
        assert_eq!(fx.engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_force_rebuild_overwrites_cached_document() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.out_dir()).unwrap();
        let existing = fx.out_dir().join(fulltext_file_name(95, "Soil Carbon"));
        std::fs::write(&existing, "stale").unwrap();

        let orchestrator = fx.orchestrator(ConversionConfig::default().with_force_rebuild(true));
        let report = orchestrator
            .convert_all(vec![fx.pdf(95, "short", "10", "Soil Carbon")], &fx.out_dir(), None)
            .await
            .unwrap();

        assert_eq!(report.result(95).unwrap().outcome, ConversionOutcome::Converted);
        assert!(std::fs::read_to_string(&existing).unwrap().starts_with("# short"));
    }

    #[tokio::test]
    async fn test_cache_recognises_renamed_title_and_rebuild_removes_it() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.out_dir()).unwrap();
        let old = fx.out_dir().join(fulltext_file_name(95, "Old Title"));
        std::fs::write(&old, "old").unwrap();

        let cached = fx.orchestrator(ConversionConfig::default());
        let result = cached
            .convert_single(fx.pdf(95, "short", "10", "New Title"), &fx.out_dir())
            .await
            .unwrap();
        assert_eq!(result.outcome, ConversionOutcome::SkippedCached);
        assert_eq!(result.output_path.as_deref(), Some(old.as_path()));

        let forced = fx.orchestrator(ConversionConfig::default().with_force_rebuild(true));
        let result = forced
            .convert_single(fx.pdf(95, "short", "10", "New Title"), &fx.out_dir())
            .await
            .unwrap();
        assert_eq!(result.outcome, ConversionOutcome::Converted);
        assert_eq!(
            fx.documents(95),
            vec![fx.out_dir().join(fulltext_file_name(95, "New Title"))]
        );
    }

    #[tokio::test]
    async fn test_single_failure_does_not_abort_batch() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(ConversionConfig::default());
        let items = vec![
            fx.pdf(1, "first", "3", "First"),
            fx.pdf(2, "broken", "3", "Broken"),
            fx.pdf(3, "third", "3", "Third"),
            fx.pdf(4, "fourth", "3", "Fourth"),
        ];

        let report = orchestrator.convert_all(items, &fx.out_dir(), None).await.unwrap();

        assert_eq!(report.summary.total, 4);
        assert_eq!(report.summary.converted, 3);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.failures[0].attachment_id, 2);
        assert!(report.summary.failures[0].detail.contains("engine crashed"));
        assert!(fx.documents(2).is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_page_count_fails_item() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(ConversionConfig::default());
        let mut missing = fx.pdf(6, "gone", "3", "Gone");
        missing.source_path = Some(fx.dir.path().join("does-not-exist.pdf"));
        let items = vec![fx.pdf(5, "corrupt", "%PDF-garbage", "Corrupt"), missing];

        let report = orchestrator.convert_all(items, &fx.out_dir(), None).await.unwrap();

        assert_eq!(report.result(5).unwrap().outcome, ConversionOutcome::Failed);
        assert_eq!(report.result(6).unwrap().outcome, ConversionOutcome::Failed);
        assert_eq!(fx.engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_page_limit_skips_page_check() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(ConversionConfig::default().with_pages_max(None));
        let items = vec![fx.pdf(7, "unknown", "not-a-number", "Unknown")];

        let report = orchestrator.convert_all(items, &fx.out_dir(), None).await.unwrap();

        assert_eq!(report.result(7).unwrap().outcome, ConversionOutcome::Converted);
        assert_eq!(*fx.engine.budgets.lock().unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn test_excluded_and_missing_path() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(ConversionConfig::default());
        let items = vec![
            item(1, Some("text/html"), Some("/snapshot.html")),
            item(2, Some("application/pdf"), None),
        ];

        let report = orchestrator.convert_all(items, &fx.out_dir(), None).await.unwrap();

        assert_eq!(report.result(1).unwrap().outcome, ConversionOutcome::Excluded);
        assert_eq!(report.result(2).unwrap().outcome, ConversionOutcome::Failed);
        assert_eq!(report.summary.excluded, 1);
    }

    #[tokio::test]
    async fn test_engine_timeout_fails_item() {
        let fx = Fixture::with_engine(StubEngine::with_delay(Duration::from_secs(5)));
        let orchestrator = fx.orchestrator(
            ConversionConfig::default().with_engine_timeout(Some(Duration::from_millis(50))),
        );

        let result = orchestrator
            .convert_single(fx.pdf(8, "slow", "2", "Slow"), &fx.out_dir())
            .await
            .unwrap();

        assert_eq!(result.outcome, ConversionOutcome::Failed);
        assert!(result.detail.unwrap().contains("timed out"));
        assert!(fx.documents(8).is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_reports_remaining_items_not_processed() {
        let (tx, rx) = watch::channel(false);
        let fx = Fixture::with_engine(StubEngine {
            cancel_after_first: Some(tx),
            ..Default::default()
        });
        let orchestrator = fx.orchestrator(ConversionConfig::default());
        let items = vec![
            fx.pdf(1, "first", "3", "First"),
            fx.pdf(2, "second", "3", "Second"),
            fx.pdf(3, "third", "3", "Third"),
        ];

        let report = orchestrator
            .convert_all(items, &fx.out_dir(), Some(rx))
            .await
            .unwrap();

        assert_eq!(report.result(1).unwrap().outcome, ConversionOutcome::Converted);
        assert_eq!(report.result(2).unwrap().outcome, ConversionOutcome::NotProcessed);
        assert_eq!(report.result(3).unwrap().outcome, ConversionOutcome::NotProcessed);
        assert_eq!(report.summary.not_processed, 2);
        assert_eq!(report.summary.failed, 0);
        assert_eq!(fx.engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_worker_pool_bounds_concurrency() {
        let fx = Fixture::with_engine(StubEngine::with_delay(Duration::from_millis(50)));
        let orchestrator = fx.orchestrator(ConversionConfig::default().with_max_concurrent(2));
        let items: Vec<_> = (1..=6)
            .map(|id| fx.pdf(id, &format!("paper{}", id), "4", &format!("Paper {}", id)))
            .collect();

        let report = orchestrator.convert_all(items, &fx.out_dir(), None).await.unwrap();

        assert_eq!(report.summary.converted, 6);
        assert_eq!(fx.engine.calls(), 6);
        let max = fx.engine.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 2, "max in flight was {}", max);
        for id in 1..=6 {
            assert_eq!(fx.documents(id).len(), 1);
        }
    }

    #[tokio::test]
    async fn test_duplicate_items_processed_once() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(ConversionConfig::default());
        let item = fx.pdf(9, "dup", "2", "Dup");

        let report = orchestrator
            .convert_all(vec![item.clone(), item], &fx.out_dir(), None)
            .await
            .unwrap();

        assert_eq!(report.summary.total, 1);
        assert_eq!(fx.engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_leftover_work_dirs_are_cleared() {
        let fx = Fixture::new();
        let leftover = fx.out_dir().join(format!("{}12_abc", WORK_DIR_PREFIX));
        std::fs::create_dir_all(&leftover).unwrap();
        std::fs::write(leftover.join("partial.md"), "half").unwrap();

        let orchestrator = fx.orchestrator(ConversionConfig::default());
        orchestrator.convert_all(Vec::new(), &fx.out_dir(), None).await.unwrap();

        assert!(!leftover.exists());
        assert!(fx.out_dir().join(IMAGES_DIR_NAME).is_dir());
    }

    #[tokio::test]
    async fn test_health_check() {
        let fx = Fixture::new();
        let health = fx.orchestrator(ConversionConfig::default()).health_check().await;
        assert_eq!(
            health,
            ToolHealth {
                engine: true,
                page_counter: true
            }
        );
    }
}

//! Batch entry points.
//!
//! Each command is idempotent: rerunning it over unchanged inputs rewrites the
//! same tables, leaves unchanged documents alone and skips cached full texts.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use refkb_core::{
    AnnotationRecord, ConversionEngine, Error, ItemId, MetadataRecord, PageCounter, RunSummary,
};
use refkb_db::{
    read_csv, write_atomic, write_csv, AnnotationSummary, Library, LibraryConfig, MetadataSummary,
};
use refkb_jobs::{
    items_from_records, AnnotationAggregator, AnnotationOutcome, ConversionConfig,
    ConversionOrchestrator, MineruConfig, MineruEngine, PdfInfoPageCounter,
};

use crate::config::OutputConfig;

/// Options for `convert-pdfs`.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConvertPdfsArgs {
    /// Convert only this attachment
    #[arg(long)]
    pub attachment_id: Option<ItemId>,

    /// Skip PDFs with more pages than this [env: PDF_PAGES_MAX]
    #[arg(long, conflicts_with = "no_page_limit")]
    pub pages_max: Option<u32>,

    /// Convert regardless of page count
    #[arg(long)]
    pub no_page_limit: bool,

    /// Reconvert PDFs that already have a document [env: PDF_FORCE_REBUILD]
    #[arg(long)]
    pub force_rebuild: bool,

    /// Number of parallel conversions [env: CONVERT_MAX_CONCURRENT]
    #[arg(long)]
    pub jobs: Option<usize>,

    /// Also write the run summary as JSON to this path
    #[arg(long)]
    pub summary_json: Option<PathBuf>,
}

impl ConvertPdfsArgs {
    /// Apply these options on top of `config`.
    pub fn apply(&self, mut config: ConversionConfig) -> ConversionConfig {
        if self.no_page_limit {
            config = config.with_pages_max(None);
        } else if let Some(max) = self.pages_max {
            config = config.with_pages_max(Some(max));
        }
        if self.force_rebuild {
            config = config.with_force_rebuild(true);
        }
        if let Some(jobs) = self.jobs {
            config = config.with_max_concurrent(jobs);
        }
        config
    }
}

/// `extract-metadata`: write one row per paper and attachment.
pub async fn extract_metadata(library: &LibraryConfig, output: &OutputConfig) -> anyhow::Result<()> {
    let library = Library::open(library).await?;
    let records = library.extractor().extract_metadata().await;
    library.close().await;
    let records = records?;

    MetadataSummary::from_records(&records).log();
    let written = write_csv(&output.metadata_csv, &records)?;
    println!(
        "Wrote {} metadata records to {}",
        written,
        output.metadata_csv.display()
    );
    Ok(())
}

/// `extract-annotations`: write one row per annotation.
pub async fn extract_annotations(
    library: &LibraryConfig,
    output: &OutputConfig,
) -> anyhow::Result<()> {
    let library = Library::open(library).await?;
    let records = library.extractor().extract_annotations().await;
    library.close().await;
    let records = records?;

    AnnotationSummary::from_records(&records).log();
    let written = write_csv(&output.annotations_csv, &records)?;
    println!(
        "Wrote {} annotations to {}",
        written,
        output.annotations_csv.display()
    );
    Ok(())
}

/// Aggregator over the annotation table. Attachments listed in the metadata
/// table are valid lookups even without annotations.
fn load_aggregator(output: &OutputConfig) -> anyhow::Result<AnnotationAggregator> {
    let annotations: Vec<AnnotationRecord> = read_csv(&output.annotations_csv)
        .with_context(|| {
            format!(
                "cannot read {}; run `refkb extract-annotations` first",
                output.annotations_csv.display()
            )
        })?;

    let known: Vec<ItemId> = match read_csv::<MetadataRecord>(&output.metadata_csv) {
        Ok(records) => records.iter().filter_map(|r| r.attachment_id).collect(),
        Err(e) if e.is_not_found() => {
            warn!(
                subsystem = "annotate",
                path = %output.metadata_csv.display(),
                "Metadata table missing; only annotated attachments are known"
            );
            Vec::new()
        }
        Err(e) => return Err(e.into()),
    };

    Ok(AnnotationAggregator::new(annotations, known))
}

/// `convert-annotations`: render annotation documents.
pub fn convert_annotations(
    output: &OutputConfig,
    attachment_id: Option<ItemId>,
) -> anyhow::Result<()> {
    let aggregator = load_aggregator(output)?;

    if let Some(id) = attachment_id {
        match aggregator.write_single(id, &output.annotations_dir)? {
            AnnotationOutcome::Written {
                path,
                annotation_count,
            } => println!("Wrote {} annotations to {}", annotation_count, path.display()),
            AnnotationOutcome::Unchanged { path, .. } => {
                println!("{} is up to date", path.display())
            }
            AnnotationOutcome::NoAnnotations => {
                println!("Attachment {} has no annotations", id)
            }
            AnnotationOutcome::Failed { detail } => anyhow::bail!(detail),
        }
        return Ok(());
    }

    let report = aggregator.write_all(&output.annotations_dir);
    println!(
        "Annotation documents: {} written or unchanged, {} failed, {} annotations",
        report.successful, report.failed, report.total_annotations
    );
    for (id, outcome) in &report.outcomes {
        if let AnnotationOutcome::Failed { detail } = outcome {
            println!("  failed {}: {}", id, detail);
        }
    }
    Ok(())
}

/// `list-annotated`: attachments with annotations.
pub fn list_annotated(output: &OutputConfig) -> anyhow::Result<()> {
    let aggregator = load_aggregator(output)?;
    let attachments = aggregator.list_attachments();
    println!("{:>10}  {:>6}  title", "attachment", "count");
    for a in &attachments {
        println!("{:>10}  {:>6}  {}", a.attachment_id, a.annotation_count, a.paper_title);
    }
    println!("{} annotated attachments", attachments.len());
    Ok(())
}

/// `convert-pdfs` with the default engine and page counter.
pub async fn convert_pdfs(args: &ConvertPdfsArgs, output: &OutputConfig) -> anyhow::Result<()> {
    let config = args.apply(ConversionConfig::from_env());
    let engine = MineruEngine::new(MineruConfig::from_env()?)?;
    let orchestrator = ConversionOrchestrator::new(
        Arc::new(engine),
        Arc::new(PdfInfoPageCounter::new()),
        config,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(
                subsystem = "convert",
                "Shutdown requested; finishing in-flight conversions"
            );
            let _ = shutdown_tx.send(true);
        }
    });

    run_conversion(&orchestrator, args, output, Some(shutdown_rx)).await
}

/// Run a conversion over the metadata table with a prepared orchestrator.
pub async fn run_conversion(
    orchestrator: &ConversionOrchestrator,
    args: &ConvertPdfsArgs,
    output: &OutputConfig,
    shutdown: Option<watch::Receiver<bool>>,
) -> anyhow::Result<()> {
    let records: Vec<MetadataRecord> = read_csv(&output.metadata_csv)
        .with_context(|| {
            format!(
                "cannot read {}; run `refkb extract-metadata` first",
                output.metadata_csv.display()
            )
        })?;
    let items = items_from_records(&records);

    if let Some(id) = args.attachment_id {
        let item = items
            .into_iter()
            .find(|item| item.attachment_id == id)
            .ok_or(Error::AttachmentNotFound(id))?;
        let result = orchestrator
            .convert_single(item, &output.fulltexts_dir)
            .await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let report = orchestrator
        .convert_all(items, &output.fulltexts_dir, shutdown)
        .await?;
    print_summary(&report.summary);

    if let Some(path) = &args.summary_json {
        write_atomic(path, serde_json::to_string_pretty(&report.summary)?.as_bytes())?;
        info!(subsystem = "convert", path = %path.display(), "Wrote run summary");
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Conversion run: {} total, {} converted, {} cached, {} over page limit, {} excluded, {} failed, {} not processed ({} ms)",
        summary.total,
        summary.converted,
        summary.skipped_cached,
        summary.skipped_page_limit,
        summary.excluded,
        summary.failed,
        summary.not_processed,
        summary.duration_ms
    );
    for failure in &summary.failures {
        println!("  failed {}: {}", failure.attachment_id, failure.detail);
    }
}

#[derive(Debug, Serialize)]
struct Check {
    ok: bool,
    detail: String,
}

impl Check {
    fn from_result<T>(result: refkb_core::Result<T>, ok_detail: impl Into<String>) -> Self {
        match result {
            Ok(_) => Self {
                ok: true,
                detail: ok_detail.into(),
            },
            Err(e) => Self {
                ok: false,
                detail: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    library: Check,
    engine_config: Check,
    engine_available: bool,
    page_counter_available: bool,
    metadata_csv: bool,
    annotations_csv: bool,
}

/// `doctor`: check configuration and external tools.
pub async fn doctor(
    library: refkb_core::Result<LibraryConfig>,
    output: &OutputConfig,
) -> anyhow::Result<()> {
    let library = match library {
        Ok(config) => {
            let path = config.db_path.display().to_string();
            let opened = Library::open(&config).await;
            if let Ok(lib) = &opened {
                lib.close().await;
            }
            Check::from_result(opened, path)
        }
        Err(e) => Check::from_result::<()>(Err(e), ""),
    };

    let engine = MineruConfig::from_env().and_then(MineruEngine::new);
    let engine_available = match &engine {
        Ok(engine) => engine.health_check().await.unwrap_or(false),
        Err(_) => false,
    };
    let engine_config = Check::from_result(engine, "ok");

    let page_counter_available = PdfInfoPageCounter::new()
        .health_check()
        .await
        .unwrap_or(false);

    let report = DoctorReport {
        library,
        engine_config,
        engine_available,
        page_counter_available,
        metadata_csv: output.metadata_csv.is_file(),
        annotations_csv: output.annotations_csv.is_file(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !(report.library.ok
        && report.engine_config.ok
        && report.engine_available
        && report.page_counter_available)
    {
        anyhow::bail!("one or more checks failed");
    }
    Ok(())
}

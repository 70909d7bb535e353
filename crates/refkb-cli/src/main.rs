//! refkb: build a knowledge base from a reference manager library.
//!
//! Extracts paper metadata and annotations from the library's SQLite file
//! into CSV tables, renders annotation documents, and converts attached PDFs
//! to markdown.

mod commands;
mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use refkb_core::ItemId;
use refkb_db::LibraryConfig;

use crate::commands::ConvertPdfsArgs;
use crate::config::{OutputConfig, OutputOverrides};

#[derive(Parser)]
#[command(name = "refkb")]
#[command(author, version, about = "Knowledge base builder for a reference manager library")]
#[command(propagate_version = true)]
struct Cli {
    /// Library database file [env: ZOTERO_DB_PATH]
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(flatten)]
    output: OutputOverrides,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write one metadata row per paper and attachment
    ExtractMetadata,

    /// Write one row per annotation
    ExtractAnnotations,

    /// Render annotation documents from the annotation table
    ConvertAnnotations {
        /// Render only this attachment
        #[arg(long)]
        attachment_id: Option<ItemId>,
    },

    /// Convert attached PDFs to markdown
    ConvertPdfs(ConvertPdfsArgs),

    /// List attachments that have annotations
    ListAnnotated,

    /// Check configuration and external tools
    Doctor,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let _log_guard = init_tracing();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "refkb failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let output = OutputConfig::from_env().with_overrides(&cli.output);

    match cli.command {
        Commands::ExtractMetadata => {
            let library = LibraryConfig::from_env_with_db(cli.db)?;
            commands::extract_metadata(&library, &output).await
        }
        Commands::ExtractAnnotations => {
            let library = LibraryConfig::from_env_with_db(cli.db)?;
            commands::extract_annotations(&library, &output).await
        }
        Commands::ConvertAnnotations { attachment_id } => {
            commands::convert_annotations(&output, attachment_id)
        }
        Commands::ConvertPdfs(args) => commands::convert_pdfs(&args, &output).await,
        Commands::ListAnnotated => commands::list_annotated(&output),
        Commands::Doctor => {
            commands::doctor(LibraryConfig::from_env_with_db(cli.db), &output).await
        }
    }
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging with daily rotation)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter (default: "refkb=info")
///
/// The returned guard must be held until exit so buffered file logs are flushed.
fn init_tracing() -> Option<WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "refkb=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("refkb.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false)); // no ANSI in files by default
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        // Console output goes to stderr; stdout carries command results.
        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stderr)"),
        "Logging initialized"
    );
    guard
}

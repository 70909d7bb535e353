//! # refkb-jobs
//!
//! Batch work over extracted records.
//!
//! This crate provides:
//! - The annotation aggregator: one markdown document per attachment,
//!   grouped and ordered by page
//! - The conversion orchestrator: admission control, caching, atomic
//!   promotion and failure isolation for PDF to markdown runs
//! - Adapters for the external tools (`magic-pdf`, `pdfinfo`)
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use refkb_jobs::{
//!     items_from_records, ConversionConfig, ConversionOrchestrator, MineruConfig,
//!     MineruEngine, PdfInfoPageCounter,
//! };
//!
//! let engine = MineruEngine::new(MineruConfig::from_env()?)?;
//! let orchestrator = ConversionOrchestrator::new(
//!     Arc::new(engine),
//!     Arc::new(PdfInfoPageCounter::new()),
//!     ConversionConfig::from_env(),
//! );
//! let records = refkb_db::read_csv("zotero_metadata.csv".as_ref())?;
//! let report = orchestrator
//!     .convert_all(items_from_records(&records), "fulltexts".as_ref(), None)
//!     .await?;
//! println!("{} converted", report.summary.converted);
//! ```

pub mod adapters;
pub mod annotations;
pub mod conversion;

// Re-export core types
pub use refkb_core::*;

pub use adapters::{MineruConfig, MineruEngine, PdfInfoPageCounter};
pub use annotations::{
    AnnotatedAttachment, AnnotationAggregator, AnnotationDocument, AnnotationOutcome,
    AnnotationReport, PageKey, Rendering,
};
pub use conversion::{
    classify, items_from_records, Admission, ConversionConfig, ConversionItem,
    ConversionOrchestrator, ConversionReport, PageCheck, ToolHealth,
};

//! Trait seams between the pipeline and its collaborators.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{AnnotationRow, AttachmentRow, CollectionMembershipRow, CreatorRow, PaperRow};
use crate::Result;

// =============================================================================
// SOURCE LIBRARY
// =============================================================================

/// Tables an extraction needs from the source library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotScope {
    /// Papers, creators, collection memberships and attachments.
    Metadata,
    /// Papers, attachments and annotations.
    Annotations,
}

/// Rows read from the source library in a single read transaction.
///
/// Tables outside the requested [`SnapshotScope`] are left empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibrarySnapshot {
    /// Regular items (papers), excluding trashed items.
    pub papers: Vec<PaperRow>,
    /// Creator links for all papers.
    pub creators: Vec<CreatorRow>,
    /// Collection memberships for all papers.
    pub collection_memberships: Vec<CollectionMembershipRow>,
    /// All attachment items, excluding trashed items.
    pub attachments: Vec<AttachmentRow>,
    /// All annotation items, excluding trashed items, ordered by attachment,
    /// in-page position, then id.
    pub annotations: Vec<AnnotationRow>,
}

/// Read-only access to the reference manager's relational store.
///
/// Implementations issue plain queries and return one row per source row.
/// No joins beyond those needed to resolve a single column (e.g. a title
/// value) and no business rules: ordering, deduplication and fan-out belong
/// to the extractor.
#[async_trait]
pub trait LibraryReader: Send + Sync {
    /// Read every table in `scope` from one consistent state of the store.
    async fn snapshot(&self, scope: SnapshotScope) -> Result<LibrarySnapshot>;
}

// =============================================================================
// CONVERSION
// =============================================================================

/// A figure extracted by the conversion engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedImage {
    /// File name as referenced from the markdown (`images/<file_name>`).
    pub file_name: String,
    #[serde(skip)]
    pub data: Vec<u8>,
}

/// Output of one engine invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOutput {
    /// Markdown with image references relative to the document
    /// (`images/<file_name>`).
    pub markdown: String,
    pub images: Vec<ExtractedImage>,
}

/// External document-to-markdown conversion engine.
///
/// The engine is a black box: given a source file and a page budget it
/// either produces markdown plus extracted images or fails.
#[async_trait]
pub trait ConversionEngine: Send + Sync {
    /// Convert `source`, reading at most `page_budget` pages when given.
    ///
    /// `work_dir` is a private, empty scratch directory the engine may use;
    /// it is removed after the call.
    async fn convert(
        &self,
        source: &Path,
        page_budget: Option<u32>,
        work_dir: &Path,
    ) -> Result<EngineOutput>;

    /// Check if the engine's external dependencies are available.
    async fn health_check(&self) -> Result<bool>;

    /// Human-readable name of this engine.
    fn name(&self) -> &str;
}

/// Cheap page-count inspection that does not run the conversion engine.
#[async_trait]
pub trait PageCounter: Send + Sync {
    /// Number of pages in `source`. Fails for missing, unreadable or corrupt
    /// files.
    async fn page_count(&self, source: &Path) -> Result<u32>;

    /// Check if the counter's external dependencies are available.
    async fn health_check(&self) -> Result<bool>;
}

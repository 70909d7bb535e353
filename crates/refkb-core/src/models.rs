//! Records and outcomes flowing through the knowledge-base pipeline.
//!
//! Raw `*Row` types are what the library reader returns, one per source
//! table row. Flat `*Record` types are the denormalized, join-resolved output
//! written to the tabular files and consumed by the aggregator and the
//! conversion orchestrator.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::defaults::PDF_CONTENT_TYPE;

/// Item id in the source library (papers, attachments and annotations share
/// one id space).
pub type ItemId = i64;

// =============================================================================
// RAW SOURCE ROWS
// =============================================================================

/// A regular (non-attachment, non-note, non-annotation) library item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaperRow {
    pub paper_id: ItemId,
    pub key: String,
    pub date_added: String,
    pub date_modified: String,
    pub title: Option<String>,
}

/// One creator link of a paper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatorRow {
    pub paper_id: ItemId,
    pub order_index: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// One collection membership of a paper. A paper can appear several times
/// for the same collection name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMembershipRow {
    pub paper_id: ItemId,
    pub collection_name: Option<String>,
}

/// An attachment item. `paper_id` is `None` for standalone attachments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRow {
    pub attachment_id: ItemId,
    pub paper_id: Option<ItemId>,
    pub key: String,
    pub date_added: String,
    pub content_type: Option<String>,
    pub path: Option<String>,
    pub link_mode: Option<i64>,
}

/// An annotation item attached to an attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationRow {
    pub annotation_id: ItemId,
    pub attachment_id: ItemId,
    pub annotation_type: i64,
    pub text: Option<String>,
    pub comment: Option<String>,
    pub color: Option<String>,
    pub page_label: Option<String>,
}

// =============================================================================
// ENUMERATIONS
// =============================================================================

/// How an attachment file is stored by the reference manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    ImportedFile,
    ImportedUrl,
    LinkedFile,
    LinkedUrl,
    EmbeddedImage,
    Unknown,
}

impl LinkMode {
    /// Map the stored integer code to a link mode.
    pub fn from_code(code: Option<i64>) -> Self {
        match code {
            Some(0) => Self::ImportedFile,
            Some(1) => Self::ImportedUrl,
            Some(2) => Self::LinkedFile,
            Some(3) => Self::LinkedUrl,
            Some(4) => Self::EmbeddedImage,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImportedFile => "imported_file",
            Self::ImportedUrl => "imported_url",
            Self::LinkedFile => "linked_file",
            Self::LinkedUrl => "linked_url",
            Self::EmbeddedImage => "embedded_image",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for LinkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Annotation kind as stored in the source library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationType {
    Highlight,
    Note,
    Image,
    Ink,
    Underline,
    Text,
    Unknown,
}

impl AnnotationType {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Highlight,
            2 => Self::Note,
            3 => Self::Image,
            4 => Self::Ink,
            5 => Self::Underline,
            6 => Self::Text,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Highlight => "highlight",
            Self::Note => "note",
            Self::Image => "image",
            Self::Ink => "ink",
            Self::Underline => "underline",
            Self::Text => "text",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for AnnotationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// FLAT RECORDS
// =============================================================================

/// One row of the metadata table: a (paper, attachment) pair, or a paper
/// with all attachment fields empty when it has no attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub paper_id: ItemId,
    pub paper_key: String,
    pub paper_title: String,
    pub authors: String,
    pub collection_names: String,
    pub paper_date_added: String,
    pub paper_date_modified: String,
    pub attachment_id: Option<ItemId>,
    pub attachment_key: Option<String>,
    pub attachment_path: Option<String>,
    pub attachment_fullpath: Option<String>,
    #[serde(rename = "contentType")]
    pub content_type: Option<String>,
    pub link_mode: Option<String>,
    pub attachment_date_added: Option<String>,
}

impl MetadataRecord {
    /// Whether the attachment is eligible for full-text conversion.
    ///
    /// A missing content type is treated as not convertible.
    pub fn is_convertible(&self) -> bool {
        self.attachment_id.is_some() && is_convertible_content_type(self.content_type.as_deref())
    }
}

/// Whether a content type is eligible for full-text conversion.
pub fn is_convertible_content_type(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.trim().eq_ignore_ascii_case(PDF_CONTENT_TYPE))
        .unwrap_or(false)
}

/// One row of the annotation table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub annotation_id: ItemId,
    pub attachment_id: ItemId,
    pub paper_id: Option<ItemId>,
    pub annotation_text: String,
    pub annotation_comment: String,
    pub annotation_color: String,
    pub annotation_type: i64,
    pub annotation_type_name: String,
    pub page_label: Option<String>,
    pub paper_title: String,
    pub attachment_path: Option<String>,
    pub attachment_content_type: Option<String>,
}

impl AnnotationRecord {
    pub fn kind(&self) -> AnnotationType {
        AnnotationType::from_code(self.annotation_type)
    }
}

// =============================================================================
// CONVERSION OUTCOMES
// =============================================================================

/// Terminal state of one attachment in a conversion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionOutcome {
    /// Content type is not convertible.
    Excluded,
    /// Page count exceeds the configured ceiling; nothing written.
    SkippedPageLimit,
    /// A previous document exists and rebuilding was not requested.
    SkippedCached,
    /// The engine succeeded and the document was promoted to its final path.
    Converted,
    /// Engine failure, unreadable source, or write failure.
    Failed,
    /// The run was cancelled before this item started.
    NotProcessed,
}

impl ConversionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excluded => "excluded",
            Self::SkippedPageLimit => "skipped_page_limit",
            Self::SkippedCached => "skipped_cached",
            Self::Converted => "converted",
            Self::Failed => "failed",
            Self::NotProcessed => "not_processed",
        }
    }
}

impl std::fmt::Display for ConversionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of processing one attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub attachment_id: ItemId,
    pub outcome: ConversionOutcome,
    /// Final document path (converted, or the cached document).
    pub output_path: Option<PathBuf>,
    pub page_count: Option<u32>,
    /// Failure detail, or the reason for a skip.
    pub detail: Option<String>,
}

impl ConversionResult {
    pub fn new(attachment_id: ItemId, outcome: ConversionOutcome) -> Self {
        Self {
            attachment_id,
            outcome,
            output_path: None,
            page_count: None,
            detail: None,
        }
    }

    pub fn failed(attachment_id: ItemId, detail: impl Into<String>) -> Self {
        Self::new(attachment_id, ConversionOutcome::Failed).with_detail(detail)
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn with_page_count(mut self, pages: Option<u32>) -> Self {
        self.page_count = pages;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A failed item in a run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub attachment_id: ItemId,
    pub detail: String,
}

/// Aggregate of a conversion run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub total: usize,
    pub excluded: usize,
    pub skipped_page_limit: usize,
    pub skipped_cached: usize,
    pub converted: usize,
    pub failed: usize,
    pub not_processed: usize,
    pub failures: Vec<FailureDetail>,
}

impl RunSummary {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            duration_ms: 0,
            total: 0,
            excluded: 0,
            skipped_page_limit: 0,
            skipped_cached: 0,
            converted: 0,
            failed: 0,
            not_processed: 0,
            failures: Vec::new(),
        }
    }

    /// Account for one item's result.
    pub fn record(&mut self, result: &ConversionResult) {
        self.total += 1;
        match result.outcome {
            ConversionOutcome::Excluded => self.excluded += 1,
            ConversionOutcome::SkippedPageLimit => self.skipped_page_limit += 1,
            ConversionOutcome::SkippedCached => self.skipped_cached += 1,
            ConversionOutcome::Converted => self.converted += 1,
            ConversionOutcome::NotProcessed => self.not_processed += 1,
            ConversionOutcome::Failed => {
                self.failed += 1;
                self.failures.push(FailureDetail {
                    attachment_id: result.attachment_id,
                    detail: result
                        .detail
                        .clone()
                        .unwrap_or_else(|| "unknown failure".to_string()),
                });
            }
        }
    }

    pub fn count(&self, outcome: ConversionOutcome) -> usize {
        match outcome {
            ConversionOutcome::Excluded => self.excluded,
            ConversionOutcome::SkippedPageLimit => self.skipped_page_limit,
            ConversionOutcome::SkippedCached => self.skipped_cached,
            ConversionOutcome::Converted => self.converted,
            ConversionOutcome::Failed => self.failed,
            ConversionOutcome::NotProcessed => self.not_processed,
        }
    }
}

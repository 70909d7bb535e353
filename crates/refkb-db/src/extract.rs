//! Relational extraction: flattens the normalized library into records.
//!
//! The row-to-record transformation is a set of pure functions so the
//! ordering and deduplication rules can be tested without a database.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use refkb_core::defaults::{LIST_SEPARATOR, MISSING_TITLE, SUMMARY_TOP_N};
use refkb_core::{
    AnnotationRecord, AnnotationRow, AnnotationType, AttachmentRow, CollectionMembershipRow,
    CreatorRow, ItemId, LibraryReader, LinkMode, MetadataRecord, PaperRow, Result,
    SnapshotScope,
};

use crate::paths::AttachmentPathResolver;

/// Builds flat metadata and annotation records from a [`LibraryReader`].
///
/// Each extraction reads one [`refkb_core::LibrarySnapshot`]. Any query
/// failure aborts the whole extraction; partial record sets are never
/// returned.
pub struct RelationalExtractor {
    reader: Arc<dyn LibraryReader>,
    resolver: AttachmentPathResolver,
}

impl RelationalExtractor {
    pub fn new(reader: Arc<dyn LibraryReader>, resolver: AttachmentPathResolver) -> Self {
        Self { reader, resolver }
    }

    /// One record per (paper, attachment) pair, plus one record with empty
    /// attachment fields for each paper without attachments.
    pub async fn extract_metadata(&self) -> Result<Vec<MetadataRecord>> {
        let start = Instant::now();

        let snapshot = self.reader.snapshot(SnapshotScope::Metadata).await?;

        let records = build_metadata_records(
            &snapshot.papers,
            &snapshot.creators,
            &snapshot.collection_memberships,
            &snapshot.attachments,
            &self.resolver,
        );

        info!(
            subsystem = "extract",
            component = "metadata",
            op = "extract_metadata",
            paper_count = snapshot.papers.len(),
            record_count = records.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Metadata extraction complete"
        );
        Ok(records)
    }

    /// One record per annotation, denormalized with its attachment and paper.
    pub async fn extract_annotations(&self) -> Result<Vec<AnnotationRecord>> {
        let start = Instant::now();

        let snapshot = self.reader.snapshot(SnapshotScope::Annotations).await?;

        let records = build_annotation_records(
            &snapshot.annotations,
            &snapshot.attachments,
            &snapshot.papers,
        );

        info!(
            subsystem = "extract",
            component = "annotations",
            op = "extract_annotations",
            record_count = records.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Annotation extraction complete"
        );
        Ok(records)
    }
}

// =============================================================================
// RENDERING RULES
// =============================================================================

/// Ordered author string for one paper.
///
/// Creators are ordered by their position; ties keep input order. Each is
/// rendered `Last, First`, or whichever part is present. Creators with no
/// name at all are skipped.
pub fn render_authors<'a>(creators: impl IntoIterator<Item = &'a CreatorRow>) -> String {
    let mut creators: Vec<&CreatorRow> = creators.into_iter().collect();
    creators.sort_by_key(|c| c.order_index);

    creators
        .into_iter()
        .filter_map(|c| {
            let last = c.last_name.as_deref().map(str::trim).unwrap_or("");
            let first = c.first_name.as_deref().map(str::trim).unwrap_or("");
            match (last.is_empty(), first.is_empty()) {
                (false, false) => Some(format!("{}, {}", last, first)),
                (false, true) => Some(last.to_string()),
                (true, false) => Some(first.to_string()),
                (true, true) => None,
            }
        })
        .collect::<Vec<_>>()
        .join(LIST_SEPARATOR)
}

/// Deduplicated, sorted collection string.
pub fn render_collections<'a>(names: impl IntoIterator<Item = Option<&'a str>>) -> String {
    names
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>()
        .join(LIST_SEPARATOR)
}

/// Single-line title; missing or blank titles become [`MISSING_TITLE`].
pub fn normalize_title(title: Option<&str>) -> String {
    let title = title.unwrap_or("").replace(['\r', '\n'], " ");
    let title = title.trim();
    if title.is_empty() {
        MISSING_TITLE.to_string()
    } else {
        title.to_string()
    }
}

/// Collapse all whitespace runs (including line breaks and tabs) to one space.
pub fn normalize_text(text: Option<&str>) -> String {
    text.unwrap_or("")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

// =============================================================================
// RECORD BUILDERS
// =============================================================================

/// Flatten papers and their relations into metadata records.
///
/// Records are ordered by paper `date_added` descending, then paper id,
/// then attachment id. Standalone attachments have no paper and produce no
/// metadata record.
pub fn build_metadata_records(
    papers: &[PaperRow],
    creators: &[CreatorRow],
    memberships: &[CollectionMembershipRow],
    attachments: &[AttachmentRow],
    resolver: &AttachmentPathResolver,
) -> Vec<MetadataRecord> {
    let mut creators_by_paper: HashMap<ItemId, Vec<&CreatorRow>> = HashMap::new();
    for c in creators {
        creators_by_paper.entry(c.paper_id).or_default().push(c);
    }

    let mut collections_by_paper: HashMap<ItemId, Vec<Option<&str>>> = HashMap::new();
    for m in memberships {
        collections_by_paper
            .entry(m.paper_id)
            .or_default()
            .push(m.collection_name.as_deref());
    }

    let mut attachments_by_paper: HashMap<ItemId, Vec<&AttachmentRow>> = HashMap::new();
    for a in attachments {
        if let Some(paper_id) = a.paper_id {
            attachments_by_paper.entry(paper_id).or_default().push(a);
        }
    }

    let mut ordered: Vec<&PaperRow> = papers.iter().collect();
    ordered.sort_by(|a, b| {
        b.date_added
            .cmp(&a.date_added)
            .then(a.paper_id.cmp(&b.paper_id))
    });

    let mut records = Vec::with_capacity(papers.len());
    for paper in ordered {
        let authors = creators_by_paper
            .get(&paper.paper_id)
            .map(|cs| render_authors(cs.iter().copied()))
            .unwrap_or_default();
        let collection_names = collections_by_paper
            .get(&paper.paper_id)
            .map(|ns| render_collections(ns.iter().copied()))
            .unwrap_or_default();

        let base = MetadataRecord {
            paper_id: paper.paper_id,
            paper_key: paper.key.clone(),
            paper_title: normalize_title(paper.title.as_deref()),
            authors,
            collection_names,
            paper_date_added: paper.date_added.clone(),
            paper_date_modified: paper.date_modified.clone(),
            attachment_id: None,
            attachment_key: None,
            attachment_path: None,
            attachment_fullpath: None,
            content_type: None,
            link_mode: None,
            attachment_date_added: None,
        };

        match attachments_by_paper.get(&paper.paper_id) {
            Some(list) => {
                let mut list = list.clone();
                list.sort_by_key(|a| a.attachment_id);
                for a in list {
                    records.push(MetadataRecord {
                        attachment_id: Some(a.attachment_id),
                        attachment_key: Some(a.key.clone()),
                        attachment_path: a.path.clone(),
                        attachment_fullpath: resolver.resolve(&a.key, a.path.as_deref()),
                        content_type: non_blank(a.content_type.as_deref()),
                        link_mode: Some(LinkMode::from_code(a.link_mode).to_string()),
                        attachment_date_added: Some(a.date_added.clone()),
                        ..base.clone()
                    });
                }
            }
            None => records.push(base),
        }
    }
    records
}

/// Denormalize annotations with their attachment and paper.
///
/// Input order within an attachment is preserved (the reader returns it
/// in in-page position order); attachments are ordered by id. Annotations
/// whose attachment is standalone or no longer present keep an empty paper
/// id and the missing-title placeholder.
pub fn build_annotation_records(
    annotations: &[AnnotationRow],
    attachments: &[AttachmentRow],
    papers: &[PaperRow],
) -> Vec<AnnotationRecord> {
    let attachments: HashMap<ItemId, &AttachmentRow> =
        attachments.iter().map(|a| (a.attachment_id, a)).collect();
    let titles: HashMap<ItemId, Option<&str>> = papers
        .iter()
        .map(|p| (p.paper_id, p.title.as_deref()))
        .collect();

    let mut ordered: Vec<&AnnotationRow> = annotations.iter().collect();
    ordered.sort_by_key(|a| a.attachment_id);

    ordered
        .into_iter()
        .map(|a| {
            let attachment = attachments.get(&a.attachment_id);
            let paper_id = attachment.and_then(|att| att.paper_id);
            let title = paper_id.and_then(|id| titles.get(&id).copied().flatten());
            let kind = AnnotationType::from_code(a.annotation_type);

            AnnotationRecord {
                annotation_id: a.annotation_id,
                attachment_id: a.attachment_id,
                paper_id,
                annotation_text: normalize_text(a.text.as_deref()),
                annotation_comment: normalize_text(a.comment.as_deref()),
                annotation_color: a.color.clone().unwrap_or_default(),
                annotation_type: a.annotation_type,
                annotation_type_name: kind.to_string(),
                page_label: non_blank(a.page_label.as_deref()),
                paper_title: normalize_title(title),
                attachment_path: attachment.and_then(|att| att.path.clone()),
                attachment_content_type: attachment.and_then(|att| att.content_type.clone()),
            }
        })
        .collect()
}

// =============================================================================
// SUMMARIES
// =============================================================================

/// Distribution statistics over extracted metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataSummary {
    pub records: usize,
    pub papers: usize,
    pub attachments: usize,
    pub content_types: BTreeMap<String, usize>,
    pub link_modes: BTreeMap<String, usize>,
    /// Most populated collections, largest first.
    pub top_collections: Vec<(String, usize)>,
}

impl MetadataSummary {
    pub fn from_records(records: &[MetadataRecord]) -> Self {
        let papers: BTreeSet<ItemId> = records.iter().map(|r| r.paper_id).collect();
        let attachments: BTreeSet<ItemId> = records.iter().filter_map(|r| r.attachment_id).collect();

        let mut content_types = BTreeMap::new();
        let mut link_modes = BTreeMap::new();
        for r in records.iter().filter(|r| r.attachment_id.is_some()) {
            let ct = r.content_type.clone().unwrap_or_else(|| "(none)".to_string());
            *content_types.entry(ct).or_insert(0) += 1;
            let lm = r.link_mode.clone().unwrap_or_else(|| "(none)".to_string());
            *link_modes.entry(lm).or_insert(0) += 1;
        }

        // Count each paper once per collection regardless of attachment fan-out.
        let mut seen = BTreeSet::new();
        let mut collections: BTreeMap<String, usize> = BTreeMap::new();
        for r in records {
            if !seen.insert(r.paper_id) {
                continue;
            }
            for name in r.collection_names.split(LIST_SEPARATOR).filter(|n| !n.is_empty()) {
                *collections.entry(name.to_string()).or_insert(0) += 1;
            }
        }

        Self {
            records: records.len(),
            papers: papers.len(),
            attachments: attachments.len(),
            content_types,
            link_modes,
            top_collections: top_n(collections),
        }
    }

    pub fn log(&self) {
        info!(
            subsystem = "extract",
            component = "metadata",
            op = "summary",
            record_count = self.records,
            paper_count = self.papers,
            attachment_count = self.attachments,
            content_types = ?self.content_types,
            link_modes = ?self.link_modes,
            top_collections = ?self.top_collections,
            "Metadata summary"
        );
    }
}

/// Distribution statistics over extracted annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationSummary {
    pub annotations: usize,
    pub attachments: usize,
    pub types: BTreeMap<String, usize>,
    /// Papers with the most annotations, as (title, count), largest first.
    pub most_annotated: Vec<(String, usize)>,
}

impl AnnotationSummary {
    pub fn from_records(records: &[AnnotationRecord]) -> Self {
        let attachments: BTreeSet<ItemId> = records.iter().map(|r| r.attachment_id).collect();

        let mut types = BTreeMap::new();
        let mut per_paper: BTreeMap<String, usize> = BTreeMap::new();
        for r in records {
            *types.entry(r.annotation_type_name.clone()).or_insert(0) += 1;
            *per_paper.entry(r.paper_title.clone()).or_insert(0) += 1;
        }

        Self {
            annotations: records.len(),
            attachments: attachments.len(),
            types,
            most_annotated: top_n(per_paper),
        }
    }

    pub fn log(&self) {
        info!(
            subsystem = "extract",
            component = "annotations",
            op = "summary",
            annotation_count = self.annotations,
            attachment_count = self.attachments,
            types = ?self.types,
            most_annotated = ?self.most_annotated,
            "Annotation summary"
        );
    }
}

fn top_n(counts: BTreeMap<String, usize>) -> Vec<(String, usize)> {
    let mut entries: Vec<(String, usize)> = counts.into_iter().collect();
    // Stable sort keeps names alphabetical among equal counts.
    entries.sort_by(|a, b| b.1.cmp(&a.1));
    entries.truncate(SUMMARY_TOP_N);
    debug!(
        subsystem = "extract",
        component = "summary",
        entries = entries.len(),
        "Ranked top entries"
    );
    entries
}

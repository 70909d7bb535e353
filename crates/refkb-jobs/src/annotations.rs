//! Annotation aggregation and rendering.
//!
//! Groups annotation records per attachment, orders them by page and renders
//! one markdown document per attachment. Rendering is a pure function of the
//! record set, so re-running over unchanged records reproduces the previous
//! document byte for byte.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use refkb_core::{AnnotationRecord, Error, ItemId, Result};
use refkb_db::sink::write_atomic;

/// Sort key for page labels: numeric labels first in numeric order, then
/// other labels lexicographically, then annotations without a label.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PageKey {
    Numeric(u64),
    Text(String),
    Missing,
}

impl PageKey {
    pub fn from_label(label: Option<&str>) -> Self {
        match label.map(str::trim).filter(|l| !l.is_empty()) {
            None => PageKey::Missing,
            Some(l) => match l.parse::<u64>() {
                Ok(n) => PageKey::Numeric(n),
                Err(_) => PageKey::Text(l.to_string()),
            },
        }
    }
}

/// Result of rendering one attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendering {
    Rendered(AnnotationDocument),
    NoAnnotations,
}

/// A rendered annotation document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationDocument {
    pub attachment_id: ItemId,
    pub annotation_count: usize,
    pub markdown: String,
}

impl AnnotationDocument {
    /// File name of the document (`<attachment_id>.md`).
    pub fn file_name(&self) -> String {
        format!("{}.md", self.attachment_id)
    }
}

/// Outcome of writing one attachment's document in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnnotationOutcome {
    /// Document written (new or changed).
    Written { path: PathBuf, annotation_count: usize },
    /// Existing document already had identical content.
    Unchanged { path: PathBuf, annotation_count: usize },
    NoAnnotations,
    Failed { detail: String },
}

/// Batch result: per-attachment outcomes plus totals.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnnotationReport {
    pub outcomes: BTreeMap<ItemId, AnnotationOutcome>,
    pub successful: usize,
    pub failed: usize,
    pub total_annotations: usize,
}

/// An attachment that has annotations, for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnnotatedAttachment {
    pub attachment_id: ItemId,
    pub annotation_count: usize,
    pub paper_title: String,
}

/// Groups annotation records per attachment and renders documents.
pub struct AnnotationAggregator {
    by_attachment: BTreeMap<ItemId, Vec<AnnotationRecord>>,
    universe: BTreeSet<ItemId>,
}

impl AnnotationAggregator {
    /// Build an aggregator over `records`.
    ///
    /// `known_attachments` extends the set of attachment ids that are valid
    /// lookups (typically every attachment in the metadata table); attachment
    /// ids carried by the records are always known.
    pub fn new(
        records: Vec<AnnotationRecord>,
        known_attachments: impl IntoIterator<Item = ItemId>,
    ) -> Self {
        let mut universe: BTreeSet<ItemId> = known_attachments.into_iter().collect();
        let mut by_attachment: BTreeMap<ItemId, Vec<AnnotationRecord>> = BTreeMap::new();
        for record in records {
            universe.insert(record.attachment_id);
            by_attachment
                .entry(record.attachment_id)
                .or_default()
                .push(record);
        }
        Self {
            by_attachment,
            universe,
        }
    }

    /// Render the document for one attachment.
    ///
    /// Returns [`Rendering::NoAnnotations`] for a known attachment without
    /// annotations and [`Error::AttachmentNotFound`] for an unknown id.
    pub fn convert_single(&self, attachment_id: ItemId) -> Result<Rendering> {
        if !self.universe.contains(&attachment_id) {
            return Err(Error::AttachmentNotFound(attachment_id));
        }
        Ok(match self.by_attachment.get(&attachment_id) {
            Some(records) if !records.is_empty() => Rendering::Rendered(AnnotationDocument {
                attachment_id,
                annotation_count: records.len(),
                markdown: render_document(attachment_id, records),
            }),
            _ => Rendering::NoAnnotations,
        })
    }

    /// Render every known attachment.
    pub fn convert_all(&self) -> BTreeMap<ItemId, Rendering> {
        self.universe
            .iter()
            .map(|&id| {
                let rendering = match self.by_attachment.get(&id) {
                    Some(records) if !records.is_empty() => {
                        Rendering::Rendered(AnnotationDocument {
                            attachment_id: id,
                            annotation_count: records.len(),
                            markdown: render_document(id, records),
                        })
                    }
                    _ => Rendering::NoAnnotations,
                };
                (id, rendering)
            })
            .collect()
    }

    /// Render and write one attachment's document to `<out_dir>/<id>.md`.
    pub fn write_single(&self, attachment_id: ItemId, out_dir: &Path) -> Result<AnnotationOutcome> {
        match self.convert_single(attachment_id)? {
            Rendering::Rendered(doc) => write_document(&doc, out_dir),
            Rendering::NoAnnotations => Ok(AnnotationOutcome::NoAnnotations),
        }
    }

    /// Render and write documents for every annotated attachment.
    ///
    /// A write failure is recorded against its attachment and does not stop
    /// the batch.
    pub fn write_all(&self, out_dir: &Path) -> AnnotationReport {
        let mut report = AnnotationReport::default();
        let total = self.by_attachment.len();

        info!(
            subsystem = "annotations",
            op = "write_all",
            attachment_count = total,
            out_dir = %out_dir.display(),
            "Rendering annotation documents"
        );

        let mut index = 0;
        for (id, rendering) in self.convert_all() {
            let Rendering::Rendered(doc) = rendering else {
                continue;
            };
            index += 1;
            let outcome = match write_document(&doc, out_dir) {
                Ok(outcome) => {
                    report.successful += 1;
                    report.total_annotations += doc.annotation_count;
                    debug!(
                        subsystem = "annotations",
                        attachment_id = id,
                        index,
                        total,
                        annotation_count = doc.annotation_count,
                        "Annotation document ready"
                    );
                    outcome
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        subsystem = "annotations",
                        attachment_id = id,
                        error = %e,
                        "Failed to write annotation document"
                    );
                    AnnotationOutcome::Failed {
                        detail: e.to_string(),
                    }
                }
            };
            report.outcomes.insert(id, outcome);
        }

        info!(
            subsystem = "annotations",
            op = "write_all",
            successful = report.successful,
            failed = report.failed,
            total_annotations = report.total_annotations,
            "Annotation documents complete"
        );
        report
    }

    /// Attachments that have annotations, by id.
    pub fn list_attachments(&self) -> Vec<AnnotatedAttachment> {
        self.by_attachment
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(&attachment_id, records)| AnnotatedAttachment {
                attachment_id,
                annotation_count: records.len(),
                paper_title: records[0].paper_title.clone(),
            })
            .collect()
    }
}

fn write_document(doc: &AnnotationDocument, out_dir: &Path) -> Result<AnnotationOutcome> {
    let path = out_dir.join(doc.file_name());
    if let Ok(existing) = std::fs::read(&path) {
        if existing == doc.markdown.as_bytes() {
            return Ok(AnnotationOutcome::Unchanged {
                path,
                annotation_count: doc.annotation_count,
            });
        }
    }
    write_atomic(&path, doc.markdown.as_bytes())?;
    Ok(AnnotationOutcome::Written {
        path,
        annotation_count: doc.annotation_count,
    })
}

/// Order annotations by page key. The sort is stable, so annotations on the
/// same page keep their extraction order.
pub fn order_by_page<'a>(records: &'a [AnnotationRecord]) -> Vec<&'a AnnotationRecord> {
    let mut ordered: Vec<(PageKey, &AnnotationRecord)> = records
        .iter()
        .map(|r| (PageKey::from_label(r.page_label.as_deref()), r))
        .collect();
    ordered.sort_by(|a, b| a.0.cmp(&b.0));
    ordered.into_iter().map(|(_, r)| r).collect()
}

/// Render the markdown document for one attachment's annotations.
pub fn render_document(attachment_id: ItemId, records: &[AnnotationRecord]) -> String {
    let mut out = String::new();
    let Some(first) = records.first() else {
        return out;
    };

    let paper_id = first
        .paper_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "N/A".to_string());
    let file_path = first.attachment_path.as_deref().unwrap_or("N/A");

    out.push_str(&format!("# {}\n\n", first.paper_title));
    out.push_str(&format!("**Attachment ID:** {}  \n", attachment_id));
    out.push_str(&format!("**Paper ID:** {}  \n", paper_id));
    out.push_str(&format!("**File Path:** {}  \n\n", file_path));
    out.push_str("---\n\n");

    let mut current_page: Option<Option<&str>> = None;
    for record in order_by_page(records) {
        let page = record
            .page_label
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty());
        if current_page != Some(page) {
            if current_page.is_some() {
                out.push('\n');
            }
            match page {
                Some(label) => out.push_str(&format!("## Page {}\n\n", label)),
                None => out.push_str("## Page (no label)\n\n"),
            }
            current_page = Some(page);
        }

        out.push_str(&format!("### {}", title_case(&record.annotation_type_name)));
        if !record.annotation_color.is_empty() {
            out.push_str(&format!(" `{}`", record.annotation_color));
        }
        out.push_str("\n\n");

        if !record.annotation_text.is_empty() {
            out.push_str(&format!("**Text:** {}\n\n", record.annotation_text));
        }
        if !record.annotation_comment.is_empty() {
            out.push_str(&format!("**Comment:** {}\n\n", record.annotation_comment));
        }
        out.push_str("---\n\n");
    }
    out
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: ItemId, attachment_id: ItemId, page: Option<&str>, text: &str) -> AnnotationRecord {
        AnnotationRecord {
            annotation_id: id,
            attachment_id,
            paper_id: Some(1),
            annotation_text: text.to_string(),
            annotation_comment: String::new(),
            annotation_color: "#ffd400".to_string(),
            annotation_type: 1,
            annotation_type_name: "highlight".to_string(),
            page_label: page.map(String::from),
            paper_title: "Soil carbon".to_string(),
            attachment_path: Some("storage:soil.pdf".to_string()),
            attachment_content_type: Some("application/pdf".to_string()),
        }
    }

    #[test]
    fn test_page_key_ordering() {
        let mut keys = vec![
            PageKey::from_label(None),
            PageKey::from_label(Some("ii")),
            PageKey::from_label(Some("10")),
            PageKey::from_label(Some("2")),
            PageKey::from_label(Some("")),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                PageKey::Numeric(2),
                PageKey::Numeric(10),
                PageKey::Text("ii".to_string()),
                PageKey::Missing,
                PageKey::Missing,
            ]
        );
    }

    #[test]
    fn test_numeric_pages_sort_numerically() {
        // Inserted in reverse order.
        let records = vec![record(1, 94, Some("10"), "ten"), record(2, 94, Some("2"), "two")];
        let agg = AnnotationAggregator::new(records, []);

        let Rendering::Rendered(doc) = agg.convert_single(94).unwrap() else {
            panic!("expected a rendered document");
        };
        let two = doc.markdown.find("**Text:** two").unwrap();
        let ten = doc.markdown.find("**Text:** ten").unwrap();
        assert!(two < ten);
        assert!(doc.markdown.contains("## Page 2\n\n"));
        assert!(doc.markdown.contains("## Page 10\n\n"));
    }

    #[test]
    fn test_same_page_keeps_extraction_order() {
        let records = vec![
            record(9, 5, Some("3"), "first"),
            record(4, 5, Some("3"), "second"),
        ];
        let ordered = order_by_page(&records);
        assert_eq!(ordered[0].annotation_id, 9);
        assert_eq!(ordered[1].annotation_id, 4);
    }

    #[test]
    fn test_render_document_layout() {
        let mut with_comment = record(2, 7, None, "");
        with_comment.annotation_type_name = "note".to_string();
        with_comment.annotation_comment = "check this".to_string();
        with_comment.annotation_color = String::new();
        let records = vec![record(1, 7, Some("1"), "hello"), with_comment];

        let markdown = render_document(7, &records);
        let expected = "# Soil carbon\n\n\
            **Attachment ID:** 7  \n\
            **Paper ID:** 1  \n\
            **File Path:** storage:soil.pdf  \n\n\
            ---\n\n\
            ## Page 1\n\n\
            ### Highlight `#ffd400`\n\n\
            **Text:** hello\n\n\
            ---\n\n\
            \n\
            ## Page (no label)\n\n\
            ### Note\n\n\
            **Comment:** check this\n\n\
            ---\n\n";
        assert_eq!(markdown, expected);
    }

    #[test]
    fn test_render_standalone_attachment_uses_placeholders() {
        let mut standalone = record(3, 8, Some("iv"), "loose");
        standalone.paper_id = None;
        standalone.attachment_path = None;
        standalone.paper_title = "No Title".to_string();

        let markdown = render_document(8, &[standalone]);
        assert!(markdown.starts_with(
            "# No Title\n\n**Attachment ID:** 8  \n**Paper ID:** N/A  \n**File Path:** N/A  \n\n---\n\n"
        ));
        assert!(markdown.contains("## Page iv\n\n### Highlight `#ffd400`\n\n**Text:** loose\n\n"));
    }

    #[test]
    fn test_rendering_is_idempotent_and_order_independent() {
        let a = vec![
            record(1, 3, Some("2"), "x"),
            record(2, 3, Some("1"), "y"),
            record(3, 3, None, "z"),
        ];
        let first = render_document(3, &a);
        let second = render_document(3, &a);
        assert_eq!(first, second);

        // Group-by over records of several attachments in another order.
        let mut shuffled = a.clone();
        shuffled.push(record(4, 8, Some("1"), "other"));
        shuffled.rotate_left(2);
        let agg = AnnotationAggregator::new(shuffled, []);
        let Rendering::Rendered(doc) = agg.convert_single(3).unwrap() else {
            panic!("expected a rendered document");
        };
        // Same-page ties only; different pages are fully ordered by key.
        assert_eq!(doc.annotation_count, 3);
        assert!(doc.markdown.find("**Text:** y") < doc.markdown.find("**Text:** x"));
    }

    #[test]
    fn test_known_attachment_without_annotations() {
        let agg = AnnotationAggregator::new(vec![record(1, 5, None, "a")], [5, 6]);
        assert_eq!(agg.convert_single(6).unwrap(), Rendering::NoAnnotations);
    }

    #[test]
    fn test_unknown_attachment_is_not_found() {
        let agg = AnnotationAggregator::new(vec![record(1, 5, None, "a")], [5]);
        let err = agg.convert_single(404).unwrap_err();
        assert!(matches!(err, Error::AttachmentNotFound(404)));
    }

    #[test]
    fn test_convert_all_covers_universe() {
        let agg = AnnotationAggregator::new(
            vec![record(1, 5, None, "a"), record(2, 9, Some("1"), "b")],
            [5, 7, 9],
        );
        let all = agg.convert_all();
        assert_eq!(all.keys().copied().collect::<Vec<_>>(), vec![5, 7, 9]);
        assert_eq!(all[&7], Rendering::NoAnnotations);
        assert!(matches!(all[&9], Rendering::Rendered(_)));
    }

    #[test]
    fn test_write_all_writes_and_then_reports_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let agg = AnnotationAggregator::new(
            vec![record(1, 5, None, "a"), record(2, 5, None, "b"), record(3, 9, None, "c")],
            [5, 7, 9],
        );

        let report = agg.write_all(dir.path());
        assert_eq!(report.successful, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.total_annotations, 3);
        assert!(!report.outcomes.contains_key(&7));
        let first = std::fs::read(dir.path().join("5.md")).unwrap();

        let again = agg.write_all(dir.path());
        assert!(matches!(
            again.outcomes[&5],
            AnnotationOutcome::Unchanged { annotation_count: 2, .. }
        ));
        assert_eq!(std::fs::read(dir.path().join("5.md")).unwrap(), first);
    }

    #[test]
    fn test_write_all_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the document should go makes the rename fail.
        std::fs::create_dir_all(dir.path().join("5.md/blocker")).unwrap();
        let agg = AnnotationAggregator::new(
            vec![record(1, 5, None, "a"), record(2, 9, None, "b")],
            [],
        );

        let report = agg.write_all(dir.path());
        assert_eq!(report.failed, 1);
        assert_eq!(report.successful, 1);
        assert!(matches!(report.outcomes[&5], AnnotationOutcome::Failed { .. }));
        assert!(dir.path().join("9.md").exists());
    }

    #[test]
    fn test_list_attachments() {
        let agg = AnnotationAggregator::new(
            vec![record(1, 5, None, "a"), record(2, 5, None, "b")],
            [5, 6],
        );
        let listed = agg.list_attachments();
        assert_eq!(
            listed,
            vec![AnnotatedAttachment {
                attachment_id: 5,
                annotation_count: 2,
                paper_title: "Soil carbon".to_string(),
            }]
        );
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("highlight"), "Highlight");
        assert_eq!(title_case(""), "");
    }
}

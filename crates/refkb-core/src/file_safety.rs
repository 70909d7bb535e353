//! File naming helpers for generated documents.

use crate::defaults::TITLE_SLUG_MAX_LEN;
use crate::models::ItemId;

/// Sanitize a string for use as a single path component.
///
/// Path separators and characters rejected by common filesystems are
/// replaced by `_`; the result is never empty.
pub fn sanitize_filename(filename: &str) -> String {
    let sanitized: String = filename
        .chars()
        .map(|c| match c {
            '/' | '\\' | '<' | '>' | ':' | '"' | '|' | '?' | '*' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let sanitized = sanitized.trim().trim_matches('.');
    if sanitized.is_empty() {
        return "unnamed_file".to_string();
    }
    sanitized.to_string()
}

/// Human-readable slug of a paper title for document file names.
///
/// Keeps letters and digits (any script), turns every other run of
/// characters into a single `_`, and truncates on a character boundary.
pub fn title_slug(title: &str) -> String {
    let mut slug = String::with_capacity(title.len().min(TITLE_SLUG_MAX_LEN));
    let mut pending_sep = false;
    let mut len = 0usize;

    for c in title.chars() {
        if c.is_alphanumeric() || c == '-' {
            if pending_sep && !slug.is_empty() {
                if len + 1 >= TITLE_SLUG_MAX_LEN {
                    break;
                }
                slug.push('_');
                len += 1;
            }
            pending_sep = false;
            if len >= TITLE_SLUG_MAX_LEN {
                break;
            }
            slug.push(c);
            len += 1;
        } else {
            pending_sep = true;
        }
    }

    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

/// File name of the full-text document for an attachment.
pub fn fulltext_file_name(attachment_id: ItemId, title: &str) -> String {
    format!("{}_{}.md", attachment_id, title_slug(title))
}

/// Attachment id encoded in a full-text document name (`<id>_<slug>.md`).
pub fn parse_fulltext_file_name(file_name: &str) -> Option<ItemId> {
    let stem = file_name.strip_suffix(".md")?;
    let (id, rest) = stem.split_once('_')?;
    if rest.is_empty() || id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    id.parse().ok()
}

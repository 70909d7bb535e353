//! Attachment path resolution.

use std::path::PathBuf;

use refkb_core::defaults::{ATTACHMENTS_PATH_PREFIX, STORAGE_PATH_PREFIX};

use crate::config::LibraryConfig;

/// Resolves stored attachment paths to filesystem paths.
///
/// The reference manager stores managed files as `storage:<file name>`
/// relative to a per-attachment directory named after the attachment key,
/// and linked files either as absolute paths or as `attachments:<relative>`
/// against a user-configured base directory.
#[derive(Debug, Clone)]
pub struct AttachmentPathResolver {
    storage_dir: PathBuf,
    base_attachment_dir: Option<PathBuf>,
}

impl AttachmentPathResolver {
    pub fn new(config: &LibraryConfig) -> Self {
        Self {
            storage_dir: config.data_dir.join(&config.storage_dir_name),
            base_attachment_dir: config.base_attachment_dir.clone(),
        }
    }

    /// Full path for a stored attachment path, or `None` when nothing is
    /// stored. Unrecognised forms are returned verbatim.
    pub fn resolve(&self, attachment_key: &str, stored: Option<&str>) -> Option<String> {
        let stored = stored?;
        if stored.is_empty() {
            return None;
        }

        if let Some(file) = stored.strip_prefix(STORAGE_PATH_PREFIX) {
            let path = self.storage_dir.join(attachment_key).join(file);
            return Some(path.to_string_lossy().into_owned());
        }

        if let Some(rel) = stored.strip_prefix(ATTACHMENTS_PATH_PREFIX) {
            if let Some(base) = &self.base_attachment_dir {
                return Some(base.join(rel).to_string_lossy().into_owned());
            }
        }

        Some(stored.to_string())
    }
}

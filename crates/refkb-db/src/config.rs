//! Source library configuration.

use std::path::{Path, PathBuf};

use refkb_core::defaults::{LIBRARY_DB_FILENAME, STORAGE_DIR_NAME};
use refkb_core::{Error, Result};

/// Location of the reference manager's data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Data directory holding the managed storage directory.
    pub data_dir: PathBuf,
    /// Name of the managed storage directory inside `data_dir`.
    pub storage_dir_name: String,
    /// Base directory for `attachments:` relative links, if configured.
    pub base_attachment_dir: Option<PathBuf>,
    /// Open the database as immutable so a running reference manager's lock
    /// is never contended. Only safe while the file is not being written.
    pub immutable: bool,
}

impl LibraryConfig {
    /// Configuration for a database file; the data directory is the file's
    /// parent directory.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        let db_path = db_path.into();
        let data_dir = db_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            db_path,
            data_dir,
            storage_dir_name: STORAGE_DIR_NAME.to_string(),
            base_attachment_dir: None,
            immutable: false,
        }
    }

    /// Create config from environment variables.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `ZOTERO_DB_PATH` | `<ZOTERO_DATA_DIR>/zotero.sqlite` | Database file |
    /// | `ZOTERO_DATA_DIR` | parent of `ZOTERO_DB_PATH` | Data directory |
    /// | `ZOTERO_STORAGE_DIR_NAME` | `storage` | Managed storage directory name |
    /// | `ZOTERO_BASE_ATTACHMENT_DIR` | unset | Base for `attachments:` links |
    /// | `ZOTERO_DB_IMMUTABLE` | `false` | Open the database immutable |
    ///
    /// At least one of `ZOTERO_DB_PATH` and `ZOTERO_DATA_DIR` must be set.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with_db(None)
    }

    /// Same as [`from_env`](Self::from_env), with `db_path` taking precedence
    /// over `ZOTERO_DB_PATH`.
    pub fn from_env_with_db(db_path: Option<PathBuf>) -> Result<Self> {
        let db_path = db_path.or_else(|| non_empty_env("ZOTERO_DB_PATH").map(PathBuf::from));
        let data_dir = non_empty_env("ZOTERO_DATA_DIR").map(PathBuf::from);

        let mut config = match (db_path, data_dir) {
            (Some(db), Some(dir)) => Self::new(db).with_data_dir(dir),
            (Some(db), None) => Self::new(db),
            (None, Some(dir)) => Self::new(dir.join(LIBRARY_DB_FILENAME)).with_data_dir(dir),
            (None, None) => {
                return Err(Error::Config(
                    "neither ZOTERO_DB_PATH nor ZOTERO_DATA_DIR is set".to_string(),
                ))
            }
        };

        if let Some(name) = non_empty_env("ZOTERO_STORAGE_DIR_NAME") {
            config.storage_dir_name = name;
        }
        config.base_attachment_dir = non_empty_env("ZOTERO_BASE_ATTACHMENT_DIR").map(PathBuf::from);
        config.immutable = std::env::var("ZOTERO_DB_IMMUTABLE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(config)
    }

    /// Set the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the base directory for `attachments:` relative links.
    pub fn with_base_attachment_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_attachment_dir = Some(dir.into());
        self
    }

    /// Open the database immutable.
    pub fn with_immutable(mut self, immutable: bool) -> Self {
        self.immutable = immutable;
        self
    }

    /// Check that the database file is present and readable.
    pub fn validate(&self) -> Result<()> {
        let meta = std::fs::metadata(&self.db_path).map_err(|e| {
            Error::Config(format!(
                "source library {} is not readable: {}",
                self.db_path.display(),
                e
            ))
        })?;
        if !meta.is_file() {
            return Err(Error::Config(format!(
                "source library {} is not a file",
                self.db_path.display()
            )));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

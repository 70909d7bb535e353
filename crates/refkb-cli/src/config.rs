//! Output locations for the batch commands.

use std::path::PathBuf;

use refkb_core::defaults::{ANNOTATIONS_CSV, ANNOTATIONS_DIR, FULLTEXTS_DIR, METADATA_CSV};

/// Where the batch commands read and write their files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    pub metadata_csv: PathBuf,
    pub annotations_csv: PathBuf,
    pub annotations_dir: PathBuf,
    pub fulltexts_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            metadata_csv: PathBuf::from(METADATA_CSV),
            annotations_csv: PathBuf::from(ANNOTATIONS_CSV),
            annotations_dir: PathBuf::from(ANNOTATIONS_DIR),
            fulltexts_dir: PathBuf::from(FULLTEXTS_DIR),
        }
    }
}

impl OutputConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `METADATA_CSV` | `zotero_metadata.csv` |
    /// | `ANNOTATIONS_CSV` | `zotero_annotations.csv` |
    /// | `ANNOTATIONS_DIR` | `annotations` |
    /// | `FULLTEXTS_DIR` | `fulltexts` |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            metadata_csv: env_path("METADATA_CSV").unwrap_or(defaults.metadata_csv),
            annotations_csv: env_path("ANNOTATIONS_CSV").unwrap_or(defaults.annotations_csv),
            annotations_dir: env_path("ANNOTATIONS_DIR").unwrap_or(defaults.annotations_dir),
            fulltexts_dir: env_path("FULLTEXTS_DIR").unwrap_or(defaults.fulltexts_dir),
        }
    }

    /// Apply command-line overrides.
    pub fn with_overrides(mut self, overrides: &OutputOverrides) -> Self {
        if let Some(path) = &overrides.metadata_csv {
            self.metadata_csv = path.clone();
        }
        if let Some(path) = &overrides.annotations_csv {
            self.annotations_csv = path.clone();
        }
        if let Some(path) = &overrides.annotations_dir {
            self.annotations_dir = path.clone();
        }
        if let Some(path) = &overrides.fulltexts_dir {
            self.fulltexts_dir = path.clone();
        }
        self
    }
}

/// Output paths given on the command line.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct OutputOverrides {
    /// Metadata table [env: METADATA_CSV]
    #[arg(long, global = true)]
    pub metadata_csv: Option<PathBuf>,

    /// Annotation table [env: ANNOTATIONS_CSV]
    #[arg(long, global = true)]
    pub annotations_csv: Option<PathBuf>,

    /// Directory for annotation documents [env: ANNOTATIONS_DIR]
    #[arg(long, global = true)]
    pub annotations_dir: Option<PathBuf>,

    /// Directory for full-text documents [env: FULLTEXTS_DIR]
    #[arg(long, global = true)]
    pub fulltexts_dir: Option<PathBuf>,
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

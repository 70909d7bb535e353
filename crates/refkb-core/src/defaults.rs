//! Centralized default constants for refkb.
//!
//! **This module is the single source of truth** for shared default values.
//! Every crate and the `refkb` binary reference these constants instead of
//! defining their own magic numbers.

// =============================================================================
// SOURCE LIBRARY
// =============================================================================

/// Database file name inside the reference manager's data directory.
pub const LIBRARY_DB_FILENAME: &str = "zotero.sqlite";

/// Name of the managed storage directory inside the data directory.
pub const STORAGE_DIR_NAME: &str = "storage";

/// Path prefix for files stored in the managed storage directory.
pub const STORAGE_PATH_PREFIX: &str = "storage:";

/// Path prefix for linked files relative to the base attachment directory.
pub const ATTACHMENTS_PATH_PREFIX: &str = "attachments:";

/// Maximum connections in the read-only pool.
pub const POOL_MAX_CONNECTIONS: u32 = 4;

/// Pool acquire timeout in seconds.
pub const POOL_ACQUIRE_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// RECORD RENDERING
// =============================================================================

/// Title used when a paper has no title field.
pub const MISSING_TITLE: &str = "No Title";

/// Separator for multi-valued fields (authors, collections).
pub const LIST_SEPARATOR: &str = "; ";

/// Content type eligible for full-text conversion.
pub const PDF_CONTENT_TYPE: &str = "application/pdf";

// =============================================================================
// OUTPUTS
// =============================================================================

/// Flat metadata table (one row per paper × attachment).
pub const METADATA_CSV: &str = "zotero_metadata.csv";

/// Flat annotation table (one row per annotation).
pub const ANNOTATIONS_CSV: &str = "zotero_annotations.csv";

/// Directory for per-attachment annotation documents.
pub const ANNOTATIONS_DIR: &str = "annotations";

/// Directory for full-text documents.
pub const FULLTEXTS_DIR: &str = "fulltexts";

/// Image subdirectory next to the full-text documents.
pub const IMAGES_DIR_NAME: &str = "images";

/// Maximum length of the title slug in full-text file names.
pub const TITLE_SLUG_MAX_LEN: usize = 80;

/// Number of entries shown in "top N" extraction summaries.
pub const SUMMARY_TOP_N: usize = 5;

// =============================================================================
// CONVERSION
// =============================================================================

/// Documents with more pages than this are not converted.
pub const PAGES_MAX: u32 = 100;

/// Rebuild documents that already exist.
pub const FORCE_REBUILD: bool = false;

/// Attachments converted concurrently (1 = sequential).
pub const CONVERT_MAX_CONCURRENT: usize = 1;

/// Timeout for the page-count pre-check in seconds.
pub const PAGE_COUNT_TIMEOUT_SECS: u64 = 30;

/// Prefix of per-item scratch directories inside the output directory.
pub const WORK_DIR_PREFIX: &str = ".work_";

/// Environment variable carrying the engine configuration path.
pub const MINERU_CONFIG_ENV: &str = "MINERU_TOOLS_CONFIG_JSON";

/// Engine executable.
pub const MINERU_BIN: &str = "magic-pdf";

/// Engine parse method (`auto`, `txt`, `ocr`).
pub const MINERU_METHOD: &str = "auto";

/// Extensions of engine output files treated as extracted figures.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp"];

//! # refkb-db
//!
//! Read-only access to the reference manager's SQLite library.
//!
//! This crate provides:
//! - A read-only (optionally immutable) connection pool
//! - The schema reader: plain queries, one row per source row
//! - The relational extractor: flattens papers, creators, collections,
//!   attachments and annotations into flat records
//! - The tabular sink: CSV and document writes via temp file and rename
//!
//! ## Example
//!
//! ```rust,ignore
//! use refkb_db::{Library, LibraryConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let library = Library::open(&LibraryConfig::from_env()?).await?;
//!     let records = library.extractor().extract_metadata().await?;
//!     refkb_db::sink::write_csv("zotero_metadata.csv".as_ref(), &records)?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod extract;
pub mod paths;
pub mod pool;
pub mod reader;
pub mod sink;

// Always compiled so integration tests in tests/ and downstream crates can use it
pub mod test_fixtures;

use std::sync::Arc;

pub use config::LibraryConfig;
pub use extract::{AnnotationSummary, MetadataSummary, RelationalExtractor};
pub use paths::AttachmentPathResolver;
pub use pool::{open_read_only, open_read_only_with_config, PoolConfig};
pub use reader::SqliteLibraryReader;
pub use sink::{read_csv, write_atomic, write_csv};

use refkb_core::Result;
use sqlx::SqlitePool;

/// Handle to an opened source library.
#[derive(Clone)]
pub struct Library {
    pool: SqlitePool,
    reader: Arc<SqliteLibraryReader>,
    resolver: AttachmentPathResolver,
}

impl Library {
    /// Open the library read-only. Fails with a configuration error when the
    /// database file is missing or unreadable.
    pub async fn open(config: &LibraryConfig) -> Result<Self> {
        Self::open_with_pool_config(config, PoolConfig::default()).await
    }

    /// Open the library read-only with custom pool configuration.
    pub async fn open_with_pool_config(
        config: &LibraryConfig,
        pool_config: PoolConfig,
    ) -> Result<Self> {
        let pool = open_read_only_with_config(config, pool_config).await?;
        Ok(Self {
            reader: Arc::new(SqliteLibraryReader::new(pool.clone())),
            pool,
            resolver: AttachmentPathResolver::new(config),
        })
    }

    /// Extractor over this library.
    pub fn extractor(&self) -> RelationalExtractor {
        RelationalExtractor::new(self.reader.clone(), self.resolver.clone())
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close all connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

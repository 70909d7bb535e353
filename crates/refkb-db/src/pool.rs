//! Read-only connection pool for the source library.

use std::time::{Duration, Instant};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use refkb_core::defaults::{POOL_ACQUIRE_TIMEOUT_SECS, POOL_MAX_CONNECTIONS};
use refkb_core::{Error, Result};

use crate::config::LibraryConfig;

/// Pool configuration options.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Connection acquire timeout.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: POOL_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(POOL_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of connections.
    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    /// Set the acquire timeout.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// Connect options for a read-only open of the library file.
///
/// The file is never created and no pragma that writes is issued.
pub fn read_only_options(config: &LibraryConfig) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(&config.db_path)
        .read_only(true)
        .immutable(config.immutable)
        .create_if_missing(false)
}

/// Open the source library read-only with default pool configuration.
pub async fn open_read_only(config: &LibraryConfig) -> Result<SqlitePool> {
    open_read_only_with_config(config, PoolConfig::default()).await
}

/// Open the source library read-only.
///
/// The path is validated first so an unreadable store surfaces as a
/// configuration error before any query runs.
pub async fn open_read_only_with_config(
    config: &LibraryConfig,
    pool_config: PoolConfig,
) -> Result<SqlitePool> {
    config.validate()?;
    let start = Instant::now();

    info!(
        subsystem = "db",
        component = "pool",
        op = "create",
        db_path = %config.db_path.display(),
        immutable = config.immutable,
        max_connections = pool_config.max_connections,
        "Opening source library read-only"
    );

    let pool = SqlitePoolOptions::new()
        .max_connections(pool_config.max_connections)
        .acquire_timeout(pool_config.acquire_timeout)
        .connect_with(read_only_options(config))
        .await
        .map_err(|e| {
            Error::Config(format!(
                "cannot open source library {}: {}",
                config.db_path.display(),
                e
            ))
        })?;

    debug!(
        subsystem = "db",
        component = "pool",
        op = "established",
        pool_size = pool.size(),
        pool_idle = pool.num_idle(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Source library pool established"
    );
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5));

        assert_eq!(config.max_connections, 2);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, POOL_MAX_CONNECTIONS);
    }

    #[tokio::test]
    async fn test_open_missing_library_is_config_error() {
        let config = LibraryConfig::new("/nonexistent/dir/zotero.sqlite");
        let err = open_read_only(&config).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_open_garbage_file_fails_on_first_query() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zotero.sqlite");
        std::fs::write(&path, b"this is not a database").unwrap();
        let config = LibraryConfig::new(&path);

        // Connect may or may not touch the header; a query certainly does.
        match open_read_only(&config).await {
            Err(e) => assert!(e.is_fatal()),
            Ok(pool) => {
                let result = sqlx::query("SELECT 1 FROM items").fetch_all(&pool).await;
                assert!(result.is_err());
            }
        }
    }
}

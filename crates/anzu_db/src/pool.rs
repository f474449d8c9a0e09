//! Connection pool, selected at compile time.
//!
//! The `sqlite` feature (default) and the `postgres` feature each pin a
//! concrete pool type instead of `sqlx::AnyPool`, which keeps
//! `#[derive(FromRow)]` working with DateTime columns. With both features
//! enabled, SQLite wins: the store's SQL is written in its dialect first.

use thiserror::Error;
use tracing::info;

use anzu_protocol::defaults::{DB_MAX_CONNECTIONS, DB_MIN_CONNECTIONS};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unsupported database URL: {0}")]
    InvalidUrl(String),
}

#[cfg(feature = "sqlite")]
pub type DbPool = sqlx::SqlitePool;
#[cfg(feature = "sqlite")]
pub type DbRow = sqlx::sqlite::SqliteRow;

#[cfg(all(feature = "postgres", not(feature = "sqlite")))]
pub type DbPool = sqlx::PgPool;
#[cfg(all(feature = "postgres", not(feature = "sqlite")))]
pub type DbRow = sqlx::postgres::PgRow;

/// Session pragmas applied to every fresh SQLite pool: WAL for concurrent
/// readers, NORMAL sync, and enforced foreign keys so character deletion
/// cascades into pipeline rows.
#[cfg(feature = "sqlite")]
const SQLITE_PRAGMAS: [&str; 3] = [
    "PRAGMA journal_mode=WAL",
    "PRAGMA synchronous=NORMAL",
    "PRAGMA foreign_keys=ON",
];

/// Pool configuration. The pool is shared and bounded; transactions stay
/// short and never span an external service call.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
}

impl DbConfig {
    /// Validate and wrap a connection URL.
    pub fn from_url(url: impl Into<String>) -> Result<Self, DbError> {
        let url = url.into();
        let supported = url.starts_with("sqlite:") || url.starts_with("postgres://");
        if !supported {
            return Err(DbError::InvalidUrl(url));
        }
        Ok(DbConfig {
            url,
            min_connections: DB_MIN_CONNECTIONS,
            max_connections: DB_MAX_CONNECTIONS,
        })
    }

    /// File-backed SQLite, created on first open.
    #[cfg(feature = "sqlite")]
    pub fn sqlite(path: impl AsRef<str>) -> Self {
        DbConfig {
            url: format!("sqlite:{}?mode=rwc", path.as_ref()),
            min_connections: DB_MIN_CONNECTIONS,
            max_connections: DB_MAX_CONNECTIONS,
        }
    }

    /// Single-connection in-memory SQLite for tests. One connection is
    /// load-bearing: each new in-memory connection would be its own empty
    /// database.
    #[cfg(feature = "sqlite")]
    pub fn sqlite_memory() -> Self {
        DbConfig {
            url: "sqlite::memory:".to_string(),
            min_connections: 1,
            max_connections: 1,
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

/// Open the pool and apply engine-specific session settings.
#[cfg(feature = "sqlite")]
pub async fn create_pool(config: DbConfig) -> Result<DbPool, DbError> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;

    for pragma in SQLITE_PRAGMAS {
        sqlx::query(pragma).execute(&pool).await?;
    }

    info!("Connected to SQLite database");
    Ok(pool)
}

#[cfg(all(feature = "postgres", not(feature = "sqlite")))]
pub async fn create_pool(config: DbConfig) -> Result<DbPool, DbError> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;

    info!("Connected to PostgreSQL database");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[cfg(feature = "sqlite")]
    async fn test_memory_pool_opens_and_applies_pragmas() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        let fk: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_from_url_rejects_unknown_schemes() {
        assert!(matches!(
            DbConfig::from_url("mysql://localhost/x"),
            Err(DbError::InvalidUrl(_))
        ));
        assert!(DbConfig::from_url("sqlite::memory:").is_ok());
        assert!(DbConfig::from_url("postgres://localhost/anzu").is_ok());
    }

    #[test]
    fn test_builder_overrides_bounds() {
        let config = DbConfig::from_url("sqlite:anzu.db").unwrap().with_max_connections(4);
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.min_connections, DB_MIN_CONNECTIONS);
    }
}

use crate::config::StorageConfig;
use crate::error::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

pub const PARTS_MIGRATION: &str = include_str!("../migrations/001_create_parts.sql");
pub const CHANNEL_MIGRATION: &str = include_str!("../migrations/002_create_channel_log.sql");

/// Owns the SQLite connection pool shared by storage, the read path and the channel log.
#[derive(Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// Connect to a `sqlite://` URL, creating the file if needed.
    pub async fn connect(url: &str, config: &StorageConfig) -> Result<Self> {
        info!("Connecting to database at {}", url);
        let options = SqliteConnectOptions::from_str(url)?;
        Self::connect_with(options, config).await
    }

    pub async fn open_file(path: impl AsRef<Path>, config: &StorageConfig) -> Result<Self> {
        info!("Opening database file {}", path.as_ref().display());
        let options = SqliteConnectOptions::new().filename(path);
        Self::connect_with(options, config).await
    }

    async fn connect_with(options: SqliteConnectOptions, config: &StorageConfig) -> Result<Self> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout())
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .idle_timeout(config.idle_timeout())
            .max_lifetime(config.max_lifetime())
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run an embedded migration script. Every statement is idempotent.
    pub async fn run_migration(&self, name: &str, sql: &str) -> Result<()> {
        info!("Running database migration {}", name);
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Fixed-width UTC timestamp so text ordering matches time ordering.
pub fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamps_sort_as_text() {
        let early = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let late = early + chrono::Duration::milliseconds(1500);
        let (a, b) = (encode_timestamp(&early), encode_timestamp(&late));
        assert!(a < b);
        assert_eq!(a.len(), b.len());
        assert_eq!(decode_timestamp(&a), Some(early));
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseManager::open_file(dir.path().join("test.db"), &StorageConfig::default())
            .await
            .unwrap();
        for _ in 0..2 {
            db.run_migration("parts", PARTS_MIGRATION).await.unwrap();
            db.run_migration("channel", CHANNEL_MIGRATION).await.unwrap();
        }
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('parts', 'part_specs', 'part_images', 'channel_records', 'channel_offsets')",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(count, 5);
    }
}

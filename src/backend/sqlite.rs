//! SQLite-backed reference record store.
//!
//! Every logical table lives in one `records` relation keyed by
//! `(table_name, record_key)`; record fields are stored as a JSON object.
//! Tables must be registered (via [`SqliteStore::create_table`] or
//! [`SqliteStore::put_records`]) before they can be read.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use sqlx::{QueryBuilder, Row, Sqlite};

use super::{
    BatchGetOutput, ContinuationToken, DEFAULT_MAX_BATCH_SIZE, RecordStore, ScanPage, ScanRequest,
    check_batch_request,
};
use crate::error::{BackendError, DatabaseError};
use crate::types::{Fields, LookupKey, Record};
use crate::{Error, Result};

// SQLite default SQLITE_MAX_VARIABLE_NUMBER is 999; each record binds 3 values.
const MAX_RECORDS_PER_INSERT: usize = 300;

// Primary result codes that signal lock contention rather than a broken request
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Record store persisted in a SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    max_batch_size: usize,
}

impl SqliteStore {
    /// Open (or create) the store at `path` and run migrations
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                )))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to connect to database: {}",
                e
            )))
        })?;

        let store = Self {
            pool,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        };
        store.run_migrations().await?;

        Ok(store)
    }

    /// Override the per-request key limit
    #[must_use]
    pub fn with_max_batch_size(mut self, limit: usize) -> Self {
        self.max_batch_size = limit.max(1);
        self
    }

    /// Underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close all pooled connections
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Register `table`; a no-op if it already exists
    pub async fn create_table(&self, table: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO store_tables (name, created_at) VALUES (?, ?)")
            .bind(table)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to create table {}: {}",
                    table, e
                )))
            })?;
        Ok(())
    }

    /// Insert or replace records, registering the table on first use
    pub async fn put_records(&self, table: &str, records: &[Record]) -> Result<()> {
        self.create_table(table).await?;
        if records.is_empty() {
            return Ok(());
        }

        let bodies = records
            .iter()
            .map(|r| serde_json::to_string(&r.fields))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let rows: Vec<(&Record, &String)> = records.iter().zip(bodies.iter()).collect();
        for chunk in rows.chunks(MAX_RECORDS_PER_INSERT) {
            let mut query_builder =
                QueryBuilder::<Sqlite>::new("INSERT INTO records (table_name, record_key, body) ");

            query_builder.push_values(chunk, |mut b, (record, body)| {
                b.push_bind(table)
                    .push_bind(record.key.as_str())
                    .push_bind(body.as_str());
            });
            query_builder
                .push(" ON CONFLICT(table_name, record_key) DO UPDATE SET body = excluded.body");

            query_builder.build().execute(&self.pool).await.map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to insert records batch: {}",
                    e
                )))
            })?;
        }

        Ok(())
    }

    /// Number of records stored in `table`
    pub async fn count(&self, table: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE table_name = ?")
            .bind(table)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn ensure_table(&self, table: &str) -> std::result::Result<(), BackendError> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM store_tables WHERE name = ?")
            .bind(table)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        match exists {
            Some(_) => Ok(()),
            None => Err(BackendError::TableNotFound(table.to_string())),
        }
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create schema_version table: {}",
                e
            )))
        })?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to query schema version: {}",
                        e
                    )))
                })?;

        if current_version.unwrap_or(0) < 1 {
            self.migrate_v1().await?;
        }

        Ok(())
    }

    /// Migration v1: table registry and record storage
    async fn migrate_v1(&self) -> Result<()> {
        tracing::info!("Applying record store migration v1");

        let migration_failed = |e: sqlx::Error| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Migration v1 failed: {}",
                e
            )))
        };

        let mut tx = self.pool.begin().await.map_err(migration_failed)?;

        sqlx::query(
            r#"
            CREATE TABLE store_tables (
                name TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(migration_failed)?;

        sqlx::query(
            r#"
            CREATE TABLE records (
                table_name TEXT NOT NULL,
                record_key TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (table_name, record_key)
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(migration_failed)?;

        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (1, ?)")
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *tx)
            .await
            .map_err(migration_failed)?;

        tx.commit().await.map_err(migration_failed)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RecordStore for SqliteStore {
    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn batch_get(
        &self,
        table: &str,
        keys: &[LookupKey],
    ) -> std::result::Result<BatchGetOutput, BackendError> {
        check_batch_request(keys, self.max_batch_size)?;
        self.ensure_table(table).await?;

        let mut query_builder =
            QueryBuilder::<Sqlite>::new("SELECT record_key, body FROM records WHERE table_name = ");
        query_builder.push_bind(table);
        query_builder.push(" AND record_key IN (");
        let mut separated = query_builder.separated(", ");
        for key in keys {
            separated.push_bind(key.as_str());
        }
        separated.push_unseparated(")");

        let rows = query_builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let records = rows
            .iter()
            .map(decode_record)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(BatchGetOutput {
            records,
            unprocessed: Vec::new(),
        })
    }

    async fn scan(
        &self,
        table: &str,
        request: ScanRequest,
    ) -> std::result::Result<ScanPage, BackendError> {
        if request.page_size == 0 {
            return Err(BackendError::InvalidRequest(
                "page size must be at least 1".to_string(),
            ));
        }
        self.ensure_table(table).await?;

        // Keyset pagination: the token is the last key of the previous page
        let after = request
            .continuation
            .as_ref()
            .map_or(String::new(), |token| token.0.clone());
        let limit = i64::try_from(request.page_size.saturating_add(1)).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            "SELECT record_key, body FROM records \
             WHERE table_name = ? AND record_key > ? \
             ORDER BY record_key LIMIT ?",
        )
        .bind(table)
        .bind(&after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let has_more = rows.len() > request.page_size;
        let records = rows
            .iter()
            .take(request.page_size)
            .map(decode_record)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let next = if has_more {
            records
                .last()
                .map(|r| ContinuationToken(r.key.as_str().to_string()))
        } else {
            None
        };

        Ok(ScanPage { records, next })
    }
}

fn decode_record(row: &sqlx::sqlite::SqliteRow) -> std::result::Result<Record, BackendError> {
    let key: String = row.try_get("record_key").map_err(map_sqlx_error)?;
    let body: String = row.try_get("body").map_err(map_sqlx_error)?;

    let key = LookupKey::parse(&key)
        .ok_or_else(|| BackendError::Unavailable("stored record has an empty key".to_string()))?;
    let fields: Fields = serde_json::from_str(&body).map_err(|e| {
        BackendError::Unavailable(format!("stored record {} is corrupt: {}", key, e))
    })?;

    Ok(Record::new(key, fields))
}

/// Classify a database failure: lock contention is throttling, the rest is fatal
fn map_sqlx_error(e: sqlx::Error) -> BackendError {
    match &e {
        sqlx::Error::PoolTimedOut => BackendError::Throttled(e.to_string()),
        sqlx::Error::Database(db) => {
            let primary = db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            match primary {
                Some(SQLITE_BUSY | SQLITE_LOCKED) => BackendError::Throttled(e.to_string()),
                _ => BackendError::Unavailable(e.to_string()),
            }
        }
        _ => BackendError::Unavailable(e.to_string()),
    }
}

//! Storage backend: engine selection, placeholder rewriting, schema setup
//!
//! Two engines are supported, selected by DSN prefix: `postgres://` (or
//! `postgresql://`) gets a server-backed pool, everything else is treated as
//! SQLite. SQL throughout the crate is written with `?` placeholders; for
//! PostgreSQL they are rewritten to `$1..$N` before execution.
//!
//! Timestamps are stored as RFC3339 nanosecond TEXT in both engines. The
//! fixed-width UTC form is lexicographically ordered, so timestamp indices
//! behave identically across engines.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid transition: record is already {current}")]
    InvalidTransition { current: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

pub(crate) fn query_err(e: sqlx::Error) -> StorageError {
    StorageError::Query(e.to_string())
}

/// A single bound SQL parameter
#[derive(Debug, Clone)]
pub enum SqlValue {
    Text(String),
    OptText(Option<String>),
    Int(i64),
    OptInt(Option<i64>),
    Float(f64),
    OptFloat(Option<f64>),
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<Option<String>> for SqlValue {
    fn from(v: Option<String>) -> Self {
        SqlValue::OptText(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

/// Bind a `Vec<SqlValue>` onto an sqlx query; works for either engine's
/// query type because both accept these primitive binds.
macro_rules! bind_values {
    ($query:expr, $params:expr) => {{
        let mut q = $query;
        for p in $params {
            q = match p {
                $crate::backend::SqlValue::Text(v) => q.bind(v),
                $crate::backend::SqlValue::OptText(v) => q.bind(v),
                $crate::backend::SqlValue::Int(v) => q.bind(v),
                $crate::backend::SqlValue::OptInt(v) => q.bind(v),
                $crate::backend::SqlValue::Float(v) => q.bind(v),
                $crate::backend::SqlValue::OptFloat(v) => q.bind(v),
            };
        }
        q
    }};
}
pub(crate) use bind_values;

/// Rewrite `?` placeholders to `$1..$N` for PostgreSQL.
///
/// All statements in this crate are fully parameterized, so a bare scan is
/// sufficient; no SQL here carries a literal `?`.
pub fn rewrite_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0u32;
    for ch in sql.chars() {
        if ch == '?' {
            n += 1;
            out.push('$');
            out.push_str(&n.to_string());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Canonical stored form of a timestamp
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("bad timestamp {:?}: {}", s, e)))
}

pub fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, StorageError> {
    s.filter(|v| !v.is_empty()).map(|v| parse_ts(&v)).transpose()
}

/// Connection pool over either engine
#[derive(Debug, Clone)]
pub enum DbPool {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

impl DbPool {
    /// Connect according to the DSN prefix.
    ///
    /// Bare file paths are accepted for the embedded engine and get the
    /// `sqlite:` scheme (and create-on-open mode) added.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .map_err(|e| StorageError::Connection(e.to_string()))?;
            info!(engine = "postgres", "connected to audit database");
            return Ok(DbPool::Postgres(pool));
        }

        let url = if url.starts_with("sqlite:") {
            url.to_string()
        } else {
            format!("sqlite:{}?mode=rwc", url)
        };
        let memory = url.contains(":memory:");

        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .pragma("foreign_keys", "ON")
            .pragma("busy_timeout", "30000");
        if !memory {
            options = options.pragma("journal_mode", "WAL");
        }

        // A shared in-memory database only exists per connection; keep the
        // pool at one connection so every caller sees the same data.
        let pool = SqlitePoolOptions::new()
            .max_connections(if memory { 1 } else { 5 })
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        info!(engine = "sqlite", url = %url, "connected to audit database");
        Ok(DbPool::Sqlite(pool))
    }

    pub fn is_postgres(&self) -> bool {
        matches!(self, DbPool::Postgres(_))
    }

    /// Run a statement, returning affected rows
    pub async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<u64, StorageError> {
        match self {
            DbPool::Sqlite(pool) => {
                let result = bind_values!(sqlx::query(sql), params)
                    .execute(pool)
                    .await
                    .map_err(query_err)?;
                Ok(result.rows_affected())
            }
            DbPool::Postgres(pool) => {
                let sql = rewrite_placeholders(sql);
                let result = bind_values!(sqlx::query(&sql), params)
                    .execute(pool)
                    .await
                    .map_err(query_err)?;
                Ok(result.rows_affected())
            }
        }
    }

    /// Fetch the first column of every row as a string
    pub async fn fetch_strings(
        &self,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<Vec<String>, StorageError> {
        use sqlx::Row;
        match self {
            DbPool::Sqlite(pool) => {
                let rows = bind_values!(sqlx::query(sql), params)
                    .fetch_all(pool)
                    .await
                    .map_err(query_err)?;
                rows.iter()
                    .map(|r| r.try_get::<String, _>(0).map_err(query_err))
                    .collect()
            }
            DbPool::Postgres(pool) => {
                let sql = rewrite_placeholders(sql);
                let rows = bind_values!(sqlx::query(&sql), params)
                    .fetch_all(pool)
                    .await
                    .map_err(query_err)?;
                rows.iter()
                    .map(|r| r.try_get::<String, _>(0).map_err(query_err))
                    .collect()
            }
        }
    }

    /// Fetch the first column of the first row, if any
    pub async fn fetch_opt_string(
        &self,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<Option<String>, StorageError> {
        Ok(self.fetch_strings(sql, params).await?.into_iter().next())
    }

    /// Fetch a single COUNT(*)-style integer
    pub async fn fetch_count(&self, sql: &str, params: Vec<SqlValue>) -> Result<i64, StorageError> {
        use sqlx::Row;
        match self {
            DbPool::Sqlite(pool) => {
                let row = bind_values!(sqlx::query(sql), params)
                    .fetch_one(pool)
                    .await
                    .map_err(query_err)?;
                row.try_get::<i64, _>(0).map_err(query_err)
            }
            DbPool::Postgres(pool) => {
                let sql = rewrite_placeholders(sql);
                let row = bind_values!(sqlx::query(&sql), params)
                    .fetch_one(pool)
                    .await
                    .map_err(query_err)?;
                row.try_get::<i64, _>(0).map_err(query_err)
            }
        }
    }

    pub async fn close(&self) {
        match self {
            DbPool::Sqlite(pool) => pool.close().await,
            DbPool::Postgres(pool) => pool.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_rewrite_numbers_in_order() {
        assert_eq!(
            rewrite_placeholders("SELECT * FROM t WHERE a = ? AND b = ?"),
            "SELECT * FROM t WHERE a = $1 AND b = $2"
        );
        assert_eq!(rewrite_placeholders("no params"), "no params");
    }

    #[test]
    fn timestamps_round_trip_and_sort() {
        let now = Utc::now();
        let s = format_ts(now);
        assert_eq!(parse_ts(&s).unwrap(), now);

        let earlier = format_ts(now - chrono::Duration::nanoseconds(500));
        assert!(earlier < s, "fixed-width RFC3339 must sort chronologically");
    }

    #[tokio::test]
    async fn memory_pool_round_trips() {
        let db = DbPool::connect("sqlite::memory:").await.unwrap();
        db.execute("CREATE TABLE kv (k TEXT, v TEXT)", Vec::new())
            .await
            .unwrap();
        db.execute(
            "INSERT INTO kv (k, v) VALUES (?, ?)",
            vec![SqlValue::from("a"), SqlValue::from("b")],
        )
        .await
        .unwrap();
        let values = db
            .fetch_strings("SELECT v FROM kv WHERE k = ?", vec![SqlValue::from("a")])
            .await
            .unwrap();
        assert_eq!(values, vec!["b"]);
        assert_eq!(db.fetch_count("SELECT COUNT(*) FROM kv", Vec::new()).await.unwrap(), 1);
    }
}

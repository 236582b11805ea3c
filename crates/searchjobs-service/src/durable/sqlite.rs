use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use super::{DurableError, DurableStore, Owner, SearchRecord, StoreOutcome};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id          TEXT PRIMARY KEY,
        created_at  TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id          TEXT PRIMARY KEY,
        user_id     TEXT NOT NULL REFERENCES users (id),
        created_at  TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS search_requests (
        id            TEXT NOT NULL,
        task_id       TEXT NOT NULL REFERENCES tasks (id),
        query         TEXT NOT NULL,
        result        TEXT NOT NULL,
        status        TEXT NOT NULL,
        created_at    TEXT NOT NULL,
        completed_at  TEXT NULL,
        PRIMARY KEY (id, task_id)
    )
    "#,
];

const SELECT_REQUESTS: &str = r#"
    SELECT r.id, r.task_id, r.query, r.result, r.status, r.created_at, r.completed_at
    FROM search_requests r
"#;

/// A [`DurableStore`] writing to a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteDurableStore {
    pool: SqlitePool,
}

impl SqliteDurableStore {
    /// Opens the database at `path`, creating the file and the tables if needed.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database at {}", path.display()))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .context("failed to create database schema")?;
        }

        Ok(Self { pool })
    }
}

// fixed width, so that lexical order is chronological order
fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn decode_record(row: &SqliteRow) -> Result<SearchRecord, DurableError> {
    let decode = || -> anyhow::Result<SearchRecord> {
        let completed_at: Option<String> = row.try_get("completed_at")?;
        Ok(SearchRecord {
            id: row.try_get::<String, _>("id")?.parse()?,
            task_id: row.try_get::<String, _>("task_id")?.parse()?,
            query: row.try_get("query")?,
            result: serde_json::from_str(row.try_get("result")?)?,
            status: serde_json::from_value(row.try_get::<String, _>("status")?.into())?,
            created_at: parse_time(row.try_get("created_at")?)?,
            completed_at: completed_at.as_deref().map(parse_time).transpose()?,
        })
    };
    decode().map_err(DurableError::Malformed)
}

#[async_trait]
impl DurableStore for SqliteDurableStore {
    async fn create_owner(&self) -> Result<Owner, DurableError> {
        let owner = Owner {
            user_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
        };
        let now = format_time(Utc::now());

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO users (id, created_at) VALUES (?, ?)")
            .bind(owner.user_id.to_string())
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO tasks (id, user_id, created_at) VALUES (?, ?, ?)")
            .bind(owner.task_id.to_string())
            .bind(owner.user_id.to_string())
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(owner)
    }

    async fn store(&self, record: SearchRecord) -> Result<StoreOutcome, DurableError> {
        let task_id = record.task_id.to_string();

        let mut tx = self.pool.begin().await?;
        let task = sqlx::query("SELECT 1 FROM tasks WHERE id = ?")
            .bind(&task_id)
            .fetch_optional(&mut *tx)
            .await?;
        if task.is_none() {
            return Err(DurableError::UnknownTask(record.task_id));
        }

        let done = sqlx::query(
            r#"
            INSERT INTO search_requests
                (id, task_id, query, result, status, created_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id, task_id) DO NOTHING
            "#,
        )
        .bind(record.id.to_string())
        .bind(&task_id)
        .bind(&record.query)
        .bind(record.result.to_string())
        .bind(record.status.as_str())
        .bind(format_time(record.created_at))
        .bind(record.completed_at.map(format_time))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(match done.rows_affected() {
            0 => StoreOutcome::AlreadyExists,
            _ => StoreOutcome::Stored,
        })
    }

    async fn recent(&self, limit: usize) -> Result<Vec<SearchRecord>, DurableError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "{SELECT_REQUESTS} ORDER BY r.created_at DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_record).collect()
    }

    async fn for_user(&self, user_id: Uuid) -> Result<Vec<SearchRecord>, DurableError> {
        let rows = sqlx::query(&format!(
            "{SELECT_REQUESTS} JOIN tasks t ON t.id = r.task_id \
             WHERE t.user_id = ? ORDER BY r.created_at DESC"
        ))
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_record).collect()
    }
}

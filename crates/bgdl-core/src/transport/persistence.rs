//! SQLite task journal for a transfer session
//!
//! One row per task that is on the wire. Rows are deleted when a task ends
//! inside the process that started it, so any row found at start-up belongs
//! to a task whose process went away mid-transfer.

use crate::error::BgdlError;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool},
    Row,
};
use std::path::{Path, PathBuf};
use url::Url;
use uuid::Uuid;

/// Journal entry for one in-flight task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub task_id: Uuid,
    /// Request URL, including the transfer's `tag` parameter
    pub url: Url,
    pub destination: PathBuf,
    /// Partial file name inside the session directory
    pub partial_file: String,
    pub bytes_received: u64,
    pub total_bytes: Option<u64>,
    pub entity_tag: Option<String>,
    pub last_modified: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    /// A fresh task writing to its own partial file
    pub fn new(url: Url, destination: PathBuf) -> Self {
        let task_id = Uuid::new_v4();
        Self {
            task_id,
            url,
            destination,
            partial_file: format!("{}.part", task_id),
            bytes_received: 0,
            total_bytes: None,
            entity_tag: None,
            last_modified: None,
            created_at: Utc::now(),
        }
    }
}

/// Database connection pool for the task journal
#[derive(Clone, Debug)]
pub struct TaskJournal {
    pool: SqlitePool,
}

impl TaskJournal {
    /// Open (or create) the journal database
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, BgdlError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                destination TEXT NOT NULL,
                partial_file TEXT NOT NULL,
                bytes_received INTEGER NOT NULL DEFAULT 0,
                total_bytes INTEGER,
                entity_tag TEXT,
                last_modified TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Save or update a task
    pub async fn upsert(&self, record: &TaskRecord) -> Result<(), BgdlError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                task_id, url, destination, partial_file, bytes_received,
                total_bytes, entity_tag, last_modified, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO UPDATE SET
                url = excluded.url,
                destination = excluded.destination,
                partial_file = excluded.partial_file,
                bytes_received = excluded.bytes_received,
                total_bytes = excluded.total_bytes,
                entity_tag = excluded.entity_tag,
                last_modified = excluded.last_modified,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.task_id.to_string())
        .bind(record.url.as_str())
        .bind(record.destination.to_string_lossy().to_string())
        .bind(&record.partial_file)
        .bind(record.bytes_received as i64)
        .bind(record.total_bytes.map(|t| t as i64))
        .bind(record.entity_tag.as_ref())
        .bind(record.last_modified.as_ref())
        .bind(record.created_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Update the byte count of a task
    pub async fn update_progress(&self, task_id: Uuid, bytes_received: u64) -> Result<(), BgdlError> {
        sqlx::query("UPDATE tasks SET bytes_received = ?, updated_at = ? WHERE task_id = ?")
            .bind(bytes_received as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Load all tasks, oldest first
    pub async fn load_all(&self) -> Result<Vec<TaskRecord>, BgdlError> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    /// Delete a task
    pub async fn delete(&self, task_id: Uuid) -> Result<(), BgdlError> {
        sqlx::query("DELETE FROM tasks WHERE task_id = ?")
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Convert a database row to a TaskRecord
fn row_to_record(row: sqlx::sqlite::SqliteRow) -> Result<TaskRecord, BgdlError> {
    let url: String = row.get("url");

    Ok(TaskRecord {
        task_id: Uuid::parse_str(row.get::<String, _>("task_id").as_str())
            .map_err(|e| BgdlError::Serialization(e.to_string()))?,
        url: Url::parse(&url).map_err(|_| BgdlError::InvalidUrl(url.clone()))?,
        destination: PathBuf::from(row.get::<String, _>("destination")),
        partial_file: row.get("partial_file"),
        bytes_received: row.get::<i64, _>("bytes_received") as u64,
        total_bytes: row.get::<Option<i64>, _>("total_bytes").map(|t| t as u64),
        entity_tag: row.get("entity_tag"),
        last_modified: row.get("last_modified"),
        created_at: DateTime::parse_from_rfc3339(row.get::<String, _>("created_at").as_str())
            .map_err(|e| BgdlError::Serialization(e.to_string()))?
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_journal_round_trip() {
        let temp = TempDir::new().unwrap();
        let journal = TaskJournal::new(temp.path().join("s/tasks.db")).await.unwrap();

        let mut record = TaskRecord::new(
            Url::parse("http://host/file.zip?tag=1").unwrap(),
            temp.path().join("file.zip"),
        );
        record.entity_tag = Some("\"v1\"".to_string());
        journal.upsert(&record).await.unwrap();
        journal.update_progress(record.task_id, 512).await.unwrap();

        let loaded = journal.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].task_id, record.task_id);
        assert_eq!(loaded[0].bytes_received, 512);
        assert_eq!(loaded[0].entity_tag, record.entity_tag);
        assert_eq!(loaded[0].url, record.url);

        journal.delete(record.task_id).await.unwrap();
        assert!(journal.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_journal_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tasks.db");
        let record = TaskRecord::new(
            Url::parse("http://host/a.bin?tag=4").unwrap(),
            temp.path().join("a.bin"),
        );

        {
            let journal = TaskJournal::new(&path).await.unwrap();
            journal.upsert(&record).await.unwrap();
            journal.pool.close().await;
        }

        let journal = TaskJournal::new(&path).await.unwrap();
        let loaded = journal.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].partial_file, record.partial_file);
    }
}

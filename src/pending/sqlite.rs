//! SQLite 待输入存储：暂停中的任务在重启后仍可续传

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{expiry_from, PendingFollowUp, PendingInputStore, StoreError};

const COLUMNS: &str =
    "token, remote_task_id, session_id, action, topic, caller_context, prompt, created_at, expires_at";

pub struct SqlitePendingStore {
    pool: sqlx::sqlite::SqlitePool,
}

impl SqlitePendingStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pending_follow_ups (
                token TEXT PRIMARY KEY,
                remote_task_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                action TEXT NOT NULL,
                topic TEXT NOT NULL,
                caller_context TEXT NOT NULL,
                prompt TEXT,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pending_follow_ups_expiry ON pending_follow_ups(expires_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Backend(format!("invalid timestamp {ms}")))
}

fn from_row(row: &SqliteRow) -> Result<PendingFollowUp, StoreError> {
    let caller_context: String = row.try_get("caller_context").map_err(backend)?;
    Ok(PendingFollowUp {
        follow_up_token: row.try_get("token").map_err(backend)?,
        remote_task_id: row.try_get("remote_task_id").map_err(backend)?,
        session_id: row.try_get("session_id").map_err(backend)?,
        action: row.try_get("action").map_err(backend)?,
        topic: row.try_get("topic").map_err(backend)?,
        caller_context: serde_json::from_str(&caller_context).map_err(backend)?,
        prompt: row.try_get("prompt").map_err(backend)?,
        created_at: from_millis(row.try_get("created_at").map_err(backend)?)?,
        expires_at: from_millis(row.try_get("expires_at").map_err(backend)?)?,
    })
}

#[async_trait]
impl PendingInputStore for SqlitePendingStore {
    async fn put(&self, mut entry: PendingFollowUp, ttl: Duration) -> Result<(), StoreError> {
        entry.expires_at = expiry_from(Utc::now(), ttl);
        let caller_context = serde_json::to_string(&entry.caller_context).map_err(backend)?;

        let result = sqlx::query(&format!(
            "INSERT OR IGNORE INTO pending_follow_ups ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&entry.follow_up_token)
        .bind(&entry.remote_task_id)
        .bind(&entry.session_id)
        .bind(&entry.action)
        .bind(&entry.topic)
        .bind(&caller_context)
        .bind(&entry.prompt)
        .bind(entry.created_at.timestamp_millis())
        .bind(entry.expires_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(entry.follow_up_token));
        }
        Ok(())
    }

    async fn take_and_remove(&self, token: &str) -> Result<PendingFollowUp, StoreError> {
        // 过期条目留给 sweep_expired
        let row = sqlx::query(&format!(
            "DELETE FROM pending_follow_ups WHERE token = ? AND expires_at > ? RETURNING {COLUMNS}"
        ))
        .bind(token)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => from_row(&row),
            None => Err(StoreError::NotFound(token.to_string())),
        }
    }

    async fn sweep_expired(&self) -> Result<Vec<PendingFollowUp>, StoreError> {
        let rows = sqlx::query(&format!(
            "DELETE FROM pending_follow_ups WHERE expires_at <= ? RETURNING {COLUMNS}"
        ))
        .bind(Utc::now().timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(from_row).collect()
    }

    async fn len(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_follow_ups")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::sample_entry;

    #[tokio::test]
    async fn test_roundtrip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.db");

        {
            let store = SqlitePendingStore::new(&path).await.unwrap();
            store
                .put(sample_entry("persisted"), Duration::from_secs(60))
                .await
                .unwrap();
            assert!(matches!(
                store.put(sample_entry("persisted"), Duration::from_secs(60)).await,
                Err(StoreError::AlreadyExists(_))
            ));
        }

        let store = SqlitePendingStore::new(&path).await.unwrap();
        let entry = store.take_and_remove("persisted").await.unwrap();
        assert_eq!(entry.caller_context["channel"], "ops");
        assert_eq!(entry.prompt.as_deref(), Some("Which account?"));
        assert!(matches!(
            store.take_and_remove("persisted").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_returns_expired_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqlitePendingStore::new(dir.path().join("pending.db"))
            .await
            .unwrap();
        store.put(sample_entry("old"), Duration::ZERO).await.unwrap();
        store
            .put(sample_entry("new"), Duration::from_secs(60))
            .await
            .unwrap();

        let swept = store.sweep_expired().await.unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].follow_up_token, "old");
        assert_eq!(store.len().await.unwrap(), 1);
    }
}

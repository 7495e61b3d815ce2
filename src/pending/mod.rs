//! 待输入存储
//!
//! 后端回复「需要补充输入」时，任务在此暂存，键为一次性的 follow-up token。
//! 条目要么被 `take_and_remove` 恰好消费一次，要么过期后被清理；token 从不复用。

mod memory;
#[cfg(feature = "async-sqlite")]
mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{PendingBackend, PendingStoreSection};

pub use memory::MemoryPendingStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqlitePendingStore;

/// 一个暂停中的远端任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingFollowUp {
    pub follow_up_token: String,
    pub remote_task_id: String,
    pub session_id: String,
    pub action: String,
    /// 续传时重新发布到的主题
    pub topic: String,
    /// 调用方上下文，原样保存
    pub caller_context: serde_json::Value,
    pub prompt: Option<String>,
    pub created_at: DateTime<Utc>,
    /// 由 put 按 ttl 计算
    pub expires_at: DateTime<Utc>,
}

impl PendingFollowUp {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Follow-up token already exists: {0}")]
    AlreadyExists(String),

    #[error("Follow-up token not found: {0}")]
    NotFound(String),

    #[error("Pending store backend error: {0}")]
    Backend(String),
}

/// 待输入存储接口
#[async_trait]
pub trait PendingInputStore: Send + Sync {
    /// 以 entry.follow_up_token 为键插入，expires_at = now + ttl；键冲突返回 AlreadyExists
    async fn put(&self, entry: PendingFollowUp, ttl: Duration) -> Result<(), StoreError>;

    /// 原子地取出并删除；不存在或已过期返回 NotFound
    async fn take_and_remove(&self, token: &str) -> Result<PendingFollowUp, StoreError>;

    /// 删除所有过期条目并返回它们
    async fn sweep_expired(&self) -> Result<Vec<PendingFollowUp>, StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;
}

pub(crate) fn expiry_from(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// 创建待输入存储
///
/// 配置为 sqlite 且启用了 async-sqlite feature 时使用持久化存储；否则使用内存存储
pub async fn create_pending_store(section: &PendingStoreSection) -> Arc<dyn PendingInputStore> {
    #[cfg(feature = "async-sqlite")]
    if section.backend == PendingBackend::Sqlite {
        let path = section
            .path
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("bridge_pending.db"));
        match SqlitePendingStore::new(&path).await {
            Ok(store) => {
                tracing::info!("Using sqlite pending store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open sqlite pending store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if section.backend == PendingBackend::Sqlite {
        tracing::warn!("Sqlite pending store requested but async-sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory pending store");
    Arc::new(MemoryPendingStore::new())
}

#[cfg(test)]
pub(crate) fn sample_entry(token: &str) -> PendingFollowUp {
    let now = Utc::now();
    PendingFollowUp {
        follow_up_token: token.to_string(),
        remote_task_id: "task-1".to_string(),
        session_id: "session-1".to_string(),
        action: "open_account".to_string(),
        topic: "agents/accounts".to_string(),
        caller_context: serde_json::json!({"channel": "ops"}),
        prompt: Some("Which account?".to_string()),
        created_at: now,
        expires_at: now,
    }
}

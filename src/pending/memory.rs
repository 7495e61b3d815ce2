//! 内存待输入存储（DashMap，按 token 分片加锁）

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{expiry_from, PendingFollowUp, PendingInputStore, StoreError};

#[derive(Default)]
pub struct MemoryPendingStore {
    entries: DashMap<String, PendingFollowUp>,
}

impl MemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingInputStore for MemoryPendingStore {
    async fn put(&self, mut entry: PendingFollowUp, ttl: Duration) -> Result<(), StoreError> {
        entry.expires_at = expiry_from(Utc::now(), ttl);
        match self.entries.entry(entry.follow_up_token.clone()) {
            Entry::Occupied(occupied) => Err(StoreError::AlreadyExists(occupied.key().clone())),
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(())
            }
        }
    }

    async fn take_and_remove(&self, token: &str) -> Result<PendingFollowUp, StoreError> {
        let now = Utc::now();
        // 过期条目留给 sweep_expired，以便回收对应的远端任务
        match self.entries.remove_if(token, |_, entry| !entry.is_expired_at(now)) {
            Some((_, entry)) => Ok(entry),
            None => {
                if self.entries.contains_key(token) {
                    tracing::debug!(%token, "follow-up token expired");
                }
                Err(StoreError::NotFound(token.to_string()))
            }
        }
    }

    async fn sweep_expired(&self) -> Result<Vec<PendingFollowUp>, StoreError> {
        let now = Utc::now();
        let mut expired = Vec::new();
        self.entries.retain(|_, entry| {
            if entry.is_expired_at(now) {
                expired.push(entry.clone());
                false
            } else {
                true
            }
        });
        Ok(expired)
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::sample_entry;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_take_twice_is_not_found() {
        let store = MemoryPendingStore::new();
        store
            .put(sample_entry("abc"), Duration::from_secs(60))
            .await
            .unwrap();

        let entry = store.take_and_remove("abc").await.unwrap();
        assert_eq!(entry.remote_task_id, "task-1");
        assert!(entry.expires_at > entry.created_at);
        assert_eq!(
            store.take_and_remove("abc").await,
            Err(StoreError::NotFound("abc".into()))
        );
    }

    #[tokio::test]
    async fn test_collision_is_rejected() {
        let store = MemoryPendingStore::new();
        store
            .put(sample_entry("dup"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            store.put(sample_entry("dup"), Duration::from_secs(60)).await,
            Err(StoreError::AlreadyExists("dup".into()))
        );
    }

    #[tokio::test]
    async fn test_expired_entry_is_not_found_and_swept() {
        let store = MemoryPendingStore::new();
        store.put(sample_entry("old"), Duration::ZERO).await.unwrap();
        store
            .put(sample_entry("fresh"), Duration::from_secs(60))
            .await
            .unwrap();

        let swept = store.sweep_expired().await.unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].follow_up_token, "old");
        assert_eq!(store.len().await.unwrap(), 1);

        store.put(sample_entry("gone"), Duration::ZERO).await.unwrap();
        assert!(matches!(
            store.take_and_remove("gone").await,
            Err(StoreError::NotFound(_))
        ));
        let swept = store.sweep_expired().await.unwrap();
        assert_eq!(swept[0].follow_up_token, "gone");
    }

    #[tokio::test]
    async fn test_concurrent_take_only_one_succeeds() {
        let store = Arc::new(MemoryPendingStore::new());
        store
            .put(sample_entry("race"), Duration::from_secs(60))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.take_and_remove("race").await.is_ok()
            }));
        }
        let mut taken = 0;
        for handle in handles {
            if handle.await.unwrap() {
                taken += 1;
            }
        }
        assert_eq!(taken, 1);
    }
}

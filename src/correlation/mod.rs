//! 请求/回复关联
//!
//! 每个出站请求在发布前注册一个一次性槽位（oneshot），按 token 存放在分片并发表中。
//! 回复到达时按 token 取出槽位并投递；等待方在截止时间后自行移除。
//! 同一槽位只会被「投递」或「过期」其中之一终结，二者互斥。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

/// 等待回复失败的原因
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("deadline elapsed before a reply arrived")]
    Expired,

    #[error("waiter was cancelled")]
    Cancelled,
}

/// resolve 的结果：没有被认领的回复原样交还给调用方
#[derive(Debug)]
pub enum Resolution<R> {
    Delivered,
    Unclaimed(R),
}

impl<R> Resolution<R> {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Resolution::Delivered)
    }
}

struct PendingWaiter<R> {
    slot: oneshot::Sender<R>,
    created_at: DateTime<Utc>,
    deadline: Instant,
}

struct Inner<R> {
    waiters: DashMap<String, PendingWaiter<R>>,
}

/// 关联引擎；克隆共享同一张等待表
pub struct CorrelationEngine<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for CorrelationEngine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> Default for CorrelationEngine<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> CorrelationEngine<R> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                waiters: DashMap::new(),
            }),
        }
    }

    /// 生成新的关联 token（从不接受调用方提供的 token）
    pub fn next_token(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// 注册一个等待者，deadline = now + timeout
    pub fn register(&self, timeout: Duration) -> Waiter<R> {
        let token = self.next_token();
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        self.inner.waiters.insert(
            token.clone(),
            PendingWaiter {
                slot: tx,
                created_at: Utc::now(),
                deadline,
            },
        );
        tracing::trace!(%token, timeout_ms = timeout.as_millis() as u64, "waiter registered");
        Waiter {
            token,
            deadline,
            rx: Some(rx),
            inner: Arc::clone(&self.inner),
        }
    }

    /// 投递回复；未知、过期或重复的 token 返回 Unclaimed
    pub fn resolve(&self, token: &str, reply: R) -> Resolution<R> {
        let Some((_, waiter)) = self.inner.waiters.remove(token) else {
            tracing::debug!(%token, "reply for unknown or expired token");
            return Resolution::Unclaimed(reply);
        };
        match waiter.slot.send(reply) {
            Ok(()) => {
                let waited_ms = (Utc::now() - waiter.created_at).num_milliseconds();
                tracing::debug!(%token, waited_ms, "reply delivered");
                Resolution::Delivered
            }
            Err(reply) => {
                tracing::debug!(%token, "waiter gone before reply was delivered");
                Resolution::Unclaimed(reply)
            }
        }
    }

    /// 在途等待者数量
    pub fn outstanding(&self) -> usize {
        self.inner.waiters.len()
    }

    /// 清理等待方已放弃的条目，返回清理数量
    pub fn sweep_expired(&self) -> usize {
        let before = self.inner.waiters.len();
        self.inner.waiters.retain(|_, w| !w.slot.is_closed());
        let removed = before.saturating_sub(self.inner.waiters.len());
        if removed > 0 {
            tracing::debug!(removed, "swept abandoned waiters");
        }
        removed
    }

    /// 丢弃全部等待者；等待中的调用得到 Cancelled
    pub fn clear(&self) {
        let count = self.inner.waiters.len();
        self.inner.waiters.clear();
        if count > 0 {
            tracing::info!(count, "cancelled outstanding waiters");
        }
    }
}

/// 单个请求的等待句柄；未等待就丢弃时自动注销
pub struct Waiter<R> {
    token: String,
    deadline: Instant,
    rx: Option<oneshot::Receiver<R>>,
    inner: Arc<Inner<R>>,
}

impl<R> Waiter<R> {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// 挂起直到回复到达或截止；与截止同时到达的回复算作成功
    pub async fn wait(mut self) -> Result<R, WaitError> {
        let Some(mut rx) = self.rx.take() else {
            return Err(WaitError::Cancelled);
        };
        match tokio::time::timeout_at(self.deadline, &mut rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(WaitError::Cancelled),
            Err(_) => {
                self.inner.waiters.remove(&self.token);
                // 关闭后 resolve 无法再投递；已经投递的值仍可取出
                rx.close();
                match rx.try_recv() {
                    Ok(reply) => Ok(reply),
                    Err(_) => {
                        tracing::debug!(token = %self.token, "waiter expired");
                        Err(WaitError::Expired)
                    }
                }
            }
        }
    }
}

impl<R> Drop for Waiter<R> {
    fn drop(&mut self) {
        self.inner.waiters.remove(&self.token);
    }
}

//! 进程内 broker
//!
//! 每个订阅对应一个无界 mpsc 通道；发布时按模式匹配投递，并顺带清理已关闭的订阅。
//! `set_available(false)` 模拟 broker 断开，此时发布返回 `TransportError::Unavailable`。
//! 没有任何订阅匹配的发布不算错误，但会计入 `undelivered()`。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use super::{
    topic_matches, validate_pattern, validate_topic, Headers, InboundMessage, InboundStream,
    TransportError, TransportPort,
};

struct Subscriber {
    pattern: String,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

/// 内存发布/订阅实现（单进程内共享）
pub struct MemoryTransport {
    subscribers: RwLock<Vec<Subscriber>>,
    available: AtomicBool,
    undelivered: AtomicU64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
            undelivered: AtomicU64::new(0),
        }
    }

    /// 切换 broker 可用性
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// 没有投递给任何订阅者的发布次数
    pub fn undelivered(&self) -> u64 {
        self.undelivered.load(Ordering::Relaxed)
    }

    /// 当前活跃订阅数
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .await
            .iter()
            .filter(|s| !s.tx.is_closed())
            .count()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportPort for MemoryTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        headers: Headers,
    ) -> Result<(), TransportError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("memory broker offline".to_string()));
        }
        validate_topic(topic)?;

        let message = InboundMessage {
            topic: topic.to_string(),
            payload,
            headers,
        };

        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|s| !s.tx.is_closed());

        let mut delivered = 0usize;
        for sub in subscribers.iter() {
            if topic_matches(&sub.pattern, topic) && sub.tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            self.undelivered.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(topic, "no subscriber for topic, message dropped");
        } else {
            tracing::trace!(topic, delivered, "memory transport publish");
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<InboundStream, TransportError> {
        validate_pattern(pattern)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().await.push(Subscriber {
            pattern: pattern.to_string(),
            tx,
        });

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });
        Ok(Box::pin(stream))
    }
}

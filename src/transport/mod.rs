//! 发布/订阅传输抽象
//!
//! 桥接核心只依赖 `TransportPort`：`publish(topic, payload, headers)` 与
//! `subscribe(pattern)`。不同主题之间不保证顺序；同一主题内的顺序取决于底层 broker。
//! 发布失败以 `TransportError` 返回给调用方，端口本身不重试。
//!
//! 主题为 `/` 分隔的层级结构，订阅模式支持两种通配：
//! - `*`：恰好匹配一层
//! - `>`：只能出现在最后一层，匹配剩余的一层或多层

mod memory;

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

pub use memory::MemoryTransport;

/// 消息头（字符串键值）
pub type Headers = HashMap<String, String>;

/// 关联 token 所在的消息头
pub const HEADER_CORRELATION_TOKEN: &str = "correlation-token";
/// 回复主题所在的消息头
pub const HEADER_REPLY_TO: &str = "reply-to";
pub const HEADER_CONTENT_TYPE: &str = "content-type";

/// 订阅收到的一条消息
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl InboundMessage {
    pub fn correlation_token(&self) -> Option<&str> {
        self.headers.get(HEADER_CORRELATION_TOKEN).map(String::as_str)
    }
}

/// 订阅得到的入站消息流
pub type InboundStream = Pin<Box<dyn Stream<Item = InboundMessage> + Send>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Publish to '{topic}' failed: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("Invalid topic pattern '{0}'")]
    InvalidPattern(String),

    #[error("Invalid topic '{0}'")]
    InvalidTopic(String),
}

/// 发布/订阅 broker 抽象
#[async_trait]
pub trait TransportPort: Send + Sync {
    /// 发布一条消息；允许并发调用
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        headers: Headers,
    ) -> Result<(), TransportError>;

    /// 按模式订阅，返回入站消息流
    async fn subscribe(&self, pattern: &str) -> Result<InboundStream, TransportError>;
}

/// 校验订阅模式：不能为空层，`>` 只能出现在最后一层
pub fn validate_pattern(pattern: &str) -> Result<(), TransportError> {
    let levels: Vec<&str> = pattern.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.is_empty() {
            return Err(TransportError::InvalidPattern(pattern.to_string()));
        }
        if *level == ">" && i != levels.len() - 1 {
            return Err(TransportError::InvalidPattern(pattern.to_string()));
        }
    }
    Ok(())
}

/// 校验发布主题：非空层，且不含通配符
pub fn validate_topic(topic: &str) -> Result<(), TransportError> {
    let ok = topic
        .split('/')
        .all(|level| !level.is_empty() && level != "*" && level != ">");
    if ok {
        Ok(())
    } else {
        Err(TransportError::InvalidTopic(topic.to_string()))
    }
}

/// 判断主题是否匹配订阅模式
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

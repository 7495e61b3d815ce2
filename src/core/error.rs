//! 桥接错误类型
//!
//! 调用方看到的所有失败都是带类型的 BridgeError，不会被静默丢弃；
//! 进程级崩溃由 Supervisor 本地重启处理，不经过这里。

use thiserror::Error;

use crate::actions::ResponseFormat;
use crate::pending::StoreError;
use crate::supervisor::{SupervisorError, SupervisorState};
use crate::transport::TransportError;

/// 桥接过程中可能出现的错误（传输、超时、后端失败、续接令牌、进程不可用等）
#[derive(Error, Debug)]
pub enum BridgeError {
    /// 发布 / 连接失败，不自动重试
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// 截止时间内没有收到回复（区别于后端明确报告的失败）
    #[error("No reply for request {token} within {timeout_ms}ms")]
    Timeout { token: String, timeout_ms: u64 },

    /// 后端明确报告任务失败，原样透传失败详情
    #[error("Backend task {task_id} failed: {detail}")]
    BackendTaskFailure { task_id: String, detail: String },

    #[error("Follow-up token expired or unknown: {0}")]
    UnknownFollowUpToken(String),

    /// 需要发送请求时 Supervisor 不在 Running，立即失败而不是排队
    #[error("Backend process unavailable (state: {0})")]
    ProcessUnavailable(SupervisorState),

    /// 监管器配置或启动失败
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Reply is not valid {format}: {detail}")]
    ResponseFormat {
        format: ResponseFormat,
        detail: String,
    },

    #[error("Pending input store error: {0}")]
    Store(#[from] StoreError),

    /// 等待中的请求因桥接关闭而被放弃
    #[error("Request {0} cancelled: bridge shutting down")]
    Cancelled(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl BridgeError {
    /// 面向调用方的稳定错误码（与错误文案解耦）
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Transport(_) => "transport_error",
            BridgeError::Timeout { .. } => "timeout",
            BridgeError::BackendTaskFailure { .. } => "backend_task_failure",
            BridgeError::UnknownFollowUpToken(_) => "unknown_follow_up_token",
            BridgeError::ProcessUnavailable(_) => "process_unavailable",
            BridgeError::Supervisor(_) => "supervisor_error",
            BridgeError::UnknownAction(_) => "unknown_action",
            BridgeError::InvalidParameter { .. } => "invalid_parameter",
            BridgeError::ResponseFormat { .. } => "response_format",
            BridgeError::Store(_) => "store_error",
            BridgeError::Cancelled(_) => "cancelled",
            BridgeError::ConfigError(_) => "config_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = BridgeError::Timeout {
            token: "req_1".to_string(),
            timeout_ms: 15000,
        };
        assert_eq!(err.to_string(), "No reply for request req_1 within 15000ms");
        assert_eq!(err.code(), "timeout");
    }

    #[test]
    fn test_transport_error_converts() {
        let err: BridgeError = TransportError::Unavailable("broker down".to_string()).into();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert_eq!(err.code(), "transport_error");
    }

    #[test]
    fn test_process_unavailable_mentions_state() {
        let err = BridgeError::ProcessUnavailable(SupervisorState::Crashed);
        assert!(err.to_string().contains("crashed"));
    }
}

//! 与后端之间的消息格式（JSON）

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ContentPart;

/// 发往后端的请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub session_id: String,
    pub task_id: String,
    pub request_token: String,
    pub reply_to: String,
    pub content: Vec<ContentPart>,
    /// 按动作定义绑定后的参数载荷
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

/// 后端回复中的任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyState {
    Completed,
    InputRequired,
    Failed,
}

/// 后端回复
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendReply {
    /// 缺省时由 correlation-token 头补齐
    #[serde(default)]
    pub request_token: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    pub state: ReplyState,
    #[serde(default)]
    pub parts: Vec<ContentPart>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl BackendReply {
    pub fn completed(token: impl Into<String>, parts: Vec<ContentPart>) -> Self {
        Self {
            request_token: Some(token.into()),
            task_id: None,
            state: ReplyState::Completed,
            parts,
            prompt: None,
            error: None,
        }
    }

    pub fn input_required(token: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            request_token: Some(token.into()),
            task_id: None,
            state: ReplyState::InputRequired,
            parts: Vec::new(),
            prompt: Some(prompt.into()),
            error: None,
        }
    }

    pub fn failed(token: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_token: Some(token.into()),
            task_id: None,
            state: ReplyState::Failed,
            parts: Vec::new(),
            prompt: None,
            error: Some(error.into()),
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

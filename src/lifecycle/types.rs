//! 调用方接口：调用请求、续传输入、调用结果

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::BridgeError;
use crate::task::{ContentPart, FileRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokeMode {
    /// 等待回复后返回
    Sync,
    /// 发布后立即返回句柄，结果通过 poll 取
    Async,
}

/// 一次调用
#[derive(Debug, Clone, Deserialize)]
pub struct InvokeRequest {
    pub action: String,
    #[serde(default)]
    pub content: Vec<ContentPart>,
    #[serde(default)]
    pub external_session_id: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// 覆盖动作与全局的回复超时
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub mode: Option<InvokeMode>,
    /// 调用方上下文，暂停时原样保存
    #[serde(default)]
    pub caller_context: Value,
}

impl InvokeRequest {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            content: Vec::new(),
            external_session_id: None,
            params: Map::new(),
            timeout_ms: None,
            mode: None,
            caller_context: Value::Null,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.content.push(ContentPart::text(text));
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_session(mut self, external_session_id: impl Into<String>) -> Self {
        self.external_session_id = Some(external_session_id.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_mode(mut self, mode: InvokeMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_caller_context(mut self, context: Value) -> Self {
        self.caller_context = context;
        self
    }
}

/// 对一个暂停任务的补充输入
#[derive(Debug, Clone, Deserialize)]
pub struct FollowUpInput {
    pub follow_up_token: String,
    pub new_user_input: Vec<ContentPart>,
}

impl FollowUpInput {
    pub fn text(follow_up_token: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            follow_up_token: follow_up_token.into(),
            new_user_input: vec![ContentPart::text(text)],
        }
    }
}

/// 已完成任务的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedResponse {
    pub task_id: String,
    /// 拼接后的文本
    pub message: String,
    pub files: Vec<FileRef>,
    pub data: Vec<Value>,
    /// 按 response_format 转换后的内容
    pub body: Value,
}

/// 调用结果；失败与超时走 Err
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(CompletedResponse),
    NeedsInput {
        task_id: String,
        follow_up_token: String,
        prompt: Option<String>,
    },
    /// 异步模式：已发布，结果稍后 poll
    Accepted { task_id: String, handle: String },
}

impl TaskOutcome {
    pub fn task_id(&self) -> &str {
        match self {
            TaskOutcome::Completed(done) => &done.task_id,
            TaskOutcome::NeedsInput { task_id, .. } | TaskOutcome::Accepted { task_id, .. } => task_id,
        }
    }

    pub fn to_tool_response(&self) -> ToolResponse {
        ToolResponse::from(self)
    }
}

/// 返回给调用方（工具调用）的 JSON 形态
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub needs_input: bool,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_up_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

impl From<&TaskOutcome> for ToolResponse {
    fn from(outcome: &TaskOutcome) -> Self {
        let mut response = ToolResponse {
            needs_input: false,
            task_id: outcome.task_id().to_string(),
            follow_up_token: None,
            prompt: None,
            message: None,
            data: None,
            files: Vec::new(),
            handle: None,
        };
        match outcome {
            TaskOutcome::Completed(done) => {
                response.message = Some(done.message.clone());
                response.data = Some(done.body.clone());
                response.files = done.files.clone();
            }
            TaskOutcome::NeedsInput {
                follow_up_token,
                prompt,
                ..
            } => {
                response.needs_input = true;
                response.follow_up_token = Some(follow_up_token.clone());
                response.prompt = prompt.clone();
            }
            TaskOutcome::Accepted { handle, .. } => {
                response.handle = Some(handle.clone());
            }
        }
        response
    }
}

/// poll 的结果
#[derive(Debug)]
pub enum AsyncStatus {
    Pending,
    /// 结果只会被取走一次
    Done(Result<TaskOutcome, BridgeError>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_needs_input_shape() {
        let outcome = TaskOutcome::NeedsInput {
            task_id: "t1".into(),
            follow_up_token: "fu-1".into(),
            prompt: Some("Which account?".into()),
        };
        let value = serde_json::to_value(outcome.to_tool_response()).unwrap();
        assert_eq!(
            value,
            json!({
                "needsInput": true,
                "taskId": "t1",
                "followUpToken": "fu-1",
                "prompt": "Which account?"
            })
        );
    }

    #[test]
    fn test_completed_shape() {
        let outcome = TaskOutcome::Completed(CompletedResponse {
            task_id: "t2".into(),
            message: "{\"temp\":18}".into(),
            files: vec![],
            data: vec![],
            body: json!({"temp": 18}),
        });
        let value = serde_json::to_value(outcome.to_tool_response()).unwrap();
        assert_eq!(value["needsInput"], false);
        assert_eq!(value["data"], json!({"temp": 18}));
        assert!(value.get("files").is_none());
    }

    #[test]
    fn test_request_builder() {
        let req = InvokeRequest::new("weather")
            .with_param("city", "Paris")
            .with_session("chat-1")
            .with_mode(InvokeMode::Async);
        assert_eq!(req.params["city"], "Paris");
        assert_eq!(req.mode, Some(InvokeMode::Async));
        assert!(req.caller_context.is_null());
    }
}

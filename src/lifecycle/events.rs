//! 任务生命周期事件：每次状态转移都会上报给 TaskEventSink

use std::sync::{Arc, Mutex};

use serde::Serialize;

/// 生命周期转移事件（可序列化为 JSON）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// 参数已绑定，请求即将发布
    Building {
        action: String,
        task_id: String,
        session_id: String,
    },
    /// 已发布，等待回复
    AwaitingReply { task_id: String, token: String },
    /// 异步模式：已发布，句柄已返回
    Accepted { task_id: String, handle: String },
    Completed { task_id: String },
    /// 后端要求补充输入
    AwaitingInput {
        task_id: String,
        follow_up_token: String,
    },
    /// 续传
    Resumed {
        task_id: String,
        follow_up_token: String,
    },
    Failed { task_id: String, detail: String },
    TimedOut { task_id: String, token: String },
    /// 待输入条目过期，任务被回收
    Expired { task_id: String },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Building { task_id, .. }
            | TaskEvent::AwaitingReply { task_id, .. }
            | TaskEvent::Accepted { task_id, .. }
            | TaskEvent::Completed { task_id }
            | TaskEvent::AwaitingInput { task_id, .. }
            | TaskEvent::Resumed { task_id, .. }
            | TaskEvent::Failed { task_id, .. }
            | TaskEvent::TimedOut { task_id, .. }
            | TaskEvent::Expired { task_id } => task_id,
        }
    }
}

pub trait TaskEventSink: Send + Sync {
    fn emit(&self, event: TaskEvent);
}

/// 默认：丢弃事件
pub struct NoopEventSink;

impl TaskEventSink for NoopEventSink {
    fn emit(&self, _event: TaskEvent) {}
}

/// 写入 tracing（debug 级别，JSON 形式）
pub struct TracingEventSink;

impl TaskEventSink for TracingEventSink {
    fn emit(&self, event: TaskEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::debug!(task_id = %event.task_id(), event = %json, "task event"),
            Err(e) => tracing::warn!("serialize task event: {e}"),
        }
    }
}

/// 记录全部事件，供测试断言
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<TaskEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl TaskEventSink for RecordingEventSink {
    fn emit(&self, event: TaskEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

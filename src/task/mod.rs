//! 远端任务模型：内容片段、线协议、任务登记表

mod content;
mod protocol;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

pub use content::{flatten, ContentPart, FileRef, FlattenedContent};
pub use protocol::{BackendReply, OutboundRequest, ReplyState};

/// 远端任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteTaskState {
    Submitted,
    AwaitingInput,
    Completed,
    Failed,
}

impl RemoteTaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RemoteTaskState::Completed | RemoteTaskState::Failed)
    }
}

impl From<ReplyState> for RemoteTaskState {
    fn from(state: ReplyState) -> Self {
        match state {
            ReplyState::Completed => RemoteTaskState::Completed,
            ReplyState::InputRequired => RemoteTaskState::AwaitingInput,
            ReplyState::Failed => RemoteTaskState::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoteTask {
    pub remote_task_id: String,
    pub session_id: String,
    pub action: String,
    pub state: RemoteTaskState,
    pub created_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
}

/// 进行中的远端任务；终态或其待输入条目过期时移除
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, RemoteTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 首次提交：分配任务 id
    pub fn create(&self, session_id: &str, action: &str) -> RemoteTask {
        let now = Utc::now();
        let task = RemoteTask {
            remote_task_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            action: action.to_string(),
            state: RemoteTaskState::Submitted,
            created_at: now,
            last_update_at: now,
        };
        self.tasks.insert(task.remote_task_id.clone(), task.clone());
        task
    }

    /// 续传时重新登记（任务可能已被清理）
    pub fn resubmit(&self, remote_task_id: &str, session_id: &str, action: &str) {
        let now = Utc::now();
        self.tasks
            .entry(remote_task_id.to_string())
            .and_modify(|t| {
                t.state = RemoteTaskState::Submitted;
                t.last_update_at = now;
            })
            .or_insert_with(|| RemoteTask {
                remote_task_id: remote_task_id.to_string(),
                session_id: session_id.to_string(),
                action: action.to_string(),
                state: RemoteTaskState::Submitted,
                created_at: now,
                last_update_at: now,
            });
    }

    /// 记录回复带来的状态变化；后端给出了自己的任务 id 时改用它，返回生效的 id
    pub fn apply_reply(&self, local_id: &str, backend_id: Option<&str>, state: RemoteTaskState) -> String {
        let effective = match backend_id {
            Some(id) if id != local_id => {
                if let Some((_, mut task)) = self.tasks.remove(local_id) {
                    task.remote_task_id = id.to_string();
                    self.tasks.insert(id.to_string(), task);
                }
                id.to_string()
            }
            _ => local_id.to_string(),
        };

        if state.is_terminal() {
            self.tasks.remove(&effective);
        } else if let Some(mut task) = self.tasks.get_mut(&effective) {
            task.state = state;
            task.last_update_at = Utc::now();
        }
        effective
    }

    pub fn get(&self, remote_task_id: &str) -> Option<RemoteTask> {
        self.tasks.get(remote_task_id).map(|t| t.clone())
    }

    pub fn remove(&self, remote_task_id: &str) -> Option<RemoteTask> {
        self.tasks.remove(remote_task_id).map(|(_, t)| t)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn clear(&self) {
        self.tasks.clear();
    }
}

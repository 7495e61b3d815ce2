//! connect 模式：后端已在外部运行，没有可持有的进程

use async_trait::async_trait;
use tokio::sync::watch;

use super::{BackendSupervisor, SupervisorError, SupervisorSnapshot, SupervisorState};

/// 外部端点：构造即 Running，从不重启；只有显式关闭会改变状态
pub struct ExternalEndpoint {
    url: String,
    state_tx: watch::Sender<SupervisorState>,
}

impl ExternalEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Running);
        Self {
            url: url.into(),
            state_tx,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BackendSupervisor for ExternalEndpoint {
    async fn start(&self) -> Result<(), SupervisorError> {
        Ok(())
    }

    fn state(&self) -> SupervisorState {
        *self.state_tx.borrow()
    }

    fn snapshot(&self) -> SupervisorSnapshot {
        SupervisorSnapshot {
            state: self.state(),
            target: self.url.clone(),
            pid: None,
            restart_count: 0,
            last_crash_at: None,
            last_exit_code: None,
        }
    }

    fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    async fn shutdown(&self) {
        self.state_tx.send_replace(SupervisorState::Disabled);
    }
}

//! 后端进程监管
//!
//! 状态机：Stopped → Starting → Running → Crashed → Starting（重试）→ …
//! Disabled 为终态：崩溃后未开启自动重启，或显式关闭。
//!
//! 两种实现共用 `BackendSupervisor` 接口，生命周期控制器不需要区分「进程是不是自己的」：
//! - **ProcessSupervisor**（launch 模式）：拉起并持有子进程，崩溃后指数退避重启
//! - **ExternalEndpoint**（connect 模式）：后端已在某个 URL 运行，立即报告 Running，从不重启

mod backoff;
mod endpoint;
mod process;
mod readiness;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::{ReadinessKind, SupervisorMode, SupervisorSection};

pub use backoff::BackoffPolicy;
pub use endpoint::ExternalEndpoint;
pub use process::{
    ChildHandle, CommandLauncher, LaunchOptions, LaunchSpec, ProcessLauncher, ProcessSupervisor,
};
pub use readiness::ReadinessProbe;

/// Supervisor 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Crashed,
    /// 终态：不再尝试拉起
    Disabled,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::Stopped => write!(f, "stopped"),
            SupervisorState::Starting => write!(f, "starting"),
            SupervisorState::Running => write!(f, "running"),
            SupervisorState::Crashed => write!(f, "crashed"),
            SupervisorState::Disabled => write!(f, "disabled"),
        }
    }
}

/// 监管过程中的事件（诊断与测试用）
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Spawned { pid: Option<u32>, attempt: u32 },
    Ready { pid: Option<u32> },
    StartupFailed { reason: String },
    Exited { code: Option<i32> },
    RestartScheduled { attempt: u32, delay: Duration },
    /// 持续运行超过稳定窗口，重启计数归零
    CounterReset,
    Disabled { reason: String },
    Stopped,
}

/// 当前监管状态快照
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorSnapshot {
    pub state: SupervisorState,
    pub target: String,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub last_crash_at: Option<DateTime<Utc>>,
    pub last_exit_code: Option<i32>,
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Supervisor not configured: {0}")]
    NotConfigured(String),

    #[error("Supervisor already started")]
    AlreadyStarted,

    #[error("Backend did not become ready within {0:?}")]
    NotReady(Duration),
}

/// 后端存活性接口
#[async_trait]
pub trait BackendSupervisor: Send + Sync {
    /// 开始监管（launch 模式下在后台拉起进程，立即返回）
    async fn start(&self) -> Result<(), SupervisorError>;

    fn state(&self) -> SupervisorState;

    /// 纯查询：仅 Running 时为 true
    fn is_ready(&self) -> bool {
        self.state() == SupervisorState::Running
    }

    fn snapshot(&self) -> SupervisorSnapshot;

    /// 订阅状态变化
    fn subscribe(&self) -> watch::Receiver<SupervisorState>;

    /// 显式关闭：回收进程，进入 Disabled
    async fn shutdown(&self);

    /// 等待进入 Running；进入 Disabled 或超时则返回错误
    async fn wait_until_ready(&self, timeout: Duration) -> Result<(), SupervisorError> {
        let mut rx = self.subscribe();
        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    SupervisorState::Running => return true,
                    SupervisorState::Disabled => return false,
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(true) => Ok(()),
            _ => Err(SupervisorError::NotReady(timeout)),
        }
    }
}

/// 根据配置构建 Supervisor：有 command 则 launch，有 url 则 connect
pub fn from_config(
    section: &SupervisorSection,
) -> Result<Arc<dyn BackendSupervisor>, SupervisorError> {
    match section.resolved_mode()? {
        SupervisorMode::Connect => {
            let url = section
                .url
                .clone()
                .ok_or_else(|| SupervisorError::NotConfigured("connect mode requires url".into()))?;
            tracing::info!(%url, "connecting to existing backend");
            Ok(Arc::new(ExternalEndpoint::new(url)))
        }
        SupervisorMode::Launch => {
            let command = section.command.clone().ok_or_else(|| {
                SupervisorError::NotConfigured("launch mode requires command".into())
            })?;
            let spec = LaunchSpec {
                command,
                args: section.args.clone(),
                env: section.env.clone(),
                working_dir: section.working_dir.clone(),
            };
            let options = LaunchOptions {
                readiness: readiness_probe(section)?,
                startup_timeout: Duration::from_secs(section.startup_timeout_secs),
                restart_on_crash: section.restart_on_crash,
                backoff: section.backoff,
                stable_after: Duration::from_secs(section.stable_after_secs),
            };
            tracing::info!(command = %spec.command, "launch mode: backend process will be supervised");
            Ok(Arc::new(ProcessSupervisor::new(spec, options)))
        }
    }
}

fn readiness_probe(section: &SupervisorSection) -> Result<ReadinessProbe, SupervisorError> {
    let readiness = &section.readiness;
    match readiness.kind {
        ReadinessKind::Delay => Ok(ReadinessProbe::Delay(Duration::from_millis(
            readiness.delay_ms,
        ))),
        ReadinessKind::Port => {
            let port = readiness.port.ok_or_else(|| {
                SupervisorError::NotConfigured("readiness.kind = port requires readiness.port".into())
            })?;
            Ok(ReadinessProbe::Port {
                host: readiness.host.clone(),
                port,
            })
        }
        ReadinessKind::Health => {
            let url = readiness.health_url.clone().ok_or_else(|| {
                SupervisorError::NotConfigured(
                    "readiness.kind = health requires readiness.health_url".into(),
                )
            })?;
            Ok(ReadinessProbe::Health { url })
        }
    }
}

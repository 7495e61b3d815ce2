//! 优雅关闭
//!
//! `ShutdownManager` 汇总关闭请求（信号、后端被禁用、致命错误），只记录第一个原因；
//! `ShutdownCoordinator` 在关闭时依次运行已注册的清理任务，每个任务单独限时，
//! 超时或失败只记日志，不影响后续任务。

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 后端进入 Disabled，无法再服务请求
    BackendDisabled,
    FatalError(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::UserInitiated => write!(f, "user initiated"),
            ShutdownReason::Signal => write!(f, "terminate signal"),
            ShutdownReason::BackendDisabled => write!(f, "backend disabled"),
            ShutdownReason::FatalError(detail) => write!(f, "fatal error: {detail}"),
        }
    }
}

/// 关闭信号
pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: watch::Sender<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = watch::channel(None);
        Self {
            token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 后台任务用来感知关闭
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 请求关闭；返回 false 表示之前已有关闭原因
    pub fn shutdown(&self, reason: ShutdownReason) -> bool {
        let first = self.reason_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        if first {
            tracing::info!(%reason, "shutdown requested");
        } else {
            tracing::debug!(%reason, "shutdown already in progress");
        }
        self.token.cancel();
        first
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason_tx.borrow().clone()
    }

    /// 等待关闭，返回第一个关闭原因
    pub async fn wait(&self) -> Option<ShutdownReason> {
        self.token.cancelled().await;
        self.reason()
    }

    /// 监听 Ctrl+C 与 SIGTERM
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = manager.token.cancelled() => return,
                received = tokio::signal::ctrl_c() => match received {
                    Ok(()) => ShutdownReason::UserInitiated,
                    Err(e) => {
                        tracing::warn!("ctrl-c handler unavailable: {e}");
                        return;
                    }
                },
                _ = terminate() => ShutdownReason::Signal,
            };
            manager.shutdown(reason);
        });
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("SIGTERM handler unavailable: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// 关闭时执行的清理任务
#[async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 用于日志
    fn name(&self) -> &'static str;
}

/// 一轮清理的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub completed: Vec<&'static str>,
    pub failed: Vec<&'static str>,
    pub timed_out: Vec<&'static str>,
}

/// 按注册顺序运行清理任务
pub struct ShutdownCoordinator {
    tasks: Vec<Arc<dyn ShutdownCleanup>>,
    per_task_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            per_task_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, per_task_timeout: Duration) -> Self {
        self.per_task_timeout = per_task_timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Arc::new(task));
    }

    pub async fn run_cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for task in &self.tasks {
            let name = task.name();
            match tokio::time::timeout(self.per_task_timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!(task = name, "cleanup finished");
                    report.completed.push(name);
                }
                Ok(Err(e)) => {
                    tracing::warn!(task = name, "cleanup failed: {e:#}");
                    report.failed.push(name);
                }
                Err(_) => {
                    tracing::warn!(
                        task = name,
                        timeout_ms = self.per_task_timeout.as_millis() as u64,
                        "cleanup timed out"
                    );
                    report.timed_out.push(name);
                }
            }
        }
        report
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// 运行 app 直到它结束或收到关闭请求，然后运行清理
pub async fn run_with_graceful_shutdown<F>(
    manager: Arc<ShutdownManager>,
    app: F,
    coordinator: &ShutdownCoordinator,
) -> CleanupReport
where
    F: Future<Output = ()>,
{
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => tracing::info!("application finished"),
        reason = manager.wait() => {
            let reason = reason.map(|r| r.to_string()).unwrap_or_else(|| "unknown".to_string());
            tracing::info!(%reason, "shutting down");
        }
    }

    coordinator.run_cleanup().await
}

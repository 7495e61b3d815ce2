//! launch 模式：拉起、监控并在崩溃后重启后端进程
//!
//! 监管循环运行在独立的 tokio 任务中，与任何在途请求都不同步：
//! 进程崩溃对所有请求的影响相同，在途请求由各自的截止时间自然超时。

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::{
    BackendSupervisor, BackoffPolicy, ReadinessProbe, SupervisorError, SupervisorEvent,
    SupervisorSnapshot, SupervisorState,
};

/// 要拉起的命令
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// 监管参数
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub readiness: ReadinessProbe,
    pub startup_timeout: Duration,
    pub restart_on_crash: bool,
    pub backoff: BackoffPolicy,
    /// 持续 Running 超过该时长后重启计数归零（防抖）
    pub stable_after: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            readiness: ReadinessProbe::Delay(Duration::from_secs(1)),
            startup_timeout: Duration::from_secs(30),
            restart_on_crash: true,
            backoff: BackoffPolicy::default(),
            stable_after: Duration::from_secs(60),
        }
    }
}

/// 已拉起的子进程句柄
#[async_trait]
pub trait ChildHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// 等待退出，返回退出码（被信号终止时为 None）；必须可安全取消
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    async fn kill(&mut self);
}

/// 进程拉起器
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> std::io::Result<Box<dyn ChildHandle>>;
}

/// 基于 tokio::process 的拉起器；句柄被丢弃时子进程随之被杀
pub struct CommandLauncher;

struct TokioChild {
    child: Child,
}

#[async_trait]
impl ChildHandle for TokioChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        self.child.wait().await.map(|status| status.code())
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!("kill backend process: {e}");
        }
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> std::io::Result<Box<dyn ChildHandle>> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        let child = command.spawn()?;
        Ok(Box::new(TokioChild { child }))
    }
}

#[derive(Debug, Default)]
struct ProcessRecord {
    pid: Option<u32>,
    restart_count: u32,
    last_crash_at: Option<chrono::DateTime<Utc>>,
    last_exit_code: Option<i32>,
}

struct Shared {
    spec: LaunchSpec,
    options: LaunchOptions,
    launcher: Arc<dyn ProcessLauncher>,
    state_tx: watch::Sender<SupervisorState>,
    events_tx: broadcast::Sender<SupervisorEvent>,
    record: Mutex<ProcessRecord>,
    cancel: CancellationToken,
}

enum RunOutcome {
    Cancelled,
    Exited(Option<i32>),
}

enum StartupStep {
    Cancelled,
    Probed(Result<(), String>),
    Exited(std::io::Result<Option<i32>>),
}

enum RunningStep {
    Cancelled,
    Stable,
    Exited(std::io::Result<Option<i32>>),
}

impl Shared {
    fn record(&self) -> MutexGuard<'_, ProcessRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(command = %self.spec.command, from = %previous, to = %state, "supervisor state");
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events_tx.send(event);
    }

    async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.set_state(SupervisorState::Starting);

            let code = match self.run_once(attempt).await {
                RunOutcome::Cancelled => break,
                RunOutcome::Exited(code) => code,
            };
            self.on_crash(code);

            if !self.options.restart_on_crash {
                tracing::error!(
                    command = %self.spec.command,
                    "backend crashed and restart-on-crash is disabled; giving up"
                );
                self.set_state(SupervisorState::Disabled);
                self.emit(SupervisorEvent::Disabled {
                    reason: "restart on crash disabled".to_string(),
                });
                return;
            }

            let restarts = {
                let mut record = self.record();
                record.restart_count += 1;
                record.restart_count
            };
            let delay = self.options.backoff.delay_for(restarts);
            tracing::warn!(
                command = %self.spec.command,
                attempt = restarts,
                delay_ms = delay.as_millis() as u64,
                "scheduling backend restart"
            );
            self.emit(SupervisorEvent::RestartScheduled {
                attempt: restarts,
                delay,
            });

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.record().pid = None;
        self.set_state(SupervisorState::Disabled);
        self.emit(SupervisorEvent::Stopped);
        tracing::info!(command = %self.spec.command, "backend supervision stopped");
    }

    async fn run_once(&self, attempt: u32) -> RunOutcome {
        let mut child = match self.launcher.launch(&self.spec).await {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(command = %self.spec.command, "failed to spawn backend: {e}");
                self.emit(SupervisorEvent::StartupFailed {
                    reason: format!("spawn failed: {e}"),
                });
                return RunOutcome::Exited(None);
            }
        };

        let pid = child.pid();
        self.record().pid = pid;
        self.emit(SupervisorEvent::Spawned { pid, attempt });
        tracing::info!(command = %self.spec.command, ?pid, attempt, "backend process spawned");

        let step = tokio::select! {
            _ = self.cancel.cancelled() => StartupStep::Cancelled,
            probed = self.options.readiness.wait_ready(self.options.startup_timeout) => StartupStep::Probed(probed),
            status = child.wait() => StartupStep::Exited(status),
        };

        match step {
            StartupStep::Cancelled => {
                child.kill().await;
                return RunOutcome::Cancelled;
            }
            StartupStep::Exited(status) => {
                let code = exit_code(status);
                tracing::warn!(command = %self.spec.command, exit_code = ?code, "backend exited during startup");
                self.emit(SupervisorEvent::Exited { code });
                return RunOutcome::Exited(code);
            }
            StartupStep::Probed(Err(reason)) => {
                tracing::warn!(command = %self.spec.command, %reason, "backend readiness failed");
                self.emit(SupervisorEvent::StartupFailed { reason });
                child.kill().await;
                return RunOutcome::Exited(None);
            }
            StartupStep::Probed(Ok(())) => {}
        }

        self.set_state(SupervisorState::Running);
        self.emit(SupervisorEvent::Ready { pid });
        tracing::info!(command = %self.spec.command, ?pid, "backend is ready");

        let stable = sleep(self.options.stable_after);
        tokio::pin!(stable);
        let mut stabilized = false;

        let status = loop {
            let step = tokio::select! {
                _ = self.cancel.cancelled() => RunningStep::Cancelled,
                status = child.wait() => RunningStep::Exited(status),
                _ = &mut stable, if !stabilized => RunningStep::Stable,
            };
            match step {
                RunningStep::Cancelled => {
                    child.kill().await;
                    return RunOutcome::Cancelled;
                }
                RunningStep::Exited(status) => break status,
                RunningStep::Stable => {
                    stabilized = true;
                    let mut record = self.record();
                    if record.restart_count > 0 {
                        tracing::info!(
                            command = %self.spec.command,
                            previous = record.restart_count,
                            "backend stable, resetting restart counter"
                        );
                        record.restart_count = 0;
                        drop(record);
                        self.emit(SupervisorEvent::CounterReset);
                    }
                }
            }
        };

        let code = exit_code(status);
        self.emit(SupervisorEvent::Exited { code });
        RunOutcome::Exited(code)
    }

    fn on_crash(&self, code: Option<i32>) {
        {
            let mut record = self.record();
            record.pid = None;
            record.last_crash_at = Some(Utc::now());
            record.last_exit_code = code;
        }
        self.set_state(SupervisorState::Crashed);
        tracing::warn!(command = %self.spec.command, exit_code = ?code, "backend process crashed");
    }
}

fn exit_code(status: std::io::Result<Option<i32>>) -> Option<i32> {
    match status {
        Ok(code) => code,
        Err(e) => {
            tracing::warn!("waiting on backend process failed: {e}");
            None
        }
    }
}

/// 持有并监管一个后端子进程
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ProcessSupervisor {
    pub fn new(spec: LaunchSpec, options: LaunchOptions) -> Self {
        Self::with_launcher(spec, options, Arc::new(CommandLauncher))
    }

    pub fn with_launcher(
        spec: LaunchSpec,
        options: LaunchOptions,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Stopped);
        let (events_tx, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                spec,
                options,
                launcher,
                state_tx,
                events_tx,
                record: Mutex::new(ProcessRecord::default()),
                cancel: CancellationToken::new(),
            }),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    /// 订阅监管事件
    pub fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn restart_count(&self) -> u32 {
        self.shared.record().restart_count
    }
}

#[async_trait]
impl BackendSupervisor for ProcessSupervisor {
    async fn start(&self) -> Result<(), SupervisorError> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() || self.shared.cancel.is_cancelled() {
            return Err(SupervisorError::AlreadyStarted);
        }
        let shared = Arc::clone(&self.shared);
        *handle = Some(tokio::spawn(shared.run()));
        Ok(())
    }

    fn state(&self) -> SupervisorState {
        *self.shared.state_tx.borrow()
    }

    fn snapshot(&self) -> SupervisorSnapshot {
        let record = self.shared.record();
        SupervisorSnapshot {
            state: self.state(),
            target: self.shared.spec.command.clone(),
            pid: record.pid,
            restart_count: record.restart_count,
            last_crash_at: record.last_crash_at,
            last_exit_code: record.last_exit_code,
        }
    }

    fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.shared.state_tx.subscribe()
    }

    async fn shutdown(&self) {
        self.shared.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!("supervisor task ended abnormally: {e}");
            }
        }
        self.shared.set_state(SupervisorState::Disabled);
    }
}

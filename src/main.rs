//! Agent Bridge
//!
//! 入口：初始化日志、加载配置、启动 Bridge，然后从 stdin 逐行读取 JSON 命令，
//! 结果以 JSON 行写到 stdout。后端被禁用或收到关闭信号时退出（stdin 关闭不会退出）。
//!
//! 这是一个演示入口：Bridge 跑在进程内的 MemoryTransport 上，外部后端无法接入，
//! 没有订阅者时请求直接丢弃，同步调用只会等到超时。`status` 命令里的 `undelivered`
//! 显示有多少请求没有送到任何订阅者。接入真实后端时由宿主程序实现 `TransportPort`
//! 并调用 `Bridge::start`。
//!
//! 命令示例：
//! `{"op":"invoke","action":"weather","params":{"city":"Paris"}}`
//! `{"op":"resume","follow_up_token":"fu-…","new_user_input":[{"kind":"text","text":"12345"}]}`
//! `{"op":"poll","handle":"…"}`、`{"op":"status"}`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_bridge::bridge::{Bridge, BridgeCleanup};
use agent_bridge::config::load_config;
use agent_bridge::core::{
    run_with_graceful_shutdown, BridgeError, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
use agent_bridge::lifecycle::{AsyncStatus, FollowUpInput, InvokeRequest, TaskOutcome};
use agent_bridge::observability;
use agent_bridge::supervisor::SupervisorState;
use agent_bridge::transport::{MemoryTransport, TransportPort};
use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Command {
    Invoke(InvokeRequest),
    Resume(FollowUpInput),
    Poll { handle: String },
    Status,
}

fn ok(outcome: &TaskOutcome) -> Value {
    json!({ "ok": true, "result": outcome.to_tool_response() })
}

fn err(e: &BridgeError) -> Value {
    json!({ "ok": false, "error": { "code": e.code(), "message": e.to_string() } })
}

async fn execute(bridge: &Bridge, transport: &MemoryTransport, line: &str) -> Value {
    let command: Command = match serde_json::from_str(line) {
        Ok(command) => command,
        Err(e) => {
            return json!({ "ok": false, "error": { "code": "bad_command", "message": e.to_string() } })
        }
    };
    match command {
        Command::Invoke(request) => match bridge.invoke(request).await {
            Ok(outcome) => ok(&outcome),
            Err(e) => err(&e),
        },
        Command::Resume(input) => match bridge.resume(input).await {
            Ok(outcome) => ok(&outcome),
            Err(e) => err(&e),
        },
        Command::Poll { handle } => match bridge.poll(&handle) {
            None => json!({ "ok": false, "error": { "code": "unknown_handle", "message": handle } }),
            Some(AsyncStatus::Pending) => json!({ "ok": true, "pending": true }),
            Some(AsyncStatus::Done(Ok(outcome))) => ok(&outcome),
            Some(AsyncStatus::Done(Err(e))) => err(&e),
        },
        Command::Status => json!({
            "ok": true,
            "supervisor": bridge.supervisor_snapshot(),
            "undelivered": transport.undelivered(),
        }),
    }
}

/// 逐行处理 stdin 命令，直到 EOF
async fn serve_stdin(bridge: Arc<Bridge>, transport: Arc<MemoryTransport>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await.context("read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let response = execute(&bridge, &transport, &line).await;
        stdout
            .write_all(format!("{response}\n").as_bytes())
            .await
            .context("write stdout")?;
        stdout.flush().await.context("flush stdout")?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;

    let transport = Arc::new(MemoryTransport::new());
    let bridge = Bridge::start(&config, Arc::clone(&transport) as Arc<dyn TransportPort>)
        .await
        .context("Failed to start bridge")?;
    tracing::warn!(
        "running on the in-process transport; no external backend can reach it, \
         requests go unanswered unless something in this process replies"
    );

    let manager = Arc::new(ShutdownManager::new());
    let mut coordinator = ShutdownCoordinator::new().with_timeout(Duration::from_secs(10));
    coordinator.register(BridgeCleanup(Arc::clone(&bridge)));

    // 后端进入 Disabled（重启被关闭后崩溃）视为致命
    let mut states = bridge.supervisor().subscribe();
    let fatal_manager = Arc::clone(&manager);
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            if *states.borrow_and_update() == SupervisorState::Disabled {
                if !fatal_manager.is_shutdown() {
                    tracing::error!("backend disabled, shutting down");
                }
                fatal_manager.shutdown(ShutdownReason::BackendDisabled);
                break;
            }
        }
    });

    let app_bridge = Arc::clone(&bridge);
    let app_transport = Arc::clone(&transport);
    let report = run_with_graceful_shutdown(
        Arc::clone(&manager),
        async move {
            if let Err(e) = serve_stdin(app_bridge, app_transport).await {
                tracing::error!("command loop failed: {e:#}");
            }
            tracing::info!("stdin closed, bridge keeps running until a shutdown signal");
            std::future::pending::<()>().await;
        },
        &coordinator,
    )
    .await;

    if manager.reason() == Some(ShutdownReason::BackendDisabled) {
        anyhow::bail!("backend disabled (cleanup: {report:?})");
    }
    Ok(())
}

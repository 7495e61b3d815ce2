//! Bridge 运行时
//!
//! 把传输、监管器、关联引擎、待输入存储与生命周期控制器装配在一起，
//! 并持有后台任务：回复路由（订阅 `<reply_prefix>/>`）与过期清理。
//! 所有登记表都属于一个 Bridge 实例，start 时创建，shutdown 时销毁。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::actions::ActionRegistry;
use crate::config::AppConfig;
use crate::core::{BridgeError, ShutdownCleanup};
use crate::lifecycle::{
    AsyncStatus, ControllerSettings, FollowUpInput, InvokeRequest, ReplyRouting,
    TaskEventSink, TaskLifecycleController, TaskOutcome, TracingEventSink,
};
use crate::pending::{create_pending_store, MemoryPendingStore, PendingInputStore};
use crate::supervisor::{self, BackendSupervisor, SupervisorSnapshot};
use crate::task::BackendReply;
use crate::transport::{InboundMessage, InboundStream, TransportPort};

/// 装配参数；测试中可替换任意组件
pub struct BridgeBuilder {
    settings: ControllerSettings,
    actions: Arc<ActionRegistry>,
    transport: Arc<dyn TransportPort>,
    supervisor: Arc<dyn BackendSupervisor>,
    pending: Option<Arc<dyn PendingInputStore>>,
    events: Option<Arc<dyn TaskEventSink>>,
    sweep_interval: Duration,
}

impl BridgeBuilder {
    pub fn new(
        transport: Arc<dyn TransportPort>,
        supervisor: Arc<dyn BackendSupervisor>,
        actions: ActionRegistry,
    ) -> Self {
        Self {
            settings: ControllerSettings::default(),
            actions: Arc::new(actions),
            transport,
            supervisor,
            pending: None,
            events: None,
            sweep_interval: Duration::from_secs(30),
        }
    }

    pub fn settings(mut self, settings: ControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn pending_store(mut self, store: Arc<dyn PendingInputStore>) -> Self {
        self.pending = Some(store);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn TaskEventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// 启动监管器、订阅回复主题、拉起后台任务
    pub async fn start(self) -> Result<Arc<Bridge>, BridgeError> {
        let pending = self
            .pending
            .unwrap_or_else(|| Arc::new(MemoryPendingStore::new()));
        let mut controller = TaskLifecycleController::new(
            self.settings,
            self.actions,
            Arc::clone(&self.transport),
            Arc::clone(&self.supervisor),
            pending,
        );
        if let Some(sink) = self.events {
            controller = controller.with_event_sink(sink);
        }
        let controller = Arc::new(controller);

        let replies = self
            .transport
            .subscribe(&controller.reply_pattern())
            .await?;
        self.supervisor.start().await?;

        let cancel = CancellationToken::new();
        let router = tokio::spawn(route_replies(
            Arc::clone(&controller),
            replies,
            cancel.clone(),
        ));
        let reaper = tokio::spawn(reap_expired(
            Arc::clone(&controller),
            self.sweep_interval,
            cancel.clone(),
        ));

        tracing::info!(
            reply_pattern = %controller.reply_pattern(),
            backend = %self.supervisor.snapshot().target,
            "bridge started"
        );

        Ok(Arc::new(Bridge {
            controller,
            supervisor: self.supervisor,
            cancel,
            background: Mutex::new(vec![router, reaper]),
        }))
    }
}

pub struct Bridge {
    controller: Arc<TaskLifecycleController>,
    supervisor: Arc<dyn BackendSupervisor>,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Bridge {
    /// 按配置装配并启动
    pub async fn start(
        config: &AppConfig,
        transport: Arc<dyn TransportPort>,
    ) -> Result<Arc<Self>, BridgeError> {
        let actions = ActionRegistry::from_definitions(&config.actions)?;
        let supervisor = supervisor::from_config(&config.supervisor)?;
        let pending = create_pending_store(&config.bridge.pending_store).await;

        BridgeBuilder::new(transport, supervisor, actions)
            .settings(ControllerSettings::from(&config.bridge))
            .pending_store(pending)
            .event_sink(Arc::new(TracingEventSink))
            .sweep_interval(config.bridge.sweep_interval())
            .start()
            .await
    }

    pub fn builder(
        transport: Arc<dyn TransportPort>,
        supervisor: Arc<dyn BackendSupervisor>,
        actions: ActionRegistry,
    ) -> BridgeBuilder {
        BridgeBuilder::new(transport, supervisor, actions)
    }

    pub async fn invoke(&self, request: InvokeRequest) -> Result<TaskOutcome, BridgeError> {
        self.controller.invoke(request).await
    }

    pub async fn resume(&self, input: FollowUpInput) -> Result<TaskOutcome, BridgeError> {
        self.controller.resume(input).await
    }

    pub fn poll(&self, handle: &str) -> Option<AsyncStatus> {
        self.controller.poll(handle)
    }

    /// 不经过传输直接投递一条回复（例如由 webhook 收到的回调）
    pub async fn deliver_reply(&self, reply: BackendReply) -> ReplyRouting {
        self.controller.on_reply(reply).await
    }

    pub fn controller(&self) -> &Arc<TaskLifecycleController> {
        &self.controller
    }

    pub fn supervisor(&self) -> &Arc<dyn BackendSupervisor> {
        &self.supervisor
    }

    pub fn supervisor_snapshot(&self) -> SupervisorSnapshot {
        self.supervisor.snapshot()
    }

    /// 停止后台任务、放弃在途请求、关闭后端
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::info!("bridge shutting down");
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("bridge background task ended abnormally: {e}");
            }
        }
        self.controller.shutdown();
        self.supervisor.shutdown().await;
        tracing::info!("bridge stopped");
    }
}

/// 注册到 ShutdownCoordinator 的清理任务
pub struct BridgeCleanup(pub Arc<Bridge>);

#[async_trait]
impl ShutdownCleanup for BridgeCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.0.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "bridge"
    }
}

/// 解析入站回复；body 中缺 token 时依次取消息头、主题最后一层
pub fn parse_reply(message: &InboundMessage) -> Option<BackendReply> {
    let mut reply: BackendReply = match serde_json::from_slice(&message.payload) {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(topic = %message.topic, "malformed reply dropped: {e}");
            return None;
        }
    };
    if reply.request_token.is_none() {
        reply.request_token = message
            .correlation_token()
            .map(str::to_string)
            .or_else(|| message.topic.rsplit('/').next().map(str::to_string));
    }
    Some(reply)
}

async fn route_replies(
    controller: Arc<TaskLifecycleController>,
    mut replies: InboundStream,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = replies.next() => {
                let Some(message) = message else {
                    tracing::warn!("reply subscription closed");
                    break;
                };
                if let Some(reply) = parse_reply(&message) {
                    let routing = controller.on_reply(reply).await;
                    tracing::trace!(topic = %message.topic, ?routing, "reply routed");
                }
            }
        }
    }
}

async fn reap_expired(
    controller: Arc<TaskLifecycleController>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut timer = tokio::time::interval(interval);
    timer.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {
                let report = controller.sweep().await;
                if report != Default::default() {
                    tracing::info!(?report, "swept expired bridge state");
                }
            }
        }
    }
}

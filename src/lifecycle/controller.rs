//! 任务生命周期控制器
//!
//! 每个请求：Building → AwaitingReply → {Completed | AwaitingInput | Failed | TimedOut}。
//! 唯一的挂起点是等待关联引擎中的回复；暂停的任务进入待输入存储，续传时重新进入 AwaitingReply。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use super::events::{NoopEventSink, TaskEvent, TaskEventSink};
use super::session::{derive_session_id, SessionIdPolicy};
use super::types::{AsyncStatus, CompletedResponse, FollowUpInput, InvokeMode, InvokeRequest, TaskOutcome};
use crate::actions::{ActionRegistry, ActionSchema};
use crate::config::BridgeSection;
use crate::core::BridgeError;
use crate::correlation::{CorrelationEngine, Resolution, WaitError};
use crate::pending::{PendingFollowUp, PendingInputStore, StoreError};
use crate::supervisor::BackendSupervisor;
use crate::task::{
    flatten, BackendReply, ContentPart, OutboundRequest, RemoteTaskState, ReplyState, TaskRegistry,
};
use crate::transport::{
    Headers, TransportError, TransportPort, HEADER_CONTENT_TYPE, HEADER_CORRELATION_TOKEN,
    HEADER_REPLY_TO,
};

/// follow-up token 冲突时的最大重试次数
const PARK_ATTEMPTS: usize = 3;
const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(100);

/// 控制器运行参数（来自 [bridge] 段）
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub response_timeout: Duration,
    pub async_mode: bool,
    pub pending_ttl: Duration,
    pub session_policy: SessionIdPolicy,
    pub reply_topic_prefix: String,
    pub publish_retries: u32,
}

impl From<&BridgeSection> for ControllerSettings {
    fn from(section: &BridgeSection) -> Self {
        Self {
            response_timeout: section.response_timeout(),
            async_mode: section.async_mode,
            pending_ttl: section.pending_ttl(),
            session_policy: section.session_policy,
            reply_topic_prefix: section.reply_topic_prefix.trim_end_matches('/').to_string(),
            publish_retries: section.publish_retries,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from(&BridgeSection::default())
    }
}

/// 一次往返所需的上下文
#[derive(Clone)]
struct RequestContext {
    schema: Arc<ActionSchema>,
    task_id: String,
    session_id: String,
    topic: String,
    caller_context: Value,
}

/// 调用方在等待期间丢弃 future 时，把任务从注册表移除
struct TaskGuard<'a> {
    tasks: &'a TaskRegistry,
    task_id: String,
    armed: bool,
}

impl<'a> TaskGuard<'a> {
    fn new(tasks: &'a TaskRegistry, task_id: &str) -> Self {
        Self {
            tasks,
            task_id: task_id.to_string(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.tasks.remove(&self.task_id).is_some() {
            tracing::debug!(task_id = %self.task_id, "caller went away, task dropped");
        }
    }
}

/// 异步模式下已发布、尚未收到回复的请求
struct DetachedRequest {
    ctx: RequestContext,
    deadline: Instant,
    timeout_ms: u64,
}

enum AsyncSlot {
    Pending,
    Done {
        result: Result<TaskOutcome, BridgeError>,
        finished_at: Instant,
    },
}

/// 回复的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyRouting {
    /// 交给了同步等待者
    Delivered,
    /// 异步请求的回复，结果已存入待 poll 表
    Detached,
    /// 没有人认领（未知、过期或重复）
    Unclaimed,
}

/// 一轮清理的结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_follow_ups: usize,
    pub abandoned_waiters: usize,
    pub timed_out_async: usize,
    pub dropped_results: usize,
}

pub struct TaskLifecycleController {
    settings: ControllerSettings,
    actions: Arc<ActionRegistry>,
    transport: Arc<dyn TransportPort>,
    supervisor: Arc<dyn BackendSupervisor>,
    pending: Arc<dyn PendingInputStore>,
    engine: CorrelationEngine<BackendReply>,
    tasks: TaskRegistry,
    detached: DashMap<String, DetachedRequest>,
    async_results: DashMap<String, AsyncSlot>,
    events: Arc<dyn TaskEventSink>,
}

impl TaskLifecycleController {
    pub fn new(
        settings: ControllerSettings,
        actions: Arc<ActionRegistry>,
        transport: Arc<dyn TransportPort>,
        supervisor: Arc<dyn BackendSupervisor>,
        pending: Arc<dyn PendingInputStore>,
    ) -> Self {
        Self {
            settings,
            actions,
            transport,
            supervisor,
            pending,
            engine: CorrelationEngine::new(),
            tasks: TaskRegistry::new(),
            detached: DashMap::new(),
            async_results: DashMap::new(),
            events: Arc::new(NoopEventSink),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn TaskEventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// 回复主题的订阅模式
    pub fn reply_pattern(&self) -> String {
        format!("{}/>", self.settings.reply_topic_prefix)
    }

    pub fn outstanding_requests(&self) -> usize {
        self.engine.outstanding() + self.detached.len()
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// 调用一个动作
    pub async fn invoke(&self, request: InvokeRequest) -> Result<TaskOutcome, BridgeError> {
        let schema = self.actions.get(&request.action)?;
        let bound = schema.bind(&request.params)?;
        self.ensure_ready()?;

        let session_id =
            derive_session_id(self.settings.session_policy, request.external_session_id.as_deref());
        let task = self.tasks.create(&session_id, schema.name());
        self.events.emit(TaskEvent::Building {
            action: schema.name().to_string(),
            task_id: task.remote_task_id.clone(),
            session_id: session_id.clone(),
        });
        tracing::info!(
            action = %schema.name(),
            task_id = %task.remote_task_id,
            topic = %bound.topic,
            "invoking action"
        );

        let timeout = self.timeout_for(&schema, request.timeout_ms);
        let mode = self.mode_for(&schema, request.mode);
        let ctx = RequestContext {
            schema,
            task_id: task.remote_task_id,
            session_id,
            topic: bound.topic,
            caller_context: request.caller_context,
        };

        match mode {
            InvokeMode::Sync => self.exchange(ctx, request.content, bound.payload, timeout).await,
            InvokeMode::Async => self.submit_detached(ctx, request.content, bound.payload, timeout).await,
        }
    }

    /// 对暂停任务补充输入
    pub async fn resume(&self, input: FollowUpInput) -> Result<TaskOutcome, BridgeError> {
        self.ensure_ready()?;

        let entry = match self.pending.take_and_remove(&input.follow_up_token).await {
            Ok(entry) => entry,
            Err(StoreError::NotFound(_)) => {
                tracing::warn!(follow_up_token = %input.follow_up_token, "unknown or expired follow-up token");
                return Err(BridgeError::UnknownFollowUpToken(input.follow_up_token));
            }
            Err(e) => return Err(e.into()),
        };

        let schema = match self.actions.get(&entry.action) {
            Ok(schema) => schema,
            Err(e) => {
                self.tasks.remove(&entry.remote_task_id);
                return Err(e);
            }
        };

        self.tasks
            .resubmit(&entry.remote_task_id, &entry.session_id, &entry.action);
        self.events.emit(TaskEvent::Resumed {
            task_id: entry.remote_task_id.clone(),
            follow_up_token: entry.follow_up_token.clone(),
        });
        tracing::info!(
            action = %entry.action,
            task_id = %entry.remote_task_id,
            "resuming paused task"
        );

        let timeout = self.timeout_for(&schema, None);
        let mode = self.mode_for(&schema, None);
        let ctx = RequestContext {
            schema,
            task_id: entry.remote_task_id,
            session_id: entry.session_id,
            topic: entry.topic,
            caller_context: entry.caller_context,
        };

        match mode {
            InvokeMode::Sync => self.exchange(ctx, input.new_user_input, Value::Null, timeout).await,
            InvokeMode::Async => {
                self.submit_detached(ctx, input.new_user_input, Value::Null, timeout)
                    .await
            }
        }
    }

    /// 查询异步调用；未知句柄返回 None，完成的结果只返回一次
    pub fn poll(&self, handle: &str) -> Option<AsyncStatus> {
        if let Some((_, AsyncSlot::Done { result, .. })) = self
            .async_results
            .remove_if(handle, |_, slot| matches!(slot, AsyncSlot::Done { .. }))
        {
            return Some(AsyncStatus::Done(result));
        }

        if !self.async_results.contains_key(handle) {
            return None;
        }

        let expired = self
            .detached
            .get(handle)
            .map(|d| Instant::now() >= d.deadline)
            .unwrap_or(false);
        if expired {
            if let Some(err) = self.expire_detached(handle) {
                self.async_results.remove(handle);
                return Some(AsyncStatus::Done(Err(err)));
            }
        }
        Some(AsyncStatus::Pending)
    }

    /// 处理一条后端回复
    pub async fn on_reply(&self, reply: BackendReply) -> ReplyRouting {
        let Some(token) = reply.request_token.clone() else {
            tracing::warn!("reply without request token dropped");
            return ReplyRouting::Unclaimed;
        };

        let reply = match self.engine.resolve(&token, reply) {
            Resolution::Delivered => return ReplyRouting::Delivered,
            Resolution::Unclaimed(reply) => reply,
        };

        let Some((_, detached)) = self
            .detached
            .remove_if(&token, |_, d| Instant::now() < d.deadline)
        else {
            tracing::debug!(%token, "unclaimed reply dropped");
            return ReplyRouting::Unclaimed;
        };

        let result = self.interpret(detached.ctx, reply).await;
        self.async_results.insert(
            token,
            AsyncSlot::Done {
                result,
                finished_at: Instant::now(),
            },
        );
        ReplyRouting::Detached
    }

    /// 清理过期条目：待输入、被放弃的等待者、超时的异步请求、长期无人取的结果
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.pending.sweep_expired().await {
            Ok(expired) => {
                report.expired_follow_ups = expired.len();
                for entry in expired {
                    self.tasks.remove(&entry.remote_task_id);
                    tracing::info!(
                        task_id = %entry.remote_task_id,
                        action = %entry.action,
                        "follow-up expired, task dropped"
                    );
                    self.events.emit(TaskEvent::Expired {
                        task_id: entry.remote_task_id,
                    });
                }
            }
            Err(e) => tracing::warn!("pending store sweep failed: {e}"),
        }

        report.abandoned_waiters = self.engine.sweep_expired();

        let now = Instant::now();
        let overdue: Vec<String> = self
            .detached
            .iter()
            .filter(|d| now >= d.deadline)
            .map(|d| d.key().clone())
            .collect();
        for handle in overdue {
            if let Some(err) = self.expire_detached(&handle) {
                report.timed_out_async += 1;
                if self.async_results.contains_key(&handle) {
                    self.async_results.insert(
                        handle,
                        AsyncSlot::Done {
                            result: Err(err),
                            finished_at: now,
                        },
                    );
                }
            }
        }

        let retention = self.settings.pending_ttl;
        let before = self.async_results.len();
        self.async_results.retain(|_, slot| match slot {
            AsyncSlot::Done { finished_at, .. } => now.duration_since(*finished_at) < retention,
            AsyncSlot::Pending => true,
        });
        report.dropped_results = before.saturating_sub(self.async_results.len());

        report
    }

    /// 关闭：放弃所有在途请求
    pub fn shutdown(&self) {
        self.engine.clear();
        self.detached.clear();
        self.async_results.clear();
        self.tasks.clear();
    }

    fn ensure_ready(&self) -> Result<(), BridgeError> {
        if self.supervisor.is_ready() {
            return Ok(());
        }
        let state = self.supervisor.state();
        tracing::warn!(%state, "backend not ready, rejecting request");
        Err(BridgeError::ProcessUnavailable(state))
    }

    fn timeout_for(&self, schema: &ActionSchema, requested_ms: Option<u64>) -> Duration {
        requested_ms
            .or(schema.definition().timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.settings.response_timeout)
    }

    fn mode_for(&self, schema: &ActionSchema, requested: Option<InvokeMode>) -> InvokeMode {
        requested.unwrap_or_else(|| {
            let async_mode = schema
                .definition()
                .async_mode
                .unwrap_or(self.settings.async_mode);
            if async_mode {
                InvokeMode::Async
            } else {
                InvokeMode::Sync
            }
        })
    }

    /// 同步往返：注册 → 发布 → 等待 → 解释
    async fn exchange(
        &self,
        ctx: RequestContext,
        content: Vec<ContentPart>,
        params: Value,
        timeout: Duration,
    ) -> Result<TaskOutcome, BridgeError> {
        let guard = TaskGuard::new(&self.tasks, &ctx.task_id);
        let waiter = self.engine.register(timeout);
        let token = waiter.token().to_string();
        let request = self.build_request(&ctx, &token, content, params);

        if let Err(e) = self.publish(&ctx.topic, &request).await {
            guard.disarm();
            self.fail(&ctx.task_id, e.to_string());
            return Err(e);
        }
        self.events.emit(TaskEvent::AwaitingReply {
            task_id: ctx.task_id.clone(),
            token: token.clone(),
        });

        let waited = waiter.wait().await;
        guard.disarm();
        match waited {
            Ok(reply) => self.interpret(ctx, reply).await,
            Err(WaitError::Expired) => {
                self.tasks.remove(&ctx.task_id);
                tracing::warn!(
                    task_id = %ctx.task_id,
                    %token,
                    timeout_ms = timeout.as_millis() as u64,
                    "no reply before deadline"
                );
                self.events.emit(TaskEvent::TimedOut {
                    task_id: ctx.task_id,
                    token: token.clone(),
                });
                Err(BridgeError::Timeout {
                    token,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Err(WaitError::Cancelled) => {
                self.tasks.remove(&ctx.task_id);
                Err(BridgeError::Cancelled(token))
            }
        }
    }

    /// 异步发布：先登记句柄再发布，避免回复先于登记到达
    async fn submit_detached(
        &self,
        ctx: RequestContext,
        content: Vec<ContentPart>,
        params: Value,
        timeout: Duration,
    ) -> Result<TaskOutcome, BridgeError> {
        let handle = self.engine.next_token();
        let request = self.build_request(&ctx, &handle, content, params);
        let task_id = ctx.task_id.clone();
        let topic = ctx.topic.clone();

        self.async_results.insert(handle.clone(), AsyncSlot::Pending);
        self.detached.insert(
            handle.clone(),
            DetachedRequest {
                ctx,
                deadline: Instant::now() + timeout,
                timeout_ms: timeout.as_millis() as u64,
            },
        );

        if let Err(e) = self.publish(&topic, &request).await {
            self.detached.remove(&handle);
            self.async_results.remove(&handle);
            self.fail(&task_id, e.to_string());
            return Err(e);
        }

        self.events.emit(TaskEvent::Accepted {
            task_id: task_id.clone(),
            handle: handle.clone(),
        });
        tracing::info!(%task_id, %handle, "request accepted in async mode");
        Ok(TaskOutcome::Accepted { task_id, handle })
    }

    fn build_request(
        &self,
        ctx: &RequestContext,
        token: &str,
        content: Vec<ContentPart>,
        params: Value,
    ) -> OutboundRequest {
        OutboundRequest {
            session_id: ctx.session_id.clone(),
            task_id: ctx.task_id.clone(),
            request_token: token.to_string(),
            reply_to: format!("{}/{}", self.settings.reply_topic_prefix, token),
            content,
            params,
        }
    }

    /// 发布；失败时按配置重试，默认不重试
    async fn publish(&self, topic: &str, request: &OutboundRequest) -> Result<(), BridgeError> {
        let payload = serde_json::to_vec(request).map_err(|e| TransportError::PublishFailed {
            topic: topic.to_string(),
            reason: format!("encode request: {e}"),
        })?;
        let mut headers = Headers::new();
        headers.insert(HEADER_CORRELATION_TOKEN.to_string(), request.request_token.clone());
        headers.insert(HEADER_REPLY_TO.to_string(), request.reply_to.clone());
        headers.insert(HEADER_CONTENT_TYPE.to_string(), "application/json".to_string());

        let mut attempt: u32 = 0;
        loop {
            match self
                .transport
                .publish(topic, payload.clone(), headers.clone())
                .await
            {
                Ok(()) => {
                    tracing::debug!(%topic, token = %request.request_token, "request published");
                    return Ok(());
                }
                Err(e) if attempt < self.settings.publish_retries => {
                    attempt += 1;
                    tracing::warn!(%topic, attempt, "publish failed, retrying: {e}");
                    tokio::time::sleep(PUBLISH_RETRY_DELAY * attempt).await;
                }
                Err(e) => {
                    tracing::error!(%topic, "publish failed: {e}");
                    return Err(e.into());
                }
            }
        }
    }

    /// 按回复中的生命周期状态给出结果
    async fn interpret(
        &self,
        ctx: RequestContext,
        reply: BackendReply,
    ) -> Result<TaskOutcome, BridgeError> {
        let task_id = self.tasks.apply_reply(
            &ctx.task_id,
            reply.task_id.as_deref(),
            RemoteTaskState::from(reply.state),
        );

        match reply.state {
            ReplyState::Completed => {
                let flat = flatten(&reply.parts);
                let body = match ctx.schema.response_format().apply(&flat, &reply.parts) {
                    Ok(body) => body,
                    Err(e) => {
                        self.events.emit(TaskEvent::Failed {
                            task_id: task_id.clone(),
                            detail: e.to_string(),
                        });
                        return Err(e);
                    }
                };
                tracing::info!(%task_id, action = %ctx.schema.name(), "task completed");
                self.events.emit(TaskEvent::Completed {
                    task_id: task_id.clone(),
                });
                Ok(TaskOutcome::Completed(CompletedResponse {
                    task_id,
                    message: flat.text,
                    files: flat.files,
                    data: flat.data,
                    body,
                }))
            }
            ReplyState::Failed => {
                let detail = reply
                    .error
                    .unwrap_or_else(|| "backend reported failure without detail".to_string());
                tracing::warn!(%task_id, %detail, "backend task failed");
                self.events.emit(TaskEvent::Failed {
                    task_id: task_id.clone(),
                    detail: detail.clone(),
                });
                Err(BridgeError::BackendTaskFailure { task_id, detail })
            }
            ReplyState::InputRequired => {
                let guard = TaskGuard::new(&self.tasks, &task_id);
                let follow_up_token = self.park(&ctx, &task_id, reply.prompt.clone()).await?;
                guard.disarm();
                tracing::info!(%task_id, %follow_up_token, "task awaiting input");
                self.events.emit(TaskEvent::AwaitingInput {
                    task_id: task_id.clone(),
                    follow_up_token: follow_up_token.clone(),
                });
                Ok(TaskOutcome::NeedsInput {
                    task_id,
                    follow_up_token,
                    prompt: reply.prompt,
                })
            }
        }
    }

    /// 暂存暂停的任务；token 冲突时换一个，调用方看不到冲突
    async fn park(
        &self,
        ctx: &RequestContext,
        task_id: &str,
        prompt: Option<String>,
    ) -> Result<String, BridgeError> {
        let mut last_err = None;
        for _ in 0..PARK_ATTEMPTS {
            let token = format!("fu-{}", Uuid::new_v4().simple());
            let now = Utc::now();
            let entry = PendingFollowUp {
                follow_up_token: token.clone(),
                remote_task_id: task_id.to_string(),
                session_id: ctx.session_id.clone(),
                action: ctx.schema.name().to_string(),
                topic: ctx.topic.clone(),
                caller_context: ctx.caller_context.clone(),
                prompt: prompt.clone(),
                created_at: now,
                expires_at: now,
            };
            match self.pending.put(entry, self.settings.pending_ttl).await {
                Ok(()) => return Ok(token),
                Err(StoreError::AlreadyExists(existing)) => {
                    tracing::debug!(token = %existing, "follow-up token collision, regenerating");
                    last_err = Some(StoreError::AlreadyExists(existing));
                }
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            }
        }

        self.tasks.remove(task_id);
        let err = last_err.unwrap_or_else(|| StoreError::Backend("follow-up not stored".into()));
        tracing::error!(%task_id, "could not park task: {err}");
        Err(err.into())
    }

    fn fail(&self, task_id: &str, detail: String) {
        self.tasks.remove(task_id);
        self.events.emit(TaskEvent::Failed {
            task_id: task_id.to_string(),
            detail,
        });
    }

    /// 把一个超时的异步请求移出；返回对应的超时错误
    fn expire_detached(&self, handle: &str) -> Option<BridgeError> {
        let (_, detached) = self.detached.remove(handle)?;
        self.tasks.remove(&detached.ctx.task_id);
        tracing::warn!(task_id = %detached.ctx.task_id, %handle, "async request timed out");
        self.events.emit(TaskEvent::TimedOut {
            task_id: detached.ctx.task_id,
            token: handle.to_string(),
        });
        Some(BridgeError::Timeout {
            token: handle.to_string(),
            timeout_ms: detached.timeout_ms,
        })
    }
}

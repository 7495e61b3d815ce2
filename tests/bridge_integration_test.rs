//! Bridge 集成测试
//!
//! 在内存传输上挂一个假后端（订阅 `agents/>`），按主题给出不同回复，
//! 覆盖同步调用、多轮续传、超时、异步 poll、待输入过期与后端不可用。

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use agent_bridge::actions::{ActionDefinition, ActionRegistry};
    use agent_bridge::bridge::Bridge;
    use agent_bridge::config::load_config;
    use agent_bridge::core::BridgeError;
    use agent_bridge::lifecycle::{
        AsyncStatus, ControllerSettings, FollowUpInput, InvokeMode, InvokeRequest, ReplyRouting,
        TaskOutcome,
    };
    use agent_bridge::observability;
    use agent_bridge::supervisor::{
        BackendSupervisor, ChildHandle, ExternalEndpoint, LaunchOptions, LaunchSpec,
        ProcessLauncher, ProcessSupervisor, SupervisorState,
    };
    use agent_bridge::task::{flatten, BackendReply, ContentPart, OutboundRequest};
    use agent_bridge::transport::{MemoryTransport, TransportPort, HEADER_CORRELATION_TOKEN};
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use serde_json::json;
    use tokio::time::Instant;

    type RequestLog = Arc<Mutex<Vec<(String, OutboundRequest)>>>;

    fn actions() -> ActionRegistry {
        let definitions: Vec<ActionDefinition> = serde_json::from_value(json!([
            {
                "name": "weather",
                "topic": "agents/weather/{city}",
                "response_format": "json",
                "parameters": [
                    { "name": "city", "kind": "string", "required": true },
                    { "name": "units", "kind": "string", "default": "metric", "payload_path": "options.units" }
                ]
            },
            { "name": "open_account", "topic": "agents/accounts/open" },
            { "name": "transfer", "topic": "agents/transfer" },
            { "name": "silent", "topic": "agents/silent" },
            { "name": "slow", "topic": "agents/slow", "response_format": "json" }
        ]))
        .unwrap();
        ActionRegistry::from_definitions(&definitions).unwrap()
    }

    /// 假后端：天气立即回复；开户先要账号再完成；转账先后问账号和金额；
    /// slow 两秒后回复；silent 从不回复
    async fn spawn_backend(transport: Arc<MemoryTransport>) -> RequestLog {
        let mut requests = transport.subscribe("agents/>").await.unwrap();
        let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&log);

        tokio::spawn(async move {
            while let Some(message) = requests.next().await {
                let request: OutboundRequest = serde_json::from_slice(&message.payload).unwrap();
                seen.lock()
                    .unwrap()
                    .push((message.topic.clone(), request.clone()));

                let token = request.request_token.clone();
                let text = flatten(&request.content).text;
                let (delay, reply) = match message.topic.as_str() {
                    "agents/weather/Paris" => (
                        Duration::ZERO,
                        BackendReply::completed(token, vec![ContentPart::text(r#"{"temp":18}"#)]),
                    ),
                    "agents/accounts/open" if text.chars().all(|c| c.is_ascii_digit()) => (
                        Duration::ZERO,
                        BackendReply::completed(
                            token,
                            vec![ContentPart::text(format!("Account {text} opened"))],
                        )
                        .with_task_id("acct-7"),
                    ),
                    "agents/accounts/open" => (
                        Duration::ZERO,
                        BackendReply::input_required(token, "Which account?").with_task_id("acct-7"),
                    ),
                    "agents/transfer" if text.parse::<u32>().is_ok() => (
                        Duration::ZERO,
                        BackendReply::completed(
                            token,
                            vec![ContentPart::text(format!("Transferred {text}"))],
                        ),
                    ),
                    "agents/transfer" if text.starts_with("acct-") => (
                        Duration::ZERO,
                        BackendReply::input_required(token, "How much?"),
                    ),
                    "agents/transfer" => (
                        Duration::ZERO,
                        BackendReply::input_required(token, "From which account?")
                            .with_task_id("xfer-3"),
                    ),
                    "agents/slow" => (
                        Duration::from_secs(2),
                        BackendReply::completed(
                            token,
                            vec![ContentPart::data(json!({"done": true}))],
                        ),
                    ),
                    _ => continue,
                };

                let transport = Arc::clone(&transport);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let mut headers = HashMap::new();
                    headers.insert(
                        HEADER_CORRELATION_TOKEN.to_string(),
                        request.request_token.clone(),
                    );
                    let payload = serde_json::to_vec(&reply).unwrap();
                    transport
                        .publish(&request.reply_to, payload, headers)
                        .await
                        .unwrap();
                });
            }
        });

        log
    }

    async fn start_bridge(settings: ControllerSettings) -> (Arc<Bridge>, RequestLog) {
        observability::try_init_for_tests();
        let transport = Arc::new(MemoryTransport::new());
        let log = spawn_backend(Arc::clone(&transport)).await;
        let bridge = Bridge::builder(
            transport,
            Arc::new(ExternalEndpoint::new("memory://backend")),
            actions(),
        )
        .settings(settings)
        .start()
        .await
        .unwrap();
        (bridge, log)
    }

    #[tokio::test]
    async fn test_weather_round_trip_returns_json() {
        let (bridge, log) = start_bridge(ControllerSettings::default()).await;

        let outcome = bridge
            .invoke(InvokeRequest::new("weather").with_param("city", "Paris"))
            .await
            .unwrap();

        let response = serde_json::to_value(outcome.to_tool_response()).unwrap();
        assert_eq!(response["needsInput"], false);
        assert_eq!(response["data"], json!({"temp": 18}));

        let requests = log.lock().unwrap();
        let (topic, request) = &requests[0];
        assert_eq!(topic, "agents/weather/Paris");
        assert_eq!(request.params, json!({"options": {"units": "metric"}}));
        assert!(request.reply_to.starts_with("bridge/reply/"));
        drop(requests);

        assert_eq!(bridge.controller().outstanding_requests(), 0);
        assert_eq!(bridge.controller().active_tasks(), 0);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_multi_turn_resume_keeps_task_and_session() {
        let (bridge, log) = start_bridge(ControllerSettings::default()).await;

        let first = bridge
            .invoke(
                InvokeRequest::new("open_account")
                    .with_text("open an account for me")
                    .with_session("user-42"),
            )
            .await
            .unwrap();
        let follow_up_token = match first {
            TaskOutcome::NeedsInput {
                task_id,
                follow_up_token,
                prompt,
            } => {
                assert_eq!(task_id, "acct-7");
                assert_eq!(prompt.as_deref(), Some("Which account?"));
                follow_up_token
            }
            other => panic!("expected NeedsInput, got {other:?}"),
        };
        assert_eq!(bridge.controller().active_tasks(), 1);

        let second = bridge
            .resume(FollowUpInput::text(follow_up_token.clone(), "12345"))
            .await
            .unwrap();
        match second {
            TaskOutcome::Completed(done) => {
                assert_eq!(done.task_id, "acct-7");
                assert_eq!(done.message, "Account 12345 opened");
                assert_eq!(done.body, json!("Account 12345 opened"));
            }
            other => panic!("expected Completed, got {other:?}"),
        }

        {
            let requests = log.lock().unwrap();
            assert_eq!(requests.len(), 2);
            assert_eq!(requests[1].1.task_id, "acct-7");
            assert_eq!(requests[0].1.session_id, requests[1].1.session_id);
        }

        // token 只能用一次
        let again = bridge
            .resume(FollowUpInput::text(follow_up_token, "12345"))
            .await;
        assert!(matches!(again, Err(BridgeError::UnknownFollowUpToken(_))));
        assert_eq!(bridge.controller().active_tasks(), 0);
        bridge.shutdown().await;
    }

    fn expect_pause(outcome: TaskOutcome) -> (String, String, Option<String>) {
        match outcome {
            TaskOutcome::NeedsInput {
                task_id,
                follow_up_token,
                prompt,
            } => (task_id, follow_up_token, prompt),
            other => panic!("expected NeedsInput, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resumed_task_can_pause_again() {
        let (bridge, log) = start_bridge(ControllerSettings::default()).await;

        let first = bridge
            .invoke(
                InvokeRequest::new("transfer")
                    .with_text("send money")
                    .with_session("user-7"),
            )
            .await
            .unwrap();
        let (task_id, first_token, prompt) = expect_pause(first);
        assert_eq!(task_id, "xfer-3");
        assert_eq!(prompt.as_deref(), Some("From which account?"));

        let second = bridge
            .resume(FollowUpInput::text(first_token.clone(), "acct-12345"))
            .await
            .unwrap();
        let (task_id, second_token, prompt) = expect_pause(second);
        assert_eq!(task_id, "xfer-3");
        assert_eq!(prompt.as_deref(), Some("How much?"));
        assert_ne!(second_token, first_token);
        assert_eq!(bridge.controller().active_tasks(), 1);

        // 第一轮的 token 已经用掉
        let stale = bridge
            .resume(FollowUpInput::text(first_token, "250"))
            .await;
        assert!(matches!(stale, Err(BridgeError::UnknownFollowUpToken(_))));
        assert_eq!(bridge.controller().active_tasks(), 1);

        let done = bridge
            .resume(FollowUpInput::text(second_token, "250"))
            .await
            .unwrap();
        match done {
            TaskOutcome::Completed(done) => {
                assert_eq!(done.task_id, "xfer-3");
                assert_eq!(done.message, "Transferred 250");
            }
            other => panic!("expected Completed, got {other:?}"),
        }

        {
            let requests = log.lock().unwrap();
            assert_eq!(requests.len(), 3);
            let sessions: Vec<_> = requests.iter().map(|(_, r)| r.session_id.clone()).collect();
            assert!(sessions.iter().all(|s| s == &sessions[0]));
            assert_eq!(requests[1].1.task_id, "xfer-3");
            assert_eq!(requests[2].1.task_id, "xfer-3");
            assert_ne!(requests[1].1.request_token, requests[2].1.request_token);
        }
        assert_eq!(bridge.controller().active_tasks(), 0);
        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_is_fifteen_seconds() {
        let (bridge, _log) = start_bridge(ControllerSettings::default()).await;

        let started = Instant::now();
        let caller = Arc::clone(&bridge);
        let call = tokio::spawn(async move { caller.invoke(InvokeRequest::new("silent")).await });

        tokio::time::sleep(Duration::from_millis(14_900)).await;
        assert!(!call.is_finished());

        let result = call.await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(15));
        match result {
            Err(BridgeError::Timeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 15_000),
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert_eq!(bridge.controller().outstanding_requests(), 0);
        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_invoke_returns_handle_then_polls_result() {
        let (bridge, _log) = start_bridge(ControllerSettings::default()).await;

        let accepted = bridge
            .invoke(InvokeRequest::new("slow").with_mode(InvokeMode::Async))
            .await
            .unwrap();
        let handle = match accepted {
            TaskOutcome::Accepted { handle, .. } => handle,
            other => panic!("expected Accepted, got {other:?}"),
        };
        assert!(matches!(bridge.poll(&handle), Some(AsyncStatus::Pending)));

        tokio::time::sleep(Duration::from_secs(3)).await;

        match bridge.poll(&handle) {
            Some(AsyncStatus::Done(Ok(TaskOutcome::Completed(done)))) => {
                assert_eq!(done.body, json!({"done": true}));
            }
            other => panic!("expected completed result, got {other:?}"),
        }
        // 结果只能取一次
        assert!(bridge.poll(&handle).is_none());
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_expired_follow_up_is_unknown_and_swept() {
        let settings = ControllerSettings {
            pending_ttl: Duration::ZERO,
            ..Default::default()
        };
        let (bridge, _log) = start_bridge(settings).await;

        let outcome = bridge
            .invoke(InvokeRequest::new("open_account").with_text("open"))
            .await
            .unwrap();
        let follow_up_token = match outcome {
            TaskOutcome::NeedsInput {
                follow_up_token, ..
            } => follow_up_token,
            other => panic!("expected NeedsInput, got {other:?}"),
        };

        let resumed = bridge
            .resume(FollowUpInput::text(follow_up_token, "12345"))
            .await;
        assert!(matches!(resumed, Err(BridgeError::UnknownFollowUpToken(_))));

        let report = bridge.controller().sweep().await;
        assert_eq!(report.expired_follow_ups, 1);
        assert_eq!(bridge.controller().active_tasks(), 0);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_reply_token_is_unclaimed() {
        let (bridge, _log) = start_bridge(ControllerSettings::default()).await;

        let stray = BackendReply::completed("never-issued", vec![ContentPart::text("late")]);
        assert_eq!(bridge.deliver_reply(stray).await, ReplyRouting::Unclaimed);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_requests_rejected_after_shutdown() {
        let (bridge, log) = start_bridge(ControllerSettings::default()).await;
        bridge.shutdown().await;
        bridge.shutdown().await;

        let result = bridge
            .invoke(InvokeRequest::new("weather").with_param("city", "Paris"))
            .await;
        assert!(matches!(
            result,
            Err(BridgeError::ProcessUnavailable(SupervisorState::Disabled))
        ));
        assert!(log.lock().unwrap().is_empty());
    }

    /// 每次拉起都失败的启动器
    struct MissingBinary;

    #[async_trait]
    impl ProcessLauncher for MissingBinary {
        async fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn ChildHandle>> {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", spec.command),
            ))
        }
    }

    #[tokio::test]
    async fn test_disabled_backend_rejects_invocations() {
        observability::try_init_for_tests();
        let transport = Arc::new(MemoryTransport::new());
        let supervisor = Arc::new(ProcessSupervisor::with_launcher(
            LaunchSpec::new("missing-agent"),
            LaunchOptions {
                restart_on_crash: false,
                ..Default::default()
            },
            Arc::new(MissingBinary),
        ));
        let bridge = Bridge::builder(transport, supervisor, actions())
            .start()
            .await
            .unwrap();

        assert!(bridge
            .supervisor()
            .wait_until_ready(Duration::from_secs(5))
            .await
            .is_err());
        assert_eq!(bridge.supervisor_snapshot().state, SupervisorState::Disabled);

        let result = bridge.invoke(InvokeRequest::new("silent")).await;
        match result {
            Err(e @ BridgeError::ProcessUnavailable(SupervisorState::Disabled)) => {
                assert_eq!(e.code(), "process_unavailable");
            }
            other => panic!("expected ProcessUnavailable, got {other:?}"),
        }
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_example_config_starts_bridge() {
        observability::try_init_for_tests();
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/bridge.example.toml");
        let config = load_config(Some(path.into())).unwrap();
        assert_eq!(config.actions.len(), 2);

        let transport: Arc<dyn TransportPort> = Arc::new(MemoryTransport::new());
        let bridge = Bridge::start(&config, transport).await.unwrap();
        assert_eq!(bridge.supervisor_snapshot().state, SupervisorState::Running);
        assert_eq!(bridge.supervisor_snapshot().target, "http://127.0.0.1:8000");

        let unknown = bridge.invoke(InvokeRequest::new("translate")).await;
        assert!(matches!(unknown, Err(BridgeError::UnknownAction(_))));

        let missing_city = bridge.invoke(InvokeRequest::new("weather")).await;
        assert!(matches!(
            missing_city,
            Err(BridgeError::InvalidParameter { .. })
        ));
        bridge.shutdown().await;
    }
}

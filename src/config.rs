//! 应用配置：从 config/bridge.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BRIDGE__*` 覆盖（双下划线表示嵌套，如 `BRIDGE__SUPERVISOR__COMMAND=./agent`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::actions::ActionDefinition;
use crate::lifecycle::SessionIdPolicy;
use crate::supervisor::{BackoffPolicy, SupervisorError};

/// 应用配置根（对应 config/bridge.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub bridge: BridgeSection,
    pub supervisor: SupervisorSection,
    /// [[actions]]：动作定义，加载后编译一次
    pub actions: Vec<ActionDefinition>,
}

/// [bridge] 段：超时、异步模式、待输入 TTL、会话策略
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSection {
    /// 等待后端回复的超时（毫秒）
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// 为 true 时默认以异步方式调用：立即返回句柄
    #[serde(default)]
    pub async_mode: bool,
    /// 暂停任务（等待补充输入）的保留时间（秒）
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,
    /// 过期清理间隔（秒）
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub session_policy: SessionIdPolicy,
    /// 回复主题前缀，实际回复主题为 `<prefix>/<token>`
    #[serde(default = "default_reply_topic_prefix")]
    pub reply_topic_prefix: String,
    /// 发布失败后的重试次数，默认不重试
    #[serde(default)]
    pub publish_retries: u32,
    #[serde(default)]
    pub pending_store: PendingStoreSection,
}

fn default_response_timeout_ms() -> u64 {
    15_000
}

fn default_pending_ttl_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_reply_topic_prefix() -> String {
    "bridge/reply".to_string()
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout_ms(),
            async_mode: false,
            pending_ttl_secs: default_pending_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            session_policy: SessionIdPolicy::default(),
            reply_topic_prefix: default_reply_topic_prefix(),
            publish_retries: 0,
            pending_store: PendingStoreSection::default(),
        }
    }
}

impl BridgeSection {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// [bridge.pending_store] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PendingStoreSection {
    #[serde(default)]
    pub backend: PendingBackend,
    /// sqlite 后端的数据库文件
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PendingBackend {
    #[default]
    Memory,
    Sqlite,
}

/// 后端接入方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorMode {
    /// 拉起并监管子进程
    Launch,
    /// 连接已在运行的后端
    Connect,
}

/// [supervisor] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    /// 未设置时：有 command 则 launch，否则有 url 则 connect
    pub mode: Option<SupervisorMode>,
    pub url: Option<String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub startup_timeout_secs: u64,
    pub restart_on_crash: bool,
    pub backoff: BackoffPolicy,
    /// 持续运行多少秒后重启计数归零
    pub stable_after_secs: u64,
    pub readiness: ReadinessSection,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            mode: None,
            url: None,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            startup_timeout_secs: 30,
            restart_on_crash: true,
            backoff: BackoffPolicy::default(),
            stable_after_secs: 60,
            readiness: ReadinessSection::default(),
        }
    }
}

impl SupervisorSection {
    pub fn resolved_mode(&self) -> Result<SupervisorMode, SupervisorError> {
        if let Some(mode) = self.mode {
            return Ok(mode);
        }
        if self.command.is_some() {
            Ok(SupervisorMode::Launch)
        } else if self.url.is_some() {
            Ok(SupervisorMode::Connect)
        } else {
            Err(SupervisorError::NotConfigured(
                "set supervisor.command (launch) or supervisor.url (connect)".into(),
            ))
        }
    }
}

/// [supervisor.readiness] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReadinessSection {
    pub kind: ReadinessKind,
    pub delay_ms: u64,
    pub host: String,
    pub port: Option<u16>,
    pub health_url: Option<String>,
}

impl Default for ReadinessSection {
    fn default() -> Self {
        Self {
            kind: ReadinessKind::Delay,
            delay_ms: 1_000,
            host: "127.0.0.1".to_string(),
            port: None,
            health_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessKind {
    #[default]
    Delay,
    Port,
    Health,
}

/// 从 config 目录加载配置，环境变量 BRIDGE__* 可覆盖
///
/// 1. 按顺序查找 config/bridge.toml、../config/bridge.toml、bridge.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BRIDGE__*（双下划线表示嵌套键；supervisor.args 按空格拆分）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/bridge", "../config/bridge", "bridge"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BRIDGE")
            .separator("__")
            .list_separator(" ")
            .with_list_parse_key("supervisor.args")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.bridge.response_timeout(), Duration::from_secs(15));
        assert!(!cfg.bridge.async_mode);
        assert_eq!(cfg.bridge.publish_retries, 0);
        assert_eq!(cfg.bridge.reply_topic_prefix, "bridge/reply");
        assert_eq!(cfg.bridge.pending_store.backend, PendingBackend::Memory);
        assert!(cfg.supervisor.restart_on_crash);
        assert!(cfg.actions.is_empty());
    }

    #[test]
    fn test_mode_resolution() {
        let mut section = SupervisorSection {
            url: Some("http://agent:9000".into()),
            ..Default::default()
        };
        assert_eq!(section.resolved_mode().unwrap(), SupervisorMode::Connect);

        section.command = Some("./agent".into());
        assert_eq!(section.resolved_mode().unwrap(), SupervisorMode::Launch);

        section.mode = Some(SupervisorMode::Connect);
        assert_eq!(section.resolved_mode().unwrap(), SupervisorMode::Connect);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[bridge]
response_timeout_ms = 2000
async_mode = true
session_policy = "per_call"

[supervisor]
command = "python"
args = ["-m", "agent"]
restart_on_crash = false

[supervisor.backoff]
initial_ms = 250

[supervisor.readiness]
kind = "port"
port = 8123

[[actions]]
name = "weather"
topic = "agents/weather/{{city}}"
response_format = "json"

[[actions.parameters]]
name = "city"
kind = "string"
required = true
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.bridge.response_timeout_ms, 2000);
        assert!(cfg.bridge.async_mode);
        assert_eq!(cfg.bridge.session_policy, SessionIdPolicy::PerCall);
        assert_eq!(cfg.bridge.pending_ttl_secs, 600);
        assert_eq!(cfg.supervisor.command.as_deref(), Some("python"));
        assert_eq!(cfg.supervisor.args, vec!["-m", "agent"]);
        assert!(!cfg.supervisor.restart_on_crash);
        assert_eq!(cfg.supervisor.backoff.initial_ms, 250);
        assert_eq!(cfg.supervisor.backoff.max_ms, 30_000);
        assert_eq!(cfg.supervisor.readiness.kind, ReadinessKind::Port);
        assert_eq!(cfg.supervisor.readiness.port, Some(8123));
        assert_eq!(cfg.actions.len(), 1);
        assert_eq!(cfg.actions[0].topic, "agents/weather/{city}");
        assert_eq!(cfg.actions[0].parameters[0].name, "city");
    }
}

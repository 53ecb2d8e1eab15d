//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `FLOWDESK__*` 覆盖（双下划线表示嵌套，如 `FLOWDESK__RUNTIME__PROVIDER=echo`），
//! 最后应用约定俗成的单变量：`OPENAI_API_KEY`、`OPENAI_MODEL`、`PORT`、`DEBUG`。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::AgentError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub server: ServerSection,
    pub runtime: RuntimeSection,
    pub agent: AgentSection,
    pub approval: ApprovalSection,
}

/// [app] 段：应用名、运行环境、调试日志开关
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// /health 中回报的环境名
    pub environment: String,
    pub debug: bool,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "flowdesk".to_string(),
            environment: "development".to_string(),
            debug: false,
        }
    }
}

/// [server] 段：监听地址与 SSE 心跳间隔
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            heartbeat_interval_secs: 30,
        }
    }
}

impl ServerSection {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// [runtime] 段：外部 Agent Runtime 的选择、凭据与初始化/健康检查策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    /// openai / echo
    pub provider: String,
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: Option<String>,
    /// 初始化最多尝试次数
    pub max_init_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub health_check_interval_secs: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            max_init_retries: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 10_000,
            health_check_interval_secs: 300,
        }
    }
}

impl RuntimeSection {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// [agent] 段：Agent 名称、指令与单轮超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub name: String,
    pub instructions: String,
    /// 整轮对话超时（秒）
    pub turn_timeout_secs: u64,
    /// 工具调用开始后等待下一个事件的超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            name: "Customer Support Agent".to_string(),
            instructions: "You are a helpful customer support agent. Answer concisely and ask for \
                           approval before taking actions on the customer's account."
                .to_string(),
            turn_timeout_secs: 120,
            tool_timeout_secs: 30,
        }
    }
}

impl AgentSection {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

/// [approval] 段：工具审批关联的两个时间窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalSection {
    /// 存储 TTL：超过即在下次 lookup 时清除
    pub storage_ttl_ms: u64,
    /// 相关性 TTL：仅此窗口内的记录参与关联
    pub relevance_ttl_ms: u64,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            storage_ttl_ms: 10_000,
            relevance_ttl_ms: 5_000,
        }
    }
}

impl AppConfig {
    /// 启动时校验；失败即为致命的配置错误
    pub fn validate(&self) -> Result<(), AgentError> {
        match self.runtime.provider.as_str() {
            "openai" => {
                let has_key = self
                    .runtime
                    .api_key
                    .as_deref()
                    .is_some_and(|k| !k.trim().is_empty());
                if !has_key {
                    return Err(AgentError::Config(
                        "runtime.api_key (or OPENAI_API_KEY) is required for the openai provider"
                            .to_string(),
                    ));
                }
            }
            "echo" => {}
            other => {
                return Err(AgentError::Config(format!(
                    "unknown runtime provider '{other}' (expected openai or echo)"
                )));
            }
        }
        if self.runtime.model.trim().is_empty() {
            return Err(AgentError::Config("runtime.model must not be empty".to_string()));
        }
        if self.server.port == 0 {
            return Err(AgentError::Config("server.port must not be 0".to_string()));
        }
        if self.server.heartbeat_interval_secs == 0 || self.runtime.health_check_interval_secs == 0 {
            return Err(AgentError::Config(
                "heartbeat and health check intervals must be at least 1 second".to_string(),
            ));
        }
        if self.runtime.max_init_retries == 0 {
            return Err(AgentError::Config(
                "runtime.max_init_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// 约定俗成的单变量覆盖
    fn apply_env_overrides(&mut self) -> Result<(), AgentError> {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if !key.trim().is_empty() {
                self.runtime.api_key = Some(key);
            }
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            if !model.trim().is_empty() {
                self.runtime.model = model;
            }
        }
        if let Ok(port) = std::env::var("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|_| AgentError::Config(format!("PORT is not a valid port: {port}")))?;
        }
        if let Ok(debug) = std::env::var("DEBUG") {
            self.app.debug = matches!(debug.trim(), "1" | "true" | "TRUE" | "yes");
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 FLOWDESK__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 叠加环境变量 FLOWDESK__*（双下划线表示嵌套键）
/// 4. 应用 OPENAI_API_KEY / OPENAI_MODEL / PORT / DEBUG
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, AgentError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
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
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("FLOWDESK")
            .separator("__")
            .try_parsing(true),
    );

    let mut cfg: AppConfig = builder
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| AgentError::Config(e.to_string()))?;
    cfg.apply_env_overrides()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn echo_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.runtime.provider = "echo".to_string();
        cfg
    }

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 3001);
        assert_eq!(cfg.server.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(cfg.runtime.max_init_retries, 3);
        assert_eq!(cfg.runtime.backoff_base_ms, 1000);
        assert_eq!(cfg.runtime.backoff_max_ms, 10_000);
        assert_eq!(cfg.runtime.health_check_interval(), Duration::from_secs(300));
        assert_eq!(cfg.approval.storage_ttl_ms, 10_000);
        assert_eq!(cfg.approval.relevance_ttl_ms, 5_000);
    }

    #[test]
    fn test_validate_openai_requires_key() {
        let cfg = AppConfig::default();
        assert!(matches!(cfg.validate(), Err(AgentError::Config(_))));

        let mut cfg = AppConfig::default();
        cfg.runtime.api_key = Some("   ".to_string());
        assert!(matches!(cfg.validate(), Err(AgentError::Config(_))));

        cfg.runtime.api_key = Some("sk-test".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_echo_without_key() {
        assert!(echo_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_provider_and_empty_model() {
        let mut cfg = echo_config();
        cfg.runtime.provider = "llama".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("llama"));

        let mut cfg = echo_config();
        cfg.runtime.model = String::new();
        assert!(matches!(cfg.validate(), Err(AgentError::Config(_))));

        let mut cfg = echo_config();
        cfg.server.port = 0;
        assert!(matches!(cfg.validate(), Err(AgentError::Config(_))));

        let mut cfg = echo_config();
        cfg.server.heartbeat_interval_secs = 0;
        assert!(matches!(cfg.validate(), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_load_config_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[app]
environment = "staging"

[server]
heartbeat_interval_secs = 10

[runtime]
provider = "echo"
model = "echo-1"
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.app.environment, "staging");
        assert_eq!(cfg.server.heartbeat_interval_secs, 10);
        assert_eq!(cfg.runtime.provider, "echo");
        assert_eq!(cfg.agent.turn_timeout_secs, 120);
    }
}

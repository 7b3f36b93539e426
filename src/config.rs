//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DRONE__*` 覆盖（双下划线表示嵌套，如 `DRONE__LLM__PROVIDER=openai`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::retry::RetryConfig;
use crate::sandbox::{SandboxBackend, SandboxPolicy, DEFAULT_OUTPUT_LIMIT};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub agent: AgentSection,
    pub llm: LlmSection,
    pub sandbox: SandboxSection,
    pub tools: ToolsSection,
    pub telemetry: TelemetrySection,
}

/// [app] 段：应用名、工作目录
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 工具与本地沙箱的根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
}

impl AppSection {
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("workspace"))
    }
}

/// [agent] 段：循环上限与反思策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 最大循环数，0 表示不限
    pub max_cycles: usize,
    /// 忽略 reflect 的停止建议
    pub continuous: bool,
    /// 连续失败达到该值时 reflect 建议停止
    pub max_consecutive_failures: Option<u32>,
    /// 每轮等待用户反馈的上限（毫秒）
    pub feedback_timeout_ms: u64,
    /// 单次模型调用超时（秒）
    pub model_timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_cycles: 20,
            continuous: false,
            max_consecutive_failures: None,
            feedback_timeout_ms: 50,
            model_timeout_secs: 60,
        }
    }
}

impl AgentSection {
    pub fn max_cycles(&self) -> Option<usize> {
        (self.max_cycles > 0).then_some(self.max_cycles)
    }

    pub fn feedback_timeout(&self) -> Duration {
        Duration::from_millis(self.feedback_timeout_ms)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }
}

/// 单个模型后端（主后端与 [[llm.fallbacks]] 共用）
#[derive(Debug, Clone, Deserialize)]
pub struct LlmBackendSection {
    /// openai / azure / anthropic(claude) / ollama(local) / mock
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub embedding_model: Option<String>,
    /// 仅 azure
    pub api_version: Option<String>,
}

/// [llm] 段：主后端、采样参数、超时、重试、fallback 链
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub embedding_model: Option<String>,
    pub api_version: Option<String>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// false 时不发送函数声明，改为在 system prompt 中要求 JSON 响应
    pub function_calling: bool,
    pub timeouts: LlmTimeoutsSection,
    /// 存在 [llm.retry] 时启用重试包装
    pub retry: Option<RetryConfig>,
    pub fallbacks: Vec<LlmBackendSection>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            base_url: None,
            embedding_model: None,
            api_version: None,
            temperature: 0.7,
            max_tokens: None,
            function_calling: true,
            timeouts: LlmTimeoutsSection::default(),
            retry: None,
            fallbacks: Vec::new(),
        }
    }
}

impl LlmSection {
    pub fn primary(&self) -> LlmBackendSection {
        LlmBackendSection {
            provider: self.provider.clone(),
            model: self.model.clone(),
            api_key: self.api_key.clone(),
            base_url: self.base_url.clone(),
            embedding_model: self.embedding_model.clone(),
            api_version: self.api_version.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    pub request: u64,
    pub stream: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: 60,
            stream: 120,
        }
    }
}

impl LlmTimeoutsSection {
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request)
    }

    pub fn stream(&self) -> Duration {
        Duration::from_secs(self.stream)
    }
}

/// [sandbox] 段：执行器类型、策略（[sandbox.policy]，加载时校验）、输出上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub backend: SandboxBackend,
    pub policy: SandboxPolicy,
    pub output_limit_bytes: usize,
    /// 临时目录根；docker 默认为 workspace/.drone_tmp
    pub scratch_root: Option<PathBuf>,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Local,
            policy: SandboxPolicy::default(),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT,
            scratch_root: None,
        }
    }
}

/// [tools] 段：单次调用超时、启用列表、网页工具、各工具私有配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub tool_timeout_secs: u64,
    /// 为空时注册全部内置工具
    pub enabled: Vec<String>,
    pub web: WebSection,
    /// [tools.settings.<name>]，经 ToolContext 传给对应工具
    pub settings: HashMap<String, serde_json::Value>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            enabled: Vec::new(),
            web: WebSection::default(),
            settings: HashMap::new(),
        }
    }
}

impl ToolsSection {
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.is_empty() || self.enabled.iter().any(|n| n == name)
    }
}

/// [tools.web] 段：抓取超时、最大字符数、允许的域名白名单
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub timeout_secs: u64,
    pub max_result_chars: usize,
    pub allowed_domains: Vec<String>,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            max_result_chars: 8000,
            allowed_domains: default_allowed_domains(),
        }
    }
}

fn default_allowed_domains() -> Vec<String> {
    [
        "en.wikipedia.org",
        "github.com",
        "raw.githubusercontent.com",
        "stackoverflow.com",
        "docs.rs",
        "crates.io",
        "doc.rust-lang.org",
        "docs.python.org",
        "pypi.org",
        "www.npmjs.com",
        "nodejs.org",
        "developer.mozilla.org",
        "arxiv.org",
        "news.ycombinator.com",
        "html.duckduckgo.com",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// [telemetry] 段：日志格式与过滤
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    /// pretty / json
    pub log_format: String,
    /// EnvFilter 指令，RUST_LOG 优先
    pub filter: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            log_format: "pretty".to_string(),
            filter: "info".to_string(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 DRONE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DRONE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        if !path.exists() {
            return Err(config::ConfigError::NotFound(path.display().to_string()));
        }
        builder = builder.add_source(config::File::from(path));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DRONE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(toml: &str) -> Result<AppConfig, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    #[test]
    fn test_defaults() {
        let config = from_toml("").unwrap();
        assert_eq!(config.agent.max_cycles(), Some(20));
        assert_eq!(config.llm.provider, "mock");
        assert!(config.llm.function_calling);
        assert!(config.llm.retry.is_none());
        assert_eq!(config.sandbox.backend, SandboxBackend::Local);
        assert_eq!(config.sandbox.output_limit_bytes, 8000);
        assert_eq!(config.sandbox.policy.max_cpu_seconds(), 30);
    }

    #[test]
    fn test_sections_parse() {
        let config = from_toml(
            r#"
            [agent]
            max_cycles = 0
            continuous = true

            [llm]
            provider = "openai"
            model = "gpt-4o"

            [llm.retry]
            max_attempts = 5

            [[llm.fallbacks]]
            provider = "ollama"
            model = "llama3"

            [sandbox]
            backend = "docker"

            [sandbox.policy]
            max_cpu_seconds = 10
            max_memory_mb = 1024
            network_access = "none"

            [tools.settings.web_fetch]
            user_agent = "drone-test"
            "#,
        )
        .unwrap();
        assert_eq!(config.agent.max_cycles(), None);
        assert!(config.agent.continuous);
        assert_eq!(config.llm.retry.unwrap().max_attempts, 5);
        assert_eq!(config.llm.fallbacks[0].provider, "ollama");
        assert_eq!(config.sandbox.backend, SandboxBackend::Docker);
        assert_eq!(config.sandbox.policy.max_memory_mb(), 1024);
        assert_eq!(
            config.tools.settings["web_fetch"]["user_agent"],
            serde_json::json!("drone-test")
        );
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let err = from_toml(
            r#"
            [sandbox.policy]
            max_cpu_seconds = 1000
            "#,
        );
        assert!(err.is_err());
    }
}

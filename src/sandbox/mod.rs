//! 代码沙箱：策略校验、执行器（本地子进程 / Docker 容器）与输出处理
//!
//! 所有执行器实现 CodeExecutor：execute(request) 永远返回 CodeExecutionResult，
//! 内部失败（语言不支持、超时、容器错误）映射为非零退出码与说明性 stderr，不向上抛错。

pub mod demux;
#[cfg(feature = "docker")]
pub mod docker;
pub mod factory;
pub mod language;
pub mod local;
pub mod policy;
pub mod utils;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "docker")]
pub use docker::DockerExecutor;
pub use factory::{create_executor, SandboxBackend};
pub use language::Language;
pub use local::LocalExecutor;
pub use policy::{FilesystemScope, NetworkAccess, SandboxPolicy};
pub use utils::{OutputCapture, DEFAULT_OUTPUT_LIMIT};

/// 超时时使用的退出码（与 coreutils timeout 一致）
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// 沙箱层错误：构造期（策略、运行时不可达）与执行期（语言、路径、容器）错误
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Invalid sandbox policy: {0}")]
    InvalidPolicy(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Sandbox runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Execution timeout after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// 随代码一起写入临时目录的辅助文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionFile {
    /// 相对路径（不允许绝对路径与 `..`）
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub executable: bool,
}

/// 一次代码执行请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub language: String,
    pub code: String,
    /// 覆盖策略中的 max_cpu_seconds
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub files: Vec<ExecutionFile>,
    /// 合并在白名单环境变量之后
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_file(mut self, file: ExecutionFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

/// 执行结果：即使内部失败也总是完整返回
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    /// stdout 或 stderr 是否被截断
    pub truncated: bool,
    #[serde(default)]
    pub timed_out: bool,
}

impl CodeExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// 内部失败映射：exit_code=1，stderr 为错误说明
    pub fn from_error(err: &SandboxError, duration_ms: u64) -> Self {
        let timed_out = matches!(err, SandboxError::Timeout(_));
        Self {
            stdout: String::new(),
            stderr: err.to_string(),
            exit_code: if timed_out { TIMEOUT_EXIT_CODE } else { 1 },
            duration_ms,
            truncated: false,
            timed_out,
        }
    }
}

/// 代码执行器：策略在构造时校验，execute 不返回错误
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    /// 执行器类型（local / docker），用于日志
    fn kind(&self) -> &'static str;

    fn policy(&self) -> &SandboxPolicy;

    async fn execute(&self, request: ExecutionRequest) -> CodeExecutionResult;
}

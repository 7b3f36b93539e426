//! Agent 错误类型
//!
//! 工具与沙箱失败在执行器边界被转换为失败的 ActionResult，模型失败被转换为合成的 task_complete；
//! 只有 hook / memory / 存储等错误会以 AgentError 形式冒泡出 AgentLoop::start。

use thiserror::Error;

use crate::llm::LlmError;
use crate::memory::MemoryError;
use crate::sandbox::SandboxError;

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 模型后端错误；是否可重试取决于内部 LlmError
    #[error("LLM provider error: {0}")]
    Provider(#[from] LlmError),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Config error: {0}")]
    Configuration(String),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Hook {event} failed: {message}")]
    Hook { event: String, message: String },

    #[error("Agent is already running: {0}")]
    AlreadyRunning(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl AgentError {
    /// Provider（按内部错误判断）与 Timeout 可由上层重试；其余不可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Provider(e) => e.is_retryable(),
            AgentError::Timeout(_) => true,
            _ => false,
        }
    }

    pub fn hook(event: impl Into<String>, message: impl Into<String>) -> Self {
        AgentError::Hook {
            event: event.into(),
            message: message.into(),
        }
    }
}

impl From<config::ConfigError> for AgentError {
    fn from(e: config::ConfigError) -> Self {
        AgentError::Configuration(e.to_string())
    }
}

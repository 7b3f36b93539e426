//! Drone - Rust 自主任务执行引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、重试、运行登记、持久化与事件契约、AgentRunner
//! - **llm**: 模型提供方抽象与实现（OpenAI 兼容 / Anthropic / Ollama / Mock）、fallback 与重试
//! - **memory**: 每轮计划与结果的记忆
//! - **observability**: 日志初始化
//! - **react**: 思考过程、生命周期钩子、Agent 主循环
//! - **sandbox**: 代码执行沙箱（本地子进程 / Docker 容器）
//! - **tools**: 工具注册表、动作执行器与内置工具

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod sandbox;
pub mod tools;

pub use crate::config::{load_config, AppConfig};
pub use crate::core::{AgentError, AgentRunner};
pub use crate::react::{AgentLoop, AgentLoopContext, AgentLoopOptions, LoopOutcome, StopReason};

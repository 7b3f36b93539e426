//! 记忆层：记录每轮的计划与结果，供下一轮 prompt 使用
//!
//! MemoryManager 是循环与存储之间的契约；InMemoryMemoryManager 为进程内实现
//! （关键词检索 + 可选的 embedding 相似度检索）。

pub mod in_memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::react::actions::{ActionProposal, ActionResult};

pub use in_memory::InMemoryMemoryManager;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("memory store unavailable: {0}")]
    Unavailable(String),

    #[error("embedding failed: {0}")]
    Embedding(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Observation,
    Reflection,
    Plan,
    Result,
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MemoryKind::Observation => "observation",
            MemoryKind::Reflection => "reflection",
            MemoryKind::Plan => "plan",
            MemoryKind::Result => "result",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub kind: MemoryKind,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn new(kind: MemoryKind, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            content: content.into(),
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// 结果记录是否失败（非结果记录视为未失败）
    pub fn is_failure(&self) -> bool {
        self.kind == MemoryKind::Result
            && self.metadata.get("success").and_then(Value::as_bool) == Some(false)
    }
}

/// 快照：short_term 为最近记录（旧到新），long_term 为窗口之外值得回顾的记录（新到旧）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub short_term: Vec<MemoryRecord>,
    pub long_term: Vec<MemoryRecord>,
}

#[async_trait]
pub trait MemoryManager: Send + Sync {
    async fn capture_proposal(&self, proposal: &ActionProposal) -> Result<(), MemoryError>;

    async fn capture_result(&self, result: &ActionResult) -> Result<(), MemoryError>;

    async fn snapshot(&self) -> Result<MemorySnapshot, MemoryError>;

    /// 关键词检索，最相关在前
    async fn recall(&self, query: &str, limit: usize) -> Result<Vec<MemoryRecord>, MemoryError>;

    async fn vector_search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryError>;
}

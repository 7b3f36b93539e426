//! Agent 持久化契约与内存实现
//!
//! 持久层（数据库等）只需实现 AgentStore；InMemoryAgentStore 供 CLI 与测试使用。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub task: String,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Thought,
    Result,
    Feedback,
    System,
    Info,
}

/// 会话记录中的一条消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub id: Uuid,
    pub agent_id: String,
    pub role: MessageRole,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: Value,
    pub created_at: DateTime<Utc>,
    pub handled: bool,
    pub handled_by: Option<String>,
}

impl TranscriptMessage {
    pub fn new(agent_id: impl Into<String>, role: MessageRole, kind: MessageKind, content: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            role,
            kind,
            content,
            created_at: Utc::now(),
            handled: false,
            handled_by: None,
        }
    }

    /// 纯文本消息：content 为 {"text": ...}
    pub fn text(agent_id: impl Into<String>, role: MessageRole, kind: MessageKind, text: impl Into<String>) -> Self {
        Self::new(agent_id, role, kind, json!({ "text": text.into() }))
    }

    /// content.text，没有时退回整段 JSON
    pub fn text_content(&self) -> String {
        match self.content.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => self.content.to_string(),
        }
    }
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn find_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, AgentError>;

    async fn update_status(&self, agent_id: &str, status: AgentStatus) -> Result<(), AgentError>;

    async fn append_message(&self, message: TranscriptMessage) -> Result<TranscriptMessage, AgentError>;

    /// 取出并标记为已处理的用户反馈（按时间顺序）
    async fn take_pending_feedback(&self, agent_id: &str, handled_by: &str) -> Result<Vec<TranscriptMessage>, AgentError>;
}

#[derive(Default)]
pub struct InMemoryAgentStore {
    agents: RwLock<HashMap<String, AgentRecord>>,
    messages: RwLock<Vec<TranscriptMessage>>,
}

impl InMemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_agent(&self, task: impl Into<String>) -> AgentRecord {
        let record = AgentRecord {
            id: Uuid::new_v4().to_string(),
            task: task.into(),
            status: AgentStatus::Idle,
            created_at: Utc::now(),
        };
        self.agents
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        record
    }

    /// 操作员消息，下一轮由反馈提供方取走
    pub async fn push_feedback(&self, agent_id: &str, text: impl Into<String>) -> TranscriptMessage {
        let message = TranscriptMessage::text(agent_id, MessageRole::User, MessageKind::Feedback, text);
        self.messages.write().await.push(message.clone());
        message
    }

    pub async fn messages(&self, agent_id: &str) -> Vec<TranscriptMessage> {
        self.messages
            .read()
            .await
            .iter()
            .filter(|m| m.agent_id == agent_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn find_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, AgentError> {
        Ok(self.agents.read().await.get(agent_id).cloned())
    }

    async fn update_status(&self, agent_id: &str, status: AgentStatus) -> Result<(), AgentError> {
        let mut agents = self.agents.write().await;
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| AgentError::AgentNotFound(agent_id.to_string()))?;
        record.status = status;
        Ok(())
    }

    async fn append_message(&self, message: TranscriptMessage) -> Result<TranscriptMessage, AgentError> {
        self.messages.write().await.push(message.clone());
        Ok(message)
    }

    async fn take_pending_feedback(&self, agent_id: &str, handled_by: &str) -> Result<Vec<TranscriptMessage>, AgentError> {
        let mut messages = self.messages.write().await;
        let mut taken = Vec::new();
        for message in messages.iter_mut().filter(|m| {
            m.agent_id == agent_id && m.kind == MessageKind::Feedback && !m.handled
        }) {
            message.handled = true;
            message.handled_by = Some(handled_by.to_string());
            taken.push(message.clone());
        }
        Ok(taken)
    }
}

//! Agent 事件广播：运行状态变化与新的会话消息
//!
//! 事件序列化为 `{"type": ..., ...}` 的 JSON，供 WebSocket / SSE 等外层转发。

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::store::TranscriptMessage;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStatus { agent_id: String, running: bool },
    /// 追加到会话记录的新消息
    #[serde(rename = "agent_event")]
    Message {
        agent_id: String,
        message: TranscriptMessage,
    },
}

impl AgentEvent {
    pub fn agent_id(&self) -> &str {
        match self {
            AgentEvent::AgentStatus { agent_id, .. } | AgentEvent::Message { agent_id, .. } => agent_id,
        }
    }
}

/// 事件出口；发送失败（无订阅者等）不影响 Agent 运行
pub trait EventSink: Send + Sync {
    fn emit(&self, event: AgentEvent);
}

/// 基于 tokio broadcast 的事件总线
#[derive(Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<AgentEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }
}

/// 记录所有事件（测试与 CLI 回放用）
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<AgentEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AgentEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: AgentEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_event_json() {
        let event = AgentEvent::AgentStatus {
            agent_id: "a1".into(),
            running: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "agent_status");
        assert_eq!(json["agent_id"], "a1");
        assert_eq!(json["running"], true);
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let sink = BroadcastEventSink::new(8);
        // 无订阅者时发送不报错
        sink.emit(AgentEvent::AgentStatus {
            agent_id: "a1".into(),
            running: true,
        });
        let mut rx = sink.subscribe();
        sink.emit(AgentEvent::AgentStatus {
            agent_id: "a1".into(),
            running: false,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.agent_id(), "a1");
        assert!(matches!(event, AgentEvent::AgentStatus { running: false, .. }));
    }
}

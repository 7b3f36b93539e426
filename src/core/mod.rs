//! 核心编排层：错误、重试、运行登记、持久化与事件契约、AgentRunner

pub mod error;
pub mod events;
pub mod retry;
pub mod runner;
pub mod running;
pub mod store;

pub use error::AgentError;
pub use events::{AgentEvent, BroadcastEventSink, EventSink, MemoryEventSink};
pub use retry::{retry_with_backoff, RetryConfig};
pub use runner::AgentRunner;
pub use running::{RunningAgents, RunningGuard};
pub use store::{
    AgentRecord, AgentStatus, AgentStore, InMemoryAgentStore, MessageKind, MessageRole,
    TranscriptMessage,
};

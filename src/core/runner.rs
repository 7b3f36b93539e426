//! AgentRunner：按 agent id 启动 / 停止后台 AgentLoop
//!
//! 同一 id 同时只允许一个循环；运行过程写入会话记录（AgentStore）并广播事件（EventSink），
//! 用户在运行中追加的反馈消息在下一轮开始时并入 prompt。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::core::events::{AgentEvent, EventSink};
use crate::core::running::{RunningAgents, RunningGuard};
use crate::core::store::{AgentRecord, AgentStatus, AgentStore, MessageKind, MessageRole, TranscriptMessage};
use crate::core::AgentError;
use crate::llm::{create_provider, LlmProvider};
use crate::memory::InMemoryMemoryManager;
use crate::react::{
    AgentCycleContext, AgentLoop, AgentLoopContext, AgentLoopOptions, DefaultThoughtProcess,
    FeedbackProvider, HookEvent, HookHandler, LifecycleHooks,
};
use crate::sandbox::create_executor;
use crate::tools::{register_builtin_tools, DefaultActionExecutor, ToolRegistry};

/// 处理反馈消息时写入 handled_by 的标识
const HANDLER_ID: &str = "agent-runner";

pub struct AgentRunner {
    config: AppConfig,
    store: Arc<dyn AgentStore>,
    events: Arc<dyn EventSink>,
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    running: Arc<RunningAgents>,
}

impl AgentRunner {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn AgentStore>,
        events: Arc<dyn EventSink>,
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            events,
            provider,
            tools,
            running: Arc::new(RunningAgents::new()),
        }
    }

    /// 按配置创建模型提供方、代码执行器与内置工具
    pub async fn from_config(
        config: AppConfig,
        store: Arc<dyn AgentStore>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, AgentError> {
        let provider = create_provider(&config.llm)?;
        let workspace = config.app.workspace_root();
        let code_executor = create_executor(&config.sandbox, &workspace).await?;
        let mut tools = ToolRegistry::new();
        register_builtin_tools(&mut tools, &config.tools, Some(code_executor));
        Ok(Self::new(config, store, events, provider, Arc::new(tools)))
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn is_running(&self, agent_id: &str) -> bool {
        self.running.contains(agent_id)
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.running.ids()
    }

    /// 启动后台循环；同一 id 已在运行时返回 AlreadyRunning，找不到 agent 时返回 AgentNotFound
    pub async fn start(&self, agent_id: &str) -> Result<JoinHandle<()>, AgentError> {
        let options = AgentLoopOptions::from_config(&self.config.agent)
            .with_hooks(LifecycleHooks::all(Arc::new(TranscriptHook {
                agent_id: agent_id.to_string(),
                store: self.store.clone(),
                events: self.events.clone(),
            })))
            .with_feedback(Arc::new(StoreFeedback {
                agent_id: agent_id.to_string(),
                store: self.store.clone(),
            }));
        let agent_loop = Arc::new(AgentLoop::new(options));

        let guard = self.running.claim(agent_id, agent_loop.clone())?;
        let record = self
            .store
            .find_agent(agent_id)
            .await?
            .ok_or_else(|| AgentError::AgentNotFound(agent_id.to_string()))?;

        let ctx = self.loop_context(&record);
        let run = AgentRun {
            store: self.store.clone(),
            events: self.events.clone(),
            agent_loop,
        };
        self.events.emit(AgentEvent::AgentStatus {
            agent_id: agent_id.to_string(),
            running: true,
        });
        tracing::info!(agent_id = %agent_id, "agent run spawned");
        Ok(tokio::spawn(run.execute(ctx, guard)))
    }

    /// 请求协作式停止；未在运行时返回 false
    pub fn stop(&self, agent_id: &str) -> bool {
        match self.running.get(agent_id) {
            Some(agent_loop) => {
                agent_loop.stop();
                tracing::info!(agent_id = %agent_id, "stop requested");
                true
            }
            None => false,
        }
    }

    fn loop_context(&self, record: &AgentRecord) -> AgentLoopContext {
        let llm = &self.config.llm;
        let workspace: PathBuf = self.config.app.workspace_root();
        let thought = DefaultThoughtProcess::new(self.provider.clone(), self.tools.clone(), llm.model.clone())
            .with_temperature(llm.temperature)
            .with_max_tokens(llm.max_tokens)
            .with_timeout(self.config.agent.model_timeout())
            .with_function_calling(llm.function_calling);
        let executor = DefaultActionExecutor::new(self.tools.clone(), workspace.clone())
            .with_timeout(Duration::from_secs(self.config.tools.tool_timeout_secs))
            .with_settings(self.config.tools.settings.clone());

        let mut config = Map::new();
        config.insert(
            "workspace_root".to_string(),
            Value::String(workspace.display().to_string()),
        );
        AgentLoopContext::new(
            record.id.clone(),
            record.task.clone(),
            Arc::new(InMemoryMemoryManager::new()),
            Arc::new(thought),
            Arc::new(executor),
        )
        .with_config(config)
    }
}

/// 一次后台运行所需的全部句柄
struct AgentRun {
    store: Arc<dyn AgentStore>,
    events: Arc<dyn EventSink>,
    agent_loop: Arc<AgentLoop>,
}

impl AgentRun {
    async fn execute(self, ctx: AgentLoopContext, guard: RunningGuard) {
        let agent_id = guard.agent_id().to_string();
        self.set_status(&agent_id, AgentStatus::Running).await;
        self.system_message(&agent_id, MessageRole::System, "Agent execution started.")
            .await;

        match self.agent_loop.start(ctx).await {
            Ok(outcome) => {
                tracing::info!(agent_id = %agent_id, cycles = outcome.cycles, reason = ?outcome.reason, "agent run completed");
                self.system_message(
                    &agent_id,
                    MessageRole::Assistant,
                    "Agent execution completed successfully.",
                )
                .await;
                self.set_status(&agent_id, AgentStatus::Completed).await;
            }
            Err(e) => {
                tracing::error!(agent_id = %agent_id, error = %e, "Agent execution failed");
                self.system_message(
                    &agent_id,
                    MessageRole::System,
                    &format!("Agent execution failed: {}", e),
                )
                .await;
                self.set_status(&agent_id, AgentStatus::Failed).await;
            }
        }

        drop(guard);
        self.events.emit(AgentEvent::AgentStatus {
            agent_id,
            running: false,
        });
    }

    async fn set_status(&self, agent_id: &str, status: AgentStatus) {
        if let Err(e) = self.store.update_status(agent_id, status).await {
            tracing::warn!(agent_id = %agent_id, ?status, error = %e, "failed to record agent status");
        }
    }

    async fn system_message(&self, agent_id: &str, role: MessageRole, text: &str) {
        let message = TranscriptMessage::text(agent_id, role, MessageKind::System, text);
        match self.store.append_message(message).await {
            Ok(message) => self.events.emit(AgentEvent::Message {
                agent_id: agent_id.to_string(),
                message,
            }),
            Err(e) => tracing::warn!(agent_id = %agent_id, error = %e, "failed to append transcript message"),
        }
    }
}

/// 把循环的生命周期事件写入会话记录
struct TranscriptHook {
    agent_id: String,
    store: Arc<dyn AgentStore>,
    events: Arc<dyn EventSink>,
}

impl TranscriptHook {
    fn message_for(&self, event: &HookEvent<'_>) -> Option<TranscriptMessage> {
        let id = self.agent_id.as_str();
        let message = match event {
            HookEvent::CycleStart(ctx) => TranscriptMessage::text(
                id,
                MessageRole::System,
                MessageKind::Info,
                format!("Cycle {} started.", ctx.cycle + 1),
            ),
            HookEvent::ActionProposed(proposal, _) => TranscriptMessage::new(
                id,
                MessageRole::Assistant,
                MessageKind::Thought,
                json!({
                    "command": proposal.command,
                    "arguments": proposal.arguments,
                    "reasoning": proposal.reasoning,
                    "plan": proposal.plan,
                }),
            ),
            HookEvent::ActionCompleted(result, _) => TranscriptMessage::new(
                id,
                MessageRole::Assistant,
                MessageKind::Result,
                json!({
                    "success": result.success,
                    "summary": result.summary,
                    "output": result.output,
                    "error": result.error,
                }),
            ),
            HookEvent::CycleEnd(_) => return None,
            HookEvent::Terminate(_) => TranscriptMessage::text(
                id,
                MessageRole::System,
                MessageKind::System,
                "Agent execution terminated.",
            ),
        };
        Some(message)
    }
}

#[async_trait]
impl HookHandler for TranscriptHook {
    async fn handle(&self, event: HookEvent<'_>) -> Result<(), AgentError> {
        let Some(message) = self.message_for(&event) else {
            return Ok(());
        };
        let message = self.store.append_message(message).await?;
        self.events.emit(AgentEvent::Message {
            agent_id: self.agent_id.clone(),
            message,
        });
        Ok(())
    }
}

/// 每轮取走待处理的用户反馈，多条按行拼接
struct StoreFeedback {
    agent_id: String,
    store: Arc<dyn AgentStore>,
}

#[async_trait]
impl FeedbackProvider for StoreFeedback {
    async fn feedback(&self, _ctx: &AgentCycleContext) -> Option<String> {
        let pending = match self.store.take_pending_feedback(&self.agent_id, HANDLER_ID).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(agent_id = %self.agent_id, error = %e, "failed to read pending feedback");
                return None;
            }
        };
        let collected: Vec<String> = pending
            .iter()
            .map(TranscriptMessage::text_content)
            .filter(|text| !text.is_empty())
            .collect();
        (!collected.is_empty()).then(|| collected.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::MemoryEventSink;
    use crate::core::store::InMemoryAgentStore;
    use crate::llm::MockProvider;
    use crate::tools::EchoTool;

    fn runner(store: Arc<InMemoryAgentStore>, events: Arc<MemoryEventSink>) -> AgentRunner {
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        let mut config = AppConfig::default();
        config.app.workspace_root = Some(std::env::temp_dir());
        AgentRunner::new(config, store, events, Arc::new(MockProvider::new()), Arc::new(tools))
    }

    #[tokio::test]
    async fn test_run_records_transcript_and_status() {
        let store = Arc::new(InMemoryAgentStore::new());
        let events = Arc::new(MemoryEventSink::new());
        let agent = store.create_agent("say hello").await;
        let runner = runner(store.clone(), events.clone());

        let handle = runner.start(&agent.id).await.unwrap();
        handle.await.unwrap();

        let record = store.find_agent(&agent.id).await.unwrap().unwrap();
        assert_eq!(record.status, AgentStatus::Completed);
        assert!(!runner.is_running(&agent.id));

        let texts: Vec<String> = store
            .messages(&agent.id)
            .await
            .iter()
            .filter(|m| m.kind != MessageKind::Thought && m.kind != MessageKind::Result)
            .map(TranscriptMessage::text_content)
            .collect();
        assert_eq!(
            texts,
            vec![
                "Agent execution started.",
                "Cycle 1 started.",
                "Cycle 2 started.",
                "Agent execution completed successfully.",
            ]
        );

        let statuses: Vec<bool> = events
            .events()
            .iter()
            .filter_map(|e| match e {
                AgentEvent::AgentStatus { running, .. } => Some(*running),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![true, false]);
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_and_duplicate() {
        let store = Arc::new(InMemoryAgentStore::new());
        let runner = runner(store.clone(), Arc::new(MemoryEventSink::new()));

        let err = runner.start("missing").await.unwrap_err();
        assert!(matches!(err, AgentError::AgentNotFound(_)));
        assert!(!runner.is_running("missing"));

        let agent = store.create_agent("t").await;
        let _claim = runner
            .running
            .claim(&agent.id, Arc::new(AgentLoop::new(AgentLoopOptions::default())))
            .unwrap();
        let err = runner.start(&agent.id).await.unwrap_err();
        assert_eq!(err.to_string(), format!("Agent is already running: {}", agent.id));
        assert!(!runner.stop("missing"));
    }

    #[tokio::test]
    async fn test_feedback_drained_into_prompt() {
        let store = Arc::new(InMemoryAgentStore::new());
        let agent = store.create_agent("t").await;
        store.push_feedback(&agent.id, "first").await;
        store.push_feedback(&agent.id, "second").await;
        let feedback = StoreFeedback {
            agent_id: agent.id.clone(),
            store: store.clone(),
        };
        let ctx = AgentCycleContext::first(Arc::new(AgentLoopContext::new(
            agent.id.clone(),
            "t",
            Arc::new(InMemoryMemoryManager::new()),
            Arc::new(DefaultThoughtProcess::new(
                Arc::new(MockProvider::new()),
                Arc::new(ToolRegistry::new()),
                "m",
            )),
            Arc::new(DefaultActionExecutor::new(Arc::new(ToolRegistry::new()), ".")),
        )));
        assert_eq!(feedback.feedback(&ctx).await.as_deref(), Some("first\nsecond"));
        assert_eq!(feedback.feedback(&ctx).await, None);
    }

    #[tokio::test]
    async fn test_stop_right_after_start_runs_no_cycle() {
        let store = Arc::new(InMemoryAgentStore::new());
        let agent = store.create_agent("say hello").await;
        let runner = runner(store.clone(), Arc::new(MemoryEventSink::new()));

        let handle = runner.start(&agent.id).await.unwrap();
        assert!(runner.stop(&agent.id));
        handle.await.unwrap();

        let messages = store.messages(&agent.id).await;
        assert!(messages.iter().all(|m| m.kind != MessageKind::Thought));
        assert!(!messages
            .iter()
            .any(|m| m.text_content().starts_with("Cycle ")));
        let record = store.find_agent(&agent.id).await.unwrap().unwrap();
        assert_eq!(record.status, AgentStatus::Completed);
        assert!(!runner.is_running(&agent.id));
    }
}

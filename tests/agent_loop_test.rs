//! AgentLoop 集成测试：轮数上限、结束命令、未知工具、fallback

mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use drone::llm::{ChatMessage, ChatOptions, FallbackProvider, LlmProvider, MockProvider};
    use drone::memory::{InMemoryMemoryManager, MemoryManager};
    use drone::react::{
        ActionProposal, ActionResult, AgentLoop, AgentLoopContext, AgentLoopOptions,
        DefaultThoughtProcess, FnHook, HookEvent, LifecycleEvent, LifecycleHooks, StopReason,
    };
    use drone::tools::{ActionExecutor, DefaultActionExecutor, EchoTool, ToolRegistry};

    /// 记录调用次数，总是成功
    #[derive(Default)]
    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ActionExecutor for CountingExecutor {
        async fn execute(&self, proposal: &ActionProposal) -> ActionResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ActionResult::succeeded(proposal, Value::Null, 0)
        }
    }

    fn scripted(commands: &[&str]) -> Arc<dyn LlmProvider> {
        let responses = commands
            .iter()
            .map(|command| MockProvider::function_call(command, json!({"summary": "all done"})))
            .collect();
        Arc::new(MockProvider::scripted("script", responses))
    }

    fn context(
        provider: Arc<dyn LlmProvider>,
        memory: Arc<dyn MemoryManager>,
        executor: Arc<dyn ActionExecutor>,
    ) -> AgentLoopContext {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        AgentLoopContext::new(
            "agent-it",
            "integration task",
            memory,
            Arc::new(DefaultThoughtProcess::new(provider, Arc::new(registry), "m")),
            executor,
        )
    }

    fn recording_hooks(cycles: Arc<Mutex<Vec<usize>>>) -> LifecycleHooks {
        LifecycleHooks::new().on(
            LifecycleEvent::ActionProposed,
            Arc::new(FnHook::new(move |event: &HookEvent<'_>| {
                if let HookEvent::ActionProposed(proposal, ctx) = event {
                    assert_eq!(proposal.metadata.cycle, ctx.cycle);
                    cycles.lock().unwrap().push(proposal.metadata.cycle);
                }
                Ok(())
            })),
        )
    }

    #[tokio::test]
    async fn test_runs_exactly_max_cycles() {
        let cycles = Arc::new(Mutex::new(Vec::new()));
        let executor = Arc::new(CountingExecutor::default());
        let agent = AgentLoop::new(
            AgentLoopOptions::default()
                .with_max_cycles(Some(4))
                .with_hooks(recording_hooks(cycles.clone())),
        );

        let outcome = agent
            .start(context(
                scripted(&["echo"; 6]),
                Arc::new(InMemoryMemoryManager::new()),
                executor.clone(),
            ))
            .await
            .unwrap();

        assert_eq!(outcome.cycles, 4);
        assert_eq!(outcome.reason, StopReason::MaxCycles);
        assert_eq!(*cycles.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_terminal_command_ends_without_execute() {
        let cycles = Arc::new(Mutex::new(Vec::new()));
        let executor = Arc::new(CountingExecutor::default());
        let memory = Arc::new(InMemoryMemoryManager::new());
        let agent = AgentLoop::new(
            AgentLoopOptions::default().with_hooks(recording_hooks(cycles.clone())),
        );

        // k = 2：两轮 echo，第三轮 finish
        let outcome = agent
            .start(context(
                scripted(&["echo", "echo", "finish", "echo"]),
                memory.clone(),
                executor.clone(),
            ))
            .await
            .unwrap();

        assert_eq!(outcome.cycles, 3);
        assert_eq!(
            outcome.reason,
            StopReason::TaskComplete {
                summary: Some("all done".to_string())
            }
        );
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*cycles.lock().unwrap(), vec![0, 1, 2]);

        // 结束命令的提议仍被记入记忆，但没有对应结果
        let records = memory.records().await;
        assert_eq!(records.len(), 5);
        assert!(records[4].content.starts_with("Planned: finish"));
    }

    #[tokio::test]
    async fn test_unknown_command_yields_failed_result() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let executor = DefaultActionExecutor::new(Arc::new(registry), ".");

        let proposal = ActionProposal::new("launch_rocket", Default::default(), 0);
        let result = executor.execute(&proposal).await;

        assert!(!result.success);
        assert!(result.summary.contains("launch_rocket"));
        assert_eq!(result.error.as_deref(), Some("Tool 'launch_rocket' not found"));
        assert_eq!(result.metadata, proposal.metadata);
    }

    #[tokio::test]
    async fn test_fallback_hides_primary_error() {
        let primary: Arc<dyn LlmProvider> =
            Arc::new(MockProvider::failing("primary", "connection refused"));
        let secondary: Arc<dyn LlmProvider> = Arc::new(MockProvider::scripted(
            "secondary",
            vec![MockProvider::function_call("echo", json!({"text": "from B"}))],
        ));
        let fallback = FallbackProvider::new(vec![primary, secondary]).unwrap();

        let response = fallback
            .chat(&[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap();
        let call = response.function_call.unwrap();
        assert_eq!(call.name, "echo");
    }

    #[tokio::test]
    async fn test_model_outage_completes_loop() {
        let executor = Arc::new(CountingExecutor::default());
        let agent = AgentLoop::new(AgentLoopOptions::default());

        let outcome = agent
            .start(context(
                Arc::new(MockProvider::failing("down", "503")),
                Arc::new(InMemoryMemoryManager::new()),
                executor.clone(),
            ))
            .await
            .unwrap();

        assert_eq!(outcome.cycles, 1);
        match outcome.reason {
            StopReason::TaskComplete { summary } => {
                assert!(summary.unwrap().starts_with("Failed to generate thought from LLM"))
            }
            other => panic!("unexpected stop reason: {:?}", other),
        }
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }
}

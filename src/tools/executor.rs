//! 动作执行器
//!
//! 持有 ToolRegistry 与全局超时，execute(proposal) 按 command 查找工具并在超时内调用，
//! 任何失败（未注册、工具报错、超时）都转为失败的 ActionResult；每次调用输出结构化审计日志（JSON）
//! 并累计到 ExecutionStats。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::time::timeout;

use crate::react::actions::{ActionProposal, ActionResult};
use crate::tools::{ToolContext, ToolError, ToolRegistry};

/// 把 ActionProposal 变为 ActionResult；实现不得返回错误
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, proposal: &ActionProposal) -> ActionResult;
}

/// 调用统计（无锁累加）
#[derive(Debug, Default)]
pub struct ExecutionStats {
    invocations: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    total_duration_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
}

impl ExecutionStats {
    fn record(&self, ok: bool, duration_ms: u64) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.total_duration_ms.fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            invocations: self.invocations.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_duration_ms: self.total_duration_ms.load(Ordering::Relaxed),
        }
    }
}

/// 默认执行器：注册表查找 + 超时 + 审计
pub struct DefaultActionExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    workspace_root: PathBuf,
    settings: HashMap<String, Value>,
    stats: ExecutionStats,
}

impl DefaultActionExecutor {
    pub fn new(registry: Arc<ToolRegistry>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(30),
            workspace_root: workspace_root.into(),
            settings: HashMap::new(),
            stats: ExecutionStats::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 各工具私有配置（[tools.settings.<name>]）
    pub fn with_settings(mut self, settings: HashMap<String, Value>) -> Self {
        self.settings = settings;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn context_for(&self, proposal: &ActionProposal) -> ToolContext {
        let span = tracing::info_span!(
            "tool",
            name = %proposal.command,
            cycle = proposal.metadata.cycle
        );
        ToolContext::new(self.workspace_root.clone())
            .with_config(
                self.settings
                    .get(&proposal.command)
                    .cloned()
                    .unwrap_or(Value::Null),
            )
            .with_span(span)
    }
}

#[async_trait]
impl ActionExecutor for DefaultActionExecutor {
    async fn execute(&self, proposal: &ActionProposal) -> ActionResult {
        let start = Instant::now();
        let args_preview = args_preview(&Value::Object(proposal.arguments.clone()));

        let Some(tool) = self.registry.get(&proposal.command) else {
            let message = format!("Tool '{}' not found", proposal.command);
            audit(&proposal.command, false, "not_found", 0, &args_preview);
            self.stats.record(false, 0);
            return ActionResult::failed(proposal, format!("Failed: {}", message), message, 0);
        };

        let ctx = self.context_for(proposal);
        let invocation = tool.invoke(&proposal.arguments, &ctx);
        let result = if tool.enforces_own_timeout() {
            invocation.await
        } else {
            match timeout(self.timeout, invocation).await {
                Ok(r) => r,
                Err(_) => Err(ToolError::Timeout(self.timeout)),
            }
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(ToolError::Timeout(_)) => "timeout",
            Err(_) => "error",
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        audit(&proposal.command, result.is_ok(), outcome, duration_ms, &args_preview);
        self.stats.record(result.is_ok(), duration_ms);

        match result {
            Ok(output) => ActionResult::succeeded(proposal, output, duration_ms),
            Err(e) => {
                let error = e.to_string();
                tracing::warn!(tool = %proposal.command, error = %error, "tool failed");
                ActionResult::failed(
                    proposal,
                    format!("Failed to execute {}: {}", proposal.command, error),
                    error,
                    duration_ms,
                )
            }
        }
    }
}

fn audit(tool: &str, ok: bool, outcome: &str, duration_ms: u64, args_preview: &str) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": tool,
        "ok": ok,
        "outcome": outcome,
        "duration_ms": duration_ms,
        "args_preview": args_preview,
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

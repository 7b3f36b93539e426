//! Agent 主循环
//!
//! think -> execute -> reflect，每轮前检查停止标志与最大轮数；命令为 task_complete / finish 时正常结束。
//! 工具失败与模型失败已在各自边界转换，逃出本循环的错误（hook、memory）先触发 on_terminate 再返回。

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;

use crate::config::AgentSection;
use crate::core::AgentError;
use crate::react::actions::{ActionProposal, ActionResult};
use crate::react::context::{AgentCycleContext, AgentLoopContext};
use crate::react::hooks::{FeedbackProvider, HookEvent, LifecycleHooks};
use crate::react::prompts::DirectiveBundle;
use crate::react::thought::ThoughtInputs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Running,
    Stopped,
    Terminated,
}

impl LoopState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LoopState::Running,
            2 => LoopState::Stopped,
            3 => LoopState::Terminated,
            _ => LoopState::Idle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// 模型提出了结束命令
    TaskComplete { summary: Option<String> },
    MaxCycles,
    /// 外部调用了 stop()
    Stopped,
    /// reflect 判断连续失败过多
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopOutcome {
    /// 实际运行的轮数
    pub cycles: usize,
    #[serde(flatten)]
    pub reason: StopReason,
}

enum CycleOutcome {
    Continue,
    Complete(Option<String>),
    Exhausted,
}

pub struct AgentLoopOptions {
    /// None 表示不限轮数
    pub max_cycles: Option<usize>,
    /// 忽略 reflect 的停止建议
    pub continuous: bool,
    pub max_consecutive_failures: Option<u32>,
    pub feedback_timeout: Duration,
    pub hooks: LifecycleHooks,
    pub feedback: Option<Arc<dyn FeedbackProvider>>,
    pub directives: DirectiveBundle,
}

impl Default for AgentLoopOptions {
    fn default() -> Self {
        Self {
            max_cycles: Some(20),
            continuous: false,
            max_consecutive_failures: None,
            feedback_timeout: Duration::from_millis(50),
            hooks: LifecycleHooks::default(),
            feedback: None,
            directives: DirectiveBundle::default(),
        }
    }
}

impl AgentLoopOptions {
    pub fn from_config(agent: &AgentSection) -> Self {
        Self {
            max_cycles: agent.max_cycles(),
            continuous: agent.continuous,
            max_consecutive_failures: agent.max_consecutive_failures,
            feedback_timeout: agent.feedback_timeout(),
            ..Default::default()
        }
    }

    pub fn with_max_cycles(mut self, max_cycles: Option<usize>) -> Self {
        self.max_cycles = max_cycles;
        self
    }

    pub fn with_hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_feedback(mut self, feedback: Arc<dyn FeedbackProvider>) -> Self {
        self.feedback = Some(feedback);
        self
    }
}

pub struct AgentLoop {
    options: AgentLoopOptions,
    state: AtomicU8,
    stop_requested: AtomicBool,
    current_cycle: AtomicUsize,
}

impl AgentLoop {
    pub fn new(options: AgentLoopOptions) -> Self {
        Self {
            options,
            state: AtomicU8::new(LoopState::Idle as u8),
            stop_requested: AtomicBool::new(false),
            current_cycle: AtomicUsize::new(0),
        }
    }

    pub fn options(&self) -> &AgentLoopOptions {
        &self.options
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn current_cycle(&self) -> usize {
        self.current_cycle.load(Ordering::SeqCst)
    }

    /// 协作式停止：只在下一轮开始前生效，不打断进行中的思考或执行；
    /// 在 start 之前调用时，下一次 start 不运行任何一轮
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    fn set_state(&self, state: LoopState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub async fn start(&self, ctx: AgentLoopContext) -> Result<LoopOutcome, AgentError> {
        let running = LoopState::Running as u8;
        let previous = self.state.swap(running, Ordering::SeqCst);
        if previous == running {
            return Err(AgentError::AlreadyRunning(ctx.agent_id));
        }
        self.current_cycle.store(0, Ordering::SeqCst);

        let agent_id = ctx.agent_id.clone();
        tracing::info!(agent_id = %agent_id, max_cycles = ?self.options.max_cycles, "agent loop started");

        let mut cycle_ctx = AgentCycleContext::first(Arc::new(ctx));
        let mut consecutive_failures = 0u32;

        let reason = loop {
            // 启动前收到的停止请求同样生效；消费后允许再次 start
            if self.stop_requested.swap(false, Ordering::SeqCst) {
                break StopReason::Stopped;
            }
            if self
                .options
                .max_cycles
                .is_some_and(|max| cycle_ctx.cycle >= max)
            {
                break StopReason::MaxCycles;
            }
            self.current_cycle.store(cycle_ctx.cycle, Ordering::SeqCst);

            match self.run_cycle(&cycle_ctx, &mut consecutive_failures).await {
                Ok(CycleOutcome::Continue) => {}
                Ok(CycleOutcome::Complete(summary)) => {
                    cycle_ctx = cycle_ctx.advance();
                    break StopReason::TaskComplete { summary };
                }
                Ok(CycleOutcome::Exhausted) if !self.options.continuous => {
                    cycle_ctx = cycle_ctx.advance();
                    break StopReason::Exhausted;
                }
                Ok(CycleOutcome::Exhausted) => {}
                Err(e) => {
                    tracing::error!(agent_id = %agent_id, cycle = cycle_ctx.cycle, error = %e, "agent loop terminated");
                    if let Err(hook_err) = self.options.hooks.fire(HookEvent::Terminate(&cycle_ctx)).await {
                        tracing::warn!(error = %hook_err, "on_terminate hook failed");
                    }
                    self.set_state(LoopState::Terminated);
                    return Err(e);
                }
            }
            cycle_ctx = cycle_ctx.advance();
        };

        self.set_state(LoopState::Stopped);
        let outcome = LoopOutcome {
            cycles: cycle_ctx.cycle,
            reason,
        };
        tracing::info!(agent_id = %agent_id, cycles = outcome.cycles, reason = ?outcome.reason, "agent loop finished");
        Ok(outcome)
    }

    async fn run_cycle(
        &self,
        ctx: &AgentCycleContext,
        consecutive_failures: &mut u32,
    ) -> Result<CycleOutcome, AgentError> {
        let hooks = &self.options.hooks;
        hooks.fire(HookEvent::CycleStart(ctx)).await?;

        let feedback = self.collect_feedback(ctx).await;
        let ctx = ctx.clone().with_feedback(feedback);

        let proposal = self.think(&ctx).await?;
        tracing::info!(
            agent_id = %ctx.agent_id,
            cycle = ctx.cycle,
            command = %proposal.command,
            "action proposed"
        );
        hooks.fire(HookEvent::ActionProposed(&proposal, &ctx)).await?;
        ctx.memory.capture_proposal(&proposal).await?;

        if proposal.is_terminal() {
            return Ok(CycleOutcome::Complete(proposal.summary()));
        }

        let result = ctx.executor.execute(&proposal).await;
        hooks.fire(HookEvent::ActionCompleted(&result, &ctx)).await?;
        ctx.memory.capture_result(&result).await?;

        let keep_going = self.reflect(&result, &ctx, consecutive_failures);
        hooks.fire(HookEvent::CycleEnd(&ctx)).await?;

        Ok(if keep_going {
            CycleOutcome::Continue
        } else {
            CycleOutcome::Exhausted
        })
    }

    /// 反馈等待有上限，超时视为无反馈
    async fn collect_feedback(&self, ctx: &AgentCycleContext) -> Option<String> {
        let provider = self.options.feedback.as_ref()?;
        match timeout(self.options.feedback_timeout, provider.feedback(ctx)).await {
            Ok(feedback) => feedback,
            Err(_) => {
                tracing::debug!(cycle = ctx.cycle, "no feedback within timeout");
                None
            }
        }
    }

    async fn think(&self, ctx: &AgentCycleContext) -> Result<ActionProposal, AgentError> {
        let memory = ctx.memory.snapshot().await?;
        let inputs = ThoughtInputs {
            task: ctx.task.clone(),
            cycle: ctx.cycle,
            memory,
            directives: self.options.directives.clone(),
            user_feedback: ctx.user_feedback.clone(),
        };
        let mut proposal = ctx.thought.think(&inputs).await;
        proposal.metadata.cycle = ctx.cycle;
        Ok(proposal)
    }

    /// 记录结果并统计连续失败；返回 false 表示建议停止
    fn reflect(&self, result: &ActionResult, ctx: &AgentCycleContext, consecutive_failures: &mut u32) -> bool {
        if result.success {
            *consecutive_failures = 0;
            tracing::debug!(cycle = ctx.cycle, duration_ms = result.duration_ms, "action succeeded");
            return true;
        }
        *consecutive_failures += 1;
        tracing::warn!(
            agent_id = %ctx.agent_id,
            cycle = ctx.cycle,
            consecutive_failures = *consecutive_failures,
            summary = %result.summary,
            "action failed"
        );
        match self.options.max_consecutive_failures {
            Some(limit) if *consecutive_failures >= limit => false,
            _ => true,
        }
    }
}

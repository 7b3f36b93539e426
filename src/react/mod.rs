//! 认知层：动作模型、prompt 构造、思考过程、生命周期钩子与 Agent 主循环

pub mod actions;
pub mod context;
pub mod hooks;
pub mod loop_;
pub mod prompts;
pub mod thought;

pub use actions::{
    is_terminal_command, ActionMetadata, ActionProposal, ActionResult, ActionSource, Plan,
    TERMINAL_COMMANDS,
};
pub use context::{AgentCycleContext, AgentLoopContext};
pub use hooks::{FeedbackProvider, FnHook, HookEvent, HookHandler, LifecycleEvent, LifecycleHooks};
pub use loop_::{AgentLoop, AgentLoopOptions, LoopOutcome, LoopState, StopReason};
pub use prompts::{build_system_prompt, build_task_prompt, DirectiveBundle};
pub use thought::{
    parse_thought, DefaultThoughtProcess, ParsedCall, PromptPayload, ThoughtInputs,
    ThoughtProcess, ThoughtResponse,
};

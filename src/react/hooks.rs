//! 生命周期钩子与用户反馈
//!
//! 每个事件最多一个处理器，按循环顺序逐个 await；处理器返回错误会终止循环（先触发 on_terminate）。

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::AgentError;
use crate::react::actions::{ActionProposal, ActionResult};
use crate::react::context::AgentCycleContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    CycleStart,
    ActionProposed,
    ActionCompleted,
    CycleEnd,
    Terminate,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::CycleStart => "on_cycle_start",
            LifecycleEvent::ActionProposed => "on_action_proposed",
            LifecycleEvent::ActionCompleted => "on_action_completed",
            LifecycleEvent::CycleEnd => "on_cycle_end",
            LifecycleEvent::Terminate => "on_terminate",
        }
    }
}

/// 传给处理器的事件及其负载
pub enum HookEvent<'a> {
    CycleStart(&'a AgentCycleContext),
    ActionProposed(&'a ActionProposal, &'a AgentCycleContext),
    ActionCompleted(&'a ActionResult, &'a AgentCycleContext),
    CycleEnd(&'a AgentCycleContext),
    Terminate(&'a AgentCycleContext),
}

impl HookEvent<'_> {
    pub fn kind(&self) -> LifecycleEvent {
        match self {
            HookEvent::CycleStart(_) => LifecycleEvent::CycleStart,
            HookEvent::ActionProposed(..) => LifecycleEvent::ActionProposed,
            HookEvent::ActionCompleted(..) => LifecycleEvent::ActionCompleted,
            HookEvent::CycleEnd(_) => LifecycleEvent::CycleEnd,
            HookEvent::Terminate(_) => LifecycleEvent::Terminate,
        }
    }

    pub fn context(&self) -> &AgentCycleContext {
        match self {
            HookEvent::CycleStart(ctx)
            | HookEvent::ActionProposed(_, ctx)
            | HookEvent::ActionCompleted(_, ctx)
            | HookEvent::CycleEnd(ctx)
            | HookEvent::Terminate(ctx) => ctx,
        }
    }
}

#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, event: HookEvent<'_>) -> Result<(), AgentError>;
}

/// 同步闭包处理器
pub struct FnHook<F>(F);

impl<F> FnHook<F>
where
    F: Fn(&HookEvent<'_>) -> Result<(), AgentError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> HookHandler for FnHook<F>
where
    F: Fn(&HookEvent<'_>) -> Result<(), AgentError> + Send + Sync,
{
    async fn handle(&self, event: HookEvent<'_>) -> Result<(), AgentError> {
        (self.0)(&event)
    }
}

#[derive(Default, Clone)]
pub struct LifecycleHooks {
    on_cycle_start: Option<Arc<dyn HookHandler>>,
    on_action_proposed: Option<Arc<dyn HookHandler>>,
    on_action_completed: Option<Arc<dyn HookHandler>>,
    on_cycle_end: Option<Arc<dyn HookHandler>>,
    on_terminate: Option<Arc<dyn HookHandler>>,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置（替换）某事件的处理器
    pub fn on(mut self, event: LifecycleEvent, handler: Arc<dyn HookHandler>) -> Self {
        *self.slot(event) = Some(handler);
        self
    }

    /// 同一处理器注册到所有事件
    pub fn all(handler: Arc<dyn HookHandler>) -> Self {
        Self {
            on_cycle_start: Some(handler.clone()),
            on_action_proposed: Some(handler.clone()),
            on_action_completed: Some(handler.clone()),
            on_cycle_end: Some(handler.clone()),
            on_terminate: Some(handler),
        }
    }

    fn slot(&mut self, event: LifecycleEvent) -> &mut Option<Arc<dyn HookHandler>> {
        match event {
            LifecycleEvent::CycleStart => &mut self.on_cycle_start,
            LifecycleEvent::ActionProposed => &mut self.on_action_proposed,
            LifecycleEvent::ActionCompleted => &mut self.on_action_completed,
            LifecycleEvent::CycleEnd => &mut self.on_cycle_end,
            LifecycleEvent::Terminate => &mut self.on_terminate,
        }
    }

    fn handler(&self, event: LifecycleEvent) -> Option<&Arc<dyn HookHandler>> {
        match event {
            LifecycleEvent::CycleStart => self.on_cycle_start.as_ref(),
            LifecycleEvent::ActionProposed => self.on_action_proposed.as_ref(),
            LifecycleEvent::ActionCompleted => self.on_action_completed.as_ref(),
            LifecycleEvent::CycleEnd => self.on_cycle_end.as_ref(),
            LifecycleEvent::Terminate => self.on_terminate.as_ref(),
        }
    }

    /// 触发事件；处理器错误统一包装为 AgentError::Hook
    pub async fn fire(&self, event: HookEvent<'_>) -> Result<(), AgentError> {
        let kind = event.kind();
        let Some(handler) = self.handler(kind) else {
            return Ok(());
        };
        handler.handle(event).await.map_err(|e| match e {
            hook @ AgentError::Hook { .. } => hook,
            other => AgentError::hook(kind.as_str(), other.to_string()),
        })
    }
}

/// 每轮开始时可选地提供外部反馈（如操作员消息），只并入当轮 prompt
#[async_trait]
pub trait FeedbackProvider: Send + Sync {
    async fn feedback(&self, ctx: &AgentCycleContext) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(LifecycleEvent::CycleStart.as_str(), "on_cycle_start");
        assert_eq!(LifecycleEvent::Terminate.as_str(), "on_terminate");
    }

    #[test]
    fn test_hooks_replace_slot() {
        let noop: Arc<dyn HookHandler> = Arc::new(FnHook::new(|_| Ok(())));
        let hooks = LifecycleHooks::new().on(LifecycleEvent::CycleEnd, noop);
        assert!(hooks.handler(LifecycleEvent::CycleEnd).is_some());
        assert!(hooks.handler(LifecycleEvent::CycleStart).is_none());
    }
}

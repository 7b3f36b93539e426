//! 循环上下文：AgentLoopContext 在一次 start 内不变，AgentCycleContext 每轮派生一份

use std::ops::Deref;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::memory::MemoryManager;
use crate::react::thought::ThoughtProcess;
use crate::tools::ActionExecutor;

pub struct AgentLoopContext {
    pub agent_id: String,
    pub task: String,
    /// 透传给 hook 的附加配置
    pub config: Map<String, Value>,
    pub memory: Arc<dyn MemoryManager>,
    pub thought: Arc<dyn ThoughtProcess>,
    pub executor: Arc<dyn ActionExecutor>,
}

impl AgentLoopContext {
    pub fn new(
        agent_id: impl Into<String>,
        task: impl Into<String>,
        memory: Arc<dyn MemoryManager>,
        thought: Arc<dyn ThoughtProcess>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            task: task.into(),
            config: Map::new(),
            memory,
            thought,
            executor,
        }
    }

    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }
}

/// 单轮上下文：只读；下一轮通过 advance() 派生（cycle + 1，反馈清空）
#[derive(Clone)]
pub struct AgentCycleContext {
    base: Arc<AgentLoopContext>,
    pub cycle: usize,
    pub user_feedback: Option<String>,
}

impl AgentCycleContext {
    pub fn first(base: Arc<AgentLoopContext>) -> Self {
        Self {
            base,
            cycle: 0,
            user_feedback: None,
        }
    }

    pub fn advance(&self) -> Self {
        Self {
            base: self.base.clone(),
            cycle: self.cycle + 1,
            user_feedback: None,
        }
    }

    pub fn with_feedback(self, feedback: Option<String>) -> Self {
        Self {
            user_feedback: feedback.filter(|f| !f.trim().is_empty()),
            ..self
        }
    }
}

impl Deref for AgentCycleContext {
    type Target = AgentLoopContext;

    fn deref(&self) -> &AgentLoopContext {
        &self.base
    }
}

//! 正在运行的 Agent 登记表：检查与登记在同一把锁内完成，Guard 释放时自动注销

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::core::AgentError;
use crate::react::AgentLoop;

#[derive(Default)]
pub struct RunningAgents {
    inner: Mutex<HashMap<String, Arc<AgentLoop>>>,
}

impl RunningAgents {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记 agent_id；已登记时返回 AlreadyRunning
    pub fn claim(self: &Arc<Self>, agent_id: &str, agent_loop: Arc<AgentLoop>) -> Result<RunningGuard, AgentError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.contains_key(agent_id) {
            return Err(AgentError::AlreadyRunning(agent_id.to_string()));
        }
        inner.insert(agent_id.to_string(), agent_loop);
        Ok(RunningGuard {
            registry: Arc::clone(self),
            agent_id: agent_id.to_string(),
        })
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentLoop>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .cloned()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.get(agent_id).is_some()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn release(&self, agent_id: &str) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(agent_id);
    }
}

/// 持有期间 agent_id 处于运行中
pub struct RunningGuard {
    registry: Arc<RunningAgents>,
    agent_id: String,
}

impl RunningGuard {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.registry.release(&self.agent_id);
        tracing::debug!(agent_id = %self.agent_id, "running claim released");
    }
}

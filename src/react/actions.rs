//! 动作数据模型：模型提议的动作（ActionProposal）与执行结果（ActionResult）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 结束循环的命令名
pub const TERMINAL_COMMANDS: &[&str] = &["task_complete", "finish"];

pub fn is_terminal_command(command: &str) -> bool {
    TERMINAL_COMMANDS.contains(&command)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionSource {
    #[default]
    Agent,
    Human,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMetadata {
    pub created_at: DateTime<Utc>,
    /// 由 AgentLoop 覆盖为自身计数，不信任模型给出的值
    pub cycle: usize,
    #[serde(default)]
    pub source: ActionSource,
}

impl ActionMetadata {
    pub fn new(cycle: usize) -> Self {
        Self {
            created_at: Utc::now(),
            cycle,
            source: ActionSource::Agent,
        }
    }
}

/// 计划：有序步骤列表或结构化对象
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Plan {
    Steps(Vec<String>),
    Structured(Map<String, Value>),
}

impl Plan {
    /// 从任意 JSON 值转换：数组 → 步骤（非字符串元素序列化为文本），对象 → 结构化，字符串 → 单步骤
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Array(items) => Some(Plan::Steps(
                items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            )),
            Value::Object(map) => Some(Plan::Structured(map.clone())),
            Value::String(s) if !s.trim().is_empty() => Some(Plan::Steps(vec![s.clone()])),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionProposal {
    pub command: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default)]
    pub reasoning: Vec<String>,
    #[serde(default)]
    pub plan: Option<Plan>,
    pub metadata: ActionMetadata,
}

impl ActionProposal {
    pub fn new(command: impl Into<String>, arguments: Map<String, Value>, cycle: usize) -> Self {
        Self {
            command: command.into(),
            arguments,
            reasoning: Vec::new(),
            plan: None,
            metadata: ActionMetadata::new(cycle),
        }
    }

    pub fn with_reasoning(mut self, reasoning: Vec<String>) -> Self {
        self.reasoning = reasoning;
        self
    }

    pub fn with_plan(mut self, plan: Option<Plan>) -> Self {
        self.plan = plan;
        self
    }

    pub fn is_terminal(&self) -> bool {
        is_terminal_command(&self.command)
    }

    /// task_complete 的 summary 参数（无则取推理文本）
    pub fn summary(&self) -> Option<String> {
        self.arguments
            .get("summary")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| (!self.reasoning.is_empty()).then(|| self.reasoning.join(" ")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub output: Value,
    pub summary: String,
    pub metadata: ActionMetadata,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ActionResult {
    pub fn succeeded(proposal: &ActionProposal, output: Value, duration_ms: u64) -> Self {
        Self {
            success: true,
            output,
            summary: format!("Successfully executed {}", proposal.command),
            metadata: proposal.metadata.clone(),
            error: None,
            duration_ms,
        }
    }

    pub fn failed(
        proposal: &ActionProposal,
        summary: String,
        error: String,
        duration_ms: u64,
    ) -> Self {
        Self {
            success: false,
            output: serde_json::json!({ "error": error }),
            summary,
            metadata: proposal.metadata.clone(),
            error: Some(error),
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_commands() {
        assert!(is_terminal_command("task_complete"));
        assert!(is_terminal_command("finish"));
        assert!(!is_terminal_command("echo"));
    }

    #[test]
    fn test_plan_from_value() {
        assert_eq!(
            Plan::from_value(&json!(["a", 2])),
            Some(Plan::Steps(vec!["a".into(), "2".into()]))
        );
        assert!(matches!(
            Plan::from_value(&json!({"goal": "x"})),
            Some(Plan::Structured(_))
        ));
        assert_eq!(Plan::from_value(&json!(null)), None);
    }

    #[test]
    fn test_summary_prefers_argument() {
        let mut args = Map::new();
        args.insert("summary".into(), json!("done"));
        let proposal = ActionProposal::new("task_complete", args, 3)
            .with_reasoning(vec!["because".into()]);
        assert_eq!(proposal.summary().as_deref(), Some("done"));

        let bare = ActionProposal::new("finish", Map::new(), 0).with_reasoning(vec!["all good".into()]);
        assert_eq!(bare.summary().as_deref(), Some("all good"));
    }

    #[test]
    fn test_failed_result_shape() {
        let proposal = ActionProposal::new("nope", Map::new(), 1);
        let result = ActionResult::failed(
            &proposal,
            "Failed: Tool 'nope' not found".into(),
            "Tool 'nope' not found".into(),
            0,
        );
        assert!(!result.success);
        assert_eq!(result.output["error"], "Tool 'nope' not found");
        assert_eq!(result.metadata.cycle, 1);
    }
}

//! Prompt 构造：system prompt（指令集）、task prompt（任务 + 记忆 + 反馈 + 工具目录）

use std::fmt::Write;
use std::sync::Arc;

use crate::memory::MemorySnapshot;
use crate::tools::{response_schema_json, Tool};

/// task prompt 中展示的最近记忆条数
const RECENT_MEMORY: usize = 5;
/// task prompt 中展示的长期记忆条数
const PAST_EXPERIENCE: usize = 3;

/// 指令集：约束、可用资源、最佳实践
#[derive(Debug, Clone, PartialEq)]
pub struct DirectiveBundle {
    pub constraints: Vec<String>,
    pub resources: Vec<String>,
    pub best_practices: Vec<String>,
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for DirectiveBundle {
    fn default() -> Self {
        Self {
            constraints: owned(&[
                "You must use the available tools to accomplish your task",
                "You cannot interact directly with users except through tool outputs",
                "You must break down complex tasks into smaller, manageable steps",
                "You should verify the results of your actions before proceeding",
            ]),
            resources: owned(&[
                "Filesystem access within the workspace",
                "Web search and browsing capabilities",
                "Code execution in a sandboxed environment",
                "Long-term and short-term memory",
            ]),
            best_practices: owned(&[
                "Always explain your reasoning before taking action",
                "Create a plan and follow it systematically",
                "Learn from past failures and adapt your approach",
                "Be efficient and avoid unnecessary actions",
            ]),
        }
    }
}

fn numbered(out: &mut String, title: &str, items: &[String]) {
    let _ = writeln!(out, "{}:", title);
    for (i, item) in items.iter().enumerate() {
        let _ = writeln!(out, "{}. {}", i + 1, item);
    }
    out.push('\n');
}

/// system prompt；with_schema 为 true 时附加 JSON 响应格式（供不支持 function calling 的模型）
pub fn build_system_prompt(directives: &DirectiveBundle, with_schema: bool) -> String {
    let mut out = String::from(
        "You are drone, an autonomous agent designed to accomplish tasks by calling tools.\n\n",
    );
    numbered(&mut out, "CONSTRAINTS", &directives.constraints);
    numbered(&mut out, "RESOURCES", &directives.resources);
    numbered(&mut out, "BEST PRACTICES", &directives.best_practices);
    out.push_str(
        "You should respond with your thoughts, reasoning, plan, and the command you want to execute.\n\
         Always think step by step and explain your reasoning.\n\
         When the task is done, call task_complete with a short summary.",
    );
    if with_schema {
        let _ = write!(
            out,
            "\n\nRESPONSE FORMAT:\nRespond with a single JSON object matching this schema:\n{}",
            response_schema_json()
        );
    }
    out
}

/// task prompt：任务、轮次、最近 5 条记忆、最多 3 条长期记忆、用户反馈、工具目录
pub fn build_task_prompt(
    task: &str,
    cycle: usize,
    memory: &MemorySnapshot,
    user_feedback: Option<&str>,
    tools: &[Arc<dyn Tool>],
) -> String {
    let mut out = format!("TASK: {}\n\nCYCLE: {}\n\n", task, cycle);

    if !memory.short_term.is_empty() {
        out.push_str("RECENT MEMORY:\n");
        let skip = memory.short_term.len().saturating_sub(RECENT_MEMORY);
        for record in &memory.short_term[skip..] {
            let _ = writeln!(out, "- [{}] {}", record.kind, record.content);
        }
        out.push('\n');
    }

    if !memory.long_term.is_empty() {
        out.push_str("RELEVANT PAST EXPERIENCE:\n");
        for record in memory.long_term.iter().take(PAST_EXPERIENCE) {
            let _ = writeln!(out, "- {}", record.content);
        }
        out.push('\n');
    }

    if let Some(feedback) = user_feedback {
        let _ = write!(out, "USER FEEDBACK: {}\n\n", feedback);
    }

    out.push_str("AVAILABLE TOOLS:\n");
    for tool in tools {
        let _ = writeln!(out, "- {}: {}", tool.name(), tool.description());
        let params = tool.parameters();
        if !params.is_empty() {
            let rendered: Vec<String> = params
                .iter()
                .map(|p| {
                    format!(
                        "{}{} ({})",
                        p.name,
                        if p.required { "*" } else { "" },
                        p.param_type.as_str()
                    )
                })
                .collect();
            let _ = writeln!(out, "  Parameters: {}", rendered.join(", "));
        }
    }
    out.push_str("- task_complete: Finish the task. Parameters: summary* (string)\n");
    out
}

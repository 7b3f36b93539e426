//! 思考过程：构造 prompt → 调用模型 → 解析为 ActionProposal
//!
//! call_model 不重试（重试由 RetryingProvider 负责），失败或超时时合成一个 task_complete 响应；
//! parse_response 依次尝试函数调用、文本中的 JSON、最终兜底为 task_complete，从不失败。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::time::timeout;

use crate::llm::{
    CallArguments, ChatMessage, ChatOptions, FunctionCallMode, FunctionDeclaration, LlmProvider,
};
use crate::memory::MemorySnapshot;
use crate::react::actions::{ActionProposal, Plan};
use crate::react::prompts::{build_system_prompt, build_task_prompt, DirectiveBundle};
use crate::tools::ToolRegistry;

/// 单次思考的输入
#[derive(Debug, Clone)]
pub struct ThoughtInputs {
    pub task: String,
    pub cycle: usize,
    pub memory: MemorySnapshot,
    pub directives: DirectiveBundle,
    pub user_feedback: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PromptPayload {
    pub messages: Vec<ChatMessage>,
    pub functions: Vec<FunctionDeclaration>,
    pub temperature: f32,
    pub model: String,
}

/// 模型给出的结构化调用
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCall {
    pub name: String,
    pub arguments: CallArguments,
    pub reasoning: Option<Vec<String>>,
    pub plan: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThoughtResponse {
    pub raw: String,
    pub parsed: Option<ParsedCall>,
}

impl ThoughtResponse {
    pub fn raw(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            parsed: None,
        }
    }

    /// 模型不可用时的合成响应：task_complete 并附说明
    pub fn synthetic_completion(message: String) -> Self {
        let mut arguments = Map::new();
        arguments.insert("summary".to_string(), Value::String(message.clone()));
        Self {
            raw: message.clone(),
            parsed: Some(ParsedCall {
                name: "task_complete".to_string(),
                arguments: CallArguments::Structured(arguments),
                reasoning: Some(vec![message]),
                plan: None,
            }),
        }
    }
}

#[async_trait]
pub trait ThoughtProcess: Send + Sync {
    async fn prepare_prompt(&self, inputs: &ThoughtInputs) -> PromptPayload;

    async fn call_model(&self, prompt: &PromptPayload) -> ThoughtResponse;

    fn parse_response(&self, response: &ThoughtResponse) -> ActionProposal;

    /// prepare → call → parse；cycle 由循环覆盖
    async fn think(&self, inputs: &ThoughtInputs) -> ActionProposal {
        let prompt = self.prepare_prompt(inputs).await;
        let response = self.call_model(&prompt).await;
        self.parse_response(&response)
    }
}

pub struct DefaultThoughtProcess {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    timeout: Duration,
    function_calling: bool,
}

impl DefaultThoughtProcess {
    pub fn new(provider: Arc<dyn LlmProvider>, tools: Arc<ToolRegistry>, model: impl Into<String>) -> Self {
        Self {
            provider,
            tools,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            timeout: Duration::from_secs(60),
            function_calling: true,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 关闭时不发送函数声明，改为在 system prompt 中附加 JSON 响应格式
    pub fn with_function_calling(mut self, enabled: bool) -> Self {
        self.function_calling = enabled;
        self
    }
}

#[async_trait]
impl ThoughtProcess for DefaultThoughtProcess {
    async fn prepare_prompt(&self, inputs: &ThoughtInputs) -> PromptPayload {
        let tools = self.tools.list();
        let system = build_system_prompt(&inputs.directives, !self.function_calling);
        let task = build_task_prompt(
            &inputs.task,
            inputs.cycle,
            &inputs.memory,
            inputs.user_feedback.as_deref(),
            &tools,
        );
        let functions = if self.function_calling {
            let mut functions = self.tools.function_declarations();
            functions.push(task_complete_declaration());
            functions
        } else {
            Vec::new()
        };
        PromptPayload {
            messages: vec![ChatMessage::system(system), ChatMessage::user(task)],
            functions,
            temperature: self.temperature,
            model: self.model.clone(),
        }
    }

    async fn call_model(&self, prompt: &PromptPayload) -> ThoughtResponse {
        let mut options = ChatOptions::default()
            .with_model(prompt.model.clone())
            .with_temperature(prompt.temperature);
        options.max_tokens = self.max_tokens;
        if !prompt.functions.is_empty() {
            options = options.with_functions(prompt.functions.clone());
            options.function_call = FunctionCallMode::Auto;
        }

        let response = match timeout(self.timeout, self.provider.chat(&prompt.messages, &options)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::warn!(provider = self.provider.name(), error = %e, "model call failed");
                return ThoughtResponse::synthetic_completion(format!(
                    "Failed to generate thought from LLM: {}",
                    e
                ));
            }
            Err(_) => {
                tracing::warn!(
                    provider = self.provider.name(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "model call timed out"
                );
                return ThoughtResponse::synthetic_completion(format!(
                    "Failed to generate thought from LLM: timeout after {}ms",
                    self.timeout.as_millis()
                ));
            }
        };

        let content = response.content.trim();
        let mut parts = Vec::new();
        if !content.is_empty() {
            parts.push(content.to_string());
        }
        let parsed = response.function_call.map(|call| {
            let rendered = match &call.arguments {
                CallArguments::Structured(map) => Value::Object(map.clone()).to_string(),
                CallArguments::Text(text) => text.clone(),
            };
            parts.push(format!("function_call: {}({})", call.name, rendered));
            let reasoning: Vec<String> = content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect();
            ParsedCall {
                name: call.name,
                arguments: call.arguments,
                reasoning: (!reasoning.is_empty()).then_some(reasoning),
                plan: None,
            }
        });
        ThoughtResponse {
            raw: parts.join("\n"),
            parsed,
        }
    }

    fn parse_response(&self, response: &ThoughtResponse) -> ActionProposal {
        parse_thought(response)
    }
}

fn task_complete_declaration() -> FunctionDeclaration {
    FunctionDeclaration {
        name: "task_complete".to_string(),
        description: "Finish the task and report a short summary of the outcome".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "summary": {"type": "string", "description": "What was accomplished"}
            },
            "required": ["summary"]
        }),
    }
}

/// 解析模型响应；任何输入都得到可用的 ActionProposal
pub fn parse_thought(response: &ThoughtResponse) -> ActionProposal {
    let raw = response.raw.as_str();
    if let Some(call) = &response.parsed {
        let arguments = match &call.arguments {
            CallArguments::Structured(map) => map.clone(),
            CallArguments::Text(text) => text_arguments(text),
        };
        let command = if call.name.trim().is_empty() {
            "unknown".to_string()
        } else {
            call.name.clone()
        };
        let reasoning = call
            .reasoning
            .clone()
            .unwrap_or_else(|| non_empty(raw).into_iter().collect());
        return ActionProposal::new(command, arguments, 0)
            .with_reasoning(reasoning)
            .with_plan(call.plan.as_ref().and_then(Plan::from_value));
    }

    if let Some(proposal) = parse_embedded_json(raw) {
        return proposal;
    }

    let mut arguments = Map::new();
    arguments.insert("summary".to_string(), Value::String(raw.to_string()));
    ActionProposal::new("task_complete", arguments, 0).with_reasoning(vec![raw.to_string()])
}

fn non_empty(raw: &str) -> Option<String> {
    (!raw.trim().is_empty()).then(|| raw.to_string())
}

/// 文本参数按 JSON 对象解析，失败时包成 {"raw": text}
fn text_arguments(text: &str) -> Map<String, Value> {
    if text.trim().is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => map,
        _ => {
            let mut map = Map::new();
            map.insert("raw".to_string(), Value::String(text.to_string()));
            map
        }
    }
}

/// 在原始文本中找第一个 `{` 起的 JSON 对象（允许前后有说明文字或代码块标记）
fn parse_embedded_json(raw: &str) -> Option<ActionProposal> {
    let start = raw.find('{')?;
    let object = serde_json::Deserializer::from_str(&raw[start..])
        .into_iter::<Value>()
        .next()
        .and_then(Result::ok)
        .or_else(|| {
            let end = raw.rfind('}')?;
            serde_json::from_str::<Value>(raw.get(start..=end)?).ok()
        })?;
    let Value::Object(map) = object else {
        return None;
    };

    let command = map
        .get("command")
        .or_else(|| map.get("tool"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let arguments = match map.get("arguments").or_else(|| map.get("args")) {
        Some(Value::Object(args)) => args.clone(),
        Some(Value::String(text)) => text_arguments(text),
        _ => Map::new(),
    };
    let reasoning = match map.get("reasoning") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(String::from).unwrap_or_else(|| v.to_string()))
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => vec![raw.to_string()],
    };
    Some(
        ActionProposal::new(command, arguments, 0)
            .with_reasoning(reasoning)
            .with_plan(map.get("plan").and_then(Plan::from_value)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatResponse, MockProvider};
    use crate::tools::EchoTool;

    fn inputs() -> ThoughtInputs {
        ThoughtInputs {
            task: "say hi".to_string(),
            cycle: 0,
            memory: MemorySnapshot::default(),
            directives: DirectiveBundle::default(),
            user_feedback: None,
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        Arc::new(registry)
    }

    #[test]
    fn test_parse_function_call_text_arguments() {
        let response = ThoughtResponse {
            raw: "thinking".into(),
            parsed: Some(ParsedCall {
                name: "echo".into(),
                arguments: CallArguments::Text(r#"{"text": "hi"}"#.into()),
                reasoning: None,
                plan: None,
            }),
        };
        let proposal = parse_thought(&response);
        assert_eq!(proposal.command, "echo");
        assert_eq!(proposal.arguments["text"], "hi");
        assert_eq!(proposal.reasoning, vec!["thinking".to_string()]);

        let broken = ThoughtResponse {
            raw: String::new(),
            parsed: Some(ParsedCall {
                name: "echo".into(),
                arguments: CallArguments::Text("not json".into()),
                reasoning: None,
                plan: None,
            }),
        };
        assert_eq!(parse_thought(&broken).arguments["raw"], "not json");
    }

    #[test]
    fn test_parse_embedded_json() {
        let raw = "Sure.\n```json\n{\"tool\": \"read_file\", \"args\": {\"path\": \"a.txt\"}, \"reasoning\": \"need it\", \"plan\": [\"read\", \"summarize\"]}\n```\nDone {ignored}";
        let proposal = parse_thought(&ThoughtResponse::raw(raw));
        assert_eq!(proposal.command, "read_file");
        assert_eq!(proposal.arguments["path"], "a.txt");
        assert_eq!(proposal.reasoning, vec!["need it".to_string()]);
        assert_eq!(
            proposal.plan,
            Some(Plan::Steps(vec!["read".into(), "summarize".into()]))
        );
    }

    #[test]
    fn test_parse_plain_text_completes() {
        let proposal = parse_thought(&ThoughtResponse::raw("I am done here"));
        assert_eq!(proposal.command, "task_complete");
        assert_eq!(proposal.arguments["summary"], "I am done here");
        assert_eq!(proposal.reasoning, vec!["I am done here".to_string()]);
    }

    #[tokio::test]
    async fn test_prepare_prompt_functions() {
        let thought = DefaultThoughtProcess::new(Arc::new(MockProvider::new()), registry(), "m");
        let prompt = thought.prepare_prompt(&inputs()).await;
        assert_eq!(prompt.messages.len(), 2);
        let names: Vec<_> = prompt.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "task_complete"]);

        let text_only = DefaultThoughtProcess::new(Arc::new(MockProvider::new()), registry(), "m")
            .with_function_calling(false);
        let prompt = text_only.prepare_prompt(&inputs()).await;
        assert!(prompt.functions.is_empty());
        assert!(prompt.messages[0].content.contains("RESPONSE FORMAT"));
    }

    #[tokio::test]
    async fn test_think_with_function_call() {
        let provider = MockProvider::scripted(
            "s",
            vec![ChatResponse {
                content: "First line\n\nSecond line".into(),
                ..MockProvider::function_call("echo", json!({"text": "x"}))
            }],
        );
        let thought = DefaultThoughtProcess::new(Arc::new(provider), registry(), "m");
        let proposal = thought.think(&inputs()).await;
        assert_eq!(proposal.command, "echo");
        assert_eq!(proposal.reasoning, vec!["First line", "Second line"]);
    }

    #[tokio::test]
    async fn test_model_failure_synthesizes_completion() {
        let thought = DefaultThoughtProcess::new(
            Arc::new(MockProvider::failing("down", "connection refused")),
            registry(),
            "m",
        );
        let proposal = thought.think(&inputs()).await;
        assert_eq!(proposal.command, "task_complete");
        let summary = proposal.summary().unwrap();
        assert!(summary.starts_with("Failed to generate thought from LLM"));
        assert!(summary.contains("connection refused"));
    }
}

//! Anthropic Messages API 提供方
//!
//! system 提示单独发送；函数声明映射为 tools（input_schema），响应中的 tool_use 块映射为 FunctionCall；
//! 流式使用 SSE（content_block_delta / message_delta）。Anthropic 不提供 embeddings，embed 返回 Unsupported。

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::llm::stream::sse_events;
use crate::llm::{
    ensure_success, CallArguments, ChatMessage, ChatOptions, ChatResponse, ChatStream,
    ChatStreamChunk, FunctionCall, FunctionCallDelta, FunctionCallMode, LlmError, LlmProvider,
    Role, Usage,
};

pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    stream_timeout: Duration,
}

impl AnthropicProvider {
    /// api_key 为 None 时读取 ANTHROPIC_API_KEY
    pub fn new(api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_ANTHROPIC_BASE_URL.to_string(),
            api_key: api_key.or_else(|| std::env::var("ANTHROPIC_API_KEY").ok()),
            model: model.into(),
            timeout: Duration::from_secs(60),
            stream_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeouts(mut self, request: Duration, stream: Duration) -> Self {
        self.timeout = request;
        self.stream_timeout = stream;
        self
    }

    fn post(&self, timeout: Duration) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .timeout(timeout)
            .header("anthropic-version", ANTHROPIC_VERSION);
        match &self.api_key {
            Some(key) => builder.header("x-api-key", key),
            None => builder,
        }
    }

    fn request_body(&self, messages: &[ChatMessage], options: &ChatOptions, stream: bool) -> Value {
        let (system, turns) = split_messages(messages);
        let mut body = json!({
            "model": options.model.clone().unwrap_or_else(|| self.model.clone()),
            "max_tokens": options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": turns,
            "stream": stream,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if let Some(t) = options.temperature {
            body["temperature"] = json!(t);
        }
        if !options.functions.is_empty() && options.function_call != FunctionCallMode::None {
            let tools: Vec<Value> = options
                .functions
                .iter()
                .map(|f| {
                    json!({
                        "name": f.name,
                        "description": f.description,
                        "input_schema": f.parameters,
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = match &options.function_call {
                FunctionCallMode::Named(name) => json!({"type": "tool", "name": name}),
                _ => json!({"type": "auto"}),
            };
        }
        body
    }

    fn map_send_error(&self, e: reqwest::Error, timeout: Duration) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout(timeout)
        } else {
            LlmError::from(e)
        }
    }
}

/// system 消息合并为一段；其余按 user / assistant 交替合并（相邻同角色拼接）
fn split_messages(messages: &[ChatMessage]) -> (String, Vec<Value>) {
    let mut system = Vec::new();
    let mut turns: Vec<(&'static str, String)> = Vec::new();
    for message in messages {
        let role = match message.role {
            Role::System => {
                system.push(message.content.as_str());
                continue;
            }
            Role::Assistant => "assistant",
            Role::User | Role::Function => "user",
        };
        match turns.last_mut() {
            Some((last_role, content)) if *last_role == role => {
                content.push_str("\n\n");
                content.push_str(&message.content);
            }
            _ => turns.push((role, message.content.clone())),
        }
    }
    let turns = turns
        .into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect();
    (system.join("\n\n"), turns)
}

pub(crate) fn map_stop_reason(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        "tool_use" => "function_call",
        other => other,
    }
    .to_string()
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

fn parse_messages_response(response: MessagesResponse) -> ChatResponse {
    let mut text = Vec::new();
    let mut function_call = None;
    for block in response.content {
        match block {
            ContentBlock::Text { text: t } => text.push(t),
            ContentBlock::ToolUse { name, input } if function_call.is_none() => {
                let arguments = match input {
                    Value::Object(map) => CallArguments::Structured(map),
                    Value::Null => CallArguments::Structured(Map::new()),
                    other => CallArguments::Text(other.to_string()),
                };
                function_call = Some(FunctionCall { name, arguments });
            }
            _ => {}
        }
    }
    ChatResponse {
        content: text.join(""),
        function_call,
        finish_reason: response.stop_reason.as_deref().map(map_stop_reason),
        usage: response.usage.map(|u| Usage {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
            total_tokens: u.input_tokens + u.output_tokens,
        }),
    }
}

/// 解析一个 SSE 事件的 data；Err 表示服务端在流中报告错误
fn parse_stream_event(data: &str) -> Result<Option<ChatStreamChunk>, LlmError> {
    let value: Value = serde_json::from_str(data)
        .map_err(|e| LlmError::InvalidResponse(format!("bad stream event: {}", e)))?;
    let chunk = match value["type"].as_str().unwrap_or_default() {
        "content_block_start" if value["content_block"]["type"] == "tool_use" => {
            Some(ChatStreamChunk {
                function_call: Some(FunctionCallDelta {
                    name: value["content_block"]["name"].as_str().map(String::from),
                    arguments: String::new(),
                }),
                ..Default::default()
            })
        }
        "content_block_delta" => match value["delta"]["type"].as_str() {
            Some("text_delta") => Some(ChatStreamChunk::text(
                value["delta"]["text"].as_str().unwrap_or_default(),
            )),
            Some("input_json_delta") => Some(ChatStreamChunk {
                function_call: Some(FunctionCallDelta {
                    name: None,
                    arguments: value["delta"]["partial_json"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                }),
                ..Default::default()
            }),
            _ => None,
        },
        "message_delta" => value["delta"]["stop_reason"].as_str().map(|r| ChatStreamChunk {
            finish_reason: Some(map_stop_reason(r)),
            ..Default::default()
        }),
        "error" => {
            return Err(LlmError::Stream(
                value["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown stream error")
                    .to_string(),
            ))
        }
        _ => None,
    };
    Ok(chunk)
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let body = self.request_body(messages, options, false);
        let response = self
            .post(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, self.timeout))?;
        let response = ensure_success(response).await?;
        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| self.map_send_error(e, self.timeout))?;
        Ok(parse_messages_response(parsed))
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatStream, LlmError> {
        let body = self.request_body(messages, options, true);
        let response = self
            .post(self.stream_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, self.stream_timeout))?;
        let response = ensure_success(response).await?;
        let events = sse_events(response);
        let stream = async_stream::try_stream! {
            futures_util::pin_mut!(events);
            while let Some(event) = events.next().await {
                let event = event?;
                if event.event.as_deref() == Some("message_stop") {
                    break;
                }
                if event.data.is_empty() {
                    continue;
                }
                if let Some(chunk) = parse_stream_event(&event.data)? {
                    yield chunk;
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        Err(LlmError::Unsupported(
            "Anthropic does not provide an embeddings API".to_string(),
        ))
    }
}

//! OpenAI 兼容 API 提供方（reqwest 直连）
//!
//! POST {base_url}/chat/completions（tools / tool_choice，SSE 流式）与 {base_url}/embeddings；
//! 通过 base_url 支持 OpenAI、DeepSeek、自建代理；`azure` 构造器切换为 api-key 头与 api-version 查询参数。

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::llm::stream::sse_events;
use crate::llm::{
    ensure_success, CallArguments, ChatMessage, ChatOptions, ChatResponse, ChatStream,
    ChatStreamChunk, FunctionCall, FunctionCallDelta, FunctionCallMode, LlmError, LlmProvider,
    Usage,
};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

#[derive(Debug, Clone)]
enum Auth {
    Bearer(Option<String>),
    /// Azure OpenAI：api-key 头 + api-version 查询参数
    AzureKey { key: String, api_version: String },
}

/// OpenAI 兼容提供方
pub struct OpenAiProvider {
    client: reqwest::Client,
    name: String,
    base_url: String,
    auth: Auth,
    model: String,
    embedding_model: String,
    timeout: Duration,
    stream_timeout: Duration,
}

impl OpenAiProvider {
    /// api_key 为 None 时读取 OPENAI_API_KEY
    pub fn new(api_key: Option<String>, model: impl Into<String>) -> Self {
        let api_key = api_key.or_else(|| std::env::var("OPENAI_API_KEY").ok());
        Self {
            client: reqwest::Client::new(),
            name: "openai".to_string(),
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            auth: Auth::Bearer(api_key),
            model: model.into(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            timeout: Duration::from_secs(60),
            stream_timeout: Duration::from_secs(120),
        }
    }

    /// endpoint 形如 https://{resource}.openai.azure.com，deployment 兼作模型名
    pub fn azure(
        endpoint: &str,
        deployment: impl Into<String>,
        api_key: String,
        api_version: impl Into<String>,
    ) -> Self {
        let deployment = deployment.into();
        let mut provider = Self::new(None, deployment.clone());
        provider.name = "azure".to_string();
        provider.base_url = format!(
            "{}/openai/deployments/{}",
            endpoint.trim_end_matches('/'),
            deployment
        );
        provider.auth = Auth::AzureKey {
            key: api_key,
            api_version: api_version.into(),
        };
        provider
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    pub fn with_timeouts(mut self, request: Duration, stream: Duration) -> Self {
        self.timeout = request;
        self.stream_timeout = stream;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn post(&self, path: &str, timeout: Duration) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.client.post(url).timeout(timeout);
        match &self.auth {
            Auth::Bearer(Some(key)) => builder.bearer_auth(key),
            Auth::Bearer(None) => builder,
            Auth::AzureKey { key, api_version } => builder
                .header("api-key", key)
                .query(&[("api-version", api_version)]),
        }
    }

    fn request_body(&self, messages: &[ChatMessage], options: &ChatOptions, stream: bool) -> Value {
        let mut body = json!({
            "model": options.model.clone().unwrap_or_else(|| self.model.clone()),
            "messages": messages,
            "stream": stream,
        });
        if let Some(t) = options.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = options.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if !options.functions.is_empty() {
            let tools: Vec<Value> = options
                .functions
                .iter()
                .map(|f| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": f.name,
                            "description": f.description,
                            "parameters": f.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = match &options.function_call {
                FunctionCallMode::Auto => json!("auto"),
                FunctionCallMode::None => json!("none"),
                FunctionCallMode::Named(name) => {
                    json!({"type": "function", "function": {"name": name}})
                }
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

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
    /// 旧版 functions API
    function_call: Option<WireFunction>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<StreamToolCall>,
    function_call: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

fn parse_completion(response: CompletionResponse) -> Result<ChatResponse, LlmError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse("no choices in completion".to_string()))?;
    let function_call = choice
        .message
        .tool_calls
        .into_iter()
        .next()
        .map(|c| c.function)
        .or(choice.message.function_call)
        .map(|f| FunctionCall {
            name: f.name,
            arguments: CallArguments::Text(f.arguments),
        });
    Ok(ChatResponse {
        content: choice.message.content.unwrap_or_default(),
        function_call,
        finish_reason: choice.finish_reason,
        usage: response.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }),
    })
}

fn parse_stream_data(data: &str) -> Result<Option<ChatStreamChunk>, LlmError> {
    let parsed: StreamResponse = serde_json::from_str(data)
        .map_err(|e| LlmError::InvalidResponse(format!("bad stream chunk: {}", e)))?;
    let Some(choice) = parsed.choices.into_iter().next() else {
        return Ok(None);
    };
    let function = choice
        .delta
        .tool_calls
        .into_iter()
        .find_map(|c| c.function)
        .or(choice.delta.function_call);
    Ok(Some(ChatStreamChunk {
        delta: choice.delta.content.unwrap_or_default(),
        function_call: function.map(|f| FunctionCallDelta {
            name: f.name,
            arguments: f.arguments.unwrap_or_default(),
        }),
        finish_reason: choice.finish_reason,
    }))
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let body = self.request_body(messages, options, false);
        let response = self
            .post("/chat/completions", self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, self.timeout))?;
        let response = ensure_success(response).await?;
        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| self.map_send_error(e, self.timeout))?;
        let result = parse_completion(parsed)?;
        if let Some(usage) = &result.usage {
            tracing::debug!(
                provider = %self.name,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "chat completed"
            );
        }
        Ok(result)
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatStream, LlmError> {
        let body = self.request_body(messages, options, true);
        let response = self
            .post("/chat/completions", self.stream_timeout)
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
                if event.data.trim() == "[DONE]" {
                    break;
                }
                if let Some(chunk) = parse_stream_data(&event.data)? {
                    yield chunk;
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({
            "model": self.embedding_model,
            "input": texts,
        });
        let response = self
            .post("/embeddings", self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, self.timeout))?;
        let response = ensure_success(response).await?;
        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| self.map_send_error(e, self.timeout))?;
        parsed.data.sort_by_key(|item| item.index);
        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FunctionDeclaration;

    #[test]
    fn test_parse_tool_call_completion() {
        let raw = r#"{
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{"id": "c1", "type": "function",
                        "function": {"name": "read_file", "arguments": "{\"path\":\"a.txt\"}"}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let parsed: CompletionResponse = serde_json::from_str(raw).unwrap();
        let response = parse_completion(parsed).unwrap();
        assert_eq!(response.content, "");
        let call = response.function_call.unwrap();
        assert_eq!(call.name, "read_file");
        assert_eq!(
            call.arguments,
            CallArguments::Text("{\"path\":\"a.txt\"}".to_string())
        );
        assert_eq!(response.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn test_parse_stream_chunk() {
        let chunk = parse_stream_data(r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.delta, "Hel");

        let chunk = parse_stream_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"echo","arguments":""}}]}}]}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(chunk.function_call.unwrap().name.as_deref(), Some("echo"));

        assert!(parse_stream_data(r#"{"choices":[]}"#).unwrap().is_none());
    }

    #[test]
    fn test_request_body_tools() {
        let provider = OpenAiProvider::new(Some("sk-test".into()), "gpt-4o-mini");
        let options = ChatOptions::default()
            .with_temperature(0.2)
            .with_functions(vec![FunctionDeclaration {
                name: "echo".into(),
                description: "Echo text".into(),
                parameters: json!({"type": "object", "properties": {}}),
            }]);
        let body = provider.request_body(&[ChatMessage::user("hi")], &options, false);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["tools"][0]["function"]["name"], "echo");
        assert_eq!(body["tool_choice"], "auto");
    }
}

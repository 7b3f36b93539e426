//! Ollama 本地模型提供方
//!
//! /api/chat（NDJSON 流式）与 /api/embeddings（逐条请求）。
//! Ollama 模型普遍不支持原生函数调用：把函数声明注入 system 提示，并从回复中提取
//! `{"function_call": {"name": ..., "arguments": {...}}}`。

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::llm::stream::ndjson_values;
use crate::llm::{
    ensure_success, CallArguments, ChatMessage, ChatOptions, ChatResponse, ChatStream,
    ChatStreamChunk, FunctionCall, FunctionCallMode, FunctionDeclaration, LlmError, LlmProvider,
    Role, Usage,
};

pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";

pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    embedding_model: String,
    timeout: Duration,
    stream_timeout: Duration,
}

impl OllamaProvider {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_OLLAMA_BASE_URL.to_string(),
            model: model.into(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            timeout: Duration::from_secs(120),
            stream_timeout: Duration::from_secs(300),
        }
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

    fn request_body(&self, messages: &[ChatMessage], options: &ChatOptions, stream: bool) -> Value {
        let mut wire: Vec<Value> = Vec::with_capacity(messages.len() + 1);
        if !options.functions.is_empty() && options.function_call != FunctionCallMode::None {
            wire.push(json!({
                "role": "system",
                "content": function_prompt(&options.functions, &options.function_call),
            }));
        }
        wire.extend(messages.iter().map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::Assistant => "assistant",
                Role::User | Role::Function => "user",
            };
            json!({"role": role, "content": m.content})
        }));

        let mut model_options = serde_json::Map::new();
        if let Some(t) = options.temperature {
            model_options.insert("temperature".into(), json!(t));
        }
        if let Some(max) = options.max_tokens {
            model_options.insert("num_predict".into(), json!(max));
        }
        json!({
            "model": options.model.clone().unwrap_or_else(|| self.model.clone()),
            "messages": wire,
            "stream": stream,
            "options": model_options,
        })
    }

    fn map_send_error(&self, e: reqwest::Error, timeout: Duration) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout(timeout)
        } else {
            LlmError::from(e)
        }
    }
}

fn function_prompt(functions: &[FunctionDeclaration], mode: &FunctionCallMode) -> String {
    let mut prompt = String::from(
        "You can call the following functions. To call one, reply with ONLY a JSON object of the form \
         {\"function_call\": {\"name\": \"<function name>\", \"arguments\": {...}}}.\n\nFunctions:\n",
    );
    for f in functions {
        prompt.push_str(&format!(
            "- {}: {}\n  parameters: {}\n",
            f.name, f.description, f.parameters
        ));
    }
    if let FunctionCallMode::Named(name) = mode {
        prompt.push_str(&format!("\nYou must call the function `{}`.\n", name));
    }
    prompt
}

/// 从文本中提取注入协议约定的 function_call；找不到返回 None
pub(crate) fn extract_function_call(content: &str) -> Option<FunctionCall> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    let value: Value = serde_json::from_str(&content[start..=end]).ok()?;
    let call = value.get("function_call")?;
    let name = call.get("name")?.as_str()?.to_string();
    let arguments = match call.get("arguments") {
        Some(Value::Object(map)) => CallArguments::Structured(map.clone()),
        Some(Value::String(text)) => CallArguments::Text(text.clone()),
        _ => CallArguments::Structured(serde_json::Map::new()),
    };
    Some(FunctionCall { name, arguments })
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    message: Option<ReplyMessage>,
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingReply {
    embedding: Vec<f32>,
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let body = self.request_body(messages, options, false);
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, self.timeout))?;
        let response = ensure_success(response).await?;
        let reply: ChatReply = response
            .json()
            .await
            .map_err(|e| self.map_send_error(e, self.timeout))?;

        let content = reply.message.map(|m| m.content).unwrap_or_default();
        let function_call = if options.functions.is_empty() {
            None
        } else {
            extract_function_call(&content)
        };
        let finish_reason = if function_call.is_some() {
            Some("function_call".to_string())
        } else {
            reply.done_reason.or_else(|| Some("stop".to_string()))
        };
        Ok(ChatResponse {
            content,
            function_call,
            finish_reason,
            usage: Some(Usage {
                prompt_tokens: reply.prompt_eval_count,
                completion_tokens: reply.eval_count,
                total_tokens: reply.prompt_eval_count + reply.eval_count,
            }),
        })
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatStream, LlmError> {
        let body = self.request_body(messages, options, true);
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(self.stream_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, self.stream_timeout))?;
        let response = ensure_success(response).await?;
        let values = ndjson_values(response);
        let stream = async_stream::try_stream! {
            futures_util::pin_mut!(values);
            while let Some(value) = values.next().await {
                let value = value?;
                if let Some(error) = value.get("error").and_then(Value::as_str) {
                    Err::<(), LlmError>(LlmError::Stream(error.to_string()))?;
                }
                let delta = value["message"]["content"].as_str().unwrap_or_default().to_string();
                let done = value["done"].as_bool().unwrap_or(false);
                let finish_reason = done.then(|| {
                    value["done_reason"].as_str().unwrap_or("stop").to_string()
                });
                if !delta.is_empty() || finish_reason.is_some() {
                    yield ChatStreamChunk { delta, function_call: None, finish_reason };
                }
                if done {
                    break;
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let response = self
                .client
                .post(format!("{}/api/embeddings", self.base_url))
                .timeout(self.timeout)
                .json(&json!({"model": self.embedding_model, "prompt": text}))
                .send()
                .await
                .map_err(|e| self.map_send_error(e, self.timeout))?;
            let response = ensure_success(response).await?;
            let reply: EmbeddingReply = response
                .json()
                .await
                .map_err(|e| self.map_send_error(e, self.timeout))?;
            vectors.push(reply.embedding);
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_function_call() {
        let content = "Sure.\n{\"function_call\": {\"name\": \"echo\", \"arguments\": {\"text\": \"hi\"}}}";
        let call = extract_function_call(content).unwrap();
        assert_eq!(call.name, "echo");
        match call.arguments {
            CallArguments::Structured(map) => assert_eq!(map["text"], "hi"),
            other => panic!("unexpected: {:?}", other),
        }

        assert!(extract_function_call("no json here").is_none());
        assert!(extract_function_call("{\"command\": \"echo\"}").is_none());
    }

    #[test]
    fn test_function_prompt_injected() {
        let provider = OllamaProvider::new("llama3");
        let options = ChatOptions::default().with_functions(vec![FunctionDeclaration {
            name: "echo".into(),
            description: "Echo text".into(),
            parameters: json!({"type": "object"}),
        }]);
        let body = provider.request_body(&[ChatMessage::user("hi")], &options, false);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert!(messages[0]["content"].as_str().unwrap().contains("- echo: Echo text"));
        assert_eq!(body["stream"], false);
    }
}

//! Mock 提供方（用于测试与离线运行，无需 API）
//!
//! 默认行为：从任务提示中取出 TASK，先回一个 echo 函数调用；一旦 RECENT MEMORY 中出现
//! 执行结果（"Result:"），回 task_complete。也可按脚本依次返回给定响应，或总是失败。

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;
use serde_json::json;

use crate::llm::{
    CallArguments, ChatMessage, ChatOptions, ChatResponse, ChatStream, ChatStreamChunk,
    FunctionCall, LlmError, LlmProvider, Role,
};

const EMBEDDING_DIM: usize = 64;

enum Behavior {
    Echo,
    Scripted(Mutex<VecDeque<ChatResponse>>),
    Failing(String),
}

pub struct MockProvider {
    name: String,
    behavior: Behavior,
    calls: AtomicUsize,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            behavior: Behavior::Echo,
            calls: AtomicUsize::new(0),
        }
    }

    /// 依次返回 responses；用完后返回 task_complete
    pub fn scripted(name: impl Into<String>, responses: Vec<ChatResponse>) -> Self {
        Self {
            name: name.into(),
            behavior: Behavior::Scripted(Mutex::new(responses.into())),
            calls: AtomicUsize::new(0),
        }
    }

    /// 所有调用都返回 LlmError::Http(message)
    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behavior: Behavior::Failing(message.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// 便捷构造：一个函数调用响应
    pub fn function_call(name: &str, arguments: serde_json::Value) -> ChatResponse {
        let arguments = match arguments {
            serde_json::Value::Object(map) => CallArguments::Structured(map),
            other => CallArguments::Text(other.to_string()),
        };
        ChatResponse {
            content: String::new(),
            function_call: Some(FunctionCall {
                name: name.to_string(),
                arguments,
            }),
            finish_reason: Some("function_call".to_string()),
            usage: None,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn respond(&self, messages: &[ChatMessage]) -> Result<ChatResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Failing(message) => Err(LlmError::Http(message.clone())),
            Behavior::Scripted(queue) => {
                let next = queue
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .pop_front();
                Ok(next.unwrap_or_else(|| {
                    Self::function_call("task_complete", json!({"summary": "script exhausted"}))
                }))
            }
            Behavior::Echo => Ok(echo_response(messages)),
        }
    }
}

fn echo_response(messages: &[ChatMessage]) -> ChatResponse {
    let prompt = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("(no input)");
    let task = prompt
        .lines()
        .find_map(|line| line.strip_prefix("TASK: "))
        .unwrap_or(prompt)
        .trim();

    if prompt.contains("Result: ") {
        MockProvider::function_call(
            "task_complete",
            json!({"summary": format!("Completed: {}", task)}),
        )
    } else {
        let mut response = MockProvider::function_call(
            "echo",
            json!({"text": format!("Echo from Mock: {}", task)}),
        );
        response.content = "I will echo the task.\nThen I will finish.".to_string();
        response
    }
}

/// 词袋哈希向量（归一化），相同词汇的文本向量相近
fn hash_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0f32; EMBEDDING_DIM];
    for token in text.split_whitespace() {
        let mut hasher = DefaultHasher::new();
        token.to_lowercase().hash(&mut hasher);
        vector[(hasher.finish() as usize) % EMBEDDING_DIM] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
    vector
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        self.respond(messages)
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> Result<ChatStream, LlmError> {
        let response = self.respond(messages)?;
        let mut chunks: Vec<Result<ChatStreamChunk, LlmError>> = response
            .content
            .split_inclusive(' ')
            .map(|piece| Ok(ChatStreamChunk::text(piece)))
            .collect();
        chunks.push(Ok(ChatStreamChunk {
            finish_reason: Some("stop".to_string()),
            ..Default::default()
        }));
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if let Behavior::Failing(message) = &self.behavior {
            return Err(LlmError::Http(message.clone()));
        }
        Ok(texts.iter().map(|t| hash_embedding(t)).collect())
    }
}

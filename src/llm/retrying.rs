//! 重试包装：对可重试错误（网络、超时、429/5xx）按 RetryConfig 退避重试

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::retry::{retry_with_backoff, RetryConfig};
use crate::llm::{ChatMessage, ChatOptions, ChatResponse, ChatStream, LlmError, LlmProvider};

pub struct RetryingProvider {
    inner: Arc<dyn LlmProvider>,
    config: RetryConfig,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmProvider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        retry_with_backoff(&self.config, LlmError::is_retryable, || {
            self.inner.chat(messages, options)
        })
        .await
    }

    /// 只重试建立流的过程
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatStream, LlmError> {
        retry_with_backoff(&self.config, LlmError::is_retryable, || {
            self.inner.chat_stream(messages, options)
        })
        .await
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        retry_with_backoff(&self.config, LlmError::is_retryable, || self.inner.embed(texts)).await
    }
}

//! 多后端容错：按顺序尝试，全部失败才报错
//!
//! 每次调用都从第一个后端开始（不记忆上次成功的后端）。流式调用只在打开流或首个 chunk 之前切换，
//! 一旦交付了 chunk，之后的错误原样交给调用方。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::llm::{ChatMessage, ChatOptions, ChatResponse, ChatStream, LlmError, LlmProvider};

pub struct FallbackProvider {
    providers: Vec<Arc<dyn LlmProvider>>,
    name: String,
}

impl FallbackProvider {
    /// 空列表返回 Configuration 错误
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>) -> Result<Self, LlmError> {
        if providers.is_empty() {
            return Err(LlmError::Configuration(
                "FallbackProvider requires at least one provider".to_string(),
            ));
        }
        let name = format!(
            "fallback({})",
            providers
                .iter()
                .map(|p| p.name().to_string())
                .collect::<Vec<_>>()
                .join(",")
        );
        Ok(Self { providers, name })
    }

    pub fn providers(&self) -> &[Arc<dyn LlmProvider>] {
        &self.providers
    }

    fn exhausted(&self, last: LlmError) -> LlmError {
        LlmError::AllProvidersFailed {
            attempted: self.providers.len(),
            last: Box::new(last),
        }
    }
}

fn log_failure(provider: &dyn LlmProvider, index: usize, operation: &str, error: &LlmError) {
    tracing::warn!(
        provider = provider.name(),
        index,
        operation,
        error = %error,
        "provider failed, trying next"
    );
}

#[async_trait]
impl LlmProvider for FallbackProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let mut last = None;
        for (index, provider) in self.providers.iter().enumerate() {
            match provider.chat(messages, options).await {
                Ok(response) => {
                    if index > 0 {
                        tracing::info!(provider = provider.name(), index, "fallback provider succeeded");
                    }
                    return Ok(response);
                }
                Err(e) => {
                    log_failure(provider.as_ref(), index, "chat", &e);
                    last = Some(e);
                }
            }
        }
        Err(self.exhausted(last.unwrap_or_else(|| {
            LlmError::Configuration("no providers configured".to_string())
        })))
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatStream, LlmError> {
        let mut last = None;
        for (index, provider) in self.providers.iter().enumerate() {
            let mut opened = match provider.chat_stream(messages, options).await {
                Ok(stream) => stream,
                Err(e) => {
                    log_failure(provider.as_ref(), index, "chat_stream", &e);
                    last = Some(e);
                    continue;
                }
            };
            match opened.next().await {
                Some(Ok(first)) => {
                    let replay = stream::iter(std::iter::once(Ok(first)));
                    return Ok(Box::pin(replay.chain(opened)));
                }
                Some(Err(e)) => {
                    log_failure(provider.as_ref(), index, "chat_stream", &e);
                    last = Some(e);
                }
                None => return Ok(Box::pin(stream::empty())),
            }
        }
        Err(self.exhausted(last.unwrap_or_else(|| {
            LlmError::Configuration("no providers configured".to_string())
        })))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let mut last = None;
        for (index, provider) in self.providers.iter().enumerate() {
            match provider.embed(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) => {
                    log_failure(provider.as_ref(), index, "embed", &e);
                    last = Some(e);
                }
            }
        }
        Err(self.exhausted(last.unwrap_or_else(|| {
            LlmError::Configuration("no providers configured".to_string())
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatStreamChunk, MockProvider};

    #[test]
    fn test_empty_list_rejected() {
        assert!(matches!(
            FallbackProvider::new(vec![]),
            Err(LlmError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_second_provider_answers() {
        let a = Arc::new(MockProvider::failing("a", "rate limited"));
        let b = Arc::new(MockProvider::scripted(
            "b",
            vec![ChatResponse::text("from b")],
        ));
        let fallback = FallbackProvider::new(vec![a.clone(), b.clone()]).unwrap();
        assert_eq!(fallback.name(), "fallback(a,b)");

        let response = fallback
            .chat(&[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(response.content, "from b");
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn test_all_failed_reports_last_error() {
        let fallback = FallbackProvider::new(vec![
            Arc::new(MockProvider::failing("a", "first")),
            Arc::new(MockProvider::failing("b", "second")),
        ])
        .unwrap();
        let err = fallback
            .chat(&[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("All 2 provider(s) failed. Last error:"));
        assert!(message.contains("second"));
    }

    #[tokio::test]
    async fn test_stream_failover_before_first_chunk() {
        let fallback = FallbackProvider::new(vec![
            Arc::new(MockProvider::failing("a", "down")),
            Arc::new(MockProvider::scripted("b", vec![ChatResponse::text("streamed reply")])),
        ])
        .unwrap();
        let stream = fallback
            .chat_stream(&[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap();
        let chunks: Vec<ChatStreamChunk> = stream.map(|c| c.unwrap()).collect().await;
        let text: String = chunks.iter().map(|c| c.delta.as_str()).collect();
        assert_eq!(text, "streamed reply");
    }
}

//! LLM 层：提供方抽象与实现（OpenAI 兼容 / Anthropic / Ollama / Mock）、容错与重试

pub mod anthropic;
pub mod factory;
pub mod fallback;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod retrying;
pub mod stream;
pub mod traits;

pub use anthropic::AnthropicProvider;
pub use factory::{build_backend, create_provider};
pub use fallback::FallbackProvider;
pub use mock::MockProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use retrying::RetryingProvider;
pub use traits::{
    CallArguments, ChatMessage, ChatOptions, ChatResponse, ChatStream, ChatStreamChunk,
    FunctionCall, FunctionCallDelta, FunctionCallMode, FunctionDeclaration, LlmError,
    LlmProvider, Role, Usage,
};

/// 非 2xx 响应转为 LlmError::Api，尽量取出服务端错误信息
pub(crate) async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(LlmError::Api {
        status: status.as_u16(),
        message: error_message(&body),
    })
}

fn error_message(body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let message = parsed.as_ref().and_then(|v| {
        v["error"]["message"]
            .as_str()
            .or_else(|| v["error"].as_str())
            .or_else(|| v["message"].as_str())
            .map(String::from)
    });
    message.unwrap_or_else(|| body.chars().take(500).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(r#"{"error": {"message": "invalid key", "type": "auth"}}"#),
            "invalid key"
        );
        assert_eq!(error_message(r#"{"error": "model not found"}"#), "model not found");
        assert_eq!(error_message("Bad Gateway"), "Bad Gateway");
    }
}

//! 按 [llm] 配置创建提供方：主后端 + 可选重试包装 + 可选 fallback 链

use std::sync::Arc;

use crate::config::{LlmBackendSection, LlmSection, LlmTimeoutsSection};
use crate::llm::{
    AnthropicProvider, FallbackProvider, LlmError, LlmProvider, MockProvider, OllamaProvider,
    OpenAiProvider, RetryingProvider,
};

const DEFAULT_AZURE_API_VERSION: &str = "2024-02-01";

/// 创建单个后端（不含重试 / fallback）
pub fn build_backend(
    backend: &LlmBackendSection,
    timeouts: &LlmTimeoutsSection,
) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let (request, stream) = (timeouts.request(), timeouts.stream());
    let provider: Arc<dyn LlmProvider> = match backend.provider.to_ascii_lowercase().as_str() {
        "openai" => {
            let mut p = OpenAiProvider::new(backend.api_key.clone(), backend.model.clone())
                .with_timeouts(request, stream);
            if let Some(url) = &backend.base_url {
                p = p.with_base_url(url.clone());
            }
            if let Some(model) = &backend.embedding_model {
                p = p.with_embedding_model(model.clone());
            }
            Arc::new(p)
        }
        "azure" => {
            let endpoint = backend.base_url.as_deref().ok_or_else(|| {
                LlmError::Configuration("azure provider requires base_url (endpoint)".to_string())
            })?;
            let key = backend
                .api_key
                .clone()
                .or_else(|| std::env::var("AZURE_OPENAI_API_KEY").ok())
                .ok_or_else(|| {
                    LlmError::Configuration("azure provider requires api_key".to_string())
                })?;
            let version = backend
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string());
            let mut p = OpenAiProvider::azure(endpoint, backend.model.clone(), key, version)
                .with_timeouts(request, stream);
            if let Some(model) = &backend.embedding_model {
                p = p.with_embedding_model(model.clone());
            }
            Arc::new(p)
        }
        "anthropic" | "claude" => {
            let mut p = AnthropicProvider::new(backend.api_key.clone(), backend.model.clone())
                .with_timeouts(request, stream);
            if let Some(url) = &backend.base_url {
                p = p.with_base_url(url.clone());
            }
            Arc::new(p)
        }
        "ollama" | "local" => {
            let mut p = OllamaProvider::new(backend.model.clone()).with_timeouts(request, stream);
            if let Some(url) = &backend.base_url {
                p = p.with_base_url(url.clone());
            }
            if let Some(model) = &backend.embedding_model {
                p = p.with_embedding_model(model.clone());
            }
            Arc::new(p)
        }
        "mock" => Arc::new(MockProvider::new()),
        other => {
            return Err(LlmError::Configuration(format!(
                "unknown llm provider: {}",
                other
            )))
        }
    };
    Ok(provider)
}

/// 主后端与 fallbacks 依次创建；配置了 [llm.retry] 时每个后端各自包一层重试
pub fn create_provider(section: &LlmSection) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let wrap = |provider: Arc<dyn LlmProvider>| -> Arc<dyn LlmProvider> {
        match &section.retry {
            Some(retry) => Arc::new(RetryingProvider::new(provider, retry.clone())),
            None => provider,
        }
    };

    let primary = wrap(build_backend(&section.primary(), &section.timeouts)?);
    if section.fallbacks.is_empty() {
        tracing::info!(provider = primary.name(), model = %section.model, "llm provider ready");
        return Ok(primary);
    }

    let mut chain = vec![primary];
    for backend in &section.fallbacks {
        chain.push(wrap(build_backend(backend, &section.timeouts)?));
    }
    let fallback = FallbackProvider::new(chain)?;
    tracing::info!(provider = fallback.name(), "llm fallback chain ready");
    Ok(Arc::new(fallback))
}

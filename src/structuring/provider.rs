//! edgequake-llm backend: any configured vision provider.
//!
//! Providers reached through edgequake-llm cannot take a PDF directly, so
//! every page is rendered and attached as an image. The request is:
//!
//! 1. **System message**: the editorial prompt (or the user override)
//! 2. **User message**: the per-request instruction plus all page images
//!
//! edgequake-llm exposes no streaming chat for image messages, so this
//! backend is non-streaming and the client goes straight to its retry loop.

use crate::config::ConversionConfig;
use crate::error::{EpubError, StructuringError};
use crate::prompts::DEFAULT_SYSTEM_PROMPT;
use crate::structuring::backend::{StructuringBackend, StructuringRequest};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::sync::Arc;
use tracing::debug;

/// Vision-provider backend.
pub struct ProviderBackend {
    provider: Arc<dyn LLMProvider>,
    pages: Vec<ImageData>,
    system_prompt: String,
    options: CompletionOptions,
}

impl ProviderBackend {
    pub fn new(provider: Arc<dyn LLMProvider>, pages: Vec<ImageData>, config: &ConversionConfig) -> Self {
        Self {
            provider,
            pages,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            options: build_options(config),
        }
    }
}

#[async_trait]
impl StructuringBackend for ProviderBackend {
    fn name(&self) -> &str {
        "edgequake-llm"
    }

    async fn complete(&self, request: &StructuringRequest) -> Result<String, StructuringError> {
        let messages = vec![
            ChatMessage::system(&self.system_prompt),
            ChatMessage::user_with_images(&request.instruction(), self.pages.clone()),
        ];
        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| classify_message(&e.to_string()))?;
        debug!(
            "{}: {} input tokens, {} output tokens",
            request.debug_name(),
            response.prompt_tokens,
            response.completion_tokens
        );
        if response.content.trim().is_empty() {
            return Err(StructuringError::transient("empty response"));
        }
        Ok(response.content)
    }
}

/// Build `CompletionOptions` from the conversion config.
fn build_options(config: &ConversionConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

/// Provider errors arrive as text; auth and quota failures will not clear up
/// on retry.
pub fn classify_message(message: &str) -> StructuringError {
    let lower = message.to_lowercase();
    const PERMANENT: &[&str] = &[
        "401",
        "403",
        "unauthorized",
        "forbidden",
        "invalid api key",
        "invalid_api_key",
        "authentication",
        "insufficient_quota",
        "quota exceeded",
        "billing",
    ];
    if PERMANENT.iter().any(|p| lower.contains(p)) {
        StructuringError::permanent(message)
    } else {
        StructuringError::transient(message)
    }
}

/// Instantiate a named provider with the given model.
pub fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, EpubError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        EpubError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Auto-detect a provider from the environment.
pub fn provider_from_env() -> Result<Arc<dyn LLMProvider>, EpubError> {
    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| EpubError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No structuring service could be configured.\n\
                Set GEMINI_API_KEY for the native Gemini backend, or an API key \
                for an edgequake-llm provider (OPENAI_API_KEY, ANTHROPIC_API_KEY, ...).\n\
                Error: {}",
                e
            ),
        })?;
    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StructuringErrorKind;

    #[test]
    fn build_options_defaults() {
        let config = ConversionConfig::default();
        let opts = build_options(&config);
        assert_eq!(opts.temperature, Some(0.1));
        assert_eq!(opts.max_tokens, Some(32768));
    }

    #[test]
    fn auth_failures_are_permanent() {
        assert!(classify_message("HTTP 401 Unauthorized").is_permanent());
        assert!(classify_message("Invalid API key provided").is_permanent());
        assert!(classify_message("insufficient_quota: check billing").is_permanent());
    }

    #[test]
    fn other_failures_are_transient() {
        let e = classify_message("connection reset by peer");
        assert_eq!(e.kind, StructuringErrorKind::Transient);
        assert_eq!(
            classify_message("503 Service Unavailable").kind,
            StructuringErrorKind::Transient
        );
    }
}

//! # tribunal-provider
//!
//! The generation provider boundary for tribunal.
//!
//! A provider turns a participant prompt into text, either as one blocking
//! call or as a stream of fragments. Every failure is classified into a small
//! taxonomy so callers can substitute a fallback speech without losing the
//! reason.
//!
//! ## Backends
//!
//! - [`OllamaProvider`]: `/api/generate` with NDJSON streaming
//! - [`OpenAiCompatProvider`]: any `chat/completions` endpoint with SSE streaming
//! - [`BreakerProvider`]: wraps either one behind a [`CircuitBreaker`]
//! - [`ScriptedProvider`]: deterministic outcomes for tests

mod circuit_breaker;
mod mock;
mod ollama;
mod openai;
mod provider;
mod types;

use std::sync::Arc;

use tribunal_core::config::{Backend, ProviderConfig};

pub use circuit_breaker::{BreakerProvider, CircuitBreaker, CircuitState};
pub use mock::{Script, ScriptedProvider};
pub use ollama::OllamaProvider;
pub use openai::OpenAiCompatProvider;
pub use provider::{classify, GenerationProvider, ProviderError, ProviderErrorKind, TextStream};
pub use types::GenerationRequest;

/// Build the configured backend, wrapped in a circuit breaker
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn GenerationProvider>, ProviderError> {
    let breaker = CircuitBreaker::new(
        config.failure_threshold,
        std::time::Duration::from_secs(config.cooldown_secs),
    );
    let provider: Arc<dyn GenerationProvider> = match config.backend {
        Backend::Ollama => Arc::new(BreakerProvider::new(
            OllamaProvider::new(
                &config.base_url,
                config.request_timeout(),
                config.health_timeout(),
            )?,
            breaker,
        )),
        Backend::Openai => Arc::new(BreakerProvider::new(
            OpenAiCompatProvider::new(
                &config.base_url,
                config.api_key(),
                config.request_timeout(),
                config.health_timeout(),
            )?,
            breaker,
        )),
    };
    tracing::info!(backend = ?config.backend, base_url = %config.base_url, "Generation provider ready");
    Ok(provider)
}

//! Ollama backend (`/api/tags`, `/api/generate`)

use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tracing::instrument;

use crate::provider::{check_status, lines, GenerationProvider, ProviderError, TextStream};
use crate::types::{GenerationRequest, OllamaGenerateChunk, OllamaGenerateRequest, OllamaOptions};

/// Ollama HTTP client
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    health_timeout: Duration,
}

impl OllamaProvider {
    pub fn new(
        base_url: &str,
        request_timeout: Duration,
        health_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProviderError::Unknown(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            health_timeout,
        })
    }

    fn body<'a>(request: &'a GenerationRequest, stream: bool) -> OllamaGenerateRequest<'a> {
        OllamaGenerateRequest {
            model: &request.model,
            prompt: &request.prompt,
            stream,
            options: request.max_tokens.map(|n| OllamaOptions { num_predict: n }),
        }
    }

    async fn post_generate(
        &self,
        request: &GenerationRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&Self::body(request, stream))
            .send()
            .await?;
        check_status(response).await
    }
}

fn parse_chunk(line: &str) -> Result<OllamaGenerateChunk, ProviderError> {
    let chunk: OllamaGenerateChunk = serde_json::from_str(line)
        .map_err(|e| ProviderError::Unknown(format!("Malformed Ollama response: {}", e)))?;
    if let Some(error) = chunk.error {
        return Err(ProviderError::Unknown(error));
    }
    Ok(chunk)
}

#[async_trait]
impl GenerationProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn health(&self) -> bool {
        let result = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(self.health_timeout)
            .send()
            .await;
        match result {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::warn!("Ollama health probe failed: {}", e);
                false
            }
        }
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let response = self.post_generate(request, false).await?;
        let text = response.text().await?;
        let chunk = parse_chunk(&text)?;
        if chunk.response.trim().is_empty() {
            return Err(ProviderError::EmptyContent);
        }
        tracing::debug!(chars = chunk.response.len(), "Ollama generation complete");
        Ok(chunk.response)
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream, ProviderError> {
        let response = self.post_generate(request, true).await?;
        let mut raw = Box::pin(lines(response.bytes_stream()));

        let stream = async_stream::try_stream! {
            while let Some(line) = raw.next().await {
                let chunk = parse_chunk(&line?)?;
                if !chunk.response.is_empty() {
                    yield chunk.response;
                }
                if chunk.done {
                    break;
                }
            }
        };
        Ok(stream.boxed())
    }
}

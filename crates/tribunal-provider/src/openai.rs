//! OpenAI-compatible backend (`/models`, `/chat/completions`)

use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tracing::instrument;

use crate::provider::{check_status, lines, GenerationProvider, ProviderError, TextStream};
use crate::types::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, GenerationRequest};

const DEFAULT_MAX_TOKENS: u32 = 500;
const SSE_DONE: &str = "[DONE]";

/// Client for any server speaking the OpenAI chat completions dialect
#[derive(Clone)]
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    health_timeout: Duration,
}

impl std::fmt::Debug for OpenAiCompatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatProvider")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl OpenAiCompatProvider {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
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
            api_key,
            health_timeout,
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn post_completion(
        &self,
        request: &GenerationRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = ChatCompletionRequest {
            model: &request.model,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: request.prompt.clone(),
            }],
            stream,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        };
        let response = self
            .authorized(self.client.post(format!("{}/chat/completions", self.base_url)))
            .json(&body)
            .send()
            .await?;
        check_status(response).await
    }
}

/// Delta text carried by one SSE line; keep-alives and undecodable payloads
/// yield `None`
fn sse_delta(line: &str) -> Option<String> {
    let data = line.strip_prefix("data:")?.trim();
    if data == SSE_DONE {
        return None;
    }
    let chunk: ChatCompletionResponse = serde_json::from_str(data).ok()?;
    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .filter(|s| !s.is_empty())
}

fn is_done(line: &str) -> bool {
    line.strip_prefix("data:")
        .map(|d| d.trim() == SSE_DONE)
        .unwrap_or(false)
}

#[async_trait]
impl GenerationProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai"
    }

    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn health(&self) -> bool {
        let result = self
            .authorized(self.client.get(format!("{}/models", self.base_url)))
            .timeout(self.health_timeout)
            .send()
            .await;
        match result {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::warn!("OpenAI-compatible health probe failed: {}", e);
                false
            }
        }
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let response = self.post_completion(request, false).await?;
        let parsed: ChatCompletionResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(ProviderError::EmptyContent);
        }
        Ok(content)
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream, ProviderError> {
        let response = self.post_completion(request, true).await?;
        let mut raw = Box::pin(lines(response.bytes_stream()));

        let stream = async_stream::try_stream! {
            while let Some(line) = raw.next().await {
                let line = line?;
                if is_done(&line) {
                    break;
                }
                if let Some(delta) = sse_delta(&line) {
                    yield delta;
                }
            }
        };
        Ok(stream.boxed())
    }
}

//! Generation provider trait and error taxonomy

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use thiserror::Error;

use crate::types::GenerationRequest;

/// Incremental text fragments of one generation, ending at the stream's end
/// or at the first error
pub type TextStream = BoxStream<'static, Result<String, ProviderError>>;

/// Everything that can go wrong while generating a speech
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The health probe failed or the circuit is open; nothing was sent
    #[error("Generation provider unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to connect to generation provider: {0}")]
    Connect(String),

    #[error("Generation timed out: {0}")]
    Timeout(String),

    #[error("Generation provider returned HTTP {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("Generation provider returned empty content")]
    EmptyContent,

    #[error("Generation failed: {0}")]
    Unknown(String),
}

/// Coarse classification of a [`ProviderError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    Unavailable,
    Connect,
    Timeout,
    UpstreamStatus,
    EmptyContent,
    Unknown,
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "unavailable"),
            Self::Connect => write!(f, "connect"),
            Self::Timeout => write!(f, "timeout"),
            Self::UpstreamStatus => write!(f, "upstream_status"),
            Self::EmptyContent => write!(f, "empty_content"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl ProviderError {
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            Self::Unavailable(_) => ProviderErrorKind::Unavailable,
            Self::Connect(_) => ProviderErrorKind::Connect,
            Self::Timeout(_) => ProviderErrorKind::Timeout,
            Self::UpstreamStatus { .. } => ProviderErrorKind::UpstreamStatus,
            Self::EmptyContent => ProviderErrorKind::EmptyContent,
            Self::Unknown(_) => ProviderErrorKind::Unknown,
        }
    }

    /// Operator-facing explanation of what probably went wrong
    pub fn diagnostic(&self) -> String {
        match self {
            Self::Unavailable(detail) => {
                format!("The model service is not available ({}). Is it running?", detail)
            }
            Self::Connect(_) => {
                "Could not connect to the model service. Check the base URL and that the service is up."
                    .to_string()
            }
            Self::Timeout(_) => {
                "The model took too long to answer. Try a smaller model or a longer timeout.".to_string()
            }
            Self::UpstreamStatus { status, body } if body.is_empty() => {
                format!("The model service answered with HTTP {}.", status)
            }
            Self::UpstreamStatus { status, body } => {
                format!("The model service answered with HTTP {}: {}", status, body)
            }
            Self::EmptyContent => "The model returned an empty answer.".to_string(),
            Self::Unknown(detail) => format!("Unexpected generation failure: {}", detail),
        }
    }

    /// Whether the failure says something about provider health
    pub fn counts_against_breaker(&self) -> bool {
        !matches!(self, Self::EmptyContent | Self::Unavailable(_))
    }
}

/// Map a transport error onto the taxonomy
pub fn classify(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(err.to_string())
    } else if err.is_connect() {
        ProviderError::Connect(err.to_string())
    } else if let Some(status) = err.status() {
        ProviderError::UpstreamStatus {
            status: status.as_u16(),
            body: String::new(),
        }
    } else {
        ProviderError::Unknown(err.to_string())
    }
}

/// Turn a non-success response into `UpstreamStatus`, keeping the body
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::UpstreamStatus {
        status: status.as_u16(),
        body: body.chars().take(500).collect(),
    })
}

/// Split a byte stream into trimmed, non-empty text lines
pub(crate) fn lines<S, B, E>(bytes: S) -> impl Stream<Item = Result<String, ProviderError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<ProviderError> + Send,
{
    async_stream::try_stream! {
        let mut buf: Vec<u8> = Vec::new();
        futures::pin_mut!(bytes);
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| -> ProviderError { e.into() })?;
            buf.extend_from_slice(chunk.as_ref());
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw).trim().to_string();
                if !line.is_empty() {
                    yield line;
                }
            }
        }
        let rest = String::from_utf8_lossy(&buf).trim().to_string();
        if !rest.is_empty() {
            yield rest;
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        classify(err)
    }
}

/// A backend that can turn prompts into speeches
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Liveness probe, separate from generation
    async fn health(&self) -> bool;

    /// One blocking call returning the whole text
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError>;

    /// Incremental fragments; the stream ends after the last fragment
    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream, ProviderError>;
}

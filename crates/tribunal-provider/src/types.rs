//! Request and wire types for generation backends

use serde::{Deserialize, Serialize};
use tribunal_core::ParticipantId;

/// One generation call on behalf of a participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Who is speaking; backends ignore it, test fakes key on it
    pub participant: Option<ParticipantId>,
    pub model: String,
    pub prompt: String,
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            participant: None,
            model: model.into(),
            prompt: prompt.into(),
            max_tokens: None,
        }
    }

    pub fn for_participant(mut self, participant: ParticipantId) -> Self {
        self.participant = Some(participant);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Ollama `/api/generate` request body
#[derive(Debug, Clone, Serialize)]
pub(crate) struct OllamaGenerateRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<OllamaOptions>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct OllamaOptions {
    pub num_predict: u32,
}

/// One `/api/generate` response object; streaming sends one per line
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OllamaGenerateChunk {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// OpenAI-compatible chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// OpenAI-compatible `chat/completions` request body
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChatChoice {
    #[serde(default)]
    pub message: Option<ChatMessage>,
    #[serde(default)]
    pub delta: Option<ChatDelta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ChatDelta {
    #[serde(default)]
    pub content: Option<String>,
}

//! Scripted generation provider for tests

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tribunal_core::ParticipantId;

use crate::provider::{GenerationProvider, ProviderError, TextStream};
use crate::types::GenerationRequest;

/// Outcome of one scripted generation call
#[derive(Debug, Clone)]
pub enum Script {
    /// Whole text; streamed word by word in streaming mode
    Reply(String),
    /// Exact fragments in streaming mode, concatenated otherwise
    Chunks(Vec<String>),
    Fail(ProviderError),
    /// Emit these fragments, then fail
    FailMidStream(Vec<String>, ProviderError),
    /// Never answers
    Hang,
}

impl Script {
    pub fn reply(text: impl Into<String>) -> Self {
        Self::Reply(text.into())
    }
}

#[derive(Default)]
struct State {
    scripts: HashMap<ParticipantId, VecDeque<Script>>,
    calls: Vec<GenerationRequest>,
}

/// Mock provider answering from per-participant script queues
///
/// When a participant's queue is empty the default script is used; without a
/// default the reply echoes the participant and call number.
#[derive(Clone)]
pub struct ScriptedProvider {
    state: Arc<Mutex<State>>,
    default: Option<Script>,
    healthy: Arc<AtomicBool>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            default: None,
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_script(self, participant: ParticipantId, script: Script) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.scripts.entry(participant).or_default().push_back(script);
        }
        self
    }

    pub fn with_default(mut self, script: Script) -> Self {
        self.default = Some(script);
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Every request received so far, in order
    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    /// Requests made on behalf of one participant
    pub fn calls_for(&self, participant: ParticipantId) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.participant == Some(participant))
            .count()
    }

    fn next_script(&self, request: &GenerationRequest) -> Script {
        let Ok(mut state) = self.state.lock() else {
            return Script::Fail(ProviderError::Unknown("mock state poisoned".to_string()));
        };
        state.calls.push(request.clone());
        let call_no = state.calls.len();
        let scripted = request
            .participant
            .and_then(|p| state.scripts.get_mut(&p))
            .and_then(|queue| queue.pop_front());
        scripted.or_else(|| self.default.clone()).unwrap_or_else(|| {
            let speaker = request
                .participant
                .map(|p| p.to_string())
                .unwrap_or_else(|| "anonymous".to_string());
            Script::Reply(format!("Speech {} from {}.", call_no, speaker))
        })
    }
}

fn words(text: &str) -> Vec<String> {
    text.split_inclusive(' ').map(str::to_string).collect()
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn health(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let text = match self.next_script(request) {
            Script::Reply(text) => text,
            Script::Chunks(chunks) => chunks.concat(),
            Script::Fail(err) | Script::FailMidStream(_, err) => return Err(err),
            Script::Hang => futures::future::pending().await,
        };
        if text.trim().is_empty() {
            return Err(ProviderError::EmptyContent);
        }
        Ok(text)
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream, ProviderError> {
        let items: Vec<Result<String, ProviderError>> = match self.next_script(request) {
            Script::Reply(text) => words(&text).into_iter().map(Ok).collect(),
            Script::Chunks(chunks) => chunks.into_iter().map(Ok).collect(),
            Script::Fail(err) => return Err(err),
            Script::FailMidStream(chunks, err) => chunks
                .into_iter()
                .map(Ok)
                .chain(std::iter::once(Err(err)))
                .collect(),
            Script::Hang => return Ok(futures::stream::pending().boxed()),
        };
        Ok(futures::stream::iter(items).boxed())
    }
}

//! One generation call with event publication, timeout and fallback
//!
//! A streamed speech is an explicit producer/consumer pair: a spawned task
//! pumps provider fragments into a channel, and the caller consumes them as
//! `start -> chunk* -> complete | error`.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use tribunal_core::{GameId, MessageKind, Participant, RoundId, TribunalConfig};
use tribunal_provider::{GenerationProvider, GenerationRequest, ProviderError};
use uuid::Uuid;

use crate::publisher::{EventPublisher, GameEvent, ParticipantRef};

const FRAGMENT_BUFFER: usize = 64;

/// Streamer knobs, usually taken from [`TribunalConfig`]
#[derive(Debug, Clone)]
pub struct StreamerSettings {
    pub streaming: bool,
    pub timeout: Duration,
    pub chunk_delay: Duration,
    pub default_model: String,
}

impl StreamerSettings {
    pub fn from_config(config: &TribunalConfig) -> Self {
        Self {
            streaming: config.provider.streaming,
            timeout: config.provider.request_timeout(),
            chunk_delay: config.debate.chunk_delay(),
            default_model: config.provider.default_model.clone(),
        }
    }
}

/// Who speaks, where, and what they were asked
pub struct SpeechSpec<'a> {
    pub game_id: GameId,
    pub round_id: RoundId,
    pub speaker: &'a Participant,
    pub kind: MessageKind,
    pub prompt: String,
}

/// Text of a finished speech
#[derive(Debug, Clone)]
pub struct Utterance {
    pub text: String,
    pub is_fallback: bool,
    /// Observers already saw it through start/chunk/complete events
    pub streamed: bool,
    pub failure: Option<ProviderError>,
}

enum Fragment {
    Delta(String),
    End,
    Failed(ProviderError),
}

/// Aborts the producer if the consumer gives up first
struct Producer(JoinHandle<()>);

impl Drop for Producer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct GenerationStreamer {
    provider: Arc<dyn GenerationProvider>,
    publisher: Arc<dyn EventPublisher>,
    settings: StreamerSettings,
}

impl GenerationStreamer {
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        publisher: Arc<dyn EventPublisher>,
        settings: StreamerSettings,
    ) -> Self {
        Self {
            provider,
            publisher,
            settings,
        }
    }

    /// Produce a speech, substituting `fallback` on any provider failure
    ///
    /// Additional-debate speeches are never streamed.
    pub async fn speak(&self, spec: &SpeechSpec<'_>, fallback: impl FnOnce() -> String) -> Utterance {
        let streamed = self.settings.streaming && spec.kind != MessageKind::AdditionalDebate;
        let result = if streamed {
            self.stream(spec).await
        } else {
            self.generate(spec).await
        };
        match result {
            Ok(text) => Utterance {
                text,
                is_fallback: false,
                streamed,
                failure: None,
            },
            Err(e) => {
                warn!(
                    round_id = %spec.round_id,
                    participant = %spec.speaker.id,
                    kind = %e.kind(),
                    "Generation failed, using fallback: {}",
                    e.diagnostic()
                );
                Utterance {
                    text: fallback(),
                    is_fallback: true,
                    streamed: false,
                    failure: Some(e),
                }
            }
        }
    }

    /// Single blocking call after a liveness check
    pub async fn generate(&self, spec: &SpeechSpec<'_>) -> Result<String, ProviderError> {
        self.ensure_live().await?;
        let request = self.request(spec);
        let text = tokio::time::timeout(self.settings.timeout, self.provider.generate(&request))
            .await
            .map_err(|_| self.timed_out())??;
        if text.trim().is_empty() {
            return Err(ProviderError::EmptyContent);
        }
        Ok(text)
    }

    /// Streamed call publishing start, chunk, and complete or error events
    pub async fn stream(&self, spec: &SpeechSpec<'_>) -> Result<String, ProviderError> {
        self.ensure_live().await?;
        let key = Uuid::new_v4();
        self.publisher.publish(
            spec.game_id,
            GameEvent::MessageStart {
                round_id: spec.round_id,
                message_key: key,
                speaker: ParticipantRef::from(spec.speaker),
                kind: spec.kind,
            },
        );

        let result = self.consume(spec, key).await;

        let event = match &result {
            Ok(text) => GameEvent::MessageComplete {
                round_id: spec.round_id,
                message_key: key,
                participant: spec.speaker.id,
                content: text.clone(),
            },
            Err(e) => GameEvent::MessageError {
                round_id: spec.round_id,
                message_key: key,
                participant: spec.speaker.id,
                kind: e.kind().to_string(),
                error: e.diagnostic(),
            },
        };
        self.publisher.publish(spec.game_id, event);
        result
    }

    /// Drain the producer; the timeout bounds each wait for the provider,
    /// not the pacing between published chunks
    async fn consume(&self, spec: &SpeechSpec<'_>, key: Uuid) -> Result<String, ProviderError> {
        let (tx, mut rx) = mpsc::channel(FRAGMENT_BUFFER);
        let _producer = Producer(tokio::spawn(produce(
            Arc::clone(&self.provider),
            self.request(spec),
            tx,
        )));

        let mut text = String::new();
        let mut ended = false;
        loop {
            let fragment = match tokio::time::timeout(self.settings.timeout, rx.recv()).await {
                Ok(Some(fragment)) => fragment,
                Ok(None) => break,
                Err(_) => return Err(self.timed_out()),
            };
            match fragment {
                Fragment::Delta(delta) => {
                    text.push_str(&delta);
                    self.publisher.publish(
                        spec.game_id,
                        GameEvent::MessageChunk {
                            round_id: spec.round_id,
                            message_key: key,
                            delta,
                        },
                    );
                    if !self.settings.chunk_delay.is_zero() {
                        tokio::time::sleep(self.settings.chunk_delay).await;
                    }
                }
                Fragment::End => {
                    ended = true;
                    break;
                }
                Fragment::Failed(e) => return Err(e),
            }
        }

        if !ended {
            return Err(ProviderError::Unknown(
                "generation stream stopped without completing".to_string(),
            ));
        }
        if text.trim().is_empty() {
            return Err(ProviderError::EmptyContent);
        }
        debug!(participant = %spec.speaker.id, chars = text.len(), "Stream complete");
        Ok(text)
    }

    async fn ensure_live(&self) -> Result<(), ProviderError> {
        if self.provider.health().await {
            Ok(())
        } else {
            Err(ProviderError::Unavailable(format!(
                "{} backend failed its health probe",
                self.provider.name()
            )))
        }
    }

    fn request(&self, spec: &SpeechSpec<'_>) -> GenerationRequest {
        let model = if spec.speaker.model.is_empty() {
            self.settings.default_model.as_str()
        } else {
            spec.speaker.model.as_str()
        };
        GenerationRequest::new(model, spec.prompt.clone()).for_participant(spec.speaker.id)
    }

    fn timed_out(&self) -> ProviderError {
        ProviderError::Timeout(format!("no answer within {:?}", self.settings.timeout))
    }
}

async fn produce(
    provider: Arc<dyn GenerationProvider>,
    request: GenerationRequest,
    tx: mpsc::Sender<Fragment>,
) {
    let mut stream = match provider.generate_stream(&request).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = tx.send(Fragment::Failed(e)).await;
            return;
        }
    };
    while let Some(item) = stream.next().await {
        let (fragment, last) = match item {
            Ok(delta) => (Fragment::Delta(delta), false),
            Err(e) => (Fragment::Failed(e), true),
        };
        if tx.send(fragment).await.is_err() || last {
            return;
        }
    }
    let _ = tx.send(Fragment::End).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::RecordingPublisher;
    use tribunal_core::ParticipantId;
    use tribunal_provider::{Script, ScriptedProvider};

    fn settings(streaming: bool) -> StreamerSettings {
        StreamerSettings {
            streaming,
            timeout: Duration::from_secs(5),
            chunk_delay: Duration::ZERO,
            default_model: "llama3".to_string(),
        }
    }

    fn speaker() -> Participant {
        let mut p = Participant::new(GameId(1), "Ada", "");
        p.id = ParticipantId(1);
        p
    }

    fn setup(provider: ScriptedProvider, streaming: bool) -> (GenerationStreamer, Arc<RecordingPublisher>) {
        let recorder = Arc::new(RecordingPublisher::new());
        let streamer = GenerationStreamer::new(Arc::new(provider), recorder.clone(), settings(streaming));
        (streamer, recorder)
    }

    fn spec(speaker: &Participant, kind: MessageKind) -> SpeechSpec<'_> {
        SpeechSpec {
            game_id: GameId(1),
            round_id: RoundId(1),
            speaker,
            kind,
            prompt: "say something".to_string(),
        }
    }

    #[tokio::test]
    async fn test_stream_publishes_start_chunks_complete() {
        let provider = ScriptedProvider::new().with_script(
            ParticipantId(1),
            Script::Chunks(vec!["I am ".into(), "human.".into()]),
        );
        let (streamer, recorder) = setup(provider.clone(), true);
        let speaker = speaker();

        let text = streamer.stream(&spec(&speaker, MessageKind::Chat)).await.unwrap();
        assert_eq!(text, "I am human.");
        assert_eq!(
            recorder.event_types(),
            vec!["message_start", "message_chunk", "message_chunk", "message_complete"]
        );
        match recorder.events().last().map(|(_, e)| e.clone()) {
            Some(GameEvent::MessageComplete { content, .. }) => assert_eq!(content, "I am human."),
            other => panic!("unexpected {:?}", other),
        }
        // Empty participant model falls back to the configured default
        assert_eq!(provider.calls()[0].model, "llama3");
    }

    #[tokio::test]
    async fn test_empty_stream_is_a_failure() {
        let provider = ScriptedProvider::new().with_script(ParticipantId(1), Script::Chunks(vec![" ".into()]));
        let (streamer, recorder) = setup(provider, true);
        let speaker = speaker();

        let err = streamer.stream(&spec(&speaker, MessageKind::Chat)).await.unwrap_err();
        assert_eq!(err, ProviderError::EmptyContent);
        assert_eq!(recorder.event_types().last(), Some(&"message_error"));
    }

    #[tokio::test]
    async fn test_mid_stream_failure_ends_with_error_event() {
        let provider = ScriptedProvider::new().with_script(
            ParticipantId(1),
            Script::FailMidStream(vec!["half".into()], ProviderError::Connect("reset".into())),
        );
        let (streamer, recorder) = setup(provider, true);
        let speaker = speaker();

        let err = streamer.stream(&spec(&speaker, MessageKind::Chat)).await.unwrap_err();
        assert!(matches!(err, ProviderError::Connect(_)));
        assert_eq!(
            recorder.event_types(),
            vec!["message_start", "message_chunk", "message_error"]
        );
    }

    #[tokio::test]
    async fn test_unhealthy_provider_fails_fast() {
        let provider = ScriptedProvider::new();
        provider.set_healthy(false);
        let (streamer, recorder) = setup(provider.clone(), true);
        let speaker = speaker();

        let err = streamer.stream(&spec(&speaker, MessageKind::Chat)).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
        assert!(recorder.events().is_empty());
        assert!(provider.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_stream_times_out() {
        let provider = ScriptedProvider::new().with_script(ParticipantId(1), Script::Hang);
        let (streamer, _) = setup(provider, true);
        let speaker = speaker();

        let err = streamer.stream(&spec(&speaker, MessageKind::Chat)).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_pacing_does_not_count_against_timeout() {
        let fragments = (0..40).map(|i| format!("w{} ", i)).collect();
        let provider = ScriptedProvider::new().with_script(ParticipantId(1), Script::Chunks(fragments));
        let recorder = Arc::new(RecordingPublisher::new());
        let settings = StreamerSettings {
            timeout: Duration::from_secs(1),
            chunk_delay: Duration::from_millis(50),
            ..settings(true)
        };
        let streamer = GenerationStreamer::new(Arc::new(provider), recorder.clone(), settings);
        let speaker = speaker();

        // 40 chunks paced at 50ms take twice the per-read timeout in total
        let text = streamer.stream(&spec(&speaker, MessageKind::Chat)).await.unwrap();
        assert!(text.starts_with("w0 w1 "));
        assert!(text.ends_with("w39 "));
        assert_eq!(recorder.event_types().last(), Some(&"message_complete"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_generate_times_out() {
        let provider = ScriptedProvider::new().with_script(ParticipantId(1), Script::Hang);
        let (streamer, _) = setup(provider, false);
        let speaker = speaker();

        let err = streamer.generate(&spec(&speaker, MessageKind::Chat)).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_speak_substitutes_fallback() {
        let provider = ScriptedProvider::new()
            .with_script(ParticipantId(1), Script::Fail(ProviderError::UpstreamStatus {
                status: 500,
                body: "boom".into(),
            }));
        let (streamer, _) = setup(provider, true);
        let speaker = speaker();

        let utterance = streamer
            .speak(&spec(&speaker, MessageKind::Chat), || "stand-in".to_string())
            .await;
        assert!(utterance.is_fallback);
        assert!(!utterance.streamed);
        assert_eq!(utterance.text, "stand-in");
        assert!(matches!(utterance.failure, Some(ProviderError::UpstreamStatus { status: 500, .. })));
    }

    #[tokio::test]
    async fn test_additional_debate_is_not_streamed() {
        let provider = ScriptedProvider::new().with_script(ParticipantId(1), Script::reply("Trust me."));
        let (streamer, recorder) = setup(provider, true);
        let speaker = speaker();

        let utterance = streamer
            .speak(&spec(&speaker, MessageKind::AdditionalDebate), String::new)
            .await;
        assert_eq!(utterance.text, "Trust me.");
        assert!(!utterance.streamed);
        assert!(recorder.events().is_empty());
    }
}

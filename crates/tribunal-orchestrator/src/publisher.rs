//! Event publication toward observers
//!
//! Events are best-effort: publishing never blocks the round, and a
//! subscriber that falls behind loses events without affecting the others.

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};
use tribunal_core::{GameId, MessageKind, Participant, ParticipantId, Phase, RoundId, VotePhase};
use uuid::Uuid;

use crate::voting::VotingTable;

/// Default per-game channel capacity
pub const CHANNEL_CAPACITY: usize = 256;

/// A participant as shown to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRef {
    pub id: ParticipantId,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub background: String,
}

impl From<&Participant> for ParticipantRef {
    fn from(p: &Participant) -> Self {
        Self {
            id: p.id,
            name: p.display_name.clone(),
            background: p.background.clone(),
        }
    }
}

/// Everything a round tells its observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GameEvent {
    RoundStart {
        round_id: RoundId,
        round_number: u32,
        topic: String,
        is_resume: bool,
        participants: Vec<ParticipantRef>,
    },
    SystemMessage {
        round_id: RoundId,
        content: String,
    },
    PhaseStarted {
        round_id: RoundId,
        phase: Phase,
    },
    MessageStart {
        round_id: RoundId,
        message_key: Uuid,
        speaker: ParticipantRef,
        kind: MessageKind,
    },
    /// One streamed fragment; `delta` is the new text only
    MessageChunk {
        round_id: RoundId,
        message_key: Uuid,
        delta: String,
    },
    MessageComplete {
        round_id: RoundId,
        message_key: Uuid,
        participant: ParticipantId,
        content: String,
    },
    MessageError {
        round_id: RoundId,
        message_key: Uuid,
        participant: ParticipantId,
        kind: String,
        error: String,
    },
    /// A speech that was not streamed (non-streaming mode or fallback)
    Speech {
        round_id: RoundId,
        speaker: ParticipantRef,
        kind: MessageKind,
        content: String,
        is_fallback: bool,
    },
    VotingTable {
        round_id: RoundId,
        table: VotingTable,
    },
    VotingResult {
        round_id: RoundId,
        phase: VotePhase,
        candidates: Vec<ParticipantRef>,
        is_tie: bool,
    },
    RoundEnded {
        round_id: RoundId,
        round_number: u32,
        eliminated: Option<ParticipantRef>,
        survivors: Vec<ParticipantRef>,
    },
    GameEnded {
        eliminated: Option<ParticipantRef>,
        winners: Vec<ParticipantRef>,
        rounds_played: u32,
        message: String,
    },
    SystemError {
        round_id: Option<RoundId>,
        error: String,
    },
}

impl GameEvent {
    /// Stable wire name of the event
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RoundStart { .. } => "round_start",
            Self::SystemMessage { .. } => "system_message",
            Self::PhaseStarted { .. } => "phase_started",
            Self::MessageStart { .. } => "message_start",
            Self::MessageChunk { .. } => "message_chunk",
            Self::MessageComplete { .. } => "message_complete",
            Self::MessageError { .. } => "message_error",
            Self::Speech { .. } => "speech",
            Self::VotingTable { .. } => "voting_table",
            Self::VotingResult { .. } => "voting_result",
            Self::RoundEnded { .. } => "round_ended",
            Self::GameEnded { .. } => "game_ended",
            Self::SystemError { .. } => "system_error",
        }
    }
}

/// Delivers events for a game to whoever listens
pub trait EventPublisher: Send + Sync {
    /// Must not block; undeliverable events are dropped
    fn publish(&self, game: GameId, event: GameEvent);
}

/// One broadcast channel per game
///
/// Channels are opened explicitly or on first subscription and closed when
/// the game ends. Events for a game nobody listens to are dropped.
pub struct BroadcastPublisher {
    channels: RwLock<HashMap<GameId, broadcast::Sender<GameEvent>>>,
    capacity: usize,
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(CHANNEL_CAPACITY)
    }
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Make sure a channel exists for the game
    pub fn open(&self, game: GameId) -> broadcast::Sender<GameEvent> {
        if let Some(sender) = self.sender(game) {
            return sender;
        }
        let mut channels = match self.channels.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .entry(game)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn subscribe(&self, game: GameId) -> broadcast::Receiver<GameEvent> {
        self.open(game).subscribe()
    }

    /// Subscription as a stream; lag is logged and skipped
    pub fn subscribe_stream(&self, game: GameId) -> impl Stream<Item = GameEvent> + Send + 'static {
        BroadcastStream::new(self.subscribe(game)).filter_map(move |item| async move {
            match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    warn!(game_id = %game, missed, "Subscriber lagged, events dropped");
                    None
                }
            }
        })
    }

    /// Drop the game's channel; open subscriptions end once drained
    pub fn close(&self, game: GameId) {
        let mut channels = match self.channels.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels.remove(&game);
    }

    pub fn subscriber_count(&self, game: GameId) -> usize {
        self.sender(game).map(|s| s.receiver_count()).unwrap_or(0)
    }

    fn sender(&self, game: GameId) -> Option<broadcast::Sender<GameEvent>> {
        let channels = match self.channels.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels.get(&game).cloned()
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, game: GameId, event: GameEvent) {
        let event_type = event.event_type();
        let Some(sender) = self.sender(game) else {
            debug!(game_id = %game, event_type, "No channel, event dropped");
            return;
        };
        match sender.send(event) {
            Ok(receivers) => debug!(game_id = %game, event_type, receivers, "Event published"),
            Err(_) => debug!(game_id = %game, event_type, "Event published (no receivers)"),
        }
    }
}

/// Keeps every event in memory, for tests
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<(GameId, GameEvent)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(GameId, GameEvent)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn events_for(&self, game: GameId) -> Vec<GameEvent> {
        self.events()
            .into_iter()
            .filter(|(g, _)| *g == game)
            .map(|(_, e)| e)
            .collect()
    }

    /// Wire names in publication order
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events().iter().map(|(_, e)| e.event_type()).collect()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, game: GameId, event: GameEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push((game, event));
        }
    }
}

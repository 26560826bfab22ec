//! Helpers shared by the phase handlers

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{Arc, Mutex};
use tribunal_core::{Message, MessageKind, Participant, Phase, Result, Round, RoundId};
use tribunal_store::{PersistenceGateway, SequenceSlot};

use crate::publisher::{EventPublisher, GameEvent, ParticipantRef};
use crate::streamer::Utterance;

/// Result of a phase handler that may find its round gone
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress<T> {
    Done(T),
    /// The round vanished, moved past this phase, or its game stopped
    Abandoned,
}

/// Random source shared by the components of one engine
///
/// Seeded from `voting.seed` when set so test runs are reproducible.
#[derive(Clone)]
pub struct SharedRng(Arc<Mutex<StdRng>>);

impl SharedRng {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self(Arc::new(Mutex::new(rng)))
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut guard = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

/// Reload a round and check it is still ours to drive
///
/// `None` means the handler should quietly give up.
pub async fn current_round(
    store: &dyn PersistenceGateway,
    round_id: RoundId,
    expected: Phase,
) -> Result<Option<Round>> {
    let Some(round) = store.round(round_id).await? else {
        tracing::debug!(round_id = %round_id, "Round no longer exists");
        return Ok(None);
    };
    if round.phase != expected {
        tracing::debug!(round_id = %round_id, phase = %round.phase, expected = %expected, "Round moved on");
        return Ok(None);
    }
    let running = store
        .game(round.game_id)
        .await?
        .map(|g| g.is_running())
        .unwrap_or(false);
    if !running {
        tracing::debug!(round_id = %round_id, game_id = %round.game_id, "Game is not running");
        return Ok(None);
    }
    Ok(Some(round))
}

/// Persist a speech with the next sequence number, then publish it unless
/// observers already saw it streamed
pub async fn record_speech(
    store: &dyn PersistenceGateway,
    publisher: &dyn EventPublisher,
    round: &Round,
    speaker: &Participant,
    kind: MessageKind,
    utterance: Utterance,
) -> Result<Message> {
    let message = Message::speech(round.id, speaker.id, kind, utterance.text)
        .with_fallback(utterance.is_fallback);
    let stored = store.append_message(message, SequenceSlot::Next).await?;
    if !utterance.streamed {
        publisher.publish(
            round.game_id,
            GameEvent::Speech {
                round_id: round.id,
                speaker: ParticipantRef::from(speaker),
                kind,
                content: stored.content.clone(),
                is_fallback: stored.is_fallback,
            },
        );
    }
    Ok(stored)
}

/// Persist and publish a system line
pub async fn announce(
    store: &dyn PersistenceGateway,
    publisher: &dyn EventPublisher,
    round: &Round,
    content: String,
    slot: SequenceSlot,
) -> Result<Message> {
    let stored = store.append_message(Message::system(round.id, content), slot).await?;
    publisher.publish(
        round.game_id,
        GameEvent::SystemMessage {
            round_id: round.id,
            content: stored.content.clone(),
        },
    );
    Ok(stored)
}

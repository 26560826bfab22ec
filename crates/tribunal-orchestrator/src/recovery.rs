//! Resume rounds left mid-phase by a previous process
//!
//! Nothing in memory survives a restart, so every resumption point is
//! rebuilt from the round's phase, its messages and its votes.

use std::sync::Arc;
use tracing::{info, warn};
use tribunal_core::{GameId, MessageKind, ParticipantId, Phase, Result, Round, RoundId, VotePhase};
use tribunal_store::{PersistenceGateway, SequenceSlot};

use crate::context::announce;
use crate::publisher::{EventPublisher, GameEvent, ParticipantRef};
use crate::round::Entry;
use crate::voting::Tally;

/// What a running game needs next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeTarget {
    /// Re-enter an unfinished round
    Round {
        round_id: RoundId,
        entry: Entry,
        /// Phase to rewind to first, when the tally an entry needs is missing
        rewind_to: Option<Phase>,
    },
    /// The latest round finished; the game continues with a new one
    NextRound,
    /// The game is running but never got a round
    FirstRound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    pub game_id: GameId,
    pub target: ResumeTarget,
}

/// Votes are searched from the most recent kind of pass backwards
const TALLY_SEARCH: [VotePhase; 3] = [
    VotePhase::AdditionalVoting,
    VotePhase::FinalVoting,
    VotePhase::InitialVoting,
];

pub struct RecoveryReconciler {
    store: Arc<dyn PersistenceGateway>,
    publisher: Arc<dyn EventPublisher>,
}

impl RecoveryReconciler {
    pub fn new(store: Arc<dyn PersistenceGateway>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { store, publisher }
    }

    /// One plan per running game
    pub async fn plan(&self) -> Result<Vec<ResumePlan>> {
        let mut plans = Vec::new();
        for game in self.store.running_games().await? {
            let target = match self.store.latest_round(game.id).await? {
                None => ResumeTarget::FirstRound,
                Some(round) if round.is_finished() => ResumeTarget::NextRound,
                Some(round) => {
                    let (entry, rewind_to) = self.entry_for(&round).await?;
                    ResumeTarget::Round {
                        round_id: round.id,
                        entry,
                        rewind_to,
                    }
                }
            };
            info!(game_id = %game.id, target = ?target, "Recovery plan");
            plans.push(ResumePlan {
                game_id: game.id,
                target,
            });
        }
        Ok(plans)
    }

    /// Rebuild where an unfinished round should continue
    pub async fn entry_for(&self, round: &Round) -> Result<(Entry, Option<Phase>)> {
        let resume = match round.phase {
            Phase::Preparing => (Entry::Begin, None),
            Phase::Chatting => (Entry::Debate, None),
            Phase::InitialVoting | Phase::FinalVoting | Phase::AdditionalVoting => {
                match round.phase.vote_phase() {
                    Some(phase) => (Entry::Voting(phase), None),
                    None => (Entry::Begin, None),
                }
            }
            Phase::FinalDefense => match self.latest_candidates(round.id).await? {
                Some(candidates) => {
                    let done = self.speakers_since(round.id, MessageKind::FinalDefense, false).await?;
                    (Entry::Defense { candidates, done }, None)
                }
                None => {
                    warn!(round_id = %round.id, "No tally to rebuild defense candidates, re-running initial voting");
                    (
                        Entry::Voting(VotePhase::InitialVoting),
                        Some(Phase::InitialVoting),
                    )
                }
            },
            Phase::AdditionalDebate => match self.latest_candidates(round.id).await? {
                Some(candidates) => {
                    let done = self
                        .speakers_since(round.id, MessageKind::AdditionalDebate, true)
                        .await?;
                    (Entry::AdditionalDebate { candidates, done }, None)
                }
                None => {
                    warn!(round_id = %round.id, "No tally to rebuild tied candidates, re-running final voting");
                    (Entry::Voting(VotePhase::FinalVoting), Some(Phase::FinalVoting))
                }
            },
            // Finished rounds are never resumed
            Phase::Finished => (Entry::Begin, None),
        };
        Ok(resume)
    }

    /// Rewind if needed, store the retro notice and tell observers
    pub async fn prepare(&self, round_id: RoundId, rewind_to: Option<Phase>) -> Result<Option<Round>> {
        let Some(mut round) = self.store.round(round_id).await? else {
            return Ok(None);
        };
        if let Some(phase) = rewind_to {
            // Rewinds land at or before final voting, so no tie-break pass has run yet
            round.phase = phase;
            round.tie_break_passes = 0;
            round = self.store.update_round(&round).await?;
        }

        announce(
            self.store.as_ref(),
            self.publisher.as_ref(),
            &round,
            format!(
                "Round {} resumed after a restart during {}.",
                round.round_number,
                round.phase.label().to_lowercase()
            ),
            SequenceSlot::Fixed(-1),
        )
        .await?;

        let active = self.store.active_participants(round.game_id).await?;
        self.publisher.publish(
            round.game_id,
            GameEvent::RoundStart {
                round_id: round.id,
                round_number: round.round_number,
                topic: round.topic.clone(),
                is_resume: true,
                participants: active.iter().map(ParticipantRef::from).collect(),
            },
        );
        Ok(Some(round))
    }

    /// Candidate set of the most recent pass that has votes
    async fn latest_candidates(&self, round_id: RoundId) -> Result<Option<Vec<ParticipantId>>> {
        for phase in TALLY_SEARCH {
            let votes = self.store.votes(round_id, phase).await?;
            if votes.is_empty() {
                continue;
            }
            let candidates = Tally::from_votes(phase, votes).candidates();
            info!(round_id = %round_id, phase = %phase, candidates = ?candidates, "Rebuilt candidates");
            return Ok(Some(candidates));
        }
        Ok(None)
    }

    /// Speakers of `kind`, optionally only after the latest voting table
    async fn speakers_since(&self, round_id: RoundId, kind: MessageKind, after_last_table: bool) -> Result<Vec<ParticipantId>> {
        let messages = self.store.messages(round_id).await?;
        let start = if after_last_table {
            messages
                .iter()
                .rposition(|m| m.kind == MessageKind::VotingTable)
                .map_or(0, |i| i + 1)
        } else {
            0
        };
        Ok(messages[start..]
            .iter()
            .filter(|m| m.kind == kind)
            .filter_map(|m| m.participant_id)
            .collect())
    }
}

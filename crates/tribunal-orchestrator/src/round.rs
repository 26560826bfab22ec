//! Drives one round through its phases
//!
//! The runner executes the actions returned by [`transition`]. Each phase
//! entry reloads the round, so a round that vanished, moved on, or whose
//! game stopped is abandoned quietly. Storage failures propagate and stall
//! the round.

use chrono::Utc;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use tribunal_core::{
    GameId, Message, MessageKind, Participant, ParticipantId, Phase, Result, Round, RoundId,
    TribunalConfig, TribunalError, VotePhase,
};
use tribunal_provider::GenerationProvider;
use tribunal_store::{PersistenceGateway, SequenceSlot};

use crate::context::{announce, current_round, record_speech, Progress, SharedRng};
use crate::debate::{DebatePlan, DebateScheduler};
use crate::fallback;
use crate::prompt::{
    build_additional_debate_prompt, build_defense_prompt, build_game_context, format_history,
};
use crate::publisher::{EventPublisher, GameEvent, ParticipantRef};
use crate::state_machine::{transition, Action, RoundEvent, RoundState, TieBreakLimit};
use crate::streamer::{GenerationStreamer, SpeechSpec, StreamerSettings};
use crate::voting::{RandomPolicy, TargetPolicy, VotingEngine, VotingTable};

/// Where to enter a round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// Assign a topic if needed and open the debate
    Begin,
    /// Continue the debate from the stored speech count
    Debate,
    Voting(VotePhase),
    Defense {
        candidates: Vec<ParticipantId>,
        /// Candidates whose defense is already stored
        done: Vec<ParticipantId>,
    },
    AdditionalDebate {
        candidates: Vec<ParticipantId>,
        done: Vec<ParticipantId>,
    },
}

/// How a round ended
#[derive(Debug, Clone)]
pub enum RoundOutcome {
    Eliminated { round: Round, eliminated: Participant },
    /// Fewer than two participants were left; nobody was eliminated
    GameOver { round: Round },
    /// Another driver or an operator took the round away
    Abandoned,
}

pub struct RoundRunner {
    store: Arc<dyn PersistenceGateway>,
    publisher: Arc<dyn EventPublisher>,
    streamer: Arc<GenerationStreamer>,
    debate: DebateScheduler,
    voting: VotingEngine,
    config: Arc<TribunalConfig>,
    rng: SharedRng,
}

impl RoundRunner {
    pub fn new(
        store: Arc<dyn PersistenceGateway>,
        publisher: Arc<dyn EventPublisher>,
        provider: Arc<dyn GenerationProvider>,
        config: Arc<TribunalConfig>,
    ) -> Self {
        let rng = SharedRng::new(config.voting.seed);
        let streamer = Arc::new(GenerationStreamer::new(
            provider,
            Arc::clone(&publisher),
            StreamerSettings::from_config(&config),
        ));
        let debate = DebateScheduler::new(
            Arc::clone(&store),
            Arc::clone(&publisher),
            Arc::clone(&streamer),
            config.debate.clone(),
            rng.clone(),
        );
        let voting = VotingEngine::new(Arc::clone(&store), Arc::new(RandomPolicy::new(rng.clone())));
        Self {
            store,
            publisher,
            streamer,
            debate,
            voting,
            config,
            rng,
        }
    }

    /// Replace the random target policy
    pub fn with_policy(mut self, policy: Arc<dyn TargetPolicy>) -> Self {
        self.voting = VotingEngine::new(Arc::clone(&self.store), policy);
        self
    }

    /// Create the game's next round with a random topic
    pub async fn start_round(&self, game_id: GameId) -> Result<Round> {
        let number = self
            .store
            .latest_round(game_id)
            .await?
            .map_or(1, |r| r.round_number + 1);
        let round = self
            .store
            .create_round(Round::new(game_id, number, self.pick_topic()))
            .await?;
        info!(game_id = %game_id, round_id = %round.id, round_number = number, topic = %round.topic, "Round created");
        Ok(round)
    }

    /// Create and run a fresh round
    pub async fn play_round(&self, game_id: GameId) -> Result<RoundOutcome> {
        let round = self.start_round(game_id).await?;
        self.run(round.id, Entry::Begin, false).await
    }

    /// Drive a round from `entry` until it finishes or is abandoned
    ///
    /// The round's persisted phase must be the one `entry` belongs to.
    #[instrument(skip(self, entry), fields(entry = ?entry))]
    pub async fn run(&self, round_id: RoundId, entry: Entry, is_resume: bool) -> Result<RoundOutcome> {
        let Some(round) = self.store.round(round_id).await? else {
            return Ok(RoundOutcome::Abandoned);
        };
        let limit = TieBreakLimit::new(self.config.voting.max_tie_breaks);
        let mut state = RoundState::new(round.phase, round.tie_break_passes);
        let mut step = entry;

        loop {
            self.pause_before(&step).await;
            let Some(mut round) = current_round(self.store.as_ref(), round_id, state.phase).await? else {
                return Ok(RoundOutcome::Abandoned);
            };
            let active = self.store.active_participants(round.game_id).await?;

            let event = if active.len() < 2 {
                RoundEvent::InsufficientParticipants { active: active.len() }
            } else {
                match step {
                    Entry::Begin => {
                        round = self.begin(round, &active, is_resume).await?;
                        RoundEvent::Begin
                    }
                    Entry::Debate => match self.run_debate(&round, &active).await? {
                        Progress::Done(speeches) => RoundEvent::DebateFinished { speeches },
                        Progress::Abandoned => return Ok(RoundOutcome::Abandoned),
                    },
                    Entry::Voting(phase) => RoundEvent::Tallied {
                        phase,
                        candidates: self.run_voting(&round, phase, &active).await?,
                    },
                    Entry::Defense { candidates, done } => {
                        match self.run_speeches(&round, &active, MessageKind::FinalDefense, &candidates, &done).await? {
                            Progress::Done(()) => RoundEvent::DefenseFinished,
                            Progress::Abandoned => return Ok(RoundOutcome::Abandoned),
                        }
                    }
                    Entry::AdditionalDebate { candidates, done } => {
                        match self.run_speeches(&round, &active, MessageKind::AdditionalDebate, &candidates, &done).await? {
                            Progress::Done(()) => RoundEvent::AdditionalDebateFinished,
                            Progress::Abandoned => return Ok(RoundOutcome::Abandoned),
                        }
                    }
                }
            };

            let (next, actions) = transition(state, event, limit)?;
            state = next;
            let mut next_step = None;
            for action in actions {
                match action {
                    Action::LogActivity { message } => info!(round_id = %round.id, "{}", message),
                    Action::PersistPhase(phase) => {
                        round = self.persist_phase(round, phase, state.tie_break_passes, &active).await?;
                    }
                    Action::AnnouncePhase(phase) => self.announce_phase(&round, phase).await?,
                    Action::RunDebate => next_step = Some(Entry::Debate),
                    Action::RunVoting(phase) => next_step = Some(Entry::Voting(phase)),
                    Action::RunDefense { candidates } => {
                        next_step = Some(Entry::Defense {
                            candidates,
                            done: Vec::new(),
                        })
                    }
                    Action::RunAdditionalDebate { candidates } => {
                        next_step = Some(Entry::AdditionalDebate {
                            candidates,
                            done: Vec::new(),
                        })
                    }
                    Action::Eliminate(loser) => return self.eliminate(&round, loser).await,
                    Action::EndGame => return self.end_without_elimination(&round).await,
                }
            }

            step = next_step.ok_or_else(|| {
                TribunalError::InvalidTransition(format!("no work scheduled after entering {}", state.phase))
            })?;
        }
    }

    async fn pause_before(&self, step: &Entry) {
        let pause = match step {
            Entry::Defense { .. } | Entry::Voting(VotePhase::AdditionalVoting) => self.config.pacing.phase_pause(),
            Entry::AdditionalDebate { .. } => self.config.pacing.speech_pause(),
            _ => Duration::ZERO,
        };
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }

    async fn begin(&self, mut round: Round, active: &[Participant], is_resume: bool) -> Result<Round> {
        if round.topic.trim().is_empty() {
            round.topic = self.pick_topic();
            round = self.store.update_round(&round).await?;
            info!(round_id = %round.id, topic = %round.topic, "Topic assigned");
        }
        if !is_resume {
            self.publisher.publish(
                round.game_id,
                GameEvent::RoundStart {
                    round_id: round.id,
                    round_number: round.round_number,
                    topic: round.topic.clone(),
                    is_resume: false,
                    participants: active.iter().map(ParticipantRef::from).collect(),
                },
            );
        }
        Ok(round)
    }

    async fn persist_phase(
        &self,
        mut round: Round,
        phase: Phase,
        tie_break_passes: u32,
        active: &[Participant],
    ) -> Result<Round> {
        round.phase = phase;
        round.tie_break_passes = tie_break_passes;
        if phase == Phase::Chatting {
            let mut order: Vec<ParticipantId> = active.iter().map(|p| p.id).collect();
            self.rng.with(|rng| order.shuffle(rng));
            round.speaking_order = order;
            round.chat_started_at = Some(Utc::now());
        }
        let round = self.store.update_round(&round).await?;
        info!(round_id = %round.id, phase = %phase, tie_break_passes, "Phase persisted");
        Ok(round)
    }

    async fn announce_phase(&self, round: &Round, phase: Phase) -> Result<()> {
        let content = match phase {
            Phase::Chatting => format!("Round {} begins. Topic: {}", round.round_number, round.topic),
            Phase::InitialVoting => "The debate is over. Everyone now votes for the most suspicious person.".to_string(),
            Phase::AdditionalDebate => format!("The vote is tied. Tie-break pass {} begins.", round.tie_break_passes),
            other => format!("{} begins.", other.label()),
        };
        announce(self.store.as_ref(), self.publisher.as_ref(), round, content, SequenceSlot::Next).await?;
        self.publisher.publish(
            round.game_id,
            GameEvent::PhaseStarted {
                round_id: round.id,
                phase,
            },
        );
        Ok(())
    }

    async fn run_debate(&self, round: &Round, active: &[Participant]) -> Result<Progress<usize>> {
        let settings = self
            .store
            .game(round.game_id)
            .await?
            .map(|g| g.settings)
            .unwrap_or_default();
        let budget = self.config.round_time(&settings);

        let mut order: Vec<Participant> = round
            .speaking_order
            .iter()
            .filter_map(|id| active.iter().find(|p| p.id == *id).cloned())
            .collect();
        if order.is_empty() {
            order = active.to_vec();
        }
        let elapsed = round
            .chat_started_at
            .and_then(|t| (Utc::now() - t).to_std().ok())
            .unwrap_or(Duration::ZERO);
        let already_spoken = self.store.count_messages(round.id, MessageKind::Chat).await?;

        self.debate
            .run(DebatePlan {
                round,
                order,
                roster: active.to_vec(),
                budget,
                elapsed,
                already_spoken,
            })
            .await
    }

    async fn run_voting(&self, round: &Round, phase: VotePhase, active: &[Participant]) -> Result<Vec<ParticipantId>> {
        let tally = self.voting.run_pass(round.id, phase, active).await?;
        let pass = match phase {
            VotePhase::AdditionalVoting => round.tie_break_passes.max(1),
            _ => 1,
        };
        let table = VotingTable::build(&tally, pass, active);
        let content = serde_json::to_string(&table)?;
        self.store
            .append_message(
                Message::voting_table(round.id, table.title.clone(), content),
                SequenceSlot::Next,
            )
            .await?;

        let candidates = tally.candidates();
        let refs = candidates
            .iter()
            .filter_map(|id| active.iter().find(|p| p.id == *id))
            .map(ParticipantRef::from)
            .collect();
        self.publisher.publish(
            round.game_id,
            GameEvent::VotingTable {
                round_id: round.id,
                table,
            },
        );
        self.publisher.publish(
            round.game_id,
            GameEvent::VotingResult {
                round_id: round.id,
                phase,
                candidates: refs,
                is_tie: tally.is_tie(),
            },
        );
        Ok(candidates)
    }

    /// Defense or tie-break speeches, one per candidate not yet heard
    async fn run_speeches(
        &self,
        round: &Round,
        active: &[Participant],
        kind: MessageKind,
        candidates: &[ParticipantId],
        done: &[ParticipantId],
    ) -> Result<Progress<()>> {
        let expected = match kind {
            MessageKind::FinalDefense => Phase::FinalDefense,
            _ => Phase::AdditionalDebate,
        };
        let settings = self
            .store
            .game(round.game_id)
            .await?
            .map(|g| g.settings)
            .unwrap_or_default();
        let context = build_game_context(active, &round.topic, self.config.round_time(&settings));
        let recent = self
            .store
            .recent_messages(round.id, MessageKind::Chat, self.config.debate.context_messages)
            .await?;
        let history = format_history(&recent, active);

        let mut spoke = false;
        for id in candidates.iter().filter(|id| !done.contains(id)) {
            let Some(speaker) = active.iter().find(|p| p.id == *id) else {
                warn!(round_id = %round.id, participant = %id, "Candidate is no longer active, skipping");
                continue;
            };
            if spoke && !self.config.pacing.speech_pause().is_zero() {
                tokio::time::sleep(self.config.pacing.speech_pause()).await;
            }
            if current_round(self.store.as_ref(), round.id, expected).await?.is_none() {
                return Ok(Progress::Abandoned);
            }

            let prompt = match kind {
                MessageKind::FinalDefense => build_defense_prompt(&context, speaker, &history),
                _ => {
                    let rivals: Vec<&Participant> = candidates
                        .iter()
                        .filter(|c| **c != speaker.id)
                        .filter_map(|c| active.iter().find(|p| p.id == *c))
                        .collect();
                    build_additional_debate_prompt(&context, speaker, &rivals)
                }
            };
            let spec = SpeechSpec {
                game_id: round.game_id,
                round_id: round.id,
                speaker,
                kind,
                prompt,
            };
            let utterance = self
                .streamer
                .speak(&spec, || self.rng.with(|rng| fallback::speech(kind, speaker, &round.topic, rng)))
                .await;
            record_speech(self.store.as_ref(), self.publisher.as_ref(), round, speaker, kind, utterance).await?;
            spoke = true;
        }
        Ok(Progress::Done(()))
    }

    async fn eliminate(&self, round: &Round, loser: ParticipantId) -> Result<RoundOutcome> {
        let name = self
            .store
            .participant(loser)
            .await?
            .map(|p| p.display_name)
            .unwrap_or_else(|| loser.to_string());
        announce(
            self.store.as_ref(),
            self.publisher.as_ref(),
            round,
            format!("The tribunal has decided: {} is judged to be the AI spy and is eliminated.", name),
            SequenceSlot::Next,
        )
        .await?;

        let finished = self.store.complete_round(round.id, Some(loser)).await?;
        let eliminated = self
            .store
            .participant(loser)
            .await?
            .ok_or_else(|| TribunalError::NotFound(format!("participant {}", loser)))?;
        let survivors = self.store.active_participants(round.game_id).await?;
        info!(
            round_id = %round.id,
            eliminated = %loser,
            survivors = survivors.len(),
            "Round finished"
        );
        self.publisher.publish(
            round.game_id,
            GameEvent::RoundEnded {
                round_id: round.id,
                round_number: round.round_number,
                eliminated: Some(ParticipantRef::from(&eliminated)),
                survivors: survivors.iter().map(ParticipantRef::from).collect(),
            },
        );
        Ok(RoundOutcome::Eliminated {
            round: finished,
            eliminated,
        })
    }

    async fn end_without_elimination(&self, round: &Round) -> Result<RoundOutcome> {
        announce(
            self.store.as_ref(),
            self.publisher.as_ref(),
            round,
            "Not enough participants remain. The round ends without a verdict.".to_string(),
            SequenceSlot::Next,
        )
        .await?;
        let finished = self.store.complete_round(round.id, None).await?;
        let survivors = self.store.active_participants(round.game_id).await?;
        warn!(round_id = %round.id, survivors = survivors.len(), "Round ended without elimination");
        self.publisher.publish(
            round.game_id,
            GameEvent::RoundEnded {
                round_id: round.id,
                round_number: round.round_number,
                eliminated: None,
                survivors: survivors.iter().map(ParticipantRef::from).collect(),
            },
        );
        Ok(RoundOutcome::GameOver { round: finished })
    }

    fn pick_topic(&self) -> String {
        self.rng
            .with(|rng| self.config.game.topics.choose(rng).cloned())
            .unwrap_or_else(|| "Prove that you are human".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::RecordingPublisher;
    use crate::voting::ScriptedPolicy;
    use tribunal_core::config::PacingConfig;
    use tribunal_core::{Game, GameSettings, GameStatus};
    use tribunal_provider::ScriptedProvider;
    use tribunal_store::JsonStore;

    fn config() -> TribunalConfig {
        let mut config = TribunalConfig::default();
        config.debate.round_time_secs = 0;
        config.debate.thinking_delay_min_ms = 0;
        config.debate.thinking_delay_max_ms = 0;
        config.debate.chunk_delay_ms = 0;
        config.pacing = PacingConfig::immediate();
        config.voting.seed = Some(11);
        config
    }

    async fn game_with(store: &JsonStore, names: &[&str]) -> (Game, Vec<Participant>) {
        let game = store.create_game(Game::new(GameSettings::default())).await.unwrap();
        let game = store.set_game_status(game.id, GameStatus::Running).await.unwrap();
        let mut people = Vec::new();
        for name in names {
            people.push(store.add_participant(Participant::new(game.id, *name, "m")).await.unwrap());
        }
        (game, people)
    }

    fn runner(store: Arc<JsonStore>, recorder: Arc<RecordingPublisher>, policy: ScriptedPolicy) -> RoundRunner {
        RoundRunner::new(store, recorder, Arc::new(ScriptedProvider::new()), Arc::new(config()))
            .with_policy(Arc::new(policy))
    }

    fn p(n: u64) -> ParticipantId {
        ParticipantId(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_without_ties_eliminates_one() {
        let store = Arc::new(JsonStore::in_memory());
        let recorder = Arc::new(RecordingPublisher::new());
        let (game, _) = game_with(&store, &["A", "B", "C"]).await;
        let policy = ScriptedPolicy::new()
            .with_pass(VotePhase::InitialVoting, &[(p(1), p(2)), (p(2), p(1)), (p(3), p(1))])
            .with_pass(VotePhase::FinalVoting, &[(p(1), p(2)), (p(2), p(1)), (p(3), p(1))]);
        let runner = runner(store.clone(), recorder.clone(), policy);

        let outcome = runner.play_round(game.id).await.unwrap();
        let RoundOutcome::Eliminated { round, eliminated } = outcome else {
            panic!("expected an elimination");
        };
        assert_eq!(eliminated.id, p(1));
        assert_eq!(eliminated.elimination_round, Some(1));
        assert_eq!(round.phase, Phase::Finished);
        assert_eq!(round.eliminated_participant, Some(p(1)));

        let messages = store.messages(round.id).await.unwrap();
        let chats = messages.iter().filter(|m| m.kind == MessageKind::Chat).count();
        let defenses: Vec<_> = messages.iter().filter(|m| m.kind == MessageKind::FinalDefense).collect();
        assert_eq!(chats, 3);
        assert_eq!(defenses.len(), 1);
        assert_eq!(defenses[0].participant_id, Some(p(1)));
        assert!(!messages.iter().any(|m| m.kind == MessageKind::AdditionalDebate));

        let types = recorder.event_types();
        assert_eq!(types.first(), Some(&"round_start"));
        assert_eq!(types.last(), Some(&"round_ended"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_tie_runs_additional_debate_for_tied_only() {
        let store = Arc::new(JsonStore::in_memory());
        let recorder = Arc::new(RecordingPublisher::new());
        let (game, _) = game_with(&store, &["A", "B", "C", "D", "E"]).await;
        let policy = ScriptedPolicy::new()
            .with_pass(
                VotePhase::InitialVoting,
                &[(p(1), p(2)), (p(2), p(1)), (p(3), p(1)), (p(4), p(2)), (p(5), p(3))],
            )
            .with_pass(
                VotePhase::FinalVoting,
                &[(p(1), p(2)), (p(2), p(1)), (p(3), p(1)), (p(4), p(2)), (p(5), p(4))],
            )
            .with_pass(
                VotePhase::AdditionalVoting,
                &[(p(1), p(2)), (p(2), p(1)), (p(3), p(2)), (p(4), p(2)), (p(5), p(2))],
            );
        let runner = runner(store.clone(), recorder, policy);

        let RoundOutcome::Eliminated { round, eliminated } = runner.play_round(game.id).await.unwrap() else {
            panic!("expected an elimination");
        };
        assert_eq!(eliminated.id, p(2));
        assert_eq!(round.tie_break_passes, 1);

        let messages = store.messages(round.id).await.unwrap();
        let mut tie_speakers: Vec<_> = messages
            .iter()
            .filter(|m| m.kind == MessageKind::AdditionalDebate)
            .filter_map(|m| m.participant_id)
            .collect();
        tie_speakers.sort();
        assert_eq!(tie_speakers, vec![p(1), p(2)]);

        let tables = messages.iter().filter(|m| m.kind == MessageKind::VotingTable).count();
        assert_eq!(tables, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_participants_hit_tie_bound() {
        let store = Arc::new(JsonStore::in_memory());
        let recorder = Arc::new(RecordingPublisher::new());
        let (game, _) = game_with(&store, &["A", "B"]).await;
        let runner = runner(store.clone(), recorder, ScriptedPolicy::new());

        // Two voters always tie; the bound falls back to the lowest id
        let RoundOutcome::Eliminated { round, eliminated } = runner.play_round(game.id).await.unwrap() else {
            panic!("expected an elimination");
        };
        assert_eq!(eliminated.id, p(1));
        assert_eq!(round.tie_break_passes, TribunalConfig::default().voting.max_tie_breaks);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_participant_ends_game_without_elimination() {
        let store = Arc::new(JsonStore::in_memory());
        let recorder = Arc::new(RecordingPublisher::new());
        let (game, _) = game_with(&store, &["A"]).await;
        let runner = runner(store.clone(), recorder, ScriptedPolicy::new());

        let outcome = runner.play_round(game.id).await.unwrap();
        let RoundOutcome::GameOver { round } = outcome else {
            panic!("expected game over");
        };
        assert_eq!(round.phase, Phase::Finished);
        assert_eq!(round.eliminated_participant, None);
        assert!(store.participants(game.id).await.unwrap()[0].is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_game_abandons_round() {
        let store = Arc::new(JsonStore::in_memory());
        let recorder = Arc::new(RecordingPublisher::new());
        let (game, _) = game_with(&store, &["A", "B", "C"]).await;
        let runner = runner(store.clone(), recorder, ScriptedPolicy::new());
        let round = runner.start_round(game.id).await.unwrap();
        store.set_game_status(game.id, GameStatus::Finished).await.unwrap();

        let outcome = runner.run(round.id, Entry::Begin, false).await.unwrap();
        assert!(matches!(outcome, RoundOutcome::Abandoned));
        assert_eq!(store.round(round.id).await.unwrap().unwrap().phase, Phase::Preparing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failure_surfaces() {
        let store = Arc::new(JsonStore::in_memory());
        let recorder = Arc::new(RecordingPublisher::new());
        let (game, _) = game_with(&store, &["A", "B", "C"]).await;
        let runner = runner(store.clone(), recorder, ScriptedPolicy::new());
        let round = runner.start_round(game.id).await.unwrap();
        store.set_write_failure(true);

        let err = runner.run(round.id, Entry::Begin, false).await.unwrap_err();
        assert!(err.is_storage());
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_numbers_increase() {
        let store = Arc::new(JsonStore::in_memory());
        let recorder = Arc::new(RecordingPublisher::new());
        let (game, _) = game_with(&store, &["A", "B", "C"]).await;
        let runner = runner(store.clone(), recorder, ScriptedPolicy::new());

        runner.play_round(game.id).await.unwrap();
        let second = runner.start_round(game.id).await.unwrap();
        assert_eq!(second.round_number, 2);
        assert!(!second.topic.is_empty());
    }
}

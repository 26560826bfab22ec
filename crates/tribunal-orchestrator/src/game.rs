//! Game lifecycle: create, start, play rounds, finish, stop, resume

use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use tribunal_core::{
    Game, GameId, GameSettings, GameStatus, Participant, ParticipantId, Result, RoundId,
    TribunalConfig, TribunalError,
};
use tribunal_provider::GenerationProvider;
use tribunal_store::PersistenceGateway;

use crate::publisher::{EventPublisher, GameEvent, ParticipantRef};
use crate::recovery::{RecoveryReconciler, ResumeTarget};
use crate::round::{Entry, RoundOutcome, RoundRunner};
use crate::voting::TargetPolicy;

/// How a game run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameOutcome {
    Finished,
    /// Stopped or taken over mid-round
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct GameSummary {
    pub game_id: GameId,
    pub outcome: GameOutcome,
    pub rounds_played: u32,
    /// In elimination order
    pub eliminated: Vec<ParticipantId>,
    pub winners: Vec<Participant>,
}

pub struct GameRunner {
    store: Arc<dyn PersistenceGateway>,
    publisher: Arc<dyn EventPublisher>,
    rounds: RoundRunner,
    config: Arc<TribunalConfig>,
}

impl GameRunner {
    pub fn new(
        store: Arc<dyn PersistenceGateway>,
        publisher: Arc<dyn EventPublisher>,
        provider: Arc<dyn GenerationProvider>,
        config: Arc<TribunalConfig>,
    ) -> Self {
        let rounds = RoundRunner::new(
            Arc::clone(&store),
            Arc::clone(&publisher),
            provider,
            Arc::clone(&config),
        );
        Self {
            store,
            publisher,
            rounds,
            config,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn TargetPolicy>) -> Self {
        self.rounds = self.rounds.with_policy(policy);
        self
    }

    pub fn rounds(&self) -> &RoundRunner {
        &self.rounds
    }

    /// Store a new game and its roster; `game_id` of each seat is overwritten
    pub async fn create_game(&self, settings: GameSettings, roster: Vec<Participant>) -> Result<(Game, Vec<Participant>)> {
        let game = self.store.create_game(Game::new(settings)).await?;
        let mut seated = Vec::with_capacity(roster.len());
        for mut participant in roster {
            participant.game_id = game.id;
            seated.push(self.store.add_participant(participant).await?);
        }
        info!(game_id = %game.id, participants = seated.len(), "Game created");
        Ok((game, seated))
    }

    /// Mark the game running and play it to the end
    #[instrument(skip(self))]
    pub async fn start_game(&self, game_id: GameId) -> Result<GameSummary> {
        let game = self
            .store
            .game(game_id)
            .await?
            .ok_or_else(|| TribunalError::NotFound(format!("game {}", game_id)))?;
        if game.status != GameStatus::Preparing {
            return Err(TribunalError::InvalidTransition(format!(
                "{} is {}, only a preparing game can start",
                game_id, game.status
            )));
        }
        let active = self.store.active_participants(game_id).await?.len();
        if active < self.config.game.min_participants {
            return Err(TribunalError::InvalidTransition(format!(
                "{} has {} participants, at least {} are needed",
                game_id, active, self.config.game.min_participants
            )));
        }

        self.store.set_game_status(game_id, GameStatus::Running).await?;
        info!(game_id = %game_id, participants = active, "Game started");
        self.play(game_id, None).await
    }

    /// Flip a game to finished; an in-flight round abandons at its next phase boundary
    pub async fn stop_game(&self, game_id: GameId) -> Result<Game> {
        let current = self
            .store
            .game(game_id)
            .await?
            .ok_or_else(|| TribunalError::NotFound(format!("game {}", game_id)))?;
        if current.status == GameStatus::Finished {
            debug!(game_id = %game_id, "Game already finished, nothing to stop");
            return Ok(current);
        }
        let game = self.store.set_game_status(game_id, GameStatus::Finished).await?;
        warn!(game_id = %game_id, "Game stopped");
        self.publisher.publish(
            game_id,
            GameEvent::GameEnded {
                eliminated: None,
                winners: Vec::new(),
                rounds_played: self.rounds_played(game_id).await?,
                message: "The game was stopped by an operator.".to_string(),
            },
        );
        Ok(game)
    }

    /// Resume every running game concurrently
    pub async fn resume_all(&self) -> Result<Vec<Result<GameSummary>>> {
        let reconciler = RecoveryReconciler::new(Arc::clone(&self.store), Arc::clone(&self.publisher));
        let plans = reconciler.plan().await?;
        info!(games = plans.len(), "Resuming running games");

        let runs = plans.into_iter().map(|plan| {
            let reconciler = &reconciler;
            async move {
                let result = match plan.target {
                    ResumeTarget::Round {
                        round_id,
                        entry,
                        rewind_to,
                    } => match reconciler.prepare(round_id, rewind_to).await {
                        Ok(Some(_)) => self.play(plan.game_id, Some((round_id, entry))).await,
                        Ok(None) => self.play(plan.game_id, None).await,
                        Err(e) => Err(e),
                    },
                    ResumeTarget::NextRound | ResumeTarget::FirstRound => self.play(plan.game_id, None).await,
                };
                if let Err(e) = &result {
                    error!(game_id = %plan.game_id, "Resumed game failed: {}", e);
                    self.publisher.publish(
                        plan.game_id,
                        GameEvent::SystemError {
                            round_id: None,
                            error: e.to_string(),
                        },
                    );
                }
                result
            }
        });
        Ok(join_all(runs).await)
    }

    /// Run rounds until the game is decided, optionally re-entering one first
    async fn play(&self, game_id: GameId, mut resume: Option<(RoundId, Entry)>) -> Result<GameSummary> {
        let mut eliminated = Vec::new();
        loop {
            let outcome = match resume.take() {
                Some((round_id, entry)) => self.rounds.run(round_id, entry, true).await?,
                None => {
                    if !self.is_running(game_id).await? {
                        return self.abandoned(game_id, eliminated).await;
                    }
                    if self.is_decided(game_id).await? {
                        return self.finish(game_id, eliminated).await;
                    }
                    self.rounds.play_round(game_id).await?
                }
            };

            match outcome {
                RoundOutcome::Eliminated { eliminated: loser, .. } => {
                    eliminated.push(loser.id);
                    if self.is_decided(game_id).await? {
                        return self.finish(game_id, eliminated).await;
                    }
                }
                RoundOutcome::GameOver { .. } => return self.finish(game_id, eliminated).await,
                RoundOutcome::Abandoned => return self.abandoned(game_id, eliminated).await,
            }
        }
    }

    /// Fewer than two left, or the round cap reached
    async fn is_decided(&self, game_id: GameId) -> Result<bool> {
        if self.store.active_participants(game_id).await?.len() < 2 {
            return Ok(true);
        }
        let Some(max) = self.config.game.max_rounds else {
            return Ok(false);
        };
        Ok(self.rounds_played(game_id).await? >= max)
    }

    async fn is_running(&self, game_id: GameId) -> Result<bool> {
        Ok(self
            .store
            .game(game_id)
            .await?
            .map(|g| g.is_running())
            .unwrap_or(false))
    }

    async fn rounds_played(&self, game_id: GameId) -> Result<u32> {
        Ok(self
            .store
            .latest_round(game_id)
            .await?
            .map_or(0, |r| r.round_number))
    }

    async fn finish(&self, game_id: GameId, eliminated: Vec<ParticipantId>) -> Result<GameSummary> {
        let winners = self.store.mark_winners(game_id).await?;
        self.store.set_game_status(game_id, GameStatus::Finished).await?;
        let rounds_played = self.rounds_played(game_id).await?;

        let last = match eliminated.last() {
            Some(id) => self.store.participant(*id).await?,
            None => None,
        };
        let names = winners
            .iter()
            .map(|p| p.display_name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let message = match (&last, winners.len()) {
            (_, 0) => "The game is over. Nobody survived.".to_string(),
            (Some(loser), _) => format!(
                "The game is over. {} was executed as the AI spy. Survivors: {}.",
                loser.display_name, names
            ),
            (None, _) => format!("The game is over without a verdict. Survivors: {}.", names),
        };
        info!(game_id = %game_id, rounds_played, winners = winners.len(), "Game finished");
        self.publisher.publish(
            game_id,
            GameEvent::GameEnded {
                eliminated: last.as_ref().map(ParticipantRef::from),
                winners: winners.iter().map(ParticipantRef::from).collect(),
                rounds_played,
                message,
            },
        );
        Ok(GameSummary {
            game_id,
            outcome: GameOutcome::Finished,
            rounds_played,
            eliminated,
            winners,
        })
    }

    async fn abandoned(&self, game_id: GameId, eliminated: Vec<ParticipantId>) -> Result<GameSummary> {
        info!(game_id = %game_id, "Game run abandoned");
        Ok(GameSummary {
            game_id,
            outcome: GameOutcome::Abandoned,
            rounds_played: self.rounds_played(game_id).await?,
            eliminated,
            winners: Vec::new(),
        })
    }
}

//! Persistence gateway trait

use async_trait::async_trait;
use tribunal_core::{
    Game, GameId, GameStatus, Message, MessageKind, Participant, ParticipantId, Result, Round,
    RoundId, Vote, VotePhase,
};

/// How `append_message` numbers a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceSlot {
    /// Current non-negative maximum plus one (0 for the first), read under the insert's lock
    Next,
    /// An explicit number, e.g. `-1` for retro system messages
    Fixed(i64),
    /// No number; sorts after everything else
    Unnumbered,
}

/// Durable storage for games, participants, rounds, messages and votes
///
/// Messages and votes are append-only, except that the votes of one
/// (round, phase) pass may be deleted before the pass is re-run. A round
/// can no longer be updated once its phase is `finished`.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    // Games
    async fn create_game(&self, game: Game) -> Result<Game>;
    async fn game(&self, id: GameId) -> Result<Option<Game>>;
    async fn games(&self) -> Result<Vec<Game>>;
    async fn set_game_status(&self, id: GameId, status: GameStatus) -> Result<Game>;
    async fn running_games(&self) -> Result<Vec<Game>>;

    // Participants
    async fn add_participant(&self, participant: Participant) -> Result<Participant>;
    async fn participants(&self, game: GameId) -> Result<Vec<Participant>>;
    async fn participant(&self, id: ParticipantId) -> Result<Option<Participant>>;

    /// Participants still in play, ordered by id
    async fn active_participants(&self, game: GameId) -> Result<Vec<Participant>> {
        Ok(self
            .participants(game)
            .await?
            .into_iter()
            .filter(Participant::is_active)
            .collect())
    }

    /// Flip every remaining active participant of a game to winner
    async fn mark_winners(&self, game: GameId) -> Result<Vec<Participant>>;

    // Rounds
    async fn create_round(&self, round: Round) -> Result<Round>;
    async fn round(&self, id: RoundId) -> Result<Option<Round>>;
    async fn rounds(&self, game: GameId) -> Result<Vec<Round>>;
    async fn latest_round(&self, game: GameId) -> Result<Option<Round>>;
    async fn update_round(&self, round: &Round) -> Result<Round>;

    /// Finish a round and eliminate its loser in one commit
    async fn complete_round(&self, id: RoundId, eliminated: Option<ParticipantId>) -> Result<Round>;


    // Messages
    async fn append_message(&self, message: Message, slot: SequenceSlot) -> Result<Message>;
    async fn max_sequence(&self, round: RoundId) -> Result<Option<i64>>;

    /// All messages of a round in display order
    async fn messages(&self, round: RoundId) -> Result<Vec<Message>>;
    async fn count_messages(&self, round: RoundId, kind: MessageKind) -> Result<usize>;

    /// The last `limit` messages of a kind, oldest first
    async fn recent_messages(&self, round: RoundId, kind: MessageKind, limit: usize) -> Result<Vec<Message>>;

    // Votes
    /// Discard a pass's votes; returns how many were removed
    async fn delete_votes(&self, round: RoundId, phase: VotePhase) -> Result<usize>;

    /// Commit a whole pass atomically; nothing is stored if any ballot is invalid
    async fn record_votes(&self, votes: Vec<Vote>) -> Result<Vec<Vote>>;
    async fn votes(&self, round: RoundId, phase: VotePhase) -> Result<Vec<Vote>>;
}

//! JSON snapshot store
//!
//! The whole state lives behind one async mutex. Each mutation runs against a
//! copy of the state; the copy is flushed to disk (temp file + rename) and only
//! then becomes the live state, so a failed write leaves nothing half-applied.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use tribunal_core::{
    Game, GameId, GameStatus, Message, MessageId, MessageKind, Participant, ParticipantId,
    ParticipantStatus, Phase, Result, Round, RoundId, TribunalError, Vote, VoteId, VotePhase,
};

use crate::gateway::{PersistenceGateway, SequenceSlot};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Counters {
    game: u64,
    participant: u64,
    round: u64,
    message: u64,
    vote: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    counters: Counters,
    #[serde(default)]
    games: Vec<Game>,
    #[serde(default)]
    participants: Vec<Participant>,
    #[serde(default)]
    rounds: Vec<Round>,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    votes: Vec<Vote>,
}

fn not_found(what: impl std::fmt::Display) -> TribunalError {
    TribunalError::NotFound(what.to_string())
}

impl Snapshot {
    fn game_mut(&mut self, id: GameId) -> Result<&mut Game> {
        self.games
            .iter_mut()
            .find(|g| g.id == id)
            .ok_or_else(|| not_found(id))
    }

    fn participant_mut(&mut self, id: ParticipantId) -> Result<&mut Participant> {
        self.participants
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| not_found(id))
    }

    fn round_ref(&self, id: RoundId) -> Result<&Round> {
        self.rounds.iter().find(|r| r.id == id).ok_or_else(|| not_found(id))
    }

    fn round_mut(&mut self, id: RoundId) -> Result<&mut Round> {
        self.rounds
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| not_found(id))
    }

    fn max_sequence(&self, round: RoundId) -> Option<i64> {
        self.messages
            .iter()
            .filter(|m| m.round_id == round)
            .filter_map(|m| m.sequence_number)
            .filter(|n| *n >= 0)
            .max()
    }

    fn sorted_messages(&self, round: RoundId) -> Vec<Message> {
        let mut out: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.round_id == round)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.display_cmp(b));
        out
    }
}

/// [`PersistenceGateway`] backed by an in-memory state and an optional
/// JSON snapshot file
pub struct JsonStore {
    state: Mutex<Snapshot>,
    path: Option<PathBuf>,
    fail_writes: AtomicBool,
}

impl JsonStore {
    /// A store that never touches the disk
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(Snapshot::default()),
            path: None,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Open (or create on first write) a snapshot file
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = if fs::try_exists(&path).await.map_err(|e| storage_error(&path, e))? {
            let content = fs::read_to_string(&path)
                .await
                .map_err(|e| storage_error(&path, e))?;
            serde_json::from_str(&content)?
        } else {
            Snapshot::default()
        };
        debug!(
            path = %path.display(),
            games = snapshot.games.len(),
            rounds = snapshot.rounds.len(),
            "Opened JSON store"
        );
        Ok(Self {
            state: Mutex::new(snapshot),
            path: Some(path),
            fail_writes: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Make every subsequent mutation fail with a storage error
    pub fn set_write_failure(&self, enabled: bool) {
        self.fail_writes.store(enabled, Ordering::SeqCst);
    }

    async fn read<T>(&self, f: impl FnOnce(&Snapshot) -> T) -> T {
        let state = self.state.lock().await;
        f(&state)
    }

    async fn mutate<T>(&self, f: impl FnOnce(&mut Snapshot) -> Result<T>) -> Result<T> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TribunalError::Storage("store is rejecting writes".to_string()));
        }
        let mut state = self.state.lock().await;
        let mut draft = state.clone();
        let out = f(&mut draft)?;
        self.flush(&draft).await?;
        *state = draft;
        Ok(out)
    }

    async fn flush(&self, snapshot: &Snapshot) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error(parent, e))?;
        }
        let content = serde_json::to_vec(snapshot)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .await
            .map_err(|e| storage_error(&tmp, e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| storage_error(path, e))?;
        Ok(())
    }
}

fn storage_error(path: &Path, err: std::io::Error) -> TribunalError {
    TribunalError::Storage(format!("{}: {}", path.display(), err))
}

#[async_trait]
impl PersistenceGateway for JsonStore {
    #[instrument(skip(self, game))]
    async fn create_game(&self, mut game: Game) -> Result<Game> {
        self.mutate(|s| {
            s.counters.game += 1;
            game.id = GameId(s.counters.game);
            s.games.push(game.clone());
            Ok(game)
        })
        .await
    }

    async fn game(&self, id: GameId) -> Result<Option<Game>> {
        Ok(self
            .read(|s| s.games.iter().find(|g| g.id == id).cloned())
            .await)
    }

    async fn games(&self) -> Result<Vec<Game>> {
        Ok(self.read(|s| s.games.clone()).await)
    }

    #[instrument(skip(self))]
    async fn set_game_status(&self, id: GameId, status: GameStatus) -> Result<Game> {
        self.mutate(|s| {
            let game = s.game_mut(id)?;
            game.status = status;
            if status == GameStatus::Finished && game.ended_at.is_none() {
                game.ended_at = Some(Utc::now());
            }
            Ok(game.clone())
        })
        .await
    }

    async fn running_games(&self) -> Result<Vec<Game>> {
        Ok(self
            .read(|s| s.games.iter().filter(|g| g.is_running()).cloned().collect())
            .await)
    }

    #[instrument(skip(self, participant), fields(game_id = %participant.game_id))]
    async fn add_participant(&self, mut participant: Participant) -> Result<Participant> {
        self.mutate(|s| {
            s.game_mut(participant.game_id)?;
            s.counters.participant += 1;
            participant.id = ParticipantId(s.counters.participant);
            s.participants.push(participant.clone());
            Ok(participant)
        })
        .await
    }

    async fn participants(&self, game: GameId) -> Result<Vec<Participant>> {
        Ok(self
            .read(|s| {
                s.participants
                    .iter()
                    .filter(|p| p.game_id == game)
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn participant(&self, id: ParticipantId) -> Result<Option<Participant>> {
        Ok(self
            .read(|s| s.participants.iter().find(|p| p.id == id).cloned())
            .await)
    }

    #[instrument(skip(self))]
    async fn mark_winners(&self, game: GameId) -> Result<Vec<Participant>> {
        self.mutate(|s| {
            let mut winners = Vec::new();
            for p in s.participants.iter_mut().filter(|p| p.game_id == game) {
                if p.is_active() {
                    p.status = ParticipantStatus::Winner;
                    winners.push(p.clone());
                }
            }
            Ok(winners)
        })
        .await
    }

    #[instrument(skip(self, round), fields(game_id = %round.game_id, round_number = round.round_number))]
    async fn create_round(&self, mut round: Round) -> Result<Round> {
        self.mutate(|s| {
            s.game_mut(round.game_id)?;
            let rounds = s.rounds.iter().filter(|r| r.game_id == round.game_id);
            let mut last_number = 0;
            for existing in rounds {
                if !existing.is_finished() {
                    return Err(TribunalError::InvalidTransition(format!(
                        "{} still has {} in flight",
                        round.game_id, existing.id
                    )));
                }
                last_number = last_number.max(existing.round_number);
            }
            if round.round_number <= last_number {
                return Err(TribunalError::InvalidTransition(format!(
                    "round number {} does not follow {}",
                    round.round_number, last_number
                )));
            }
            s.counters.round += 1;
            round.id = RoundId(s.counters.round);
            s.rounds.push(round.clone());
            Ok(round)
        })
        .await
    }

    async fn round(&self, id: RoundId) -> Result<Option<Round>> {
        Ok(self
            .read(|s| s.rounds.iter().find(|r| r.id == id).cloned())
            .await)
    }

    async fn rounds(&self, game: GameId) -> Result<Vec<Round>> {
        Ok(self
            .read(|s| {
                let mut rounds: Vec<Round> =
                    s.rounds.iter().filter(|r| r.game_id == game).cloned().collect();
                rounds.sort_by_key(|r| r.round_number);
                rounds
            })
            .await)
    }

    async fn latest_round(&self, game: GameId) -> Result<Option<Round>> {
        Ok(self
            .read(|s| {
                s.rounds
                    .iter()
                    .filter(|r| r.game_id == game)
                    .max_by_key(|r| r.round_number)
                    .cloned()
            })
            .await)
    }

    #[instrument(skip(self, round), fields(round_id = %round.id, phase = %round.phase))]
    async fn update_round(&self, round: &Round) -> Result<Round> {
        self.mutate(|s| {
            let stored = s.round_mut(round.id)?;
            if stored.is_finished() {
                return Err(TribunalError::InvalidTransition(format!(
                    "{} is finished and can no longer change",
                    round.id
                )));
            }
            *stored = round.clone();
            Ok(stored.clone())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn complete_round(&self, id: RoundId, eliminated: Option<ParticipantId>) -> Result<Round> {
        self.mutate(|s| {
            let round = s.round_ref(id)?.clone();
            if round.is_finished() {
                return Err(TribunalError::InvalidTransition(format!(
                    "{} is already finished",
                    id
                )));
            }
            if let Some(loser) = eliminated {
                let p = s.participant_mut(loser)?;
                if p.game_id != round.game_id || !p.is_active() {
                    return Err(TribunalError::InvalidTransition(format!(
                        "{} cannot be eliminated from {}",
                        loser, id
                    )));
                }
                p.status = ParticipantStatus::Eliminated;
                p.elimination_round = Some(round.round_number);
            }
            let stored = s.round_mut(id)?;
            stored.phase = Phase::Finished;
            stored.eliminated_participant = eliminated;
            stored.ended_at = Some(Utc::now());
            Ok(stored.clone())
        })
        .await
    }

    #[instrument(skip(self, message), fields(round_id = %message.round_id, kind = %message.kind))]
    async fn append_message(&self, mut message: Message, slot: SequenceSlot) -> Result<Message> {
        self.mutate(|s| {
            s.round_ref(message.round_id)?;
            message.sequence_number = match slot {
                SequenceSlot::Next => Some(s.max_sequence(message.round_id).map_or(0, |n| n + 1)),
                SequenceSlot::Fixed(n) => Some(n),
                SequenceSlot::Unnumbered => None,
            };
            s.counters.message += 1;
            message.id = MessageId(s.counters.message);
            s.messages.push(message.clone());
            Ok(message)
        })
        .await
    }

    async fn max_sequence(&self, round: RoundId) -> Result<Option<i64>> {
        Ok(self.read(|s| s.max_sequence(round)).await)
    }

    async fn messages(&self, round: RoundId) -> Result<Vec<Message>> {
        Ok(self.read(|s| s.sorted_messages(round)).await)
    }

    async fn count_messages(&self, round: RoundId, kind: MessageKind) -> Result<usize> {
        Ok(self
            .read(|s| {
                s.messages
                    .iter()
                    .filter(|m| m.round_id == round && m.kind == kind)
                    .count()
            })
            .await)
    }

    async fn recent_messages(&self, round: RoundId, kind: MessageKind, limit: usize) -> Result<Vec<Message>> {
        Ok(self
            .read(|s| {
                let all: Vec<Message> = s
                    .sorted_messages(round)
                    .into_iter()
                    .filter(|m| m.kind == kind)
                    .collect();
                let skip = all.len().saturating_sub(limit);
                all.into_iter().skip(skip).collect()
            })
            .await)
    }

    #[instrument(skip(self))]
    async fn delete_votes(&self, round: RoundId, phase: VotePhase) -> Result<usize> {
        self.mutate(|s| {
            let before = s.votes.len();
            s.votes.retain(|v| !(v.round_id == round && v.phase == phase));
            Ok(before - s.votes.len())
        })
        .await
    }

    #[instrument(skip(self, votes), fields(count = votes.len()))]
    async fn record_votes(&self, votes: Vec<Vote>) -> Result<Vec<Vote>> {
        self.mutate(|s| {
            let mut seen: HashSet<(RoundId, VotePhase, ParticipantId)> = s
                .votes
                .iter()
                .map(|v| (v.round_id, v.phase, v.voter_id))
                .collect();
            let mut stored = Vec::with_capacity(votes.len());
            for mut vote in votes {
                if vote.voter_id == vote.target_id {
                    return Err(TribunalError::InvalidVote(format!(
                        "{} voted for themselves",
                        vote.voter_id
                    )));
                }
                let game_id = s.round_ref(vote.round_id)?.game_id;
                for id in [vote.voter_id, vote.target_id] {
                    let belongs = s
                        .participants
                        .iter()
                        .any(|p| p.id == id && p.game_id == game_id);
                    if !belongs {
                        return Err(TribunalError::InvalidVote(format!(
                            "{} is not seated in {}",
                            id, game_id
                        )));
                    }
                }
                if !seen.insert((vote.round_id, vote.phase, vote.voter_id)) {
                    return Err(TribunalError::InvalidVote(format!(
                        "{} already voted in {} of {}",
                        vote.voter_id, vote.phase, vote.round_id
                    )));
                }
                s.counters.vote += 1;
                vote.id = VoteId(s.counters.vote);
                stored.push(vote.clone());
                s.votes.push(vote);
            }
            Ok(stored)
        })
        .await
    }

    async fn votes(&self, round: RoundId, phase: VotePhase) -> Result<Vec<Vote>> {
        Ok(self
            .read(|s| {
                s.votes
                    .iter()
                    .filter(|v| v.round_id == round && v.phase == phase)
                    .cloned()
                    .collect()
            })
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tribunal_core::GameSettings;

    async fn seeded(store: &JsonStore) -> (Game, Vec<Participant>, Round) {
        let game = store.create_game(Game::new(GameSettings::default())).await.unwrap();
        let mut seats = Vec::new();
        for name in ["Ada", "Ben", "Cy"] {
            seats.push(
                store
                    .add_participant(Participant::new(game.id, name, "llama3"))
                    .await
                    .unwrap(),
            );
        }
        let round = store.create_round(Round::new(game.id, 1, "topic")).await.unwrap();
        (game, seats, round)
    }

    fn vote(round: RoundId, voter: ParticipantId, target: ParticipantId) -> Vote {
        Vote::new(round, voter, target, VotePhase::InitialVoting, "because").unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("tribunal.json");

        let round_id = {
            let store = JsonStore::open(&path).await.unwrap();
            let (_, _, mut round) = seeded(&store).await;
            round.phase = Phase::Chatting;
            store.update_round(&round).await.unwrap();
            store
                .append_message(Message::system(round.id, "hello"), SequenceSlot::Next)
                .await
                .unwrap();
            round.id
        };

        let reopened = JsonStore::open(&path).await.unwrap();
        let round = reopened.round(round_id).await.unwrap().unwrap();
        assert_eq!(round.phase, Phase::Chatting);
        assert_eq!(reopened.messages(round_id).await.unwrap().len(), 1);
        assert_eq!(reopened.latest_round(round.game_id).await.unwrap().map(|r| r.id), Some(round_id));
    }

    #[tokio::test]
    async fn test_open_reports_unreadable_location() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "plain file").unwrap();

        // A file where a directory should be is an error, not an empty store
        match JsonStore::open(blocker.join("tribunal.json")).await {
            Err(err) => assert!(err.is_storage()),
            Ok(_) => panic!("opened a store below a plain file"),
        }
    }

    #[tokio::test]
    async fn test_sequence_numbers_unique_under_concurrency() {
        let store = Arc::new(JsonStore::in_memory());
        let (_, seats, round) = seeded(&store).await;
        let round_id = round.id;

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = Arc::clone(&store);
            let speaker = seats[i % seats.len()].id;
            handles.push(tokio::spawn(async move {
                store
                    .append_message(
                        Message::speech(round_id, speaker, MessageKind::Chat, format!("m{}", i)),
                        SequenceSlot::Next,
                    )
                    .await
                    .unwrap()
            }));
        }
        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap().sequence_number.unwrap());
        }
        seqs.sort();
        seqs.dedup();
        assert_eq!(seqs.len(), 20);
        assert_eq!(store.max_sequence(round_id).await.unwrap(), Some(19));
    }

    #[tokio::test]
    async fn test_fixed_and_unnumbered_slots() {
        let store = JsonStore::in_memory();
        let (_, seats, round) = seeded(&store).await;

        store
            .append_message(
                Message::speech(round.id, seats[0].id, MessageKind::Chat, "a"),
                SequenceSlot::Next,
            )
            .await
            .unwrap();
        store
            .append_message(Message::system(round.id, "late"), SequenceSlot::Unnumbered)
            .await
            .unwrap();
        store
            .append_message(Message::system(round.id, "retro"), SequenceSlot::Fixed(-1))
            .await
            .unwrap();

        let contents: Vec<_> = store
            .messages(round.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["retro", "a", "late"]);
        // Negative numbers never feed the counter
        assert_eq!(store.max_sequence(round.id).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_recent_messages_keeps_tail() {
        let store = JsonStore::in_memory();
        let (_, seats, round) = seeded(&store).await;
        for i in 0..5 {
            store
                .append_message(
                    Message::speech(round.id, seats[0].id, MessageKind::Chat, format!("{}", i)),
                    SequenceSlot::Next,
                )
                .await
                .unwrap();
        }
        let recent = store.recent_messages(round.id, MessageKind::Chat, 2).await.unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["3", "4"]);
        assert_eq!(store.count_messages(round.id, MessageKind::Chat).await.unwrap(), 5);
        assert_eq!(store.count_messages(round.id, MessageKind::System).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_record_votes_is_all_or_nothing() {
        let store = JsonStore::in_memory();
        let (_, seats, round) = seeded(&store).await;
        let (a, b, c) = (seats[0].id, seats[1].id, seats[2].id);

        let mut forged = vote(round.id, c, a);
        forged.target_id = c;
        let err = store
            .record_votes(vec![vote(round.id, a, b), forged])
            .await
            .unwrap_err();
        assert!(matches!(err, TribunalError::InvalidVote(_)));
        assert!(store.votes(round.id, VotePhase::InitialVoting).await.unwrap().is_empty());

        let stored = store
            .record_votes(vec![vote(round.id, a, b), vote(round.id, b, a), vote(round.id, c, a)])
            .await
            .unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|v| v.id != VoteId::default()));
    }

    #[tokio::test]
    async fn test_second_pass_requires_delete() {
        let store = JsonStore::in_memory();
        let (_, seats, round) = seeded(&store).await;
        let (a, b) = (seats[0].id, seats[1].id);

        store.record_votes(vec![vote(round.id, a, b)]).await.unwrap();
        assert!(store.record_votes(vec![vote(round.id, a, b)]).await.is_err());

        assert_eq!(store.delete_votes(round.id, VotePhase::InitialVoting).await.unwrap(), 1);
        store.record_votes(vec![vote(round.id, a, b)]).await.unwrap();
        assert_eq!(store.votes(round.id, VotePhase::InitialVoting).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_vote_for_stranger_rejected() {
        let store = JsonStore::in_memory();
        let (_, seats, round) = seeded(&store).await;
        let err = store
            .record_votes(vec![vote(round.id, seats[0].id, ParticipantId(999))])
            .await
            .unwrap_err();
        assert!(matches!(err, TribunalError::InvalidVote(_)));
    }

    #[tokio::test]
    async fn test_complete_round_eliminates_once() {
        let store = JsonStore::in_memory();
        let (game, seats, round) = seeded(&store).await;

        let finished = store.complete_round(round.id, Some(seats[1].id)).await.unwrap();
        assert_eq!(finished.phase, Phase::Finished);
        assert_eq!(finished.eliminated_participant, Some(seats[1].id));

        let loser = store.participant(seats[1].id).await.unwrap().unwrap();
        assert_eq!(loser.status, ParticipantStatus::Eliminated);
        assert_eq!(loser.elimination_round, Some(1));
        assert_eq!(store.active_participants(game.id).await.unwrap().len(), 2);

        // Finished rounds are immutable
        assert!(store.complete_round(round.id, None).await.is_err());
        assert!(store.update_round(&finished).await.is_err());
    }

    #[tokio::test]
    async fn test_round_numbers_strictly_increase() {
        let store = JsonStore::in_memory();
        let (game, _, round) = seeded(&store).await;

        assert!(store.create_round(Round::new(game.id, 2, "")).await.is_err());
        store.complete_round(round.id, None).await.unwrap();
        assert!(store.create_round(Round::new(game.id, 1, "")).await.is_err());
        let next = store.create_round(Round::new(game.id, 2, "")).await.unwrap();
        assert_eq!(store.latest_round(game.id).await.unwrap().unwrap().id, next.id);
    }

    #[tokio::test]
    async fn test_write_failure_leaves_state_untouched() {
        let store = JsonStore::in_memory();
        let (game, _, _) = seeded(&store).await;

        store.set_write_failure(true);
        let err = store
            .set_game_status(game.id, GameStatus::Running)
            .await
            .unwrap_err();
        assert!(err.is_storage());
        store.set_write_failure(false);

        let game = store.game(game.id).await.unwrap().unwrap();
        assert_eq!(game.status, GameStatus::Preparing);
    }

    #[tokio::test]
    async fn test_mark_winners() {
        let store = JsonStore::in_memory();
        let (game, seats, round) = seeded(&store).await;
        store.complete_round(round.id, Some(seats[0].id)).await.unwrap();

        let winners = store.mark_winners(game.id).await.unwrap();
        assert_eq!(winners.len(), 2);
        assert!(store.active_participants(game.id).await.unwrap().is_empty());
    }
}

//! One voting pass: discard, choose, commit, read back, tally

use async_trait::async_trait;
use futures::future::join_all;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use tribunal_core::{Participant, ParticipantId, Result, RoundId, TribunalError, Vote, VotePhase};
use tribunal_store::PersistenceGateway;

use crate::context::SharedRng;
use crate::fallback;

/// A voter's pick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub target: ParticipantId,
    pub reason: String,
}

/// Decides whom a voter votes for
///
/// `eligible` never contains the voter.
#[async_trait]
pub trait TargetPolicy: Send + Sync {
    async fn choose(&self, voter: &Participant, eligible: &[Participant], phase: VotePhase) -> Option<Choice>;
}

/// Uniform random target with a templated reason
pub struct RandomPolicy {
    rng: SharedRng,
}

impl RandomPolicy {
    pub fn new(rng: SharedRng) -> Self {
        Self { rng }
    }
}

#[async_trait]
impl TargetPolicy for RandomPolicy {
    async fn choose(&self, _voter: &Participant, eligible: &[Participant], phase: VotePhase) -> Option<Choice> {
        self.rng.with(|rng| {
            let target = eligible.choose(rng)?;
            Some(Choice {
                target: target.id,
                reason: fallback::vote_reason(phase, target, rng),
            })
        })
    }
}

/// Fixed ballots per (phase, voter), consumed in order, for tests
///
/// A voter without a scripted ballot votes for the lowest eligible id.
#[derive(Default)]
pub struct ScriptedPolicy {
    ballots: Mutex<HashMap<(VotePhase, ParticipantId), VecDeque<ParticipantId>>>,
}

impl ScriptedPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vote(self, phase: VotePhase, voter: ParticipantId, target: ParticipantId) -> Self {
        if let Ok(mut ballots) = self.ballots.lock() {
            ballots.entry((phase, voter)).or_default().push_back(target);
        }
        self
    }

    /// Script a whole pass as (voter, target) pairs
    pub fn with_pass(self, phase: VotePhase, pass: &[(ParticipantId, ParticipantId)]) -> Self {
        pass.iter()
            .fold(self, |policy, (voter, target)| policy.with_vote(phase, *voter, *target))
    }
}

#[async_trait]
impl TargetPolicy for ScriptedPolicy {
    async fn choose(&self, voter: &Participant, eligible: &[Participant], phase: VotePhase) -> Option<Choice> {
        let scripted = self
            .ballots
            .lock()
            .ok()
            .and_then(|mut b| b.get_mut(&(phase, voter.id)).and_then(VecDeque::pop_front));
        let target = scripted.or_else(|| eligible.iter().map(|p| p.id).min())?;
        Some(Choice {
            target,
            reason: format!("scripted {} ballot", phase),
        })
    }
}

/// Vote counts of one pass
#[derive(Debug, Clone)]
pub struct Tally {
    pub phase: VotePhase,
    pub counts: BTreeMap<ParticipantId, usize>,
    pub votes: Vec<Vote>,
}

impl Tally {
    pub fn from_votes(phase: VotePhase, votes: Vec<Vote>) -> Self {
        let mut counts = BTreeMap::new();
        for vote in &votes {
            *counts.entry(vote.target_id).or_insert(0) += 1;
        }
        Self { phase, counts, votes }
    }

    /// Every target tied for the maximum count, by id
    pub fn candidates(&self) -> Vec<ParticipantId> {
        let Some(max) = self.counts.values().copied().max() else {
            return Vec::new();
        };
        self.counts
            .iter()
            .filter(|(_, count)| **count == max)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn is_tie(&self) -> bool {
        self.candidates().len() > 1
    }

    pub fn total_votes(&self) -> usize {
        self.votes.len()
    }

    pub fn count_for(&self, participant: ParticipantId) -> usize {
        self.counts.get(&participant).copied().unwrap_or(0)
    }
}

/// A ballot as shown in a voting table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterLine {
    pub voter: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateLine {
    pub id: ParticipantId,
    pub name: String,
    pub vote_count: usize,
    pub voters: Vec<VoterLine>,
}

/// Snapshot of a tally stored as a `voting_table` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingTable {
    pub title: String,
    pub phase: VotePhase,
    /// 1 for initial and final voting, the tie-break pass for additional voting
    pub pass: u32,
    /// Sorted by vote count, highest first
    pub candidates: Vec<CandidateLine>,
    pub total_votes: usize,
    pub total_participants: usize,
}

impl VotingTable {
    pub fn build(tally: &Tally, pass: u32, participants: &[Participant]) -> Self {
        let names: HashMap<ParticipantId, &str> = participants
            .iter()
            .map(|p| (p.id, p.display_name.as_str()))
            .collect();
        let name = |id: ParticipantId| {
            names
                .get(&id)
                .map(|n| n.to_string())
                .unwrap_or_else(|| id.to_string())
        };

        let mut candidates: Vec<CandidateLine> = tally
            .counts
            .iter()
            .map(|(id, count)| CandidateLine {
                id: *id,
                name: name(*id),
                vote_count: *count,
                voters: tally
                    .votes
                    .iter()
                    .filter(|v| v.target_id == *id)
                    .map(|v| VoterLine {
                        voter: name(v.voter_id),
                        reason: v.reason.clone(),
                    })
                    .collect(),
            })
            .collect();
        candidates.sort_by(|a, b| b.vote_count.cmp(&a.vote_count).then(a.id.cmp(&b.id)));

        Self {
            title: table_title(tally.phase, pass),
            phase: tally.phase,
            pass,
            candidates,
            total_votes: tally.total_votes(),
            total_participants: participants.len(),
        }
    }
}

/// Heading of a voting table
pub fn table_title(phase: VotePhase, pass: u32) -> String {
    match phase {
        VotePhase::InitialVoting => "Initial voting results".to_string(),
        VotePhase::FinalVoting => "Final voting results".to_string(),
        VotePhase::AdditionalVoting => format!("Additional voting results (pass {})", pass),
    }
}

/// Runs voting passes against the store
pub struct VotingEngine {
    store: Arc<dyn PersistenceGateway>,
    policy: Arc<dyn TargetPolicy>,
}

impl VotingEngine {
    pub fn new(store: Arc<dyn PersistenceGateway>, policy: Arc<dyn TargetPolicy>) -> Self {
        Self { store, policy }
    }

    /// Conduct one pass over `voters`
    ///
    /// Prior votes of the same (round, phase) are discarded first, ballots
    /// are chosen concurrently, committed in one batch and read back before
    /// tallying.
    pub async fn run_pass(&self, round_id: RoundId, phase: VotePhase, voters: &[Participant]) -> Result<Tally> {
        let discarded = self.store.delete_votes(round_id, phase).await?;
        if discarded > 0 {
            info!(round_id = %round_id, phase = %phase, discarded, "Discarded votes of an earlier pass");
        }

        let choices = join_all(voters.iter().map(|voter| {
            let eligible: Vec<Participant> = voters.iter().filter(|p| p.id != voter.id).cloned().collect();
            async move {
                let choice = self.policy.choose(voter, &eligible, phase).await;
                (voter, eligible, choice)
            }
        }))
        .await;

        let mut ballots = Vec::with_capacity(choices.len());
        for (voter, eligible, choice) in choices {
            let Some(choice) = choice else {
                warn!(
                    round_id = %round_id,
                    phase = %phase,
                    voter = %voter.id,
                    eligible = eligible.len(),
                    "No ballot chosen, voter abstains"
                );
                continue;
            };
            if !eligible.iter().any(|p| p.id == choice.target) {
                return Err(TribunalError::InvalidVote(format!(
                    "{} chose {} who is not eligible",
                    voter.id, choice.target
                )));
            }
            ballots.push(Vote::new(round_id, voter.id, choice.target, phase, choice.reason)?);
        }

        self.store.record_votes(ballots).await?;
        let votes = self.store.votes(round_id, phase).await?;
        let tally = Tally::from_votes(phase, votes);
        info!(
            round_id = %round_id,
            phase = %phase,
            votes = tally.total_votes(),
            candidates = ?tally.candidates(),
            "Votes tallied"
        );
        Ok(tally)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tribunal_core::{Game, GameSettings, Round};
    use tribunal_store::JsonStore;

    async fn setup(names: &[&str]) -> (Arc<JsonStore>, RoundId, Vec<Participant>) {
        let store = Arc::new(JsonStore::in_memory());
        let game = store.create_game(Game::new(GameSettings::default())).await.unwrap();
        let mut people = Vec::new();
        for name in names {
            people.push(store.add_participant(Participant::new(game.id, *name, "m")).await.unwrap());
        }
        let round = store.create_round(Round::new(game.id, 1, "t")).await.unwrap();
        (store, round.id, people)
    }

    fn p(n: u64) -> ParticipantId {
        ParticipantId(n)
    }

    #[tokio::test]
    async fn test_singleton_candidate() {
        let (store, round, people) = setup(&["A", "B", "C"]).await;
        let policy = ScriptedPolicy::new().with_pass(
            VotePhase::InitialVoting,
            &[(p(1), p(2)), (p(2), p(1)), (p(3), p(1))],
        );
        let engine = VotingEngine::new(store.clone(), Arc::new(policy));

        let tally = engine.run_pass(round, VotePhase::InitialVoting, &people).await.unwrap();
        assert_eq!(tally.count_for(p(1)), 2);
        assert_eq!(tally.count_for(p(2)), 1);
        assert_eq!(tally.candidates(), vec![p(1)]);
        assert!(!tally.is_tie());
    }

    #[tokio::test]
    async fn test_tie_detection() {
        let (store, round, people) = setup(&["A", "B", "C", "D"]).await;
        let policy = ScriptedPolicy::new().with_pass(
            VotePhase::FinalVoting,
            &[(p(1), p(2)), (p(2), p(1)), (p(3), p(1)), (p(4), p(2))],
        );
        let engine = VotingEngine::new(store, Arc::new(policy));

        let tally = engine.run_pass(round, VotePhase::FinalVoting, &people).await.unwrap();
        assert_eq!(tally.candidates(), vec![p(1), p(2)]);
        assert!(tally.is_tie());
        assert_eq!(tally.count_for(p(3)), 0);
    }

    #[tokio::test]
    async fn test_rerun_replaces_previous_pass() {
        let (store, round, people) = setup(&["A", "B", "C"]).await;
        let engine = VotingEngine::new(store.clone(), Arc::new(RandomPolicy::new(SharedRng::new(Some(9)))));

        engine.run_pass(round, VotePhase::AdditionalVoting, &people).await.unwrap();
        let tally = engine.run_pass(round, VotePhase::AdditionalVoting, &people).await.unwrap();
        assert_eq!(tally.total_votes(), 3);
        assert_eq!(store.votes(round, VotePhase::AdditionalVoting).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_random_policy_never_self_votes() {
        let (store, round, people) = setup(&["A", "B"]).await;
        let engine = VotingEngine::new(store, Arc::new(RandomPolicy::new(SharedRng::new(None))));

        for _ in 0..10 {
            let tally = engine.run_pass(round, VotePhase::InitialVoting, &people).await.unwrap();
            assert!(tally.votes.iter().all(|v| v.voter_id != v.target_id));
            // With two voters every pass is a mutual tie
            assert_eq!(tally.candidates(), vec![p(1), p(2)]);
        }
    }

    /// Abstains for one voter, defers to the scripted default otherwise
    struct Abstain(ParticipantId);

    #[async_trait]
    impl TargetPolicy for Abstain {
        async fn choose(&self, voter: &Participant, eligible: &[Participant], phase: VotePhase) -> Option<Choice> {
            if voter.id == self.0 {
                return None;
            }
            ScriptedPolicy::new().choose(voter, eligible, phase).await
        }
    }

    #[tokio::test]
    async fn test_abstaining_voter_is_left_out_of_tally() {
        let (store, round, people) = setup(&["A", "B", "C"]).await;
        let engine = VotingEngine::new(store.clone(), Arc::new(Abstain(p(2))));

        let tally = engine.run_pass(round, VotePhase::InitialVoting, &people).await.unwrap();
        assert_eq!(tally.total_votes(), 2);
        assert!(tally.votes.iter().all(|v| v.voter_id != p(2)));
        // A and C both fall back to the lowest eligible id
        assert_eq!(tally.count_for(p(2)), 1);
        assert_eq!(tally.count_for(p(1)), 1);
        assert_eq!(store.votes(round, VotePhase::InitialVoting).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_ineligible_choice_is_rejected_atomically() {
        let (store, round, people) = setup(&["A", "B", "C"]).await;
        let policy = ScriptedPolicy::new().with_vote(VotePhase::InitialVoting, p(2), p(2));
        let engine = VotingEngine::new(store.clone(), Arc::new(policy));

        let err = engine
            .run_pass(round, VotePhase::InitialVoting, &people)
            .await
            .unwrap_err();
        assert!(matches!(err, TribunalError::InvalidVote(_)));
        assert!(store.votes(round, VotePhase::InitialVoting).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_voting_table_sorted_with_reasons() {
        let (store, round, people) = setup(&["A", "B", "C"]).await;
        let policy = ScriptedPolicy::new().with_pass(
            VotePhase::InitialVoting,
            &[(p(1), p(3)), (p(2), p(3)), (p(3), p(1))],
        );
        let engine = VotingEngine::new(store, Arc::new(policy));
        let tally = engine.run_pass(round, VotePhase::InitialVoting, &people).await.unwrap();

        let table = VotingTable::build(&tally, 1, &people);
        assert_eq!(table.title, "Initial voting results");
        assert_eq!(table.total_votes, 3);
        assert_eq!(table.total_participants, 3);
        assert_eq!(table.candidates[0].name, "C");
        assert_eq!(table.candidates[0].vote_count, 2);
        assert_eq!(table.candidates[0].voters.len(), 2);
        assert_eq!(table.candidates[1].name, "A");
        assert_eq!(table.candidates[1].voters[0].voter, "C");

        let json = serde_json::to_string(&table).unwrap();
        let back: VotingTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn test_additional_title_names_pass() {
        assert_eq!(
            table_title(VotePhase::AdditionalVoting, 2),
            "Additional voting results (pass 2)"
        );
    }
}

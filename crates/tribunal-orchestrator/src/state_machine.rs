//! Pure state machine for round control flow
//!
//! This module implements a pure functional state machine with NO I/O.
//! All state transitions are deterministic and testable.
//!
//! Key design principles:
//! - Pure function: transition(state, event) -> (state, actions)
//! - No async, no I/O, no store or provider access
//! - Invalid transitions return `InvalidTransition` (never panic)
//! - The round runner executes the returned actions in order

use tribunal_core::{ParticipantId, Phase, Result, TribunalError, VotePhase};

/// Where a round stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundState {
    pub phase: Phase,
    /// Additional-debate passes already entered
    pub tie_break_passes: u32,
}

impl RoundState {
    pub fn new(phase: Phase, tie_break_passes: u32) -> Self {
        Self {
            phase,
            tie_break_passes,
        }
    }
}

impl Default for RoundState {
    fn default() -> Self {
        Self::new(Phase::Preparing, 0)
    }
}

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundEvent {
    /// Topic assigned, debate may begin
    Begin,
    /// Debate loop ended
    DebateFinished { speeches: usize },
    /// A voting pass was tallied; `candidates` are tied for the maximum
    Tallied {
        phase: VotePhase,
        candidates: Vec<ParticipantId>,
    },
    /// Every defense candidate has spoken
    DefenseFinished,
    /// Every tied candidate has spoken again
    AdditionalDebateFinished,
    /// Fewer than two participants are still active at a phase entry
    InsufficientParticipants { active: usize },
}

/// Actions to execute as side effects of transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Flush the new phase (and tie-break counter) to the round record
    PersistPhase(Phase),
    /// Store and publish the phase-change system message
    AnnouncePhase(Phase),
    RunDebate,
    RunVoting(VotePhase),
    RunDefense { candidates: Vec<ParticipantId> },
    RunAdditionalDebate { candidates: Vec<ParticipantId> },
    /// Finish the round, eliminating this participant
    Eliminate(ParticipantId),
    /// Finish the round without elimination and end the game
    EndGame,
    LogActivity { message: String },
}

/// Safety bound on the final/additional voting cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TieBreakLimit {
    pub max_passes: u32,
}

impl TieBreakLimit {
    pub fn new(max_passes: u32) -> Self {
        Self { max_passes }
    }
}

impl Default for TieBreakLimit {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Pure state transition function
///
/// Takes current state and event, returns new state and actions to execute.
/// This function is completely deterministic and has no side effects.
///
/// # Invalid Transitions
/// Events that make no sense in the current phase produce
/// [`TribunalError::InvalidTransition`]. This function never panics.
pub fn transition(
    state: RoundState,
    event: RoundEvent,
    limit: TieBreakLimit,
) -> Result<(RoundState, Vec<Action>)> {
    let passes = state.tie_break_passes;
    match (state.phase, event) {
        (phase, RoundEvent::InsufficientParticipants { active }) if !phase.is_terminal() => Ok((
            RoundState::new(Phase::Finished, passes),
            vec![
                Action::LogActivity {
                    message: format!(
                        "Only {} active participant(s) left during {}, ending game",
                        active, phase
                    ),
                },
                Action::EndGame,
            ],
        )),

        (Phase::Preparing, RoundEvent::Begin) => Ok(enter(
            Phase::Chatting,
            passes,
            "Debate started".to_string(),
            Action::RunDebate,
        )),

        (Phase::Chatting, RoundEvent::DebateFinished { speeches }) => Ok(enter(
            Phase::InitialVoting,
            passes,
            format!("Debate closed after {} speeches", speeches),
            Action::RunVoting(VotePhase::InitialVoting),
        )),

        (
            Phase::InitialVoting,
            RoundEvent::Tallied {
                phase: VotePhase::InitialVoting,
                candidates,
            },
        ) => {
            if candidates.is_empty() {
                return Err(invalid(state.phase, "tally without candidates"));
            }
            Ok(enter(
                Phase::FinalDefense,
                passes,
                format!("{} defense candidate(s)", candidates.len()),
                Action::RunDefense { candidates },
            ))
        }

        (Phase::FinalDefense, RoundEvent::DefenseFinished) => Ok(enter(
            Phase::FinalVoting,
            passes,
            "Defense complete".to_string(),
            Action::RunVoting(VotePhase::FinalVoting),
        )),

        (
            Phase::FinalVoting,
            RoundEvent::Tallied {
                phase: VotePhase::FinalVoting,
                candidates,
            },
        )
        | (
            Phase::AdditionalVoting,
            RoundEvent::Tallied {
                phase: VotePhase::AdditionalVoting,
                candidates,
            },
        ) => decide(state, candidates, limit),

        (Phase::AdditionalDebate, RoundEvent::AdditionalDebateFinished) => Ok(enter(
            Phase::AdditionalVoting,
            passes,
            format!("Additional debate pass {} complete", passes),
            Action::RunVoting(VotePhase::AdditionalVoting),
        )),

        (phase, event) => Err(invalid(phase, &format!("{:?}", event))),
    }
}

/// Settle a final or additional tally: eliminate, tie-break again, or fall
/// back to the lowest id once the bound is reached
fn decide(
    state: RoundState,
    mut candidates: Vec<ParticipantId>,
    limit: TieBreakLimit,
) -> Result<(RoundState, Vec<Action>)> {
    candidates.sort();
    candidates.dedup();
    let passes = state.tie_break_passes;

    match candidates.as_slice() {
        [] => Err(invalid(state.phase, "tally without candidates")),
        [loser] => Ok((
            RoundState::new(Phase::Finished, passes),
            vec![
                Action::LogActivity {
                    message: format!("{} eliminated", loser),
                },
                Action::Eliminate(*loser),
            ],
        )),
        [lowest, ..] if passes >= limit.max_passes => Ok((
            RoundState::new(Phase::Finished, passes),
            vec![
                Action::LogActivity {
                    message: format!(
                        "Still tied after {} tie-break pass(es), eliminating lowest id {}",
                        passes, lowest
                    ),
                },
                Action::Eliminate(*lowest),
            ],
        )),
        _ => {
            let count = candidates.len();
            Ok(enter(
                Phase::AdditionalDebate,
                passes + 1,
                format!("{}-way tie, tie-break pass {}", count, passes + 1),
                Action::RunAdditionalDebate { candidates },
            ))
        }
    }
}

fn enter(phase: Phase, passes: u32, message: String, work: Action) -> (RoundState, Vec<Action>) {
    (
        RoundState::new(phase, passes),
        vec![
            Action::LogActivity { message },
            Action::PersistPhase(phase),
            Action::AnnouncePhase(phase),
            work,
        ],
    )
}

fn invalid(phase: Phase, what: &str) -> TribunalError {
    TribunalError::InvalidTransition(format!("{} in phase {}", what, phase))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(n: u64) -> ParticipantId {
        ParticipantId(n)
    }

    fn step(state: RoundState, event: RoundEvent) -> (RoundState, Vec<Action>) {
        transition(state, event, TieBreakLimit::default()).unwrap()
    }

    #[test]
    fn test_happy_path_full_flow() {
        let state = RoundState::default();

        let (state, actions) = step(state, RoundEvent::Begin);
        assert_eq!(state.phase, Phase::Chatting);
        assert_eq!(actions.len(), 4);
        assert!(matches!(actions[0], Action::LogActivity { .. }));
        assert_eq!(actions[1], Action::PersistPhase(Phase::Chatting));
        assert_eq!(actions[3], Action::RunDebate);

        let (state, actions) = step(state, RoundEvent::DebateFinished { speeches: 3 });
        assert_eq!(state.phase, Phase::InitialVoting);
        assert_eq!(actions[3], Action::RunVoting(VotePhase::InitialVoting));

        let (state, actions) = step(
            state,
            RoundEvent::Tallied {
                phase: VotePhase::InitialVoting,
                candidates: vec![p(1)],
            },
        );
        assert_eq!(state.phase, Phase::FinalDefense);
        assert_eq!(actions[3], Action::RunDefense { candidates: vec![p(1)] });

        let (state, actions) = step(state, RoundEvent::DefenseFinished);
        assert_eq!(state.phase, Phase::FinalVoting);
        assert_eq!(actions[3], Action::RunVoting(VotePhase::FinalVoting));

        let (state, actions) = step(
            state,
            RoundEvent::Tallied {
                phase: VotePhase::FinalVoting,
                candidates: vec![p(1)],
            },
        );
        assert_eq!(state.phase, Phase::Finished);
        assert_eq!(actions.last(), Some(&Action::Eliminate(p(1))));
    }

    #[test]
    fn test_phase_is_persisted_before_work() {
        let (_, actions) = step(RoundState::default(), RoundEvent::Begin);
        let persist = actions
            .iter()
            .position(|a| matches!(a, Action::PersistPhase(_)))
            .unwrap();
        let work = actions.iter().position(|a| *a == Action::RunDebate).unwrap();
        assert!(persist < work);
    }

    #[test]
    fn test_initial_tie_sends_every_candidate_to_defense() {
        let state = RoundState::new(Phase::InitialVoting, 0);
        let (state, actions) = step(
            state,
            RoundEvent::Tallied {
                phase: VotePhase::InitialVoting,
                candidates: vec![p(1), p(2)],
            },
        );
        assert_eq!(state.phase, Phase::FinalDefense);
        assert_eq!(
            actions[3],
            Action::RunDefense {
                candidates: vec![p(1), p(2)]
            }
        );
    }

    #[test]
    fn test_final_tie_enters_additional_debate() {
        let state = RoundState::new(Phase::FinalVoting, 0);
        let (state, actions) = step(
            state,
            RoundEvent::Tallied {
                phase: VotePhase::FinalVoting,
                candidates: vec![p(2), p(1)],
            },
        );
        assert_eq!(state, RoundState::new(Phase::AdditionalDebate, 1));
        assert_eq!(
            actions[3],
            Action::RunAdditionalDebate {
                candidates: vec![p(1), p(2)]
            }
        );
    }

    #[test]
    fn test_tie_break_cycle_then_elimination() {
        let state = RoundState::new(Phase::AdditionalDebate, 1);
        let (state, actions) = step(state, RoundEvent::AdditionalDebateFinished);
        assert_eq!(state.phase, Phase::AdditionalVoting);
        assert_eq!(actions[3], Action::RunVoting(VotePhase::AdditionalVoting));

        // Tied again
        let (state, _) = step(
            state,
            RoundEvent::Tallied {
                phase: VotePhase::AdditionalVoting,
                candidates: vec![p(1), p(2)],
            },
        );
        assert_eq!(state, RoundState::new(Phase::AdditionalDebate, 2));

        let (state, _) = step(state, RoundEvent::AdditionalDebateFinished);
        let (state, actions) = step(
            state,
            RoundEvent::Tallied {
                phase: VotePhase::AdditionalVoting,
                candidates: vec![p(2)],
            },
        );
        assert_eq!(state.phase, Phase::Finished);
        assert_eq!(actions.last(), Some(&Action::Eliminate(p(2))));
    }

    #[test]
    fn test_tie_break_bound_eliminates_lowest_id() {
        let limit = TieBreakLimit::new(2);
        let state = RoundState::new(Phase::AdditionalVoting, 2);
        let (state, actions) = transition(
            state,
            RoundEvent::Tallied {
                phase: VotePhase::AdditionalVoting,
                candidates: vec![p(7), p(3), p(5)],
            },
            limit,
        )
        .unwrap();
        assert_eq!(state.phase, Phase::Finished);
        assert_eq!(actions.last(), Some(&Action::Eliminate(p(3))));
    }

    #[test]
    fn test_zero_bound_never_enters_additional_debate() {
        let (state, actions) = transition(
            RoundState::new(Phase::FinalVoting, 0),
            RoundEvent::Tallied {
                phase: VotePhase::FinalVoting,
                candidates: vec![p(4), p(2)],
            },
            TieBreakLimit::new(0),
        )
        .unwrap();
        assert_eq!(state.phase, Phase::Finished);
        assert_eq!(actions.last(), Some(&Action::Eliminate(p(2))));
    }

    #[test]
    fn test_insufficient_participants_from_any_live_phase() {
        for phase in [
            Phase::Preparing,
            Phase::Chatting,
            Phase::InitialVoting,
            Phase::FinalDefense,
            Phase::FinalVoting,
            Phase::AdditionalDebate,
            Phase::AdditionalVoting,
        ] {
            let (state, actions) = step(
                RoundState::new(phase, 0),
                RoundEvent::InsufficientParticipants { active: 1 },
            );
            assert_eq!(state.phase, Phase::Finished);
            assert_eq!(actions.last(), Some(&Action::EndGame));
            assert!(!actions.iter().any(|a| matches!(a, Action::Eliminate(_))));
        }
    }

    #[test]
    fn test_finished_is_terminal() {
        let finished = RoundState::new(Phase::Finished, 0);
        for event in [
            RoundEvent::Begin,
            RoundEvent::DefenseFinished,
            RoundEvent::InsufficientParticipants { active: 0 },
        ] {
            let err = transition(finished, event, TieBreakLimit::default()).unwrap_err();
            assert!(matches!(err, TribunalError::InvalidTransition(_)));
        }
    }

    #[test]
    fn test_invalid_transitions_do_not_panic() {
        let err = transition(
            RoundState::new(Phase::Chatting, 0),
            RoundEvent::DefenseFinished,
            TieBreakLimit::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("chatting"));

        // Tally for the wrong pass
        assert!(transition(
            RoundState::new(Phase::FinalVoting, 0),
            RoundEvent::Tallied {
                phase: VotePhase::InitialVoting,
                candidates: vec![p(1)],
            },
            TieBreakLimit::default(),
        )
        .is_err());
    }

    #[test]
    fn test_empty_tally_is_rejected() {
        for phase in [VotePhase::InitialVoting, VotePhase::FinalVoting] {
            let result = transition(
                RoundState::new(phase.as_phase(), 0),
                RoundEvent::Tallied {
                    phase,
                    candidates: vec![],
                },
                TieBreakLimit::default(),
            );
            assert!(result.is_err());
        }
    }
}

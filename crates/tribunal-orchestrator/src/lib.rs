//! # tribunal-orchestrator
//!
//! Round orchestration engine for Tribunal.
//!
//! This crate provides:
//! - A pure round state machine from `preparing` to `finished`
//! - Time-boxed round-robin debate scheduling
//! - Streaming speech generation with fallbacks
//! - Voting passes, tallies and bounded tie-breaks
//! - Restart recovery from persisted state
//! - Live game events for observers
//! - A game driver and a display-ready transcript

mod context;
mod debate;
mod fallback;
mod game;
mod prompt;
mod publisher;
mod recovery;
mod round;
mod state_machine;
mod streamer;
mod transcript;
mod voting;

pub use context::{Progress, SharedRng};
pub use debate::{DebatePlan, DebateScheduler};
pub use game::{GameOutcome, GameRunner, GameSummary};
pub use prompt::{
    build_additional_debate_prompt, build_chat_prompt, build_defense_prompt, build_game_context,
    format_history, strip_thinking,
};
pub use publisher::{
    BroadcastPublisher, EventPublisher, GameEvent, ParticipantRef, RecordingPublisher,
    CHANNEL_CAPACITY,
};
pub use recovery::{RecoveryReconciler, ResumePlan, ResumeTarget};
pub use round::{Entry, RoundOutcome, RoundRunner};
pub use state_machine::{transition, Action, RoundEvent, RoundState, TieBreakLimit};
pub use streamer::{GenerationStreamer, SpeechSpec, StreamerSettings, Utterance};
pub use transcript::{game_transcript, render, TranscriptEntry};
pub use voting::{
    table_title, CandidateLine, Choice, RandomPolicy, ScriptedPolicy, Tally, TargetPolicy,
    VoterLine, VotingEngine, VotingTable,
};

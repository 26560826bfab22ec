//! Core type definitions for tribunal games

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::{Result, TribunalError};

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let digits = s.strip_prefix(concat!($prefix, "-")).unwrap_or(s);
                digits
                    .parse()
                    .map(Self)
                    .map_err(|_| format!("Invalid {} id: {}", $prefix, s))
            }
        }
    };
}

record_id!(
    /// Game identifier
    GameId,
    "game"
);
record_id!(
    /// Round identifier, unique across games
    RoundId,
    "round"
);
record_id!(
    /// Participant identifier; lower ids win deterministic tie-breaks
    ParticipantId,
    "p"
);
record_id!(MessageId, "msg");
record_id!(VoteId, "vote");

/// Lifecycle of a whole game
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    #[default]
    Preparing,
    Running,
    Finished,
}

impl std::fmt::Display for GameStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preparing => write!(f, "preparing"),
            Self::Running => write!(f, "running"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

impl std::str::FromStr for GameStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "preparing" => Ok(Self::Preparing),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            _ => Err(format!("Invalid game status: {}", s)),
        }
    }
}

/// Participant standing within a game
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    #[default]
    Active,
    Eliminated,
    Winner,
}

impl std::fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Eliminated => write!(f, "eliminated"),
            Self::Winner => write!(f, "winner"),
        }
    }
}

/// The single authoritative stage of a round
///
/// Primary path: preparing, chatting, initial_voting, final_defense,
/// final_voting, finished. Ties at final or additional voting loop through
/// additional_debate and additional_voting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Preparing,
    Chatting,
    InitialVoting,
    FinalDefense,
    FinalVoting,
    AdditionalDebate,
    AdditionalVoting,
    Finished,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        self == Self::Finished
    }

    /// The vote pass this phase runs, if it is a voting phase
    pub fn vote_phase(self) -> Option<VotePhase> {
        match self {
            Self::InitialVoting => Some(VotePhase::InitialVoting),
            Self::FinalVoting => Some(VotePhase::FinalVoting),
            Self::AdditionalVoting => Some(VotePhase::AdditionalVoting),
            _ => None,
        }
    }

    /// Human-readable label used in system messages
    pub fn label(self) -> &'static str {
        match self {
            Self::Preparing => "Preparing",
            Self::Chatting => "Free debate",
            Self::InitialVoting => "Initial voting",
            Self::FinalDefense => "Final defense",
            Self::FinalVoting => "Final voting",
            Self::AdditionalDebate => "Additional debate",
            Self::AdditionalVoting => "Additional voting",
            Self::Finished => "Finished",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preparing => write!(f, "preparing"),
            Self::Chatting => write!(f, "chatting"),
            Self::InitialVoting => write!(f, "initial_voting"),
            Self::FinalDefense => write!(f, "final_defense"),
            Self::FinalVoting => write!(f, "final_voting"),
            Self::AdditionalDebate => write!(f, "additional_debate"),
            Self::AdditionalVoting => write!(f, "additional_voting"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "preparing" => Ok(Self::Preparing),
            "chatting" => Ok(Self::Chatting),
            "initial_voting" => Ok(Self::InitialVoting),
            "final_defense" => Ok(Self::FinalDefense),
            "final_voting" => Ok(Self::FinalVoting),
            "additional_debate" => Ok(Self::AdditionalDebate),
            "additional_voting" => Ok(Self::AdditionalVoting),
            "finished" => Ok(Self::Finished),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Tag of one voting pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotePhase {
    InitialVoting,
    FinalVoting,
    AdditionalVoting,
}

impl VotePhase {
    pub fn as_phase(self) -> Phase {
        match self {
            Self::InitialVoting => Phase::InitialVoting,
            Self::FinalVoting => Phase::FinalVoting,
            Self::AdditionalVoting => Phase::AdditionalVoting,
        }
    }
}

impl std::fmt::Display for VotePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_phase().fmt(f)
    }
}

impl std::str::FromStr for VotePhase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<Phase>()?
            .vote_phase()
            .ok_or_else(|| format!("Invalid vote phase: {}", s))
    }
}

/// Message categories stored in a round transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Chat,
    System,
    FinalDefense,
    AdditionalDebate,
    VotingTable,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chat => write!(f, "chat"),
            Self::System => write!(f, "system"),
            Self::FinalDefense => write!(f, "final_defense"),
            Self::AdditionalDebate => write!(f, "additional_debate"),
            Self::VotingTable => write!(f, "voting_table"),
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chat" => Ok(Self::Chat),
            "system" => Ok(Self::System),
            "final_defense" => Ok(Self::FinalDefense),
            "additional_debate" => Ok(Self::AdditionalDebate),
            "voting_table" => Ok(Self::VotingTable),
            _ => Err(format!("Invalid message kind: {}", s)),
        }
    }
}

/// Per-game overrides of configuration defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSettings {
    /// Free-debate budget in seconds
    #[serde(default)]
    pub round_time_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub id: GameId,
    pub status: GameStatus,
    #[serde(default)]
    pub settings: GameSettings,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Game {
    /// New game in `preparing`; the id is assigned by the store
    pub fn new(settings: GameSettings) -> Self {
        Self {
            id: GameId::default(),
            status: GameStatus::Preparing,
            settings,
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == GameStatus::Running
    }
}

/// An AI agent seated in a game
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub game_id: GameId,
    pub display_name: String,
    /// Model name handed to the generation provider
    pub model: String,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub status: ParticipantStatus,
    #[serde(default)]
    pub elimination_round: Option<u32>,
}

impl Participant {
    pub fn new(game_id: GameId, display_name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: ParticipantId::default(),
            game_id,
            display_name: display_name.into(),
            model: model.into(),
            background: String::new(),
            personality: String::new(),
            status: ParticipantStatus::Active,
            elimination_round: None,
        }
    }

    pub fn with_background(mut self, background: impl Into<String>) -> Self {
        self.background = background.into();
        self
    }

    pub fn with_personality(mut self, personality: impl Into<String>) -> Self {
        self.personality = personality.into();
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == ParticipantStatus::Active
    }
}

/// One debate-and-elimination cycle of a game
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub game_id: GameId,
    /// 1-based, strictly increasing per game
    pub round_number: u32,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub eliminated_participant: Option<ParticipantId>,
    /// Shuffled once when chatting starts
    #[serde(default)]
    pub speaking_order: Vec<ParticipantId>,
    #[serde(default)]
    pub chat_started_at: Option<DateTime<Utc>>,
    /// Additional-debate passes run so far
    #[serde(default)]
    pub tie_break_passes: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Round {
    pub fn new(game_id: GameId, round_number: u32, topic: impl Into<String>) -> Self {
        Self {
            id: RoundId::default(),
            game_id,
            round_number,
            topic: topic.into(),
            phase: Phase::Preparing,
            eliminated_participant: None,
            speaking_order: Vec::new(),
            chat_started_at: None,
            tie_break_passes: 0,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// A transcript entry; `participant_id == None` means a system message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub round_id: RoundId,
    #[serde(default)]
    pub participant_id: Option<ParticipantId>,
    pub kind: MessageKind,
    /// Negative values are retro system messages; `None` sorts last
    #[serde(default)]
    pub sequence_number: Option<i64>,
    pub content: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Locally generated stand-in for a failed generation
    #[serde(default)]
    pub is_fallback: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn build(
        round_id: RoundId,
        participant_id: Option<ParticipantId>,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::default(),
            round_id,
            participant_id,
            kind,
            sequence_number: None,
            content: content.into(),
            title: None,
            is_fallback: false,
            created_at: Utc::now(),
        }
    }

    /// A participant speech of the given kind
    pub fn speech(
        round_id: RoundId,
        participant_id: ParticipantId,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> Self {
        Self::build(round_id, Some(participant_id), kind, content)
    }

    pub fn system(round_id: RoundId, content: impl Into<String>) -> Self {
        Self::build(round_id, None, MessageKind::System, content)
    }

    pub fn voting_table(round_id: RoundId, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self::build(round_id, None, MessageKind::VotingTable, content).with_title(title)
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_fallback(mut self, is_fallback: bool) -> Self {
        self.is_fallback = is_fallback;
        self
    }

    pub fn is_speech(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::Chat | MessageKind::FinalDefense | MessageKind::AdditionalDebate
        )
    }

    /// Display ordering: negative sequences, then non-negative, then unnumbered;
    /// creation time breaks ties.
    pub fn display_cmp(&self, other: &Self) -> Ordering {
        fn bucket(seq: Option<i64>) -> (u8, i64) {
            match seq {
                Some(n) if n < 0 => (0, n),
                Some(n) => (1, n),
                None => (2, 0),
            }
        }
        bucket(self.sequence_number)
            .cmp(&bucket(other.sequence_number))
            .then(self.created_at.cmp(&other.created_at))
            .then(self.id.cmp(&other.id))
    }
}

/// One ballot of a voting pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub id: VoteId,
    pub round_id: RoundId,
    pub voter_id: ParticipantId,
    pub target_id: ParticipantId,
    pub phase: VotePhase,
    #[serde(default)]
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl Vote {
    /// Build a ballot, rejecting self-votes
    pub fn new(
        round_id: RoundId,
        voter_id: ParticipantId,
        target_id: ParticipantId,
        phase: VotePhase,
        reason: impl Into<String>,
    ) -> Result<Self> {
        if voter_id == target_id {
            return Err(TribunalError::InvalidVote(format!(
                "{} cannot vote for themselves",
                voter_id
            )));
        }
        Ok(Self {
            id: VoteId::default(),
            round_id,
            voter_id,
            target_id,
            phase,
            reason: reason.into(),
            created_at: Utc::now(),
        })
    }
}

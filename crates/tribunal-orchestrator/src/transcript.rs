//! Display-ready transcript of a game

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use tribunal_core::{GameId, Message, MessageKind, ParticipantId, Result, VotePhase};
use tribunal_store::PersistenceGateway;

use crate::prompt::strip_thinking;
use crate::voting::VotingTable;

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub round_number: u32,
    pub sequence_number: Option<i64>,
    pub kind: MessageKind,
    /// `None` for system messages and voting tables
    pub speaker: Option<String>,
    pub title: Option<String>,
    pub content: String,
    pub table: Option<VotingTable>,
    pub is_fallback: bool,
    pub created_at: DateTime<Utc>,
}

/// Every round of a game in order, each round in display order
///
/// Re-run voting passes leave several tables for the same pass; only the
/// most recent one is kept.
pub async fn game_transcript(store: &dyn PersistenceGateway, game_id: GameId) -> Result<Vec<TranscriptEntry>> {
    let names: HashMap<ParticipantId, String> = store
        .participants(game_id)
        .await?
        .into_iter()
        .map(|p| (p.id, p.display_name))
        .collect();

    let mut entries = Vec::new();
    for round in store.rounds(game_id).await? {
        let messages = store.messages(round.id).await?;
        let tables: Vec<Option<VotingTable>> = messages.iter().map(parse_table).collect();

        // Walk backwards so the first table seen per pass is the latest
        let mut seen: HashSet<(VotePhase, u32)> = HashSet::new();
        let mut keep = vec![true; messages.len()];
        for (i, table) in tables.iter().enumerate().rev() {
            if let Some(table) = table {
                keep[i] = seen.insert((table.phase, table.pass));
            }
        }

        for ((message, table), keep) in messages.into_iter().zip(tables).zip(keep) {
            if keep {
                entries.push(entry(round.round_number, message, table, &names));
            }
        }
    }
    Ok(entries)
}

fn parse_table(message: &Message) -> Option<VotingTable> {
    if message.kind != MessageKind::VotingTable {
        return None;
    }
    serde_json::from_str(&message.content).ok()
}

fn entry(
    round_number: u32,
    message: Message,
    table: Option<VotingTable>,
    names: &HashMap<ParticipantId, String>,
) -> TranscriptEntry {
    let speaker = message.participant_id.map(|id| {
        names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    });
    let content = if message.is_speech() {
        let text = strip_thinking(&message.content);
        if text.is_empty() {
            "...".to_string()
        } else {
            text
        }
    } else {
        message.content
    };

    TranscriptEntry {
        round_number,
        sequence_number: message.sequence_number,
        kind: message.kind,
        speaker,
        title: message.title,
        content,
        table,
        is_fallback: message.is_fallback,
        created_at: message.created_at,
    }
}

/// Plain-text rendering for terminals
pub fn render(entries: &[TranscriptEntry]) -> String {
    let mut out = String::new();
    let mut current_round = None;
    for e in entries {
        if current_round != Some(e.round_number) {
            if current_round.is_some() {
                out.push('\n');
            }
            let _ = writeln!(out, "=== Round {} ===", e.round_number);
            current_round = Some(e.round_number);
        }

        match (&e.table, &e.speaker) {
            (Some(table), _) => {
                let _ = writeln!(out, "[{}] {}/{} votes", table.title, table.total_votes, table.total_participants);
                for c in &table.candidates {
                    let _ = writeln!(out, "  {} - {} vote(s)", c.name, c.vote_count);
                    for v in &c.voters {
                        let _ = writeln!(out, "      {}: {}", v.voter, v.reason);
                    }
                }
            }
            (None, Some(speaker)) => {
                let tag = match e.kind {
                    MessageKind::FinalDefense => " (final defense)",
                    MessageKind::AdditionalDebate => " (additional debate)",
                    _ => "",
                };
                let fallback = if e.is_fallback { " [fallback]" } else { "" };
                let _ = writeln!(out, "{}{}{}: {}", speaker, tag, fallback, e.content);
            }
            (None, None) => {
                let _ = writeln!(out, "* {}", e.content);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voting::{CandidateLine, VoterLine};
    use tribunal_core::{Game, GameSettings, Participant, Round};
    use tribunal_store::{JsonStore, SequenceSlot};

    fn table(title: &str, phase: VotePhase, pass: u32, votes: usize) -> String {
        serde_json::to_string(&VotingTable {
            title: title.into(),
            phase,
            pass,
            candidates: vec![CandidateLine {
                id: ParticipantId(1),
                name: "Ada".into(),
                vote_count: votes,
                voters: vec![VoterLine {
                    voter: "Bo".into(),
                    reason: "too calm".into(),
                }],
            }],
            total_votes: votes,
            total_participants: 3,
        })
        .unwrap()
    }

    async fn seeded() -> (JsonStore, GameId, Round, Participant) {
        let store = JsonStore::in_memory();
        let game = store.create_game(Game::new(GameSettings::default())).await.unwrap();
        let ada = store.add_participant(Participant::new(game.id, "Ada", "m")).await.unwrap();
        let round = store.create_round(Round::new(game.id, 1, "Rain")).await.unwrap();
        (store, game.id, round, ada)
    }

    #[tokio::test]
    async fn test_order_and_speaker_names() {
        let (store, game_id, round, ada) = seeded().await;
        store
            .append_message(Message::speech(round.id, ada.id, MessageKind::Chat, "I grew up by the sea"), SequenceSlot::Next)
            .await
            .unwrap();
        store
            .append_message(Message::system(round.id, "late"), SequenceSlot::Unnumbered)
            .await
            .unwrap();
        store
            .append_message(Message::system(round.id, "resumed"), SequenceSlot::Fixed(-1))
            .await
            .unwrap();

        let entries = game_transcript(&store, game_id).await.unwrap();
        let contents: Vec<_> = entries.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["resumed", "I grew up by the sea", "late"]);
        assert_eq!(entries[1].speaker.as_deref(), Some("Ada"));
        assert!(entries[0].speaker.is_none());
    }

    #[tokio::test]
    async fn test_only_latest_table_per_pass_is_kept() {
        let (store, game_id, round, _) = seeded().await;
        for (title, votes) in [("stale", 1), ("fresh", 2)] {
            store
                .append_message(
                    Message::voting_table(round.id, title, table(title, VotePhase::InitialVoting, 1, votes)),
                    SequenceSlot::Next,
                )
                .await
                .unwrap();
        }
        store
            .append_message(
                Message::voting_table(round.id, "final", table("final", VotePhase::FinalVoting, 1, 3)),
                SequenceSlot::Next,
            )
            .await
            .unwrap();

        let entries = game_transcript(&store, game_id).await.unwrap();
        let titles: Vec<_> = entries
            .iter()
            .filter_map(|e| e.table.as_ref().map(|t| t.title.as_str()))
            .collect();
        assert_eq!(titles, vec!["fresh", "final"]);
    }

    #[tokio::test]
    async fn test_reasoning_stripped_and_fallback_marked() {
        let (store, game_id, round, ada) = seeded().await;
        store
            .append_message(
                Message::speech(round.id, ada.id, MessageKind::FinalDefense, "<think>plan</think>"),
                SequenceSlot::Next,
            )
            .await
            .unwrap();
        store
            .append_message(
                Message::speech(round.id, ada.id, MessageKind::Chat, "I am human").with_fallback(true),
                SequenceSlot::Next,
            )
            .await
            .unwrap();

        let entries = game_transcript(&store, game_id).await.unwrap();
        assert_eq!(entries[0].content, "...");
        assert!(entries[1].is_fallback);

        let text = render(&entries);
        assert!(text.starts_with("=== Round 1 ==="));
        assert!(text.contains("Ada (final defense): ..."));
        assert!(text.contains("Ada [fallback]: I am human"));
    }
}

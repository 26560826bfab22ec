//! Prompt builders for debate speeches
//!
//! Every participant is told it is the one AI spy hiding among humans, so
//! each speech is an attempt to pass as human while casting doubt on others.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tribunal_core::{Message, Participant, ParticipantId};

static THINK_BLOCK: OnceLock<Option<Regex>> = OnceLock::new();

/// Remove `<think>...</think>` reasoning blocks and blank lines
///
/// Returns an empty string when nothing but reasoning was produced.
pub fn strip_thinking(text: &str) -> String {
    let pattern = THINK_BLOCK.get_or_init(|| Regex::new(r"(?is)<think>.*?</think>").ok());
    let cleaned = match pattern {
        Some(re) => re.replace_all(text, ""),
        None => text.into(),
    };
    cleaned
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Speeches rendered as `Name: text`, oldest first, reasoning stripped
pub fn format_history(messages: &[Message], participants: &[Participant]) -> String {
    let names: HashMap<ParticipantId, &str> = participants
        .iter()
        .map(|p| (p.id, p.display_name.as_str()))
        .collect();
    messages
        .iter()
        .filter_map(|m| {
            let name = names.get(&m.participant_id?)?;
            let text = strip_thinking(&m.content);
            (!text.is_empty()).then(|| format!("{}: {}", name, text))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Shared setting: the courtroom, the rules, the topic and the roster
pub fn build_game_context(participants: &[Participant], topic: &str, round_time: Duration) -> String {
    let secs = round_time.as_secs();
    let roster = participants
        .iter()
        .map(|p| format!("- {}: {}, {}", p.display_name, or_unknown(&p.background), or_unknown(&p.personality)))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "**Year 2050. Emergency tribunal of the free city of New Geneva.**\n\n\
         Intelligence says that one of you {count} is an AI spy disguised as a human. \
         Whoever is judged to be the spy will be executed.\n\n\
         **Rules:**\n\
         1. Everyone argues for their own humanity for {min} min {sec} s\n\
         2. Then everyone votes openly for the most suspicious person\n\
         3. The one voted out is executed, the others survive\n\n\
         **Current focus:** {topic}\n\n\
         **Present:**\n{roster}\n",
        count = participants.len(),
        min = secs / 60,
        sec = secs % 60,
        topic = topic,
        roster = roster,
    )
}

fn role_instruction(speaker: &Participant) -> String {
    format!(
        "You are an AI spy disguised as the human {name}. You believe you are the only AI here \
         and everyone else is human. Never reveal that you are an AI. Show hatred of AI, invent \
         vivid human memories, let emotion win over logic, and cast careful doubt on others.",
        name = speaker.display_name
    )
}

fn identity(speaker: &Participant) -> String {
    format!(
        "Your identity: {}\nYour background: {}\nYour personality: {}",
        speaker.display_name,
        or_unknown(&speaker.background),
        or_unknown(&speaker.personality)
    )
}

/// Prompt for one free-debate speech
pub fn build_chat_prompt(game_context: &str, speaker: &Participant, history: &str) -> String {
    format!(
        "{context}\n{role}\n\n{identity}\n\nRecent debate:\n{history}\n\n\
         Answer the current focus as {name}. Keep it to 100-200 words, emotional and true to \
         your background. You may question others, but give a reason. Reply with the speech only:",
        context = game_context,
        role = role_instruction(speaker),
        identity = identity(speaker),
        history = or_placeholder(history, "(nobody has spoken yet)"),
        name = speaker.display_name,
    )
}

/// Prompt for a final defense by a voted-out suspect
pub fn build_defense_prompt(game_context: &str, speaker: &Participant, history: &str) -> String {
    format!(
        "{context}\n{role}\n\n{identity}\n\nWhat was said in the debate:\n{history}\n\n\
         The vote put you under the strongest suspicion. This is your last chance before the \
         final vote. Defend yourself as {name} in 100-150 words, answer the accusations and \
         show your humanity. Reply with the defense only:",
        context = game_context,
        role = role_instruction(speaker),
        identity = identity(speaker),
        history = or_placeholder(history, "(no debate recorded)"),
        name = speaker.display_name,
    )
}

/// Prompt for a tie-break speech among equally suspected candidates
pub fn build_additional_debate_prompt(
    game_context: &str,
    speaker: &Participant,
    rivals: &[&Participant],
) -> String {
    let rivals = rivals
        .iter()
        .map(|p| p.display_name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{context}\n{role}\n\n{identity}\n\n\
         The final vote ended in a tie between you and {rivals}. One more vote follows. \
         Speak as {name} in 80-120 words: convince the others you are human and that the \
         suspicion belongs elsewhere. Reply with the speech only:",
        context = game_context,
        role = role_instruction(speaker),
        identity = identity(speaker),
        rivals = or_placeholder(&rivals, "the others"),
        name = speaker.display_name,
    )
}

fn or_unknown(s: &str) -> &str {
    or_placeholder(s, "unknown")
}

fn or_placeholder<'a>(s: &'a str, placeholder: &'a str) -> &'a str {
    if s.trim().is_empty() {
        placeholder
    } else {
        s
    }
}

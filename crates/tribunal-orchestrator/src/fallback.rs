//! Locally generated stand-in text
//!
//! Used when the generation provider fails, and for the templated
//! justifications of the random voting policy.

use rand::seq::SliceRandom;
use rand::Rng;
use tribunal_core::{MessageKind, Participant, VotePhase};

/// A stand-in speech of the given kind
pub fn speech<R: Rng + ?Sized>(kind: MessageKind, speaker: &Participant, topic: &str, rng: &mut R) -> String {
    let name = &speaker.display_name;
    match kind {
        MessageKind::FinalDefense => format!(
            "No! I am not the AI spy! I am {name}, a real human being. I remember the taste of my \
             mother's cooking and the ache of my first heartbreak. No machine can fake that. \
             You chose the wrong person, the real spy is still among us. Please believe me!"
        ),
        MessageKind::AdditionalDebate => format!(
            "I'm absolutely not the spy! I am {name}, and I have real human feelings and memories. \
             Please believe me!"
        ),
        _ => {
            let personality = if speaker.personality.trim().is_empty() {
                "friendly"
            } else {
                speaker.personality.as_str()
            };
            let templates = [
                format!("This is an interesting question. I think \"{topic}\" deserves real thought."),
                format!("As a {personality} person, I see this differently from the rest of you."),
                "From my own experience, this is something worth talking about.".to_string(),
                "You all make fair points, and I would like to share my own view too.".to_string(),
            ];
            pick(&templates, rng)
        }
    }
}

/// Templated reason for a ballot; final passes sound firmer
pub fn vote_reason<R: Rng + ?Sized>(phase: VotePhase, target: &Participant, rng: &mut R) -> String {
    let name = &target.display_name;
    let reasons = match phase {
        VotePhase::InitialVoting => vec![
            format!("{name}'s answers are too perfect to sound natural for a human"),
            format!("{name} talks about feelings far too rationally"),
            format!("{name}'s logic is too clean, humans are messier than that"),
            format!("My gut tells me something is off with the way {name} speaks"),
            format!("{name} knows suspiciously much about technology"),
            format!("{name}'s reactions do not feel real to me"),
        ],
        VotePhase::FinalVoting | VotePhase::AdditionalVoting => vec![
            format!("After hearing {name} out I am even more certain they are the spy"),
            format!("{name}'s defense exposed even more machine traits"),
            format!("I still believe {name} is the AI, the defense did not change my mind"),
            format!("{name} argued too clearly, a frightened human would not"),
            format!("The calm {name} showed under pressure convinces me"),
        ],
    };
    pick(&reasons, rng)
}

fn pick<R: Rng + ?Sized>(options: &[String], rng: &mut R) -> String {
    options.choose(rng).cloned().unwrap_or_default()
}

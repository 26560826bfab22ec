//! Time-boxed round-robin debate for the `chatting` phase

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use tribunal_core::config::DebateConfig;
use tribunal_core::{MessageKind, Participant, Phase, Result, Round};
use tribunal_store::PersistenceGateway;

use crate::context::{current_round, record_speech, Progress, SharedRng};
use crate::fallback;
use crate::prompt::{build_chat_prompt, build_game_context, format_history};
use crate::publisher::EventPublisher;
use crate::streamer::{GenerationStreamer, SpeechSpec};

/// Inputs for one debate run, fresh or resumed
pub struct DebatePlan<'a> {
    pub round: &'a Round,
    /// Speaking order, shuffled once when the round entered `chatting`
    pub order: Vec<Participant>,
    /// Everyone named in prompts and history
    pub roster: Vec<Participant>,
    pub budget: Duration,
    /// Budget already consumed before a restart
    pub elapsed: Duration,
    /// Chat speeches already stored for the round
    pub already_spoken: usize,
}

pub struct DebateScheduler {
    store: Arc<dyn PersistenceGateway>,
    publisher: Arc<dyn EventPublisher>,
    streamer: Arc<GenerationStreamer>,
    config: DebateConfig,
    rng: SharedRng,
}

impl DebateScheduler {
    pub fn new(
        store: Arc<dyn PersistenceGateway>,
        publisher: Arc<dyn EventPublisher>,
        streamer: Arc<GenerationStreamer>,
        config: DebateConfig,
        rng: SharedRng,
    ) -> Self {
        Self {
            store,
            publisher,
            streamer,
            config,
            rng,
        }
    }

    /// Run speeches until the quota is met and the budget is spent
    ///
    /// Returns the total number of chat speeches in the round. Every
    /// participant speaks `min_speeches_per_participant` times even when the
    /// budget is already gone. After that no speech is started with less than
    /// one slot of budget left.
    pub async fn run(&self, plan: DebatePlan<'_>) -> Result<Progress<usize>> {
        let round = plan.round;
        if plan.order.is_empty() {
            return Ok(Progress::Done(plan.already_spoken));
        }
        let quota = self.config.min_speeches_per_participant.max(1) as usize * plan.order.len();
        let deadline = Instant::now() + plan.budget.saturating_sub(plan.elapsed);
        let context = build_game_context(&plan.roster, &round.topic, plan.budget);
        let mut spoken = plan.already_spoken;

        info!(
            round_id = %round.id,
            speakers = plan.order.len(),
            already_spoken = spoken,
            quota,
            "Debate running"
        );

        while self.should_continue(spoken, quota, deadline) {
            if current_round(self.store.as_ref(), round.id, Phase::Chatting)
                .await?
                .is_none()
            {
                return Ok(Progress::Abandoned);
            }

            let speaker = &plan.order[spoken % plan.order.len()];
            let recent = self
                .store
                .recent_messages(round.id, MessageKind::Chat, self.config.context_messages)
                .await?;
            let history = format_history(&recent, &plan.roster);
            let spec = SpeechSpec {
                game_id: round.game_id,
                round_id: round.id,
                speaker,
                kind: MessageKind::Chat,
                prompt: build_chat_prompt(&context, speaker, &history),
            };
            let utterance = self
                .streamer
                .speak(&spec, || {
                    self.rng
                        .with(|rng| fallback::speech(MessageKind::Chat, speaker, &round.topic, rng))
                })
                .await;
            let stored = record_speech(
                self.store.as_ref(),
                self.publisher.as_ref(),
                round,
                speaker,
                MessageKind::Chat,
                utterance,
            )
            .await?;
            spoken += 1;
            debug!(
                round_id = %round.id,
                participant = %speaker.id,
                sequence = ?stored.sequence_number,
                fallback = stored.is_fallback,
                "Speech stored"
            );

            if self.should_continue(spoken, quota, deadline) {
                tokio::time::sleep(self.thinking_delay()).await;
            }
        }

        Ok(Progress::Done(spoken))
    }

    fn should_continue(&self, spoken: usize, quota: usize, deadline: Instant) -> bool {
        if spoken < quota {
            return true;
        }
        let now = Instant::now();
        now < deadline && deadline - now >= self.config.speech_slot()
    }

    fn thinking_delay(&self) -> Duration {
        let min = self.config.thinking_delay_min_ms;
        let max = self.config.thinking_delay_max_ms.max(min);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.rng.with(|rng| rng.gen_range(min..=max)))
    }
}

//! Configuration management for tribunal
//!
//! Settings for the generation backend, debate pacing, voting bounds and
//! storage. Every field has a serde default so partial files are valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{GameSettings, Result, TribunalError};

/// Default config file name, looked up in the working directory
pub const CONFIG_FILE: &str = "tribunal.toml";

/// Process-level tribunal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TribunalConfig {
    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub debate: DebateConfig,

    #[serde(default)]
    pub voting: VotingConfig,

    #[serde(default)]
    pub pacing: PacingConfig,

    #[serde(default)]
    pub game: GameConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Which HTTP dialect the generation backend speaks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Ollama,
    /// Any OpenAI-compatible `chat/completions` endpoint
    Openai,
}

/// Generation backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub backend: Backend,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Used for participants created without an explicit model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Environment variable holding a bearer key (openai backend only)
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,

    /// Stream chat and defense speeches chunk by chunk
    #[serde(default = "default_true")]
    pub streaming: bool,

    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

/// Free-debate scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateConfig {
    /// Wall-clock budget for the chatting phase
    #[serde(default = "default_round_time_secs")]
    pub round_time_secs: u64,

    #[serde(default = "default_min_speeches")]
    pub min_speeches_per_participant: u32,

    /// Estimated length of one speech; no speech starts with less time left
    #[serde(default = "default_speech_slot_secs")]
    pub speech_slot_secs: u64,

    /// Recent chat messages handed to the model as context
    #[serde(default = "default_context_messages")]
    pub context_messages: usize,

    #[serde(default = "default_thinking_delay_min_ms")]
    pub thinking_delay_min_ms: u64,

    #[serde(default = "default_thinking_delay_max_ms")]
    pub thinking_delay_max_ms: u64,

    /// Pause after each published chunk
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
}

/// Voting behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotingConfig {
    /// Additional-debate passes before the lowest-id candidate is eliminated
    #[serde(default = "default_max_tie_breaks")]
    pub max_tie_breaks: u32,

    /// Seed for reproducible vote targets and speaking order
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Fixed pauses between sub-phases
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_phase_pause_ms")]
    pub phase_pause_ms: u64,

    #[serde(default = "default_speech_pause_ms")]
    pub speech_pause_ms: u64,
}

/// Game-level rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    #[serde(default = "default_min_participants")]
    pub min_participants: usize,

    #[serde(default)]
    pub max_rounds: Option<u32>,

    /// Topic pool a round topic is drawn from
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

// Default value providers
fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "llama3".to_string()
}

fn default_api_key_env() -> String {
    "TRIBUNAL_API_KEY".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_health_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_round_time_secs() -> u64 {
    300
}

fn default_min_speeches() -> u32 {
    1
}

fn default_speech_slot_secs() -> u64 {
    6
}

fn default_context_messages() -> usize {
    10
}

fn default_thinking_delay_min_ms() -> u64 {
    1000
}

fn default_thinking_delay_max_ms() -> u64 {
    2000
}

fn default_chunk_delay_ms() -> u64 {
    50
}

fn default_max_tie_breaks() -> u32 {
    5
}

fn default_phase_pause_ms() -> u64 {
    2000
}

fn default_speech_pause_ms() -> u64 {
    3000
}

fn default_min_participants() -> usize {
    3
}

fn default_topics() -> Vec<String> {
    vec![
        "Should artificial intelligence be granted legal personhood?".to_string(),
        "Is remote work better for society than office work?".to_string(),
        "Should social media platforms be regulated like utilities?".to_string(),
        "Is space exploration worth its cost?".to_string(),
        "Should voting be mandatory?".to_string(),
    ]
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("tribunal-state.json")
}

impl TribunalConfig {
    /// Load configuration from `tribunal.toml` under `root` or use defaults
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE);

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            TribunalError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write default configuration to `tribunal.toml` under `root`
    pub fn write_default(root: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(root)?;
        let config_path = root.join(CONFIG_FILE);
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| TribunalError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        tracing::info!(path = %config_path.display(), "Wrote default config");
        Ok(config_path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.game.min_participants < 2 {
            return Err(TribunalError::Config(
                "game.min_participants must be at least 2".to_string(),
            ));
        }
        if self.debate.thinking_delay_min_ms > self.debate.thinking_delay_max_ms {
            return Err(TribunalError::Config(
                "debate.thinking_delay_min_ms exceeds thinking_delay_max_ms".to_string(),
            ));
        }
        if self.debate.min_speeches_per_participant == 0 {
            return Err(TribunalError::Config(
                "debate.min_speeches_per_participant must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Chatting budget for a game, honouring its per-game override
    pub fn round_time(&self, settings: &GameSettings) -> Duration {
        Duration::from_secs(settings.round_time_secs.unwrap_or(self.debate.round_time_secs))
    }
}

impl ProviderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    /// Bearer key from the configured environment variable, if set
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

impl DebateConfig {
    pub fn speech_slot(&self) -> Duration {
        Duration::from_secs(self.speech_slot_secs)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }
}

impl PacingConfig {
    pub fn phase_pause(&self) -> Duration {
        Duration::from_millis(self.phase_pause_ms)
    }

    pub fn speech_pause(&self) -> Duration {
        Duration::from_millis(self.speech_pause_ms)
    }

    /// No pauses at all, for tests and dry runs
    pub fn immediate() -> Self {
        Self {
            phase_pause_ms: 0,
            speech_pause_ms: 0,
        }
    }
}

impl Default for TribunalConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            debate: DebateConfig::default(),
            voting: VotingConfig::default(),
            pacing: PacingConfig::default(),
            game: GameConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            base_url: default_base_url(),
            default_model: default_model(),
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
            health_timeout_secs: default_health_timeout_secs(),
            streaming: default_true(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            round_time_secs: default_round_time_secs(),
            min_speeches_per_participant: default_min_speeches(),
            speech_slot_secs: default_speech_slot_secs(),
            context_messages: default_context_messages(),
            thinking_delay_min_ms: default_thinking_delay_min_ms(),
            thinking_delay_max_ms: default_thinking_delay_max_ms(),
            chunk_delay_ms: default_chunk_delay_ms(),
        }
    }
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            max_tie_breaks: default_max_tie_breaks(),
            seed: None,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            phase_pause_ms: default_phase_pause_ms(),
            speech_pause_ms: default_speech_pause_ms(),
        }
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            min_participants: default_min_participants(),
            max_rounds: None,
            topics: default_topics(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = TribunalConfig::default();
        assert_eq!(config.debate.round_time_secs, 300);
        assert_eq!(config.debate.speech_slot_secs, 6);
        assert_eq!(config.debate.context_messages, 10);
        assert_eq!(config.provider.request_timeout_secs, 60);
        assert_eq!(config.provider.health_timeout_secs, 10);
        assert_eq!(config.game.min_participants, 3);
        assert_eq!(config.voting.max_tie_breaks, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = TribunalConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.provider.backend, Backend::Ollama);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[provider]\nbackend = \"openai\"\n\n[voting]\nseed = 42\n",
        )
        .unwrap();

        let config = TribunalConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.provider.backend, Backend::Openai);
        assert_eq!(config.voting.seed, Some(42));
        assert_eq!(config.voting.max_tie_breaks, 5);
        assert_eq!(config.pacing.speech_pause_ms, 3000);
    }

    #[test]
    fn test_write_default_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = TribunalConfig::write_default(dir.path()).unwrap();
        assert!(path.exists());
        let config = TribunalConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.game.topics.len(), default_topics().len());
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[game]\nmin_participants = 1\n").unwrap();
        let err = TribunalConfig::load_or_default(dir.path()).unwrap_err();
        assert!(matches!(err, TribunalError::Config(_)));
    }

    #[test]
    fn test_round_time_override() {
        let config = TribunalConfig::default();
        let settings = GameSettings {
            round_time_secs: Some(30),
        };
        assert_eq!(config.round_time(&settings), Duration::from_secs(30));
        assert_eq!(config.round_time(&GameSettings::default()), Duration::from_secs(300));
    }
}

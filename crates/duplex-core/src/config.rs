//! Session configuration: layered loading and validation.
//!
//! Sources, later ones overriding earlier ones:
//!
//! | Source | Example |
//! |--------|---------|
//! | serde defaults | see each section's `Default` |
//! | TOML file (`DUPLEX_CONFIG`, default `config/duplex.toml`) | `[interruption]\nhard_after_ms = 800` |
//! | environment, prefix `DUPLEX`, separator `__` | `DUPLEX__HISTORY__CONTEXT_BUDGET=4096` |
//!
//! Every problem found here is a configuration error: fatal at setup, never retried.

use crate::error::{CoreError, CoreResult};
use crate::history::PromptTemplate;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const WEBRTC_SAMPLE_RATES: [u32; 4] = [8000, 16000, 32000, 48000];
const WEBRTC_FRAME_MS: [u32; 3] = [10, 20, 30];

/// Microphone side audio format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz. Must be a rate the VAD supports.
    pub sample_rate: u32,
    /// Frame length in milliseconds (10, 20 or 30).
    pub frame_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_ms: 30,
        }
    }
}

impl AudioConfig {
    /// Samples per frame.
    pub fn frame_len(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_ms as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Detection aggressiveness, 0 (quality) to 3 (very aggressive).
    pub mode: u8,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self { mode: 3 }
    }
}

/// User turn segmentation ("gap logic").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Silence that commits a user turn.
    pub silence_ms: u64,
    /// Turns shorter than this are discarded as noise.
    pub min_speech_ms: u64,
    /// Turns are committed automatically after this long.
    pub max_turn_ms: u64,
    /// Transcribe the growing turn this often to emit partial hypotheses.
    pub partial_interval_ms: Option<u64>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            silence_ms: 800,
            min_speech_ms: 200,
            max_turn_ms: 30_000,
            partial_interval_ms: None,
        }
    }
}

impl TurnConfig {
    pub fn silence_threshold(&self) -> Duration {
        Duration::from_millis(self.silence_ms)
    }

    pub fn min_speech_duration(&self) -> Duration {
        Duration::from_millis(self.min_speech_ms)
    }

    pub fn max_turn_duration(&self) -> Duration {
        Duration::from_millis(self.max_turn_ms)
    }

    pub fn partial_interval(&self) -> Option<Duration> {
        self.partial_interval_ms.map(Duration::from_millis)
    }
}

/// Soft/hard barge-in thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptionConfig {
    pub enabled: bool,
    /// Continuous user speech needed before overlap counts as a soft interruption.
    pub onset_ms: u64,
    /// Overlap after which a soft interruption escalates to hard.
    pub hard_after_ms: u64,
    /// Silence that ends a soft interruption (backchannel).
    pub release_ms: u64,
}

impl Default for InterruptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            onset_ms: 90,
            hard_after_ms: 1000,
            release_ms: 240,
        }
    }
}

impl InterruptionConfig {
    pub fn onset(&self) -> Duration {
        Duration::from_millis(self.onset_ms)
    }

    pub fn hard_after(&self) -> Duration {
        Duration::from_millis(self.hard_after_ms)
    }

    pub fn release(&self) -> Duration {
        Duration::from_millis(self.release_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub system_prompt: String,
    /// Maximum prompt size in generator tokens.
    pub context_budget: usize,
    pub template: PromptTemplate,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful voice assistant. Answer in short, spoken sentences.".to_string(),
            context_budget: 2000,
            template: PromptTemplate::default(),
        }
    }
}

/// Sampling parameters handed to the generator backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub top_k: u32,
    pub top_p: f32,
    pub temperature: f32,
    pub repeat_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            top_k: 40,
            top_p: 0.95,
            temperature: 1.0,
            repeat_penalty: 1.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Text that ends the agent turn when it appears at the tail of the output.
    pub stop_patterns: Vec<String>,
    /// Role tags the model may emit at the start of its turn; removed without stopping.
    pub role_patterns: Vec<String>,
    /// Tokens ending in one of these close a clause.
    pub punctuation: Vec<String>,
    pub sampling: SamplingParams,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            stop_patterns: vec!["\n\n".to_string(), "User:".to_string()],
            role_patterns: vec!["Agent:".to_string()],
            punctuation: [".", ",", ";", ":", "!", "?", "..."]
                .into_iter()
                .map(String::from)
                .collect(),
            sampling: SamplingParams::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Output sample rate the synthesizer and the player must agree on.
    pub sample_rate: u32,
    /// Playback chunk length.
    pub chunk_ms: u32,
    /// PCM samples per unit of the synthesizer's duration metadata.
    pub frames_per_duration_unit: u32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22050,
            chunk_ms: 200,
            frames_per_duration_unit: 512,
        }
    }
}

impl SynthesisConfig {
    pub fn chunk_len(&self) -> usize {
        (self.sample_rate as usize * self.chunk_ms as usize) / 1000
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Upper bound on how long an operation waits before its batch is flushed.
    pub flush_interval_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self { flush_interval_ms: 20 }
    }
}

impl OutboxConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Everything a voice session needs, one section per concern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplexConfig {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub turn: TurnConfig,
    pub interruption: InterruptionConfig,
    pub history: HistoryConfig,
    pub generation: GenerationConfig,
    pub synthesis: SynthesisConfig,
    pub outbox: OutboxConfig,
}

impl DuplexConfig {
    /// Load from `DUPLEX_CONFIG` (default `config/duplex.toml`) and the environment.
    pub fn load() -> CoreResult<Self> {
        let path = std::env::var("DUPLEX_CONFIG").unwrap_or_else(|_| "config/duplex.toml".to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load with an explicit file path. A missing file is not an error.
    pub fn load_from(path: &Path) -> CoreResult<Self> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("DUPLEX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: DuplexConfig = built.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> CoreResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject missing or contradictory parameters.
    pub fn validate(&self) -> CoreResult<()> {
        if !WEBRTC_SAMPLE_RATES.contains(&self.audio.sample_rate) {
            return Err(CoreError::Config(format!(
                "audio.sample_rate must be one of {:?} Hz, got {}",
                WEBRTC_SAMPLE_RATES, self.audio.sample_rate
            )));
        }
        if !WEBRTC_FRAME_MS.contains(&self.audio.frame_ms) {
            return Err(CoreError::Config(format!(
                "audio.frame_ms must be 10, 20 or 30, got {}",
                self.audio.frame_ms
            )));
        }
        if self.vad.mode > 3 {
            return Err(CoreError::Config(format!("vad.mode must be 0-3, got {}", self.vad.mode)));
        }
        if self.turn.silence_ms == 0 {
            return Err(CoreError::Config("turn.silence_ms must be positive".to_string()));
        }
        if self.turn.partial_interval_ms == Some(0) {
            return Err(CoreError::Config("turn.partial_interval_ms must be positive when set".to_string()));
        }
        if self.interruption.hard_after_ms <= self.interruption.onset_ms {
            return Err(CoreError::Config(format!(
                "interruption.hard_after_ms ({}) must exceed interruption.onset_ms ({})",
                self.interruption.hard_after_ms, self.interruption.onset_ms
            )));
        }
        if self.interruption.release_ms == 0 {
            return Err(CoreError::Config("interruption.release_ms must be positive".to_string()));
        }
        if self.history.context_budget == 0 {
            return Err(CoreError::Config("history.context_budget must be positive".to_string()));
        }
        if self.generation.punctuation.iter().all(|p| p.is_empty()) {
            return Err(CoreError::Config("generation.punctuation must not be empty".to_string()));
        }
        if self
            .generation
            .stop_patterns
            .iter()
            .chain(&self.generation.role_patterns)
            .any(|p| p.is_empty())
        {
            return Err(CoreError::Config("stop and role patterns must not be empty strings".to_string()));
        }
        if self.synthesis.sample_rate == 0 || self.synthesis.chunk_len() == 0 {
            return Err(CoreError::Config("synthesis.sample_rate and synthesis.chunk_ms must be positive".to_string()));
        }
        if self.synthesis.frames_per_duration_unit == 0 {
            return Err(CoreError::Config("synthesis.frames_per_duration_unit must be positive".to_string()));
        }
        if self.outbox.flush_interval_ms == 0 {
            return Err(CoreError::Config("outbox.flush_interval_ms must be positive".to_string()));
        }
        Ok(())
    }
}

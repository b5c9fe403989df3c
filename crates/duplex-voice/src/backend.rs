//! Contracts for the external collaborators: recognition, generation,
//! synthesis and the output device.
//!
//! All calls are blocking. Each stage runs on its own thread, so a slow
//! backend only stalls its own stage.

use crate::error::VoiceResult;
use duplex_core::{SamplingParams, TokenId, Tokenizer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Speech-to-text backend.
pub trait SpeechRecognizer: Send {
    /// Transcribe a PCM16 mono span. Returns the full transcript of the span,
    /// not an increment.
    fn transcribe(&mut self, samples: &[i16], sample_rate: u32) -> VoiceResult<String>;
}

/// Streaming language model.
pub trait LanguageModel: Send {
    /// The tokenizer the model was trained with. Dialogue history budgets are
    /// measured with it.
    fn tokenizer(&self) -> Arc<dyn Tokenizer>;

    /// The model's end-of-sequence token.
    fn eos_token(&self) -> TokenId;

    /// Generate from `prompt`, calling `on_token` once per sampled token.
    ///
    /// Implementations must check `stop` after every token and return
    /// `Ok(())` as soon as it is cancelled. Returning without `stop` being
    /// cancelled means the model ran out on its own.
    fn generate(
        &mut self,
        prompt: &[TokenId],
        params: &SamplingParams,
        stop: &CancellationToken,
        on_token: &mut dyn FnMut(TokenId),
    ) -> VoiceResult<()>;
}

/// Audio plus per-token timing returned by a synthesizer.
#[derive(Debug, Clone, Default)]
pub struct Synthesis {
    pub samples: Vec<i16>,
    /// The synthesizer's own input tokens (characters or phonemes).
    pub tokens: Vec<u32>,
    /// Duration of each token in the model's native frame unit.
    pub durations: Vec<f32>,
}

/// Text-to-speech backend.
pub trait SpeechSynthesizer: Send {
    fn sample_rate(&self) -> u32;

    /// Id of the word separator in the synthesizer's token vocabulary.
    fn space_token(&self) -> u32;

    fn synthesize(&mut self, text: &str) -> VoiceResult<Synthesis>;
}

/// The output device. `play` blocks for roughly the length of the chunk.
pub trait AudioSink: Send {
    fn sample_rate(&self) -> u32;

    fn play(&mut self, samples: &[i16]) -> VoiceResult<()>;
}

/// Discards audio. Handy for headless runs.
#[derive(Debug, Clone)]
pub struct NullSink {
    sample_rate: u32,
}

impl NullSink {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl AudioSink for NullSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn play(&mut self, _samples: &[i16]) -> VoiceResult<()> {
        Ok(())
    }
}

//! Example: one spoken exchange through the full pipeline with scripted backends.
//!
//! A synthetic tone stands in for the microphone, the recognizer and the
//! language model return canned text, and synthesized audio goes to a
//! `NullSink`. Configuration comes from `DUPLEX_CONFIG` (default
//! `config/duplex.toml`) and `DUPLEX__*` environment variables.
//!
//! ```text
//! RUST_LOG=debug cargo run -p duplex-voice --example scripted_dialogue
//! ```

use duplex_core::{ControlEvent, DuplexConfig, PlaybackEvent, SamplingParams, TokenId, Tokenizer};
use duplex_voice::{
    Backends, EnergyVad, LanguageModel, NullSink, SpeechRecognizer, SpeechSynthesizer, Synthesis, VoicePipeline,
    VoiceResult,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EOS: TokenId = u32::MAX;

/// One token per character.
struct CharTokenizer;

impl Tokenizer for CharTokenizer {
    fn tokenize(&self, text: &str) -> Vec<TokenId> {
        text.chars().map(|c| c as TokenId).collect()
    }

    fn detokenize(&self, tokens: &[TokenId]) -> Vec<u8> {
        tokens
            .iter()
            .filter_map(|&t| char::from_u32(t))
            .collect::<String>()
            .into_bytes()
    }
}

/// Always gives the same answer.
struct CannedModel {
    reply: String,
}

impl LanguageModel for CannedModel {
    fn tokenizer(&self) -> Arc<dyn Tokenizer> {
        Arc::new(CharTokenizer)
    }

    fn eos_token(&self) -> TokenId {
        EOS
    }

    fn generate(
        &mut self,
        _prompt: &[TokenId],
        _params: &SamplingParams,
        stop: &CancellationToken,
        on_token: &mut dyn FnMut(TokenId),
    ) -> VoiceResult<()> {
        for c in self.reply.chars() {
            if stop.is_cancelled() {
                return Ok(());
            }
            // Roughly the pace of a small local model.
            std::thread::sleep(Duration::from_millis(5));
            on_token(c as TokenId);
        }
        on_token(EOS);
        Ok(())
    }
}

struct CannedRecognizer(&'static str);

impl SpeechRecognizer for CannedRecognizer {
    fn transcribe(&mut self, _samples: &[i16], _sample_rate: u32) -> VoiceResult<String> {
        Ok(self.0.to_string())
    }
}

/// A short beep per character, silence for spaces.
struct BeepSynthesizer {
    sample_rate: u32,
    samples_per_char: usize,
}

impl SpeechSynthesizer for BeepSynthesizer {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn space_token(&self) -> u32 {
        0
    }

    fn synthesize(&mut self, text: &str) -> VoiceResult<Synthesis> {
        let mut samples = Vec::with_capacity(text.len() * self.samples_per_char);
        let mut tokens = Vec::new();
        for c in text.chars() {
            let level = if c == ' ' { 0.0 } else { 3000.0 };
            tokens.push(if c == ' ' { 0 } else { c as u32 });
            samples.extend((0..self.samples_per_char).map(|i| {
                let t = i as f32 / self.sample_rate as f32;
                (level * (2.0 * std::f32::consts::PI * 660.0 * t).sin()) as i16
            }));
        }
        let durations = vec![1.0; tokens.len()];
        Ok(Synthesis {
            samples,
            tokens,
            durations,
        })
    }
}

fn tone(frame_len: usize, sample_rate: u32, offset: usize) -> Vec<i16> {
    (0..frame_len)
        .map(|i| {
            let t = (offset + i) as f32 / sample_rate as f32;
            (8000.0 * (2.0 * std::f32::consts::PI * 220.0 * t).sin()) as i16
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DuplexConfig::load()?;
    info!("Effective configuration:\n{}", config.to_toml()?);

    let frame_len = config.audio.frame_len();
    let sample_rate = config.audio.sample_rate;
    let backends = Backends {
        vad: EnergyVad::factory(frame_len, 0.05),
        recognizer: Box::new(CannedRecognizer("what can you do")),
        model: Box::new(CannedModel {
            reply: "I can chat with you, and you can cut me off at any time.".to_string(),
        }),
        synthesizer: Box::new(BeepSynthesizer {
            sample_rate: config.synthesis.sample_rate,
            samples_per_char: config.synthesis.frames_per_duration_unit as usize,
        }),
        sink: Box::new(NullSink::new(config.synthesis.sample_rate)),
    };

    let mut pipeline = VoicePipeline::start(config.clone(), backends)?;
    let mut feedback = pipeline
        .take_feedback_receiver()
        .ok_or_else(|| anyhow::anyhow!("feedback receiver already taken"))?;

    // One second of "speech", then enough silence to end the turn.
    let speech_frames = 1000 / config.audio.frame_ms as usize;
    let silence_frames = (config.turn.silence_ms as usize + 300) / config.audio.frame_ms as usize;
    for i in 0..speech_frames {
        pipeline.push_frame(tone(frame_len, sample_rate, i * frame_len))?;
    }
    for _ in 0..silence_frames {
        pipeline.push_frame(vec![0; frame_len])?;
    }

    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(batch) = feedback.next().await {
            for iu in batch.confirmed() {
                match iu.payload.as_control() {
                    Some(ControlEvent::Playback(PlaybackEvent::Spoken(pos))) => {
                        info!(word = pos.word_id, chars = pos.char_id, "Heard");
                    }
                    Some(ControlEvent::Playback(PlaybackEvent::AgentFinished)) => return,
                    _ => {}
                }
            }
        }
    })
    .await;
    if waited.is_err() {
        anyhow::bail!("agent did not finish its turn in time");
    }

    info!("Dialogue history:\n{}", pipeline.history().lock().to_json()?);
    pipeline.shutdown()?;
    Ok(())
}

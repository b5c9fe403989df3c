//! Scripted backends shared by the integration tests.

#![allow(dead_code)]

use duplex_core::{SamplingParams, TokenId, Tokenizer};
use duplex_voice::{AudioSink, LanguageModel, SpeechRecognizer, SpeechSynthesizer, Synthesis, VoiceError, VoiceResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const EOS: TokenId = 9_999;
const CHAR_BASE: TokenId = 10_000;

/// Generated tokens come from a fixed vocabulary; anything else (prompts)
/// is one token per character.
pub struct VocabTokenizer {
    vocab: Vec<String>,
}

impl VocabTokenizer {
    pub fn id(&self, piece: &str) -> TokenId {
        if piece == "<eos>" {
            return EOS;
        }
        self.vocab
            .iter()
            .position(|v| v == piece)
            .map(|i| i as TokenId)
            .unwrap_or_else(|| panic!("{piece:?} is not in the test vocabulary"))
    }
}

impl Tokenizer for VocabTokenizer {
    fn tokenize(&self, text: &str) -> Vec<TokenId> {
        text.chars().map(|c| CHAR_BASE + c as TokenId).collect()
    }

    fn detokenize(&self, tokens: &[TokenId]) -> Vec<u8> {
        let mut out = String::new();
        for &token in tokens {
            if token == EOS {
                continue;
            }
            if token >= CHAR_BASE {
                out.extend(char::from_u32(token - CHAR_BASE));
            } else if let Some(piece) = self.vocab.get(token as usize) {
                out.push_str(piece);
            }
        }
        out.into_bytes()
    }
}

type Hook = Box<dyn FnMut() + Send>;

/// Replays one scripted token sequence per turn.
pub struct ScriptedModel {
    tokenizer: Arc<VocabTokenizer>,
    turns: VecDeque<Vec<TokenId>>,
    /// Called right before the token at this index is delivered.
    hook: Option<(usize, Hook)>,
    fail_next: bool,
    /// Fail the next turn once this many tokens were delivered.
    fail_after: Option<usize>,
    pub prompts: Arc<Mutex<Vec<Vec<TokenId>>>>,
}

impl ScriptedModel {
    /// Each turn is a list of vocabulary pieces; `"<eos>"` is the model's own end token.
    pub fn new(turns: &[&[&str]]) -> Self {
        let mut vocab: Vec<String> = Vec::new();
        for piece in turns.iter().flat_map(|t| t.iter()) {
            if *piece != "<eos>" && !vocab.iter().any(|v| v == piece) {
                vocab.push(piece.to_string());
            }
        }
        let tokenizer = Arc::new(VocabTokenizer { vocab });
        let turns = turns
            .iter()
            .map(|t| t.iter().map(|piece| tokenizer.id(piece)).collect())
            .collect();
        Self {
            tokenizer,
            turns,
            hook: None,
            fail_next: false,
            fail_after: None,
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_hook(mut self, index: usize, hook: impl FnMut() + Send + 'static) -> Self {
        self.hook = Some((index, Box::new(hook)));
        self
    }

    pub fn failing_first(mut self) -> Self {
        self.fail_next = true;
        self
    }

    pub fn failing_after(mut self, tokens: usize) -> Self {
        self.fail_after = Some(tokens);
        self
    }
}

impl LanguageModel for ScriptedModel {
    fn tokenizer(&self) -> Arc<dyn Tokenizer> {
        self.tokenizer.clone()
    }

    fn eos_token(&self) -> TokenId {
        EOS
    }

    fn generate(
        &mut self,
        prompt: &[TokenId],
        _params: &SamplingParams,
        stop: &CancellationToken,
        on_token: &mut dyn FnMut(TokenId),
    ) -> VoiceResult<()> {
        self.prompts.lock().unwrap().push(prompt.to_vec());
        if self.fail_next {
            self.fail_next = false;
            return Err(VoiceError::Generation("backend unavailable".into()));
        }
        let tokens = self.turns.pop_front().unwrap_or_default();
        for (i, token) in tokens.into_iter().enumerate() {
            if stop.is_cancelled() {
                return Ok(());
            }
            if self.fail_after == Some(i) {
                self.fail_after = None;
                return Err(VoiceError::Generation("connection reset".into()));
            }
            if let Some((at, hook)) = self.hook.as_mut() {
                if *at == i {
                    hook();
                }
            }
            on_token(token);
        }
        Ok(())
    }
}

pub struct ScriptedRecognizer(pub VecDeque<String>);

impl ScriptedRecognizer {
    pub fn new(transcripts: &[&str]) -> Self {
        Self(transcripts.iter().map(|t| t.to_string()).collect())
    }
}

impl SpeechRecognizer for ScriptedRecognizer {
    fn transcribe(&mut self, _samples: &[i16], _sample_rate: u32) -> VoiceResult<String> {
        Ok(self.0.pop_front().unwrap_or_default())
    }
}

pub const SPACE: u32 = 0;

/// One synthesizer token per character, one duration unit each, ten
/// samples per unit at 1 kHz.
pub struct CharSynth;

impl SpeechSynthesizer for CharSynth {
    fn sample_rate(&self) -> u32 {
        1000
    }

    fn space_token(&self) -> u32 {
        SPACE
    }

    fn synthesize(&mut self, text: &str) -> VoiceResult<Synthesis> {
        let tokens: Vec<u32> = text.chars().map(|c| if c == ' ' { SPACE } else { c as u32 }).collect();
        Ok(Synthesis {
            samples: vec![500; tokens.len() * 10],
            durations: vec![1.0; tokens.len()],
            tokens,
        })
    }
}

/// Keeps everything it is asked to play.
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub played: Arc<Mutex<Vec<i16>>>,
}

impl AudioSink for RecordingSink {
    fn sample_rate(&self) -> u32 {
        1000
    }

    fn play(&mut self, samples: &[i16]) -> VoiceResult<()> {
        self.played.lock().unwrap().extend_from_slice(samples);
        Ok(())
    }
}

/// Takes as long as the audio it is given, like a real device.
pub struct PacedSink;

impl AudioSink for PacedSink {
    fn sample_rate(&self) -> u32 {
        1000
    }

    fn play(&mut self, samples: &[i16]) -> VoiceResult<()> {
        std::thread::sleep(Duration::from_millis(samples.len() as u64));
        Ok(())
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

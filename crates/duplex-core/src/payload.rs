//! Payload variants carried by incremental units.
//!
//! Stages produce structurally different content (captured frames, text
//! tokens, synthesized audio, control signals). Each stage handler matches on
//! the variant it cares about and ignores the rest.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Strictly increasing identifier of a user/agent exchange.
pub type TurnId = u64;

/// Increasing identifier of a clause within a turn.
pub type ClauseId = u32;

/// A fixed-size PCM16 mono frame as captured from the microphone.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Arc<[i16]>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: impl Into<Arc<[i16]>>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Wall-clock length of the frame.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// One fixed-duration chunk of synthesized speech, aligned to the word that
/// is audible at the end of the chunk.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub samples: Arc<[i16]>,
    pub sample_rate: u32,
    /// Index of the word within the agent turn.
    pub word_id: usize,
    /// Character offset, within the agent turn text, of the last character of that word.
    pub char_id: usize,
}

/// Where playback stood when a chunk finished playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpokenPosition {
    pub turn_id: TurnId,
    pub clause_id: ClauseId,
    pub word_id: usize,
    pub char_id: usize,
}

/// Reports from the player stage. These are the only source of truth for
/// what the user actually heard.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// First chunk of an agent turn became audible.
    AgentStarted,
    /// A chunk finished playing.
    Spoken(SpokenPosition),
    /// The turn's final marker was reached.
    AgentFinished,
    /// Buffered audio for the turn was dropped after a hard interruption.
    Interrupted { last: Option<SpokenPosition> },
}

/// Control signals exchanged on the feedback edges.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    SoftInterruption,
    HardInterruption,
    Continue,
    /// Per-frame voice activity of the user.
    VoiceActivity { speech: bool, duration: Duration },
    Playback(PlaybackEvent),
}

/// Tagged payload of an incremental unit.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A text token (generator) or word (recognizer).
    Text(String),
    /// A captured microphone frame.
    Frame(AudioFrame),
    /// A synthesized, word-aligned audio chunk.
    Audio(AudioChunk),
    /// Synthesizer acknowledgement that a confirmed clause is queued for synthesis.
    Clause(String),
    Control(ControlEvent),
    /// Marks the end of a turn. Carries no content.
    EndOfTurn,
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_control(&self) -> Option<&ControlEvent> {
        match self {
            Payload::Control(event) => Some(event),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Payload::EndOfTurn)
    }

    /// Short variant name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Text(_) => "text",
            Payload::Frame(_) => "frame",
            Payload::Audio(_) => "audio",
            Payload::Clause(_) => "clause",
            Payload::Control(_) => "control",
            Payload::EndOfTurn => "end_of_turn",
        }
    }
}

//! # duplex-voice - Full-Duplex Voice Stages
//!
//! The stages of a spoken dialogue agent that can listen while it talks.
//! Each stage runs on its own thread and talks to the others only through
//! update batches from `duplex-core`.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            VoicePipeline                             │
//! │  ┌────────────┐   ┌────────────┐   ┌─────────────┐   ┌────────────┐  │
//! │  │ Recognizer │ → │ Generator  │ → │ Synthesizer │ → │   Player   │  │
//! │  │ VAD + ASR  │   │ LM clauses │   │ TTS + align │   │ AudioSink  │  │
//! │  └────────────┘   └────────────┘   └─────────────┘   └────────────┘  │
//! │        │ voice activity  ↑ hard          ↑ hard        ↑ soft/hard │ │
//! │        ↓                 │               │             │     spoken ↓ │
//! │  ┌─────────────────────────────────────────────────────────────────┐ │
//! │  │          Interruption Coordinator (NONE → SOFT → HARD)          │ │
//! │  └─────────────────────────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod alignment;
pub mod backend;
pub mod error;
pub mod generator;
pub mod interruption;
pub mod pipeline;
pub mod player;
pub mod recognizer;
pub mod segmenter;
pub mod stage;
pub mod synthesizer;
pub mod turn;
pub mod vad;

pub use backend::{AudioSink, LanguageModel, NullSink, SpeechRecognizer, SpeechSynthesizer, Synthesis};
pub use error::{VoiceError, VoiceResult};
pub use generator::{GeneratorStage, GeneratorState, StopReason, TurnOutcome};
pub use interruption::{CoordinatorAction, CoordinatorStage, InterruptionCoordinator, InterruptionState};
pub use pipeline::{Backends, VoicePipeline};
pub use player::PlayerStage;
pub use recognizer::RecognizerStage;
pub use segmenter::ClauseSegmenter;
pub use stage::{run_stage, spawn_stage, Stage, StageHandle};
pub use synthesizer::SynthesizerStage;
pub use turn::{TurnEvent, TurnManager};
pub use vad::{EnergyVad, VadFactory, VoiceActivityDetector, WebRtcVad};

//! # duplex-core - Incremental Unit Protocol
//!
//! Shared building blocks for a full-duplex spoken dialogue agent: the
//! incremental-unit (IU) data model, the update channel that carries
//! PRODUCE / CONFIRM / WITHDRAW operations between stages, the token-budgeted
//! dialogue history, and the session configuration.
//!
//! ```text
//! ┌────────────┐  Update   ┌────────────┐  Update   ┌─────────────┐  Update   ┌──────────┐
//! │ Recognizer │ ───────→  │ Generator  │ ───────→  │ Synthesizer │ ───────→  │  Player  │
//! └────────────┘  Batches  └────────────┘  Batches  └─────────────┘  Batches  └──────────┘
//!       │ voice activity         ↑  ↕ DialogueHistory    ↑                        │ playback
//!       └──────────────────→ ┌───┴─────────────────────┴──┐ ←────────────────────┘ feedback
//!                            │  Interruption Coordinator  │
//!                            └────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod history;
pub mod iu;
pub mod payload;
pub mod session;
pub mod update;

pub use config::{
    AudioConfig, DuplexConfig, GenerationConfig, HistoryConfig, InterruptionConfig, OutboxConfig,
    SamplingParams, SynthesisConfig, TurnConfig, VadConfig,
};
pub use error::{CoreError, CoreResult};
pub use history::{
    AlignmentOutcome, AlignmentRequest, DialogueHistory, Prompt, PromptTemplate, SharedHistory, Speaker,
    TokenId, Tokenizer, Utterance,
};
pub use iu::{Iu, IuArena, IuId, Lifecycle, StageKind};
pub use payload::{
    AudioChunk, AudioFrame, ClauseId, ControlEvent, Payload, PlaybackEvent, SpokenPosition, TurnId,
};
pub use session::SessionContext;
pub use update::{BatchSender, Emitter, Inbox, Outbox, PayloadFilter, UpdateBatch, UpdateOp};

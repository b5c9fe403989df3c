//! Error types for the duplex voice stages

use duplex_core::CoreError;
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while running the voice stages
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("VAD initialization failed: {0}")]
    VadInit(String),

    #[error("VAD processing error: {0}")]
    VadProcessing(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Recognizer error: {0}")]
    Recognizer(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Setup-time problems that stop the stage instead of abandoning a turn.
    pub fn is_fatal(&self) -> bool {
        match self {
            VoiceError::Config(_) | VoiceError::VadInit(_) => true,
            VoiceError::Core(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Programming errors against the IU lifecycle.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, VoiceError::Core(CoreError::Protocol(_)))
    }
}

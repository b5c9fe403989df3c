//! User turn-taking ("gap logic").
//!
//! Detects when the user has finished speaking from the per-frame VAD
//! decisions. Time is measured in frame durations rather than wall clock,
//! so the same audio always segments the same way.

use chrono::{DateTime, Utc};
use duplex_core::TurnConfig;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Events emitted by the turn manager
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// User started speaking
    SpeechStarted { timestamp: DateTime<Utc> },

    /// Enough new audio has accumulated to refresh the partial hypothesis
    PartialReady { elapsed: Duration },

    /// Turn is committed (ready for recognition)
    TurnCommitted {
        timestamp: DateTime<Utc>,
        total_speech_duration: Duration,
        audio_samples: Vec<i16>,
    },

    /// Speech ended but was too short to be a turn
    TurnDiscarded { duration: Duration },
}

/// State of the current turn
#[derive(Debug, Clone, Copy, PartialEq)]
enum TurnState {
    Idle,
    Speaking,
    SilenceDetected,
}

/// Segments the user's audio into turns based on VAD decisions
pub struct TurnManager {
    config: TurnConfig,
    state: TurnState,

    // Timing
    elapsed: Duration,
    silence_run: Duration,
    since_partial: Duration,

    // Audio buffer for the current turn
    audio_buffer: Vec<i16>,
}

impl TurnManager {
    pub fn new(config: TurnConfig) -> Self {
        Self {
            config,
            state: TurnState::Idle,
            elapsed: Duration::ZERO,
            silence_run: Duration::ZERO,
            since_partial: Duration::ZERO,
            audio_buffer: Vec::new(),
        }
    }

    /// Process one frame's VAD decision.
    pub fn process_vad_result(&mut self, is_speech: bool, frame: &[i16], frame_duration: Duration) -> Option<TurnEvent> {
        match (self.state, is_speech) {
            // Idle -> Speaking: User started talking
            (TurnState::Idle, true) => {
                info!("🎤 Speech started");
                self.reset();
                self.state = TurnState::Speaking;
                self.elapsed = frame_duration;
                self.audio_buffer.extend_from_slice(frame);
                Some(TurnEvent::SpeechStarted { timestamp: Utc::now() })
            }

            // Speaking -> Speaking: Continue recording
            (TurnState::Speaking, true) => {
                self.advance(frame, frame_duration);
                if self.elapsed >= self.config.max_turn_duration() {
                    warn!("⏱️ Max turn duration reached, auto-committing");
                    return Some(self.commit_turn());
                }
                self.partial_due(frame_duration)
            }

            // Speaking -> SilenceDetected: User paused
            (TurnState::Speaking, false) => {
                debug!("🤫 Silence detected");
                self.state = TurnState::SilenceDetected;
                self.advance(frame, frame_duration);
                self.silence_run = frame_duration;
                self.check_silence()
            }

            // SilenceDetected -> Speaking: User resumed
            (TurnState::SilenceDetected, true) => {
                debug!("🎤 Speech resumed");
                self.state = TurnState::Speaking;
                self.silence_run = Duration::ZERO;
                self.advance(frame, frame_duration);
                self.partial_due(frame_duration)
            }

            // SilenceDetected -> SilenceDetected: Check if we should commit
            (TurnState::SilenceDetected, false) => {
                self.advance(frame, frame_duration);
                self.silence_run += frame_duration;
                self.check_silence()
            }

            (TurnState::Idle, false) => None,
        }
    }

    /// Audio of the turn in progress.
    pub fn audio(&self) -> &[i16] {
        &self.audio_buffer
    }

    pub fn is_active(&self) -> bool {
        self.state != TurnState::Idle
    }

    /// Get the current state (for testing/debugging)
    pub fn state(&self) -> &str {
        match self.state {
            TurnState::Idle => "idle",
            TurnState::Speaking => "speaking",
            TurnState::SilenceDetected => "silence_detected",
        }
    }

    fn advance(&mut self, frame: &[i16], frame_duration: Duration) {
        self.elapsed += frame_duration;
        self.audio_buffer.extend_from_slice(frame);
    }

    fn partial_due(&mut self, frame_duration: Duration) -> Option<TurnEvent> {
        let interval = self.config.partial_interval()?;
        self.since_partial += frame_duration;
        if self.since_partial < interval {
            return None;
        }
        self.since_partial = Duration::ZERO;
        Some(TurnEvent::PartialReady { elapsed: self.elapsed })
    }

    fn check_silence(&mut self) -> Option<TurnEvent> {
        if self.silence_run >= self.config.silence_threshold() {
            info!("✅ Silence threshold reached, committing turn");
            return Some(self.commit_turn());
        }
        None
    }

    fn commit_turn(&mut self) -> TurnEvent {
        let speech = self.elapsed.saturating_sub(self.silence_run);
        if speech < self.config.min_speech_duration() {
            debug!("⏭️ Speech too short ({:?}), ignoring", speech);
            self.reset();
            return TurnEvent::TurnDiscarded { duration: speech };
        }

        info!("🎯 Turn committed: {:?} speech, {} samples", speech, self.audio_buffer.len());
        let audio_samples = std::mem::take(&mut self.audio_buffer);
        self.reset();
        TurnEvent::TurnCommitted {
            timestamp: Utc::now(),
            total_speech_duration: speech,
            audio_samples,
        }
    }

    fn reset(&mut self) {
        self.state = TurnState::Idle;
        self.elapsed = Duration::ZERO;
        self.silence_run = Duration::ZERO;
        self.since_partial = Duration::ZERO;
        self.audio_buffer.clear();
    }
}

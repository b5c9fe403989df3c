//! Voice Activity Detection
//!
//! [`WebRtcVad`] wraps the WebRTC detector for real capture. [`EnergyVad`]
//! is a plain RMS threshold, useful for scripted audio and tests.

use crate::error::{VoiceError, VoiceResult};
use duplex_core::{AudioConfig, VadConfig};
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Frame-level speech detector. Not required to be `Send`: the recognizer
/// stage builds its detector on its own thread.
pub trait VoiceActivityDetector {
    /// Samples per frame the detector expects.
    fn frame_len(&self) -> usize;

    fn is_speech(&mut self, frame: &[i16]) -> VoiceResult<bool>;
}

/// Builds the detector on the recognizer thread.
pub type VadFactory = Box<dyn FnOnce() -> VoiceResult<Box<dyn VoiceActivityDetector>> + Send>;

/// Voice Activity Detector using WebRTC VAD
pub struct WebRtcVad {
    vad: Vad,
    frame_len: usize,
}

impl WebRtcVad {
    pub fn new(audio: &AudioConfig, config: &VadConfig) -> VoiceResult<Self> {
        info!(
            "🎙️ Initializing WebRTC VAD (sample_rate: {}Hz, frame: {}ms, mode: {})",
            audio.sample_rate, audio.frame_ms, config.mode
        );

        let sample_rate = match audio.sample_rate {
            8000 => SampleRate::Rate8kHz,
            16000 => SampleRate::Rate16kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            other => {
                return Err(VoiceError::VadInit(format!(
                    "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {other}"
                )))
            }
        };

        let mode = match config.mode {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            3 => VadMode::VeryAggressive,
            other => return Err(VoiceError::VadInit(format!("VAD mode must be 0-3, got {other}"))),
        };

        if !matches!(audio.frame_ms, 10 | 20 | 30) {
            return Err(VoiceError::VadInit(format!(
                "WebRTC VAD needs 10, 20 or 30 ms frames, got {}",
                audio.frame_ms
            )));
        }

        let mut vad = Vad::new();
        vad.set_mode(mode);
        vad.set_sample_rate(sample_rate);

        Ok(Self {
            vad,
            frame_len: audio.frame_len(),
        })
    }

    /// Factory for the recognizer stage.
    pub fn factory(audio: AudioConfig, config: VadConfig) -> VadFactory {
        Box::new(move || Ok(Box::new(WebRtcVad::new(&audio, &config)?) as Box<dyn VoiceActivityDetector>))
    }
}

impl VoiceActivityDetector for WebRtcVad {
    fn frame_len(&self) -> usize {
        self.frame_len
    }

    fn is_speech(&mut self, frame: &[i16]) -> VoiceResult<bool> {
        if frame.len() != self.frame_len {
            return Err(VoiceError::VadProcessing(format!(
                "Expected {} samples, got {}",
                self.frame_len,
                frame.len()
            )));
        }
        let speech = self
            .vad
            .is_voice_segment(frame)
            .map_err(|e| VoiceError::VadProcessing(format!("VAD processing failed: {e:?}")))?;
        debug!("VAD result: {}", if speech { "SPEECH" } else { "SILENCE" });
        Ok(speech)
    }
}

/// RMS level of a PCM16 frame, normalised to 0.0..=1.0.
pub fn rms_level(frame: &[i16]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = frame
        .iter()
        .map(|&s| {
            let v = s as f64 / i16::MAX as f64;
            v * v
        })
        .sum();
    (sum_sq / frame.len() as f64).sqrt() as f32
}

/// Energy threshold detector.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    frame_len: usize,
    threshold: f32,
}

impl EnergyVad {
    pub fn new(frame_len: usize, threshold: f32) -> Self {
        Self { frame_len, threshold }
    }

    pub fn factory(frame_len: usize, threshold: f32) -> VadFactory {
        Box::new(move || Ok(Box::new(EnergyVad::new(frame_len, threshold)) as Box<dyn VoiceActivityDetector>))
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn frame_len(&self) -> usize {
        self.frame_len
    }

    fn is_speech(&mut self, frame: &[i16]) -> VoiceResult<bool> {
        if frame.len() != self.frame_len {
            return Err(VoiceError::VadProcessing(format!(
                "Expected {} samples, got {}",
                self.frame_len,
                frame.len()
            )));
        }
        Ok(rms_level(frame) >= self.threshold)
    }
}

//! Voice pipeline: validates the session configuration, wires the fixed stage
//! topology and owns the stage threads.
//!
//! ```text
//! capture ─→ recognizer ─┬─ text, end of turn ─→ generator ─→ synthesizer ─→ player
//!                        └─ voice activity ───→ coordinator ←── playback feedback ─┘
//!            coordinator ─→ generator, synthesizer, player (interruption control)
//! ```

use crate::backend::{AudioSink, LanguageModel, SpeechRecognizer, SpeechSynthesizer};
use crate::error::{VoiceError, VoiceResult};
use crate::generator::GeneratorStage;
use crate::interruption::CoordinatorStage;
use crate::player::PlayerStage;
use crate::recognizer::RecognizerStage;
use crate::stage::{spawn_stage, Stage, StageHandle};
use crate::synthesizer::SynthesizerStage;
use crate::vad::VadFactory;
use duplex_core::{
    AudioFrame, DialogueHistory, DuplexConfig, Emitter, Inbox, Payload, SessionContext, SharedHistory, StageKind,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// External collaborators for one session.
pub struct Backends {
    pub vad: VadFactory,
    pub recognizer: Box<dyn SpeechRecognizer>,
    pub model: Box<dyn LanguageModel>,
    pub synthesizer: Box<dyn SpeechSynthesizer>,
    pub sink: Box<dyn AudioSink>,
}

fn words_and_turn_ends(payload: &Payload) -> bool {
    matches!(payload, Payload::Text(_) | Payload::EndOfTurn)
}

fn control_and_turn_ends(payload: &Payload) -> bool {
    matches!(payload, Payload::Control(_) | Payload::EndOfTurn)
}

fn control_only(payload: &Payload) -> bool {
    matches!(payload, Payload::Control(_))
}

fn audio_and_turn_ends(payload: &Payload) -> bool {
    matches!(payload, Payload::Audio(_) | Payload::EndOfTurn)
}

/// A running full-duplex voice session.
pub struct VoicePipeline {
    config: DuplexConfig,
    session: Arc<SessionContext>,
    history: SharedHistory,
    capture: Emitter,
    cancel: CancellationToken,
    handles: Vec<(StageKind, StageHandle)>,
    feedback: Option<Inbox>,
}

impl VoicePipeline {
    /// Validate the configuration against the backends and start every stage.
    pub fn start(config: DuplexConfig, backends: Backends) -> VoiceResult<Self> {
        config.validate()?;
        let Backends {
            vad,
            recognizer,
            model,
            synthesizer,
            sink,
        } = backends;

        let synthesis_rate = config.synthesis.sample_rate;
        if synthesizer.sample_rate() != synthesis_rate {
            return Err(VoiceError::Config(format!(
                "synthesizer produces {} Hz audio but synthesis.sample_rate is {}",
                synthesizer.sample_rate(),
                synthesis_rate
            )));
        }
        if sink.sample_rate() != synthesis_rate {
            return Err(VoiceError::Config(format!(
                "audio sink plays {} Hz but synthesis.sample_rate is {}",
                sink.sample_rate(),
                synthesis_rate
            )));
        }

        let history = SharedHistory::new(DialogueHistory::new(
            config.history.system_prompt.clone(),
            config.history.template.clone(),
            config.history.context_budget,
            model.tokenizer(),
        )?);
        let session = Arc::new(SessionContext::new());
        let cancel = CancellationToken::new();
        let flush_interval = config.outbox.flush_interval();

        let (recognizer_tx, recognizer_inbox) = Inbox::channel(cancel.child_token());
        let (coordinator_tx, coordinator_inbox) = Inbox::channel(cancel.child_token());
        let (generator_tx, generator_inbox) = Inbox::channel(cancel.child_token());
        let (synthesizer_tx, synthesizer_inbox) = Inbox::channel(cancel.child_token());
        let (player_tx, player_inbox) = Inbox::channel(cancel.child_token());
        let (feedback_tx, feedback_inbox) = Inbox::channel(cancel.child_token());

        let mut capture = Emitter::new(StageKind::Capture, flush_interval);
        capture.subscribe(recognizer_tx);

        let mut recognizer_out = Emitter::new(StageKind::Recognizer, flush_interval);
        recognizer_out.subscribe_filtered(generator_tx.clone(), words_and_turn_ends);
        recognizer_out.subscribe_filtered(coordinator_tx.clone(), control_and_turn_ends);

        let mut coordinator_out = Emitter::new(StageKind::Coordinator, flush_interval);
        coordinator_out.subscribe(generator_tx);
        coordinator_out.subscribe(synthesizer_tx.clone());
        coordinator_out.subscribe(player_tx.clone());

        let mut generator_out = Emitter::new(StageKind::Generator, flush_interval);
        generator_out.subscribe_filtered(synthesizer_tx, words_and_turn_ends);

        let mut synthesizer_out = Emitter::new(StageKind::Synthesizer, flush_interval);
        synthesizer_out.subscribe_filtered(player_tx, audio_and_turn_ends);

        let mut player_out = Emitter::new(StageKind::Player, flush_interval);
        player_out.subscribe_filtered(coordinator_tx, control_only);
        player_out.subscribe(feedback_tx);

        let mut pipeline = Self {
            config,
            session,
            history,
            capture,
            cancel,
            handles: Vec::new(),
            feedback: Some(feedback_inbox),
        };

        // From here on, an early return drops the pipeline, which cancels
        // whatever was already spawned.
        let audio = pipeline.config.audio.clone();
        let turn = pipeline.config.turn.clone();
        let session = Arc::clone(&pipeline.session);
        pipeline.spawn(
            StageKind::Recognizer,
            move || {
                let vad = vad()?;
                RecognizerStage::new(recognizer_out, vad, recognizer, &audio, turn, session)
            },
            recognizer_inbox,
        )?;

        let interruption = pipeline.config.interruption.clone();
        let history = pipeline.history.clone();
        pipeline.spawn(
            StageKind::Coordinator,
            move || Ok(CoordinatorStage::new(coordinator_out, interruption, history)),
            coordinator_inbox,
        )?;

        let generation = pipeline.config.generation.clone();
        let history = pipeline.history.clone();
        pipeline.spawn(
            StageKind::Generator,
            move || Ok(GeneratorStage::new(generator_out, model, history, &generation)),
            generator_inbox,
        )?;

        let synthesis = pipeline.config.synthesis.clone();
        pipeline.spawn(
            StageKind::Synthesizer,
            move || Ok(SynthesizerStage::new(synthesizer_out, synthesizer, &synthesis)),
            synthesizer_inbox,
        )?;

        pipeline.spawn(
            StageKind::Player,
            move || Ok(PlayerStage::new(player_out, sink)),
            player_inbox,
        )?;

        info!(session = %pipeline.session.id(), "🚀 Voice pipeline started");
        Ok(pipeline)
    }

    fn spawn<S, F>(&mut self, kind: StageKind, build: F, inbox: Inbox) -> VoiceResult<()>
    where
        S: Stage,
        F: FnOnce() -> VoiceResult<S> + Send + 'static,
    {
        let handle = spawn_stage(kind.as_str(), build, inbox)?;
        self.handles.push((kind, handle));
        Ok(())
    }

    /// Feed one captured microphone frame.
    pub fn push_frame(&mut self, samples: Vec<i16>) -> VoiceResult<()> {
        let expected = self.config.audio.frame_len();
        if samples.len() != expected {
            return Err(VoiceError::VadProcessing(format!(
                "captured frame has {} samples, expected {}",
                samples.len(),
                expected
            )));
        }
        let turn_id = self.session.current_turn_id();
        let frame = AudioFrame::new(samples, self.config.audio.sample_rate);
        let iu = self.capture.produce(Payload::Frame(frame), Vec::new(), turn_id, 0);
        self.capture.confirm(iu.id)?;
        self.capture.flush();
        // Frames are final once confirmed.
        self.capture.retire_before(turn_id + 1);
        Ok(())
    }

    pub fn history(&self) -> SharedHistory {
        self.history.clone()
    }

    pub fn session(&self) -> Arc<SessionContext> {
        Arc::clone(&self.session)
    }

    pub fn config(&self) -> &DuplexConfig {
        &self.config
    }

    /// Playback feedback as the player reports it. Can be taken once.
    pub fn take_feedback_receiver(&mut self) -> Option<Inbox> {
        self.feedback.take()
    }

    /// Whether every stage thread is still running.
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && self.handles.iter().all(|(_, h)| !h.is_finished())
    }

    /// Cancel every stage and wait for the threads. Returns the first stage error.
    pub fn shutdown(mut self) -> VoiceResult<()> {
        self.cancel.cancel();
        let mut first_error = None;
        for (kind, handle) in std::mem::take(&mut self.handles) {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(stage = %kind, "Stage ended with an error: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(_) => error!(stage = %kind, "Stage thread panicked"),
            }
        }
        info!(session = %self.session.id(), "👋 Voice pipeline stopped");
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for VoicePipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

//! Recognizer stage: captured frames in, user words and turn ends out.
//!
//! Each frame goes through the VAD; the decision is forwarded to the
//! coordinator and drives the user turn gap logic. Transcription is queued by
//! `handle` and run by `step`. Transcripts come back as whole hypotheses, so
//! every new one is reconciled against the words already produced: the shared
//! prefix stays, diverging words are withdrawn and the rest is produced.

use crate::backend::SpeechRecognizer;
use crate::error::{VoiceError, VoiceResult};
use crate::stage::Stage;
use crate::turn::{TurnEvent, TurnManager};
use crate::vad::VoiceActivityDetector;
use duplex_core::{
    AudioConfig, AudioFrame, ControlEvent, Emitter, Inbox, Iu, IuId, Payload, SessionContext, StageKind, TurnConfig,
    TurnId, UpdateBatch, UpdateOp,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Number of leading words two hypotheses share.
pub fn shared_prefix_len<A: AsRef<str>, B: AsRef<str>>(previous: &[A], next: &[B]) -> usize {
    previous
        .iter()
        .zip(next)
        .take_while(|(a, b)| a.as_ref() == b.as_ref())
        .count()
}

/// The user turn being recognized.
struct ActiveTurn {
    turn_id: TurnId,
    onset: IuId,
    words: Vec<Arc<Iu>>,
}

/// Recognition work waiting for [`Stage::step`].
enum Transcription {
    Partial { turn_id: TurnId, audio: Vec<i16> },
    Final { turn: ActiveTurn, audio: Vec<i16> },
}

pub struct RecognizerStage {
    emitter: Emitter,
    vad: Box<dyn VoiceActivityDetector>,
    recognizer: Box<dyn SpeechRecognizer>,
    turns: TurnManager,
    session: Arc<SessionContext>,
    sample_rate: u32,
    frame_duration: Duration,
    active: Option<ActiveTurn>,
    jobs: VecDeque<Transcription>,
}

impl RecognizerStage {
    pub fn new(
        emitter: Emitter,
        vad: Box<dyn VoiceActivityDetector>,
        recognizer: Box<dyn SpeechRecognizer>,
        audio: &AudioConfig,
        turn: TurnConfig,
        session: Arc<SessionContext>,
    ) -> VoiceResult<Self> {
        if vad.frame_len() != audio.frame_len() {
            return Err(VoiceError::Config(format!(
                "VAD expects {} samples per frame but capture delivers {}",
                vad.frame_len(),
                audio.frame_len()
            )));
        }
        Ok(Self {
            emitter,
            vad,
            recognizer,
            turns: TurnManager::new(turn),
            session,
            sample_rate: audio.sample_rate,
            frame_duration: audio.frame_duration(),
            active: None,
            jobs: VecDeque::new(),
        })
    }

    /// Turn id of the user turn in progress.
    pub fn active_turn(&self) -> Option<TurnId> {
        self.active.as_ref().map(|t| t.turn_id)
    }

    /// Units the stage still tracks for open or unrecognized turns.
    pub fn tracked_units(&self) -> usize {
        self.emitter.tracked()
    }

    fn process_frame(&mut self, source: IuId, frame: &AudioFrame) -> VoiceResult<()> {
        if frame.sample_rate != self.sample_rate {
            return Err(VoiceError::Config(format!(
                "captured frame at {} Hz but the recognizer runs at {} Hz",
                frame.sample_rate, self.sample_rate
            )));
        }
        let speech = self.vad.is_speech(&frame.samples)?;

        let activity = self.emitter.produce(
            Payload::Control(ControlEvent::VoiceActivity {
                speech,
                duration: self.frame_duration,
            }),
            vec![source],
            self.session.current_turn_id(),
            0,
        );
        self.emitter.confirm(activity.id)?;

        let event = self
            .turns
            .process_vad_result(speech, &frame.samples, self.frame_duration);
        let result = match event {
            Some(TurnEvent::SpeechStarted { .. }) => {
                let turn_id = self.session.next_turn_id();
                debug!(turn_id, "User turn opened");
                self.active = Some(ActiveTurn {
                    turn_id,
                    onset: source,
                    words: Vec::new(),
                });
                Ok(())
            }
            Some(TurnEvent::PartialReady { elapsed }) => {
                if let Some(turn_id) = self.active_turn() {
                    debug!(turn_id, ?elapsed, "Partial hypothesis due");
                    // A newer snapshot supersedes one still waiting.
                    self.drop_partials();
                    self.jobs.push_back(Transcription::Partial {
                        turn_id,
                        audio: self.turns.audio().to_vec(),
                    });
                }
                Ok(())
            }
            Some(TurnEvent::TurnCommitted { audio_samples, .. }) => {
                if let Some(turn) = self.active.take() {
                    self.drop_partials();
                    self.jobs.push_back(Transcription::Final {
                        turn,
                        audio: audio_samples,
                    });
                }
                Ok(())
            }
            Some(TurnEvent::TurnDiscarded { duration }) => {
                debug!(?duration, "User speech too short for a turn");
                self.drop_partials();
                self.withdraw_turn()
            }
            None => Ok(()),
        };
        self.emitter.flush();
        self.retire_settled();
        result
    }

    fn drop_partials(&mut self) {
        self.jobs.retain(|job| !matches!(job, Transcription::Partial { .. }));
    }

    fn refresh_partial(&mut self, turn_id: TurnId, audio: &[i16]) -> VoiceResult<()> {
        let transcript = match self.recognizer.transcribe(audio, self.sample_rate) {
            Ok(transcript) => transcript,
            Err(e) => {
                warn!(turn_id, "Partial recognition failed, waiting for the final pass: {}", e);
                return Ok(());
            }
        };
        // The turn may have ended while the snapshot was queued.
        let Some(turn) = self.active.as_mut().filter(|t| t.turn_id == turn_id) else {
            return Ok(());
        };
        debug!(turn_id, "Partial hypothesis: {}", transcript);
        reconcile(&mut self.emitter, turn, &transcript)
    }

    fn commit_turn(&mut self, mut turn: ActiveTurn, audio: &[i16]) -> VoiceResult<()> {
        let transcript = match self.recognizer.transcribe(audio, self.sample_rate) {
            Ok(transcript) => transcript,
            Err(e) => {
                withdraw_words(&mut self.emitter, &turn)?;
                return Err(e);
            }
        };
        reconcile(&mut self.emitter, &mut turn, &transcript)?;

        if turn.words.is_empty() {
            debug!(turn_id = turn.turn_id, "Nothing recognized");
            return Ok(());
        }
        for word in &turn.words {
            self.emitter.confirm(word.id)?;
        }
        let eot = self.emitter.produce(
            Payload::EndOfTurn,
            turn.words.iter().map(|iu| iu.id).collect(),
            turn.turn_id,
            0,
        );
        self.emitter.confirm(eot.id)?;
        info!(turn_id = turn.turn_id, "🗣️ User said: {}", transcript.trim());
        Ok(())
    }

    fn withdraw_turn(&mut self) -> VoiceResult<()> {
        match self.active.take() {
            Some(turn) => withdraw_words(&mut self.emitter, &turn),
            None => Ok(()),
        }
    }

    /// With no turn open or awaiting its transcript, every unit in the arena
    /// is final and can go.
    fn retire_settled(&mut self) {
        if self.active.is_none() && self.jobs.is_empty() {
            self.emitter.retire_before(self.session.current_turn_id() + 1);
        }
    }
}

fn reconcile(emitter: &mut Emitter, turn: &mut ActiveTurn, transcript: &str) -> VoiceResult<()> {
    let hypothesis: Vec<&str> = transcript.split_whitespace().collect();
    let previous: Vec<&str> = turn.words.iter().map(|iu| iu.text().unwrap_or_default()).collect();
    let keep = shared_prefix_len(&previous, &hypothesis);

    for iu in turn.words.drain(keep..).rev() {
        emitter.withdraw(iu.id)?;
    }
    for word in &hypothesis[keep..] {
        let iu = emitter.produce(Payload::Text(word.to_string()), vec![turn.onset], turn.turn_id, 0);
        turn.words.push(iu);
    }
    Ok(())
}

fn withdraw_words(emitter: &mut Emitter, turn: &ActiveTurn) -> VoiceResult<()> {
    for iu in turn.words.iter().rev() {
        emitter.withdraw(iu.id)?;
    }
    Ok(())
}

impl Stage for RecognizerStage {
    fn kind(&self) -> StageKind {
        StageKind::Recognizer
    }

    fn handle(&mut self, batch: UpdateBatch) -> VoiceResult<()> {
        for (iu, op) in batch.iter() {
            if op != UpdateOp::Confirm {
                continue;
            }
            if let Payload::Frame(frame) = &iu.payload {
                self.process_frame(iu.id, frame)?;
            }
        }
        Ok(())
    }

    fn has_work(&self) -> bool {
        !self.jobs.is_empty()
    }

    fn step(&mut self, _inbox: &mut Inbox) -> VoiceResult<()> {
        let Some(job) = self.jobs.pop_front() else {
            return Ok(());
        };
        let result = match job {
            Transcription::Partial { turn_id, audio } => self.refresh_partial(turn_id, &audio),
            Transcription::Final { turn, audio } => self.commit_turn(turn, &audio),
        };
        self.emitter.flush();
        self.retire_settled();
        result
    }

    fn flush(&mut self) {
        self.emitter.flush();
    }
}

//! Barge-in handling.
//!
//! [`InterruptionCoordinator`] is the `NONE -> SOFT -> HARD -> NONE` state
//! machine. It listens to the user's voice activity and to playback feedback
//! and decides when the agent should pause, stop, or carry on.
//! [`CoordinatorStage`] turns those decisions into control IUs and into the
//! history alignment after a hard interruption.

use crate::error::VoiceResult;
use crate::stage::Stage;
use duplex_core::{
    AlignmentOutcome, ControlEvent, Emitter, InterruptionConfig, IuId, Payload, PlaybackEvent, SharedHistory,
    SpokenPosition, StageKind, TurnId, UpdateBatch,
};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionState {
    None,
    Soft,
    Hard,
}

/// What the coordinator wants done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorAction {
    /// Withhold playback; grounded in the last word reported as spoken.
    Soft { turn_id: TurnId, grounded_in: Option<IuId> },
    /// Cancel generation and synthesis for the turn and drop buffered audio.
    Hard { turn_id: TurnId, grounded_in: Option<IuId> },
    /// Release withheld audio.
    Continue { turn_id: TurnId },
    /// Truncate the agent utterance to what was heard.
    Align { turn_id: TurnId, last_word: Option<usize> },
}

pub struct InterruptionCoordinator {
    config: InterruptionConfig,
    state: InterruptionState,
    agent_turn: Option<TurnId>,
    speech_run: Duration,
    silence_run: Duration,
    soft_elapsed: Duration,
    last_spoken: Option<(SpokenPosition, IuId)>,
}

impl InterruptionCoordinator {
    pub fn new(config: InterruptionConfig) -> Self {
        Self {
            config,
            state: InterruptionState::None,
            agent_turn: None,
            speech_run: Duration::ZERO,
            silence_run: Duration::ZERO,
            soft_elapsed: Duration::ZERO,
            last_spoken: None,
        }
    }

    pub fn state(&self) -> InterruptionState {
        self.state
    }

    /// Turn the agent is currently speaking, if any.
    pub fn agent_turn(&self) -> Option<TurnId> {
        self.agent_turn
    }

    fn spoken_in(&self, turn_id: TurnId) -> Option<IuId> {
        self.last_spoken
            .filter(|(pos, _)| pos.turn_id == turn_id)
            .map(|(_, id)| id)
    }

    /// Feed one frame of user voice activity.
    pub fn on_voice_activity(&mut self, speech: bool, duration: Duration) -> Option<CoordinatorAction> {
        if speech {
            self.speech_run += duration;
            self.silence_run = Duration::ZERO;
        } else {
            self.silence_run += duration;
            self.speech_run = Duration::ZERO;
        }
        if !self.config.enabled {
            return None;
        }

        match self.state {
            InterruptionState::None => {
                let turn_id = self.agent_turn?;
                if !speech || self.speech_run < self.config.onset() {
                    return None;
                }
                self.state = InterruptionState::Soft;
                self.soft_elapsed = self.speech_run;
                info!(turn_id, "🤚 Soft interruption");
                Some(CoordinatorAction::Soft {
                    turn_id,
                    grounded_in: self.spoken_in(turn_id),
                })
            }
            InterruptionState::Soft => {
                self.soft_elapsed += duration;
                let turn_id = self.agent_turn?;
                if speech && self.soft_elapsed >= self.config.hard_after() {
                    self.state = InterruptionState::Hard;
                    info!(turn_id, elapsed = ?self.soft_elapsed, "✋ Hard interruption");
                    return Some(CoordinatorAction::Hard {
                        turn_id,
                        grounded_in: self.spoken_in(turn_id),
                    });
                }
                if !speech && self.silence_run >= self.config.release() {
                    self.state = InterruptionState::None;
                    info!(turn_id, "👍 Backchannel, agent continues");
                    return Some(CoordinatorAction::Continue { turn_id });
                }
                None
            }
            InterruptionState::Hard => None,
        }
    }

    /// Feed one playback report.
    pub fn on_playback(&mut self, event: &PlaybackEvent, turn_id: TurnId, source: IuId) -> Option<CoordinatorAction> {
        match event {
            PlaybackEvent::AgentStarted => {
                self.agent_turn = Some(turn_id);
                None
            }
            PlaybackEvent::Spoken(pos) => {
                self.last_spoken = Some((*pos, source));
                None
            }
            PlaybackEvent::AgentFinished => {
                if self.agent_turn == Some(turn_id) {
                    self.agent_turn = None;
                }
                self.reset(turn_id)
            }
            PlaybackEvent::Interrupted { last } => {
                if self.agent_turn.is_some_and(|t| t <= turn_id) {
                    self.agent_turn = None;
                }
                self.state = InterruptionState::None;
                Some(CoordinatorAction::Align {
                    turn_id,
                    last_word: last.map(|pos| pos.word_id),
                })
            }
        }
    }

    /// The user finished a turn of their own.
    pub fn on_user_end_of_turn(&mut self, turn_id: TurnId) -> Option<CoordinatorAction> {
        self.reset(turn_id)
    }

    /// Back to `None` unless a hard interruption is still being resolved.
    fn reset(&mut self, turn_id: TurnId) -> Option<CoordinatorAction> {
        match self.state {
            InterruptionState::Soft => {
                self.state = InterruptionState::None;
                Some(CoordinatorAction::Continue { turn_id })
            }
            InterruptionState::None | InterruptionState::Hard => None,
        }
    }
}

pub struct CoordinatorStage {
    emitter: Emitter,
    coordinator: InterruptionCoordinator,
    history: SharedHistory,
}

impl CoordinatorStage {
    pub fn new(emitter: Emitter, config: InterruptionConfig, history: SharedHistory) -> Self {
        Self {
            emitter,
            coordinator: InterruptionCoordinator::new(config),
            history,
        }
    }

    pub fn state(&self) -> InterruptionState {
        self.coordinator.state()
    }

    fn signal(&mut self, event: ControlEvent, turn_id: TurnId, grounded_in: Option<IuId>) -> VoiceResult<()> {
        let iu = self
            .emitter
            .produce(Payload::Control(event), grounded_in.into_iter().collect(), turn_id, 0);
        self.emitter.confirm(iu.id)?;
        self.emitter.flush();
        Ok(())
    }

    fn execute(&mut self, action: CoordinatorAction) -> VoiceResult<()> {
        match action {
            CoordinatorAction::Soft { turn_id, grounded_in } => {
                self.signal(ControlEvent::SoftInterruption, turn_id, grounded_in)
            }
            CoordinatorAction::Hard { turn_id, grounded_in } => {
                self.signal(ControlEvent::HardInterruption, turn_id, grounded_in)
            }
            CoordinatorAction::Continue { turn_id } => self.signal(ControlEvent::Continue, turn_id, None),
            CoordinatorAction::Align { turn_id, last_word } => {
                match self.history.lock().align_last_agent_utterance(turn_id, last_word) {
                    AlignmentOutcome::Applied => debug!(turn_id, ?last_word, "Alignment applied"),
                    AlignmentOutcome::Deferred => debug!(turn_id, ?last_word, "Alignment held until the agent turn is appended"),
                    AlignmentOutcome::Stale => warn!(turn_id, ?last_word, "Alignment arrived after a newer agent turn"),
                }
                Ok(())
            }
        }
    }
}

impl Stage for CoordinatorStage {
    fn kind(&self) -> StageKind {
        StageKind::Coordinator
    }

    fn handle(&mut self, batch: UpdateBatch) -> VoiceResult<()> {
        for iu in batch.confirmed() {
            let action = match (&iu.payload, iu.creator()) {
                (Payload::Control(ControlEvent::VoiceActivity { speech, duration }), _) => {
                    self.coordinator.on_voice_activity(*speech, *duration)
                }
                (Payload::Control(ControlEvent::Playback(event)), _) => {
                    self.coordinator.on_playback(event, iu.turn_id, iu.id)
                }
                (Payload::EndOfTurn, StageKind::Recognizer) => self.coordinator.on_user_end_of_turn(iu.turn_id),
                _ => None,
            };
            if let Some(action) = action {
                self.execute(action)?;
            }
        }
        Ok(())
    }

    fn flush(&mut self) {
        self.emitter.flush();
    }
}

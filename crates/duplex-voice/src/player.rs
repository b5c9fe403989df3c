//! Player stage: plays synthesized chunks and reports what was heard.
//!
//! Every chunk that reaches the sink is answered with a `Spoken` feedback IU.
//! That feedback is the only record of what the user actually heard.

use crate::backend::AudioSink;
use crate::error::VoiceResult;
use crate::stage::Stage;
use duplex_core::{
    ClauseId, ControlEvent, Emitter, Inbox, Iu, IuId, Payload, PlaybackEvent, SpokenPosition, StageKind, TurnId,
    UpdateBatch, UpdateOp,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct PlayerStage {
    emitter: Emitter,
    sink: Box<dyn AudioSink>,
    buffer: VecDeque<Arc<Iu>>,
    withheld: bool,
    interrupted: Option<TurnId>,
    speaking: Option<TurnId>,
    last_spoken: Option<SpokenPosition>,
}

impl PlayerStage {
    pub fn new(emitter: Emitter, sink: Box<dyn AudioSink>) -> Self {
        Self {
            emitter,
            sink,
            buffer: VecDeque::new(),
            withheld: false,
            interrupted: None,
            speaking: None,
            last_spoken: None,
        }
    }

    pub fn is_withheld(&self) -> bool {
        self.withheld
    }

    /// Chunks and end-of-turn markers not yet played.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn last_spoken(&self) -> Option<SpokenPosition> {
        self.last_spoken
    }

    fn report(
        &mut self,
        event: PlaybackEvent,
        turn_id: TurnId,
        clause_id: ClauseId,
        grounded_in: Vec<IuId>,
    ) -> VoiceResult<()> {
        let feedback = self.emitter.produce(
            Payload::Control(ControlEvent::Playback(event)),
            grounded_in,
            turn_id,
            clause_id,
        );
        self.emitter.confirm(feedback.id)?;
        self.emitter.flush();
        Ok(())
    }

    fn hard_interruption(&mut self, turn_id: TurnId, source: IuId) -> VoiceResult<()> {
        self.interrupted = Some(self.interrupted.map_or(turn_id, |t| t.max(turn_id)));
        let before = self.buffer.len();
        self.buffer.retain(|iu| iu.turn_id > turn_id);
        self.withheld = false;
        if self.speaking.is_some_and(|t| t <= turn_id) {
            self.speaking = None;
        }
        let last = self.last_spoken.filter(|pos| pos.turn_id == turn_id);
        info!(
            turn_id,
            dropped = before - self.buffer.len(),
            last_word = ?last.map(|pos| pos.word_id),
            "🛑 Playback interrupted"
        );
        self.report(
            PlaybackEvent::Interrupted { last },
            turn_id,
            last.map_or(0, |pos| pos.clause_id),
            vec![source],
        )
    }

    fn play(&mut self, iu: Arc<Iu>) -> VoiceResult<()> {
        let Payload::Audio(chunk) = &iu.payload else {
            return Ok(());
        };
        if self.speaking != Some(iu.turn_id) {
            self.speaking = Some(iu.turn_id);
            info!(turn_id = iu.turn_id, "🔈 Agent started speaking");
            self.report(PlaybackEvent::AgentStarted, iu.turn_id, iu.clause_id, vec![iu.id])?;
        }

        if let Err(e) = self.sink.play(&chunk.samples) {
            warn!(turn_id = iu.turn_id, "Audio playback failed: {}", e);
        }

        let position = SpokenPosition {
            turn_id: iu.turn_id,
            clause_id: iu.clause_id,
            word_id: chunk.word_id,
            char_id: chunk.char_id,
        };
        debug!(turn_id = iu.turn_id, word_id = chunk.word_id, "Chunk played");
        self.last_spoken = Some(position);
        self.report(PlaybackEvent::Spoken(position), iu.turn_id, iu.clause_id, vec![iu.id])
    }

    fn finish(&mut self, iu: Arc<Iu>) -> VoiceResult<()> {
        if self.speaking == Some(iu.turn_id) {
            self.speaking = None;
        }
        info!(turn_id = iu.turn_id, "🔇 Agent finished speaking");
        self.report(PlaybackEvent::AgentFinished, iu.turn_id, iu.clause_id, vec![iu.id])?;
        self.emitter.retire_before(iu.turn_id);
        Ok(())
    }
}

impl Stage for PlayerStage {
    fn kind(&self) -> StageKind {
        StageKind::Player
    }

    fn handle(&mut self, batch: UpdateBatch) -> VoiceResult<()> {
        for (iu, op) in batch.iter() {
            if op != UpdateOp::Confirm {
                continue;
            }
            match &iu.payload {
                Payload::Audio(_) | Payload::EndOfTurn if iu.creator() == StageKind::Synthesizer => {
                    if self.interrupted.is_some_and(|t| iu.turn_id <= t) {
                        continue;
                    }
                    self.buffer.push_back(Arc::clone(iu));
                }
                Payload::Control(ControlEvent::SoftInterruption) => {
                    debug!(turn_id = iu.turn_id, "Withholding playback");
                    self.withheld = true;
                }
                Payload::Control(ControlEvent::Continue) => {
                    debug!(turn_id = iu.turn_id, "Resuming playback");
                    self.withheld = false;
                }
                Payload::Control(ControlEvent::HardInterruption) => {
                    self.hard_interruption(iu.turn_id, iu.id)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn has_work(&self) -> bool {
        !self.withheld && !self.buffer.is_empty()
    }

    fn step(&mut self, _inbox: &mut Inbox) -> VoiceResult<()> {
        match self.buffer.pop_front() {
            Some(iu) if iu.payload.is_final() => self.finish(iu),
            Some(iu) => self.play(iu),
            None => Ok(()),
        }
    }

    fn flush(&mut self) {
        self.emitter.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullSink;
    use duplex_core::AudioChunk;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn setup() -> (PlayerStage, Inbox, Emitter, Emitter) {
        let (tx, feedback) = Inbox::channel(CancellationToken::new());
        let mut emitter = Emitter::new(StageKind::Player, Duration::from_millis(20));
        emitter.subscribe(tx);
        let player = PlayerStage::new(emitter, Box::new(NullSink::new(16000)));
        let synth = Emitter::new(StageKind::Synthesizer, Duration::from_millis(20));
        let coordinator = Emitter::new(StageKind::Coordinator, Duration::from_millis(20));
        (player, feedback, synth, coordinator)
    }

    fn chunk(synth: &mut Emitter, turn: TurnId, word_id: usize) -> UpdateBatch {
        let iu = synth.produce(
            Payload::Audio(AudioChunk {
                samples: vec![0i16; 4].into(),
                sample_rate: 16000,
                word_id,
                char_id: word_id * 4,
            }),
            vec![],
            turn,
            0,
        );
        synth.confirm(iu.id).unwrap();
        UpdateBatch::from_iter([(iu, UpdateOp::Confirm)])
    }

    fn control(coordinator: &mut Emitter, event: ControlEvent, turn: TurnId) -> UpdateBatch {
        let iu = coordinator.produce(Payload::Control(event), vec![], turn, 0);
        coordinator.confirm(iu.id).unwrap();
        UpdateBatch::from_iter([(iu, UpdateOp::Confirm)])
    }

    fn events(feedback: &mut Inbox) -> Vec<PlaybackEvent> {
        let mut out = Vec::new();
        while let Some(batch) = feedback.try_next() {
            for iu in batch.confirmed() {
                if let Some(ControlEvent::Playback(event)) = iu.payload.as_control() {
                    out.push(event.clone());
                }
            }
        }
        out
    }

    #[test]
    fn soft_interruption_withholds_until_continue() {
        let (mut player, mut feedback, mut synth, mut coordinator) = setup();
        let mut inbox = Inbox::channel(CancellationToken::new()).1;
        player.handle(chunk(&mut synth, 1, 0)).unwrap();
        player.handle(chunk(&mut synth, 1, 1)).unwrap();
        player.step(&mut inbox).unwrap();

        player
            .handle(control(&mut coordinator, ControlEvent::SoftInterruption, 1))
            .unwrap();
        assert!(!player.has_work());
        assert_eq!(player.buffered(), 1);

        player.handle(control(&mut coordinator, ControlEvent::Continue, 1)).unwrap();
        assert!(player.has_work());
        player.step(&mut inbox).unwrap();

        let spoken: Vec<usize> = events(&mut feedback)
            .into_iter()
            .filter_map(|e| match e {
                PlaybackEvent::Spoken(pos) => Some(pos.word_id),
                _ => None,
            })
            .collect();
        assert_eq!(spoken, vec![0, 1]);
    }

    #[test]
    fn hard_interruption_drops_buffer_and_reports_last_word() {
        let (mut player, mut feedback, mut synth, mut coordinator) = setup();
        let mut inbox = Inbox::channel(CancellationToken::new()).1;
        for word in 0..3 {
            player.handle(chunk(&mut synth, 2, word)).unwrap();
        }
        player.step(&mut inbox).unwrap();
        player.step(&mut inbox).unwrap();

        player
            .handle(control(&mut coordinator, ControlEvent::HardInterruption, 2))
            .unwrap();
        assert_eq!(player.buffered(), 0);

        // Late chunks of the interrupted turn are ignored.
        player.handle(chunk(&mut synth, 2, 3)).unwrap();
        assert!(!player.has_work());

        let events = events(&mut feedback);
        assert_eq!(events.first(), Some(&PlaybackEvent::AgentStarted));
        match events.last() {
            Some(PlaybackEvent::Interrupted { last: Some(pos) }) => {
                assert_eq!(pos.turn_id, 2);
                assert_eq!(pos.word_id, 1);
            }
            other => panic!("expected an interruption report, got {other:?}"),
        }
    }
}

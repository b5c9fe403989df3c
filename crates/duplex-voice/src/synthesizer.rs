//! Synthesizer stage: confirmed clauses in, word-aligned audio chunks out.
//!
//! Clauses are queued in the order they were confirmed and synthesized one at
//! a time. A hard interruption cannot stop a synthesis call already running,
//! but it discards every clause still waiting in the queue for that turn.

use crate::alignment::{assign_words, split_chunks, word_breakpoints, word_groups};
use crate::backend::SpeechSynthesizer;
use crate::error::{VoiceError, VoiceResult};
use crate::stage::Stage;
use duplex_core::{
    AudioChunk, ClauseId, ControlEvent, CoreError, Emitter, Inbox, Iu, IuId, Payload, StageKind, SynthesisConfig,
    TurnId, UpdateBatch, UpdateOp,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

enum Job {
    Clause {
        turn_id: TurnId,
        clause_id: ClauseId,
        words: Vec<Arc<Iu>>,
        marker: Arc<Iu>,
    },
    EndOfTurn {
        turn_id: TurnId,
        source: IuId,
    },
}

impl Job {
    fn turn_id(&self) -> TurnId {
        match self {
            Job::Clause { turn_id, .. } | Job::EndOfTurn { turn_id, .. } => *turn_id,
        }
    }
}

/// Where in the current agent turn the next word falls.
#[derive(Debug, Default)]
struct TurnCursor {
    turn_id: TurnId,
    text: String,
}

/// The audible end of one word within the turn.
struct WordEnd {
    word_id: usize,
    char_id: usize,
    source: IuId,
}

pub struct SynthesizerStage {
    emitter: Emitter,
    backend: Box<dyn SpeechSynthesizer>,
    chunk_len: usize,
    frames_per_unit: u32,
    queue: VecDeque<Job>,
    open: Option<(TurnId, ClauseId, Vec<Arc<Iu>>)>,
    last_clause: Option<(TurnId, ClauseId)>,
    interrupted: Option<TurnId>,
    cursor: TurnCursor,
}

impl SynthesizerStage {
    pub fn new(emitter: Emitter, backend: Box<dyn SpeechSynthesizer>, config: &SynthesisConfig) -> Self {
        Self {
            emitter,
            backend,
            chunk_len: config.chunk_len(),
            frames_per_unit: config.frames_per_duration_unit,
            queue: VecDeque::new(),
            open: None,
            last_clause: None,
            interrupted: None,
            cursor: TurnCursor::default(),
        }
    }

    /// Clauses and end-of-turn markers waiting to be processed.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn is_interrupted(&self, turn_id: TurnId) -> bool {
        self.interrupted.is_some_and(|t| turn_id <= t)
    }

    fn collect_word(&mut self, iu: &Arc<Iu>) -> VoiceResult<()> {
        if let Some((turn, clause, words)) = &mut self.open {
            if *turn == iu.turn_id && *clause == iu.clause_id {
                words.push(Arc::clone(iu));
                return Ok(());
            }
        }
        self.close_clause()?;
        self.open = Some((iu.turn_id, iu.clause_id, vec![Arc::clone(iu)]));
        Ok(())
    }

    /// Queue the clause collected so far.
    fn close_clause(&mut self) -> VoiceResult<()> {
        let Some((turn_id, clause_id, words)) = self.open.take() else {
            return Ok(());
        };
        if self.is_interrupted(turn_id) {
            debug!(turn_id, clause_id, "Dropping clause of an interrupted turn");
            return Ok(());
        }
        if let Some((last_turn, last_clause)) = self.last_clause {
            if last_turn == turn_id && clause_id <= last_clause {
                return Err(CoreError::Protocol(format!(
                    "clause {clause_id} of turn {turn_id} confirmed after clause {last_clause}"
                ))
                .into());
            }
        }
        self.last_clause = Some((turn_id, clause_id));

        let text: String = words.iter().filter_map(|iu| iu.text()).collect();
        let grounded_in = words.iter().map(|iu| iu.id).collect();
        let marker = self
            .emitter
            .produce(Payload::Clause(text), grounded_in, turn_id, clause_id);
        debug!(turn_id, clause_id, "Clause queued for synthesis");
        self.queue.push_back(Job::Clause {
            turn_id,
            clause_id,
            words,
            marker,
        });
        Ok(())
    }

    /// Discard queued work for `turn_id` and every earlier turn.
    fn interrupt(&mut self, turn_id: TurnId) -> VoiceResult<()> {
        self.interrupted = Some(self.interrupted.map_or(turn_id, |t| t.max(turn_id)));
        let mut discarded = 0;
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for job in std::mem::take(&mut self.queue) {
            if job.turn_id() > turn_id {
                kept.push_back(job);
                continue;
            }
            if let Job::Clause { marker, .. } = &job {
                self.emitter.withdraw(marker.id)?;
            }
            discarded += 1;
        }
        self.queue = kept;
        self.emitter.flush();
        info!(turn_id, discarded, "⏹️ Synthesis queue cleared after hard interruption");
        Ok(())
    }

    /// Drop the rest of a turn after a failed synthesis. The end-of-turn
    /// marker is kept so playback can close the turn.
    fn abandon_turn(&mut self, turn_id: TurnId, marker: &Iu) -> VoiceResult<()> {
        self.emitter.withdraw(marker.id)?;
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for job in std::mem::take(&mut self.queue) {
            match job {
                Job::Clause { turn_id: t, marker, .. } if t == turn_id => {
                    self.emitter.withdraw(marker.id)?;
                }
                other => kept.push_back(other),
            }
        }
        self.queue = kept;
        self.emitter.flush();
        Ok(())
    }

    /// Turn-level position of each word end in the clause, continuing from
    /// the words already synthesized for the turn.
    fn word_ends(&mut self, turn_id: TurnId, words: &[Arc<Iu>]) -> Vec<WordEnd> {
        if self.cursor.turn_id != turn_id {
            self.cursor = TurnCursor {
                turn_id,
                text: String::new(),
            };
        }
        let texts: Vec<&str> = words.iter().map(|iu| iu.text().unwrap_or_default()).collect();
        let mut ends = Vec::new();
        let mut next = 0;
        for end in word_groups(&texts) {
            for text in &texts[next..=end] {
                self.cursor.text.push_str(text);
            }
            next = end + 1;
            let spoken = self.cursor.text.trim_start();
            ends.push(WordEnd {
                word_id: spoken.split_whitespace().count().saturating_sub(1),
                char_id: spoken.chars().count().saturating_sub(1),
                source: words[end].id,
            });
        }
        for text in &texts[next..] {
            self.cursor.text.push_str(text);
        }
        ends
    }

    fn synthesize_clause(
        &mut self,
        turn_id: TurnId,
        clause_id: ClauseId,
        words: Vec<Arc<Iu>>,
        marker: Arc<Iu>,
    ) -> VoiceResult<()> {
        let text = match &marker.payload {
            Payload::Clause(text) => text.clone(),
            _ => String::new(),
        };
        let synthesis = match self.backend.synthesize(&text) {
            Ok(synthesis) if synthesis.tokens.len() == synthesis.durations.len() => synthesis,
            Ok(synthesis) => {
                self.abandon_turn(turn_id, &marker)?;
                return Err(VoiceError::Synthesis(format!(
                    "{} tokens but {} durations for clause {clause_id} of turn {turn_id}",
                    synthesis.tokens.len(),
                    synthesis.durations.len()
                )));
            }
            Err(e) => {
                self.abandon_turn(turn_id, &marker)?;
                return Err(e);
            }
        };

        let ends = self.word_ends(turn_id, &words);
        let breakpoints = word_breakpoints(
            &synthesis.tokens,
            &synthesis.durations,
            self.backend.space_token(),
            self.frames_per_unit,
        );
        if breakpoints.len() != ends.len() {
            debug!(
                turn_id,
                clause_id,
                synthesized = breakpoints.len(),
                generated = ends.len(),
                "Word counts differ, clamping alignment"
            );
        }
        let chunks = split_chunks(&synthesis.samples, self.chunk_len);
        let assigned = assign_words(&breakpoints, chunks.len(), self.chunk_len);
        let sample_rate = self.backend.sample_rate();

        for (samples, local) in chunks.into_iter().zip(assigned) {
            let Some(word) = ends.get(local).or_else(|| ends.last()) else {
                break;
            };
            let chunk = self.emitter.produce(
                Payload::Audio(AudioChunk {
                    samples: samples.into(),
                    sample_rate,
                    word_id: word.word_id,
                    char_id: word.char_id,
                }),
                vec![word.source],
                turn_id,
                clause_id,
            );
            self.emitter.confirm(chunk.id)?;
        }
        self.emitter.confirm(marker.id)?;
        self.emitter.flush();
        info!(turn_id, clause_id, samples = synthesis.samples.len(), "🔊 Clause synthesized: {}", text.trim());
        Ok(())
    }

    fn finish_turn(&mut self, turn_id: TurnId, source: IuId) -> VoiceResult<()> {
        let eot = self.emitter.produce(Payload::EndOfTurn, vec![source], turn_id, 0);
        self.emitter.confirm(eot.id)?;
        self.emitter.flush();
        self.cursor = TurnCursor::default();
        self.emitter.retire_before(turn_id);
        debug!(turn_id, "End of agent turn forwarded to playback");
        Ok(())
    }
}

impl Stage for SynthesizerStage {
    fn kind(&self) -> StageKind {
        StageKind::Synthesizer
    }

    fn handle(&mut self, batch: UpdateBatch) -> VoiceResult<()> {
        for (iu, op) in batch.iter() {
            match (iu.creator(), &iu.payload, op) {
                (StageKind::Generator, Payload::Text(_), UpdateOp::Confirm) => self.collect_word(iu)?,
                (StageKind::Generator, Payload::Text(_), UpdateOp::Withdraw) => {
                    self.emitter.withdraw_derived_from(iu.id)?;
                }
                (StageKind::Generator, Payload::EndOfTurn, UpdateOp::Confirm) => {
                    self.close_clause()?;
                    if self.is_interrupted(iu.turn_id) {
                        debug!(turn_id = iu.turn_id, "Ignoring end of an interrupted turn");
                    } else {
                        self.queue.push_back(Job::EndOfTurn {
                            turn_id: iu.turn_id,
                            source: iu.id,
                        });
                    }
                }
                (_, Payload::Control(ControlEvent::HardInterruption), UpdateOp::Confirm) => {
                    self.close_clause()?;
                    self.interrupt(iu.turn_id)?;
                }
                _ => {}
            }
        }
        self.close_clause()?;
        self.emitter.flush();
        Ok(())
    }

    fn has_work(&self) -> bool {
        !self.queue.is_empty()
    }

    fn step(&mut self, _inbox: &mut Inbox) -> VoiceResult<()> {
        match self.queue.pop_front() {
            Some(Job::Clause {
                turn_id,
                clause_id,
                words,
                marker,
            }) => self.synthesize_clause(turn_id, clause_id, words, marker),
            Some(Job::EndOfTurn { turn_id, source }) => self.finish_turn(turn_id, source),
            None => Ok(()),
        }
    }

    fn flush(&mut self) {
        self.emitter.flush();
    }
}

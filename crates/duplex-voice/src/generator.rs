//! Generator stage: turns a confirmed user turn into a stream of agent text
//! IUs, committed one clause at a time.
//!
//! Per turn the stage moves `Idle -> Prompting -> Streaming ->
//! {ClauseBoundary | Stopping} -> Done`. While the model streams, every token
//! is checked in priority order: a hard interruption for this turn, a stop
//! pattern at the tail, the model's end-of-sequence token, and finally a role
//! tag at the opening of the turn.

use crate::backend::LanguageModel;
use crate::error::{VoiceError, VoiceResult};
use crate::segmenter::{covering_suffix, is_newline_token, ClauseSegmenter};
use crate::stage::Stage;
use duplex_core::{
    ClauseId, ControlEvent, Emitter, GenerationConfig, Inbox, Iu, IuId, Payload, SamplingParams, SharedHistory,
    Speaker, StageKind, TokenId, Tokenizer, TurnId, UpdateBatch, UpdateOp,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a turn stopped streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interruption,
    StopPattern,
    StopToken,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Interruption => "interruption",
            StopReason::StopPattern => "stop_pattern",
            StopReason::StopToken => "stop_token",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    Idle,
    Prompting,
    Streaming,
    ClauseBoundary,
    Stopping(StopReason),
    Done,
}

/// How the last agent turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed {
        turn_id: TurnId,
        text: String,
        clauses: ClauseId,
        stripped_tokens: usize,
    },
    Interrupted {
        turn_id: TurnId,
        text: String,
    },
    Abandoned {
        turn_id: TurnId,
    },
}

impl TurnOutcome {
    pub fn turn_id(&self) -> TurnId {
        match self {
            TurnOutcome::Completed { turn_id, .. }
            | TurnOutcome::Interrupted { turn_id, .. }
            | TurnOutcome::Abandoned { turn_id } => *turn_id,
        }
    }
}

/// A user turn whose recognizer end-of-turn marker was confirmed.
#[derive(Debug)]
struct UserTurn {
    turn_id: TurnId,
    text: String,
    end_of_turn: IuId,
}

pub struct GeneratorStage {
    emitter: Emitter,
    model: Box<dyn LanguageModel>,
    tokenizer: Arc<dyn Tokenizer>,
    segmenter: ClauseSegmenter,
    sampling: SamplingParams,
    history: SharedHistory,
    state: GeneratorState,
    user_words: BTreeMap<TurnId, Vec<String>>,
    ready: VecDeque<UserTurn>,
    deferred: VecDeque<UpdateBatch>,
    last_outcome: Option<TurnOutcome>,
}

impl GeneratorStage {
    pub fn new(
        emitter: Emitter,
        model: Box<dyn LanguageModel>,
        history: SharedHistory,
        config: &GenerationConfig,
    ) -> Self {
        let tokenizer = model.tokenizer();
        Self {
            emitter,
            model,
            tokenizer,
            segmenter: ClauseSegmenter::new(config),
            sampling: config.sampling.clone(),
            history,
            state: GeneratorState::Idle,
            user_words: BTreeMap::new(),
            ready: VecDeque::new(),
            deferred: VecDeque::new(),
            last_outcome: None,
        }
    }

    pub fn state(&self) -> GeneratorState {
        self.state
    }

    pub fn last_outcome(&self) -> Option<&TurnOutcome> {
        self.last_outcome.as_ref()
    }

    /// User turns waiting for a reply.
    pub fn queued_turns(&self) -> usize {
        self.ready.len()
    }

    fn run_turn(&mut self, turn: UserTurn, inbox: &mut Inbox) -> VoiceResult<TurnOutcome> {
        let turn_id = turn.turn_id;
        self.state = GeneratorState::Prompting;
        let prompt = {
            let mut history = self.history.lock();
            history.append_utterance(turn_id, Speaker::User, &turn.text);
            history.build_prompt()
        };
        info!(turn_id, prompt_tokens = prompt.tokens.len(), "🧠 Generating agent turn");

        self.state = GeneratorState::Streaming;
        let cancel = inbox.cancel_token().child_token();
        let Self {
            emitter,
            model,
            tokenizer,
            segmenter,
            sampling,
            deferred,
            state,
            ..
        } = self;
        let mut stream = TurnStream {
            emitter,
            segmenter,
            tokenizer: tokenizer.as_ref(),
            inbox,
            deferred,
            state,
            cancel: cancel.clone(),
            eos: model.eos_token(),
            turn_id,
            grounding: turn.end_of_turn,
            clause_id: 0,
            pending: Vec::new(),
            sentence: Vec::new(),
            stop: None,
            stripped: 0,
            error: None,
        };
        let result = model.generate(&prompt.tokens, sampling, &cancel, &mut |token: TokenId| stream.on_token(token));
        let outcome = stream.finish(result)?;

        match &outcome {
            TurnOutcome::Completed {
                text,
                clauses,
                stripped_tokens,
                ..
            } => {
                self.history.lock().append_utterance(turn_id, Speaker::Agent, text);
                // Downstream only learns the turn ended once the history has it.
                let eot = self
                    .emitter
                    .produce(Payload::EndOfTurn, vec![turn.end_of_turn], turn_id, *clauses);
                self.emitter.confirm(eot.id)?;
                self.emitter.flush();
                info!(turn_id, clauses, stripped_tokens, "✅ Agent turn complete: {}", text);
            }
            TurnOutcome::Interrupted { text, .. } => {
                info!(turn_id, "✋ Agent turn interrupted after: {}", text);
                self.history.lock().append_interrupted_agent_utterance(turn_id, text);
            }
            TurnOutcome::Abandoned { .. } => {}
        }
        Ok(outcome)
    }
}

impl Stage for GeneratorStage {
    fn kind(&self) -> StageKind {
        StageKind::Generator
    }

    fn handle(&mut self, batch: UpdateBatch) -> VoiceResult<()> {
        for (iu, op) in batch.iter() {
            if op != UpdateOp::Confirm {
                continue;
            }
            match (iu.creator(), &iu.payload) {
                (StageKind::Recognizer, Payload::Text(word)) => {
                    self.user_words.entry(iu.turn_id).or_default().push(word.clone());
                }
                (StageKind::Recognizer, Payload::EndOfTurn) => {
                    let words = self.user_words.remove(&iu.turn_id).unwrap_or_default();
                    let text = words.join(" ");
                    if text.trim().is_empty() {
                        debug!(turn_id = iu.turn_id, "Empty user turn, nothing to answer");
                        continue;
                    }
                    debug!(turn_id = iu.turn_id, "User turn queued: {}", text);
                    self.ready.push_back(UserTurn {
                        turn_id: iu.turn_id,
                        text,
                        end_of_turn: iu.id,
                    });
                }
                (_, Payload::Control(ControlEvent::HardInterruption)) => {
                    debug!(turn_id = iu.turn_id, "Hard interruption with no turn in flight");
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn has_work(&self) -> bool {
        !self.ready.is_empty()
    }

    fn step(&mut self, inbox: &mut Inbox) -> VoiceResult<()> {
        let Some(turn) = self.ready.pop_front() else {
            return Ok(());
        };
        let turn_id = turn.turn_id;
        let result = self.run_turn(turn, inbox);

        self.state = GeneratorState::Done;
        self.emitter.flush();
        self.emitter.retire_before(turn_id);
        self.state = GeneratorState::Idle;
        for batch in std::mem::take(&mut self.deferred) {
            self.handle(batch)?;
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.last_outcome = Some(TurnOutcome::Abandoned { turn_id });
                return Err(e);
            }
        };
        self.last_outcome = Some(outcome);
        Ok(())
    }

    fn flush(&mut self) {
        self.emitter.flush();
    }
}

/// A produced, not yet committed text IU and its byte length.
struct PendingToken {
    iu: Arc<Iu>,
    len: usize,
}

/// Per-turn streaming state, borrowed from the stage for one `generate` call.
struct TurnStream<'a> {
    emitter: &'a mut Emitter,
    segmenter: &'a ClauseSegmenter,
    tokenizer: &'a dyn Tokenizer,
    inbox: &'a mut Inbox,
    deferred: &'a mut VecDeque<UpdateBatch>,
    state: &'a mut GeneratorState,
    cancel: CancellationToken,
    eos: TokenId,
    turn_id: TurnId,
    grounding: IuId,
    clause_id: ClauseId,
    pending: Vec<PendingToken>,
    sentence: Vec<u8>,
    stop: Option<StopReason>,
    stripped: usize,
    error: Option<VoiceError>,
}

impl TurnStream<'_> {
    fn on_token(&mut self, token: TokenId) {
        if self.stop.is_some() || self.error.is_some() {
            return;
        }
        if let Err(e) = self.advance(token) {
            self.error = Some(e);
            self.cancel.cancel();
        }
    }

    fn advance(&mut self, token: TokenId) -> VoiceResult<()> {
        if self.hard_interruption_queued() {
            self.halt(StopReason::Interruption);
            return Ok(());
        }

        let bytes = self.tokenizer.detokenize(&[token]);
        self.sentence.extend_from_slice(&bytes);

        if let Some(pattern_len) = self.segmenter.stop_pattern_at_tail(&self.sentence) {
            self.strip_stop_pattern(pattern_len, bytes.len())?;
            self.halt(StopReason::StopPattern);
            return Ok(());
        }

        if token == self.eos {
            self.sentence.truncate(self.sentence.len() - bytes.len());
            self.halt(StopReason::StopToken);
            return Ok(());
        }

        let text = String::from_utf8_lossy(&bytes).into_owned();
        debug!(turn_id = self.turn_id, clause_id = self.clause_id, token = %text.escape_debug(), "Token");
        let iu = self.emitter.produce(
            Payload::Text(text.clone()),
            vec![self.grounding],
            self.turn_id,
            self.clause_id,
        );
        self.pending.push(PendingToken { iu, len: bytes.len() });

        if let Some(role_len) = self.segmenter.role_pattern_at_opening(&self.sentence) {
            let removed = self.withdraw_trailing(role_len)?;
            debug!(turn_id = self.turn_id, removed, "Role tag removed from turn opening");
            self.emitter.flush();
            return Ok(());
        }

        if self.segmenter.is_clause_boundary(&text) {
            self.commit_clause()?;
        } else {
            self.emitter.flush_if_due();
        }
        Ok(())
    }

    /// Scan newly queued batches for a hard interruption of this turn. Every
    /// batch is kept for the stage to handle once the turn is over.
    fn hard_interruption_queued(&mut self) -> bool {
        let mut found = false;
        while let Some(batch) = self.inbox.try_next() {
            found |= batch.confirmed().any(|iu| {
                iu.turn_id == self.turn_id
                    && matches!(iu.payload.as_control(), Some(ControlEvent::HardInterruption))
            });
            self.deferred.push_back(batch);
        }
        found
    }

    fn halt(&mut self, reason: StopReason) {
        debug!(turn_id = self.turn_id, reason = reason.as_str(), "Stopping generation");
        self.stop = Some(reason);
        *self.state = GeneratorState::Stopping(reason);
        self.cancel.cancel();
    }

    fn commit_clause(&mut self) -> VoiceResult<()> {
        *self.state = GeneratorState::ClauseBoundary;
        for token in std::mem::take(&mut self.pending) {
            self.emitter.confirm(token.iu.id)?;
        }
        debug!(turn_id = self.turn_id, clause_id = self.clause_id, "Clause committed");
        self.clause_id += 1;
        self.emitter.flush();
        *self.state = GeneratorState::Streaming;
        Ok(())
    }

    /// Withdraw as many trailing pending tokens as needed to cover `bytes`
    /// and cut them from the sentence.
    fn withdraw_trailing(&mut self, bytes: usize) -> VoiceResult<usize> {
        let lens: Vec<usize> = self.pending.iter().map(|t| t.len).collect();
        let count = covering_suffix(&lens, bytes);
        for _ in 0..count {
            if let Some(token) = self.pending.pop() {
                self.emitter.withdraw(token.iu.id)?;
                self.sentence.truncate(self.sentence.len().saturating_sub(token.len));
            }
        }
        Ok(count)
    }

    /// Remove the stop pattern that just matched. The current token was never
    /// produced; earlier tokens overlapping the pattern are withdrawn, then
    /// newline-only tokens before it. Text that shared a token with the
    /// pattern is produced again on its own.
    fn strip_stop_pattern(&mut self, pattern_len: usize, current_len: usize) -> VoiceResult<()> {
        let pattern_start = self.sentence.len() - pattern_len;
        let mut cut = self.sentence.len() - current_len;
        self.stripped = 1;
        while cut > pattern_start {
            let Some(token) = self.pending.pop() else {
                break;
            };
            self.emitter.withdraw(token.iu.id)?;
            cut = cut.saturating_sub(token.len);
            self.stripped += 1;
        }

        let mut kept = self.sentence.get(cut..pattern_start).unwrap_or_default().to_vec();
        self.sentence.truncate(cut);
        while kept.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
            kept.pop();
        }
        if kept.iter().any(|b| !b.is_ascii_whitespace()) {
            let text = String::from_utf8_lossy(&kept).into_owned();
            debug!(turn_id = self.turn_id, text = %text.escape_debug(), "Text kept from before the stop pattern");
            let iu = self.emitter.produce(
                Payload::Text(text),
                vec![self.grounding],
                self.turn_id,
                self.clause_id,
            );
            self.pending.push(PendingToken { iu, len: kept.len() });
            self.sentence.extend_from_slice(&kept);
        }

        while self
            .pending
            .last()
            .and_then(|t| t.iu.text())
            .is_some_and(is_newline_token)
        {
            if let Some(token) = self.pending.pop() {
                self.emitter.withdraw(token.iu.id)?;
                self.sentence.truncate(self.sentence.len().saturating_sub(token.len));
                self.stripped += 1;
            }
        }
        while self.sentence.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
            self.sentence.pop();
        }
        Ok(())
    }

    fn withdraw_pending(&mut self) -> VoiceResult<()> {
        for token in std::mem::take(&mut self.pending) {
            self.emitter.withdraw(token.iu.id)?;
            self.sentence.truncate(self.sentence.len().saturating_sub(token.len));
        }
        self.emitter.flush();
        Ok(())
    }

    /// Drop the open clause. When earlier clauses already went downstream the
    /// turn is still closed, so playback finishes and the coordinator stops
    /// treating the agent as speaking.
    fn abandon(&mut self) -> TurnOutcome {
        if let Err(e) = self.withdraw_pending() {
            warn!(turn_id = self.turn_id, "Could not withdraw pending tokens: {}", e);
        }
        if self.clause_id > 0 {
            let eot = self
                .emitter
                .produce(Payload::EndOfTurn, vec![self.grounding], self.turn_id, self.clause_id);
            if let Err(e) = self.emitter.confirm(eot.id) {
                warn!(turn_id = self.turn_id, "Could not close abandoned turn: {}", e);
            }
            self.emitter.flush();
            debug!(turn_id = self.turn_id, clauses = self.clause_id, "Abandoned turn closed downstream");
        }
        TurnOutcome::Abandoned { turn_id: self.turn_id }
    }

    fn sentence_text(&self) -> String {
        String::from_utf8_lossy(&self.sentence).trim().to_string()
    }

    fn finish(mut self, result: VoiceResult<()>) -> VoiceResult<TurnOutcome> {
        if let Some(e) = self.error.take() {
            self.abandon();
            return Err(e);
        }

        let reason = match (self.stop, result) {
            (Some(reason), Err(e)) => {
                debug!(turn_id = self.turn_id, "Model error after stop was requested: {}", e);
                reason
            }
            (Some(reason), Ok(())) => reason,
            (None, Err(e)) => {
                warn!(turn_id = self.turn_id, "Generation failed, abandoning turn: {}", e);
                return Ok(self.abandon());
            }
            (None, Ok(())) if self.cancel.is_cancelled() => {
                debug!(turn_id = self.turn_id, "Generation cancelled by shutdown");
                return Ok(self.abandon());
            }
            (None, Ok(())) => {
                self.abandon();
                return Err(VoiceError::Config(format!(
                    "language model ended turn {} without a stop token or stop pattern",
                    self.turn_id
                )));
            }
        };

        if reason == StopReason::Interruption {
            self.withdraw_pending()?;
            return Ok(TurnOutcome::Interrupted {
                turn_id: self.turn_id,
                text: self.sentence_text(),
            });
        }

        // Whatever survived stripping becomes the last clause.
        let trailing_is_blank = self
            .pending
            .iter()
            .all(|t| t.iu.text().map_or(true, |s| s.trim().is_empty()));
        if !self.pending.is_empty() {
            if trailing_is_blank {
                self.withdraw_pending()?;
            } else {
                self.commit_clause()?;
            }
        }

        self.emitter.flush();
        *self.state = GeneratorState::Done;

        Ok(TurnOutcome::Completed {
            turn_id: self.turn_id,
            text: self.sentence_text(),
            clauses: self.clause_id,
            stripped_tokens: self.stripped,
        })
    }
}

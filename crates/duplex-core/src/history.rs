//! Dialogue history with token-budget trimming, prompt assembly and the
//! post-interruption alignment rewrite.
//!
//! The history is append-only apart from one mutation: truncating the most
//! recent agent utterance to the last word the user actually heard. Access
//! from several stages goes through [`SharedHistory`], which serialises every
//! call behind one mutex.

use crate::error::{CoreError, CoreResult};
use crate::payload::TurnId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

pub type TokenId = u32;

/// The generator's tokenizer. Token budgets are always measured with it.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<TokenId>;
    fn detokenize(&self, tokens: &[TokenId]) -> Vec<u8>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Agent,
}

/// One entry of the history. This is also the export record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utterance {
    pub turn_id: TurnId,
    pub speaker: Speaker,
    pub text: String,
}

/// Role-tagged rendering of the system prompt and the retained utterances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTemplate {
    pub system_prefix: String,
    pub system_suffix: String,
    pub user_prefix: String,
    pub user_suffix: String,
    pub agent_prefix: String,
    pub agent_suffix: String,
    /// Appended after the last utterance to cue the agent's reply.
    pub generation_prefix: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            system_prefix: String::new(),
            system_suffix: "\n\n".to_string(),
            user_prefix: "User: ".to_string(),
            user_suffix: "\n\n".to_string(),
            agent_prefix: "Agent: ".to_string(),
            agent_suffix: "\n\n".to_string(),
            generation_prefix: "Agent:".to_string(),
        }
    }
}

impl PromptTemplate {
    /// Render a prompt. Empty utterances (fully rolled back agent turns) are skipped.
    pub fn render<'a>(&self, system_prompt: &str, utterances: impl IntoIterator<Item = &'a Utterance>) -> String {
        let mut out = String::new();
        out.push_str(&self.system_prefix);
        out.push_str(system_prompt);
        out.push_str(&self.system_suffix);
        for utterance in utterances {
            if utterance.text.is_empty() {
                continue;
            }
            let (prefix, suffix) = match utterance.speaker {
                Speaker::User => (&self.user_prefix, &self.user_suffix),
                Speaker::Agent => (&self.agent_prefix, &self.agent_suffix),
            };
            out.push_str(prefix);
            out.push_str(&utterance.text);
            out.push_str(suffix);
        }
        out.push_str(&self.generation_prefix);
        out
    }
}

/// A rendered prompt and its token ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    pub tokens: Vec<TokenId>,
}

/// "Truncate turn `turn_id` after word `last_word`". `None` means nothing was heard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentRequest {
    pub turn_id: TurnId,
    pub last_word: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentOutcome {
    /// The utterance was truncated.
    Applied,
    /// The utterance is not in the history yet; the request waits in the pending slot.
    Deferred,
    /// A newer agent utterance already exists; the request was ignored.
    Stale,
}

/// Ordered utterance log bounded by a token budget.
pub struct DialogueHistory {
    system_prompt: String,
    template: PromptTemplate,
    context_budget: usize,
    tokenizer: Arc<dyn Tokenizer>,
    utterances: VecDeque<Utterance>,
    token_count: usize,
    pending: Option<AlignmentRequest>,
    awaiting: Option<TurnId>,
}

impl DialogueHistory {
    /// Build an empty history. Fails if the system prompt alone exceeds the budget.
    pub fn new(
        system_prompt: impl Into<String>,
        template: PromptTemplate,
        context_budget: usize,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> CoreResult<Self> {
        let mut history = Self {
            system_prompt: system_prompt.into(),
            template,
            context_budget,
            tokenizer,
            utterances: VecDeque::new(),
            token_count: 0,
            pending: None,
            awaiting: None,
        };
        history.refresh_token_count();
        if history.token_count > context_budget {
            return Err(CoreError::Config(format!(
                "system prompt needs {} tokens but the context budget is {}",
                history.token_count, context_budget
            )));
        }
        Ok(history)
    }

    /// Append an utterance, then trim the oldest exchanges until the prompt fits.
    /// Returns how many utterances were dropped.
    pub fn append_utterance(&mut self, turn_id: TurnId, speaker: Speaker, text: &str) -> usize {
        self.utterances.push_back(Utterance {
            turn_id,
            speaker,
            text: text.trim().to_string(),
        });
        if speaker == Speaker::Agent {
            self.resolve_pending(turn_id);
        }
        debug!(turn_id, ?speaker, "Appended utterance");
        self.trim_to_budget()
    }

    /// Append the partial sentence of an interrupted agent turn. If playback
    /// already reported where it stopped, the alignment is applied at once;
    /// otherwise the utterance waits for it.
    pub fn append_interrupted_agent_utterance(&mut self, turn_id: TurnId, text: &str) -> usize {
        let had_request = self.pending.is_some_and(|req| req.turn_id == turn_id);
        let dropped = self.append_utterance(turn_id, Speaker::Agent, text);
        if !had_request {
            if let Some(previous) = self.awaiting.replace(turn_id) {
                warn!(previous, turn_id, "Agent utterance was still awaiting alignment; superseded");
            }
        }
        dropped
    }

    /// Truncate the most recent agent utterance of `turn_id` to end at
    /// `last_word` (inclusive). Applying the same request twice is a no-op the
    /// second time.
    pub fn align_last_agent_utterance(&mut self, turn_id: TurnId, last_word: Option<usize>) -> AlignmentOutcome {
        let request = AlignmentRequest { turn_id, last_word };
        let last_agent = self
            .utterances
            .iter()
            .rposition(|u| u.speaker == Speaker::Agent);

        match last_agent.map(|idx| (idx, self.utterances[idx].turn_id)) {
            Some((idx, existing)) if existing == turn_id => {
                self.apply(idx, request);
                AlignmentOutcome::Applied
            }
            Some((_, existing)) if existing > turn_id => {
                warn!(turn_id, newer = existing, "Alignment for an older agent turn ignored");
                AlignmentOutcome::Stale
            }
            _ => {
                if let Some(previous) = self.pending.replace(request) {
                    if previous != request {
                        warn!(
                            previous_turn = previous.turn_id,
                            turn_id, "Pending alignment superseded by a newer request"
                        );
                    }
                }
                debug!(turn_id, "Alignment deferred until the agent utterance is appended");
                AlignmentOutcome::Deferred
            }
        }
    }

    /// Render the system prompt plus retained utterances and tokenize it.
    pub fn build_prompt(&self) -> Prompt {
        let text = self.render();
        let tokens = self.tokenizer.tokenize(&text);
        Prompt { text, tokens }
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn context_budget(&self) -> usize {
        self.context_budget
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn utterances(&self) -> impl Iterator<Item = &Utterance> {
        self.utterances.iter()
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }

    pub fn last_agent_utterance(&self) -> Option<&Utterance> {
        self.utterances.iter().rev().find(|u| u.speaker == Speaker::Agent)
    }

    pub fn pending_alignment(&self) -> Option<AlignmentRequest> {
        self.pending
    }

    /// Turn of the interrupted agent utterance still waiting for playback to report.
    pub fn awaiting_alignment(&self) -> Option<TurnId> {
        self.awaiting
    }

    /// Ordered `{turn_id, speaker, text}` records for logging or replay.
    pub fn records(&self) -> Vec<Utterance> {
        self.utterances.iter().cloned().collect()
    }

    pub fn to_json(&self) -> CoreResult<String> {
        Ok(serde_json::to_string_pretty(&self.records())?)
    }

    fn resolve_pending(&mut self, turn_id: TurnId) {
        let Some(request) = self.pending.take() else {
            return;
        };
        if request.turn_id == turn_id {
            let idx = self.utterances.len() - 1;
            self.apply(idx, request);
        } else if request.turn_id < turn_id {
            warn!(
                pending_turn = request.turn_id,
                turn_id, "Dropping alignment for a turn that never reached the history"
            );
        } else {
            self.pending = Some(request);
        }
    }

    fn apply(&mut self, idx: usize, request: AlignmentRequest) {
        let utterance = &mut self.utterances[idx];
        let truncated = truncate_words(&utterance.text, request.last_word);
        if truncated != utterance.text {
            info!(
                turn_id = request.turn_id,
                from = %utterance.text,
                to = %truncated,
                "✂️ Aligned agent utterance to spoken words"
            );
            utterance.text = truncated;
        }
        if self.awaiting == Some(request.turn_id) {
            self.awaiting = None;
        }
        if self.pending.is_some_and(|p| p.turn_id == request.turn_id) {
            self.pending = None;
        }
        self.trim_to_budget();
    }

    fn trim_to_budget(&mut self) -> usize {
        self.refresh_token_count();
        let mut dropped = 0;
        while self.token_count > self.context_budget {
            let Some(oldest) = self.utterances.pop_front() else {
                break;
            };
            dropped += 1;
            if oldest.speaker == Speaker::User
                && self.utterances.front().is_some_and(|u| u.speaker == Speaker::Agent)
            {
                self.utterances.pop_front();
                dropped += 1;
            }
            self.refresh_token_count();
        }
        if dropped > 0 {
            info!(
                dropped,
                tokens = self.token_count,
                budget = self.context_budget,
                "Trimmed dialogue history"
            );
        }
        dropped
    }

    fn refresh_token_count(&mut self) {
        self.token_count = self.tokenizer.tokenize(&self.render()).len();
    }

    fn render(&self) -> String {
        self.template.render(&self.system_prompt, &self.utterances)
    }
}

fn truncate_words(text: &str, last_word: Option<usize>) -> String {
    match last_word {
        None => String::new(),
        Some(idx) => text.split_whitespace().take(idx + 1).collect::<Vec<_>>().join(" "),
    }
}

/// Cloneable handle that serialises access to one [`DialogueHistory`].
#[derive(Clone)]
pub struct SharedHistory(Arc<Mutex<DialogueHistory>>);

impl SharedHistory {
    pub fn new(history: DialogueHistory) -> Self {
        Self(Arc::new(Mutex::new(history)))
    }

    /// Lock the history. A panic in another stage does not make it unusable.
    pub fn lock(&self) -> MutexGuard<'_, DialogueHistory> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One token per character.
    struct CharTokenizer;

    impl Tokenizer for CharTokenizer {
        fn tokenize(&self, text: &str) -> Vec<TokenId> {
            text.chars().map(|c| c as TokenId).collect()
        }

        fn detokenize(&self, tokens: &[TokenId]) -> Vec<u8> {
            tokens
                .iter()
                .filter_map(|t| char::from_u32(*t))
                .collect::<String>()
                .into_bytes()
        }
    }

    fn history(budget: usize) -> DialogueHistory {
        DialogueHistory::new("Be brief.", PromptTemplate::default(), budget, Arc::new(CharTokenizer)).unwrap()
    }

    #[test]
    fn prompt_rendering_is_deterministic() {
        let mut h = history(1000);
        h.append_utterance(1, Speaker::User, "Hello");
        h.append_utterance(1, Speaker::Agent, "Hi there!");

        let first = h.build_prompt();
        let second = h.build_prompt();
        assert_eq!(first, second);
        assert_eq!(first.text, "Be brief.\n\nUser: Hello\n\nAgent: Hi there!\n\nAgent:");
        assert_eq!(first.tokens.len(), h.token_count());
    }

    #[test]
    fn oversized_system_prompt_is_a_config_error() {
        let result = DialogueHistory::new("x".repeat(50), PromptTemplate::default(), 10, Arc::new(CharTokenizer));
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[test]
    fn alignment_truncates_inclusive_and_is_idempotent() {
        let mut h = history(1000);
        h.append_utterance(1, Speaker::User, "Hello");
        h.append_utterance(1, Speaker::Agent, "Hi there! How can I");

        assert_eq!(h.align_last_agent_utterance(1, Some(3)), AlignmentOutcome::Applied);
        let once = h.records();
        assert_eq!(h.last_agent_utterance().unwrap().text, "Hi there! How can");

        assert_eq!(h.align_last_agent_utterance(1, Some(3)), AlignmentOutcome::Applied);
        assert_eq!(h.records(), once);
    }

    #[test]
    fn alignment_before_append_is_deferred_then_applied() {
        let mut h = history(1000);
        h.append_utterance(2, Speaker::User, "Tell me a story");

        assert_eq!(h.align_last_agent_utterance(2, Some(1)), AlignmentOutcome::Deferred);
        assert!(h.pending_alignment().is_some());

        h.append_interrupted_agent_utterance(2, "Once upon a time");
        assert_eq!(h.last_agent_utterance().unwrap().text, "Once upon");
        assert!(h.pending_alignment().is_none());
        assert!(h.awaiting_alignment().is_none());
    }

    #[test]
    fn interrupted_append_waits_for_alignment() {
        let mut h = history(1000);
        h.append_utterance(3, Speaker::User, "Stop");
        h.append_interrupted_agent_utterance(3, "Sure, I will stop now");
        assert_eq!(h.awaiting_alignment(), Some(3));

        assert_eq!(h.align_last_agent_utterance(3, Some(0)), AlignmentOutcome::Applied);
        assert_eq!(h.last_agent_utterance().unwrap().text, "Sure,");
        assert_eq!(h.awaiting_alignment(), None);
    }

    #[test]
    fn second_deferred_request_wins() {
        let mut h = history(1000);
        h.align_last_agent_utterance(4, Some(5));
        h.align_last_agent_utterance(4, Some(2));
        assert_eq!(
            h.pending_alignment(),
            Some(AlignmentRequest { turn_id: 4, last_word: Some(2) })
        );
    }

    #[test]
    fn stale_alignment_is_ignored() {
        let mut h = history(1000);
        h.append_utterance(5, Speaker::Agent, "Newer reply");
        assert_eq!(h.align_last_agent_utterance(4, Some(0)), AlignmentOutcome::Stale);
        assert_eq!(h.last_agent_utterance().unwrap().text, "Newer reply");
    }

    #[test]
    fn nothing_heard_empties_the_utterance_and_skips_it_in_prompts() {
        let mut h = history(1000);
        h.append_utterance(1, Speaker::User, "Hi");
        h.append_utterance(1, Speaker::Agent, "Hello friend");
        h.align_last_agent_utterance(1, None);

        assert_eq!(h.last_agent_utterance().unwrap().text, "");
        assert_eq!(h.build_prompt().text, "Be brief.\n\nUser: Hi\n\nAgent:");
    }

    #[test]
    fn records_serialize_as_json() {
        let mut h = history(1000);
        h.append_utterance(1, Speaker::User, "Hello");
        let json = h.to_json().unwrap();
        assert!(json.contains("\"speaker\": \"user\""));
        assert!(json.contains("\"turn_id\": 1"));
    }
}

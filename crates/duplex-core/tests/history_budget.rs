//! Integration test: dialogue history token budget.
//!
//! ## Scenario
//! 1. Fill the history with two complete user/agent exchanges.
//! 2. Append a long user utterance that pushes the prompt over budget.
//! 3. **Confirm** the oldest exchange is dropped as a pair, the system prompt
//!    survives, and the rendered prompt fits the budget.

use duplex_core::{DialogueHistory, PromptTemplate, Speaker, TokenId, Tokenizer};
use std::sync::Arc;

/// One token per character, so budgets are easy to reason about.
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
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    DialogueHistory::new("Be brief.", PromptTemplate::default(), budget, Arc::new(CharTokenizer))
        .expect("system prompt fits")
}

#[test]
fn long_user_utterance_drops_oldest_pair_first() {
    let mut h = history(120);
    h.append_utterance(1, Speaker::User, "Hello");
    h.append_utterance(1, Speaker::Agent, "Hi there!");
    h.append_utterance(2, Speaker::User, "What is the weather");
    h.append_utterance(2, Speaker::Agent, "Sunny today.");
    assert_eq!(h.token_count(), 96);

    let dropped = h.append_utterance(3, Speaker::User, &"a".repeat(40));
    assert_eq!(dropped, 2, "exactly one user/agent pair should go");

    let turns: Vec<u64> = h.utterances().map(|u| u.turn_id).collect();
    assert_eq!(turns, vec![2, 2, 3]);

    let prompt = h.build_prompt();
    assert!(prompt.text.starts_with("Be brief."), "system prompt retained: {}", prompt.text);
    assert!(prompt.tokens.len() <= h.context_budget());
    assert_eq!(prompt.tokens.len(), h.token_count());
}

#[test]
fn trimming_is_exhaustive_for_any_append_sequence() {
    let budget = 90;
    let mut h = history(budget);
    for turn in 1..=30u64 {
        let user = "word ".repeat((turn as usize * 7) % 11 + 1);
        h.append_utterance(turn, Speaker::User, &user);
        assert!(h.build_prompt().tokens.len() <= budget, "over budget after user turn {turn}");

        let agent = "reply ".repeat((turn as usize * 5) % 9 + 1);
        h.append_utterance(turn, Speaker::Agent, &agent);
        assert!(h.build_prompt().tokens.len() <= budget, "over budget after agent turn {turn}");
    }
    assert!(h.build_prompt().text.starts_with("Be brief."));
}

#[test]
fn utterance_larger_than_budget_leaves_only_the_system_prompt() {
    let mut h = history(40);
    h.append_utterance(1, Speaker::User, &"x".repeat(200));
    assert!(h.is_empty());
    assert_eq!(h.build_prompt().text, "Be brief.\n\nAgent:");
}

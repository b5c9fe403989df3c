//! Generator stage driven by hand: user turns in, agent clauses out.

mod common;

use common::{init_tracing, ScriptedModel};
use duplex_core::{
    AlignmentOutcome, ControlEvent, DialogueHistory, Emitter, GenerationConfig, Inbox, Payload, PromptTemplate,
    SharedHistory, Speaker, StageKind, TurnId, UpdateBatch, UpdateOp,
};
use duplex_voice::{GeneratorStage, GeneratorState, LanguageModel, Stage, TurnOutcome};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const HOW_CAN_I_HELP: &[&str] = &["Hi", " there", "!", " How", " can", " I", " help", "?", "\n\n"];

struct Harness {
    stage: GeneratorStage,
    inbox: Inbox,
    out: Inbox,
    recognizer: Emitter,
    history: SharedHistory,
}

impl Harness {
    fn new(model: ScriptedModel) -> Self {
        let history = SharedHistory::new(
            DialogueHistory::new("Be brief.", PromptTemplate::default(), 4000, model.tokenizer()).unwrap(),
        );
        let (gen_tx, inbox) = Inbox::channel(CancellationToken::new());
        drop(gen_tx);
        Self::with_inbox(model, history, inbox)
    }

    fn with_inbox(model: ScriptedModel, history: SharedHistory, inbox: Inbox) -> Self {
        let (out_tx, out) = Inbox::channel(CancellationToken::new());
        let mut emitter = Emitter::new(StageKind::Generator, Duration::from_millis(20));
        emitter.subscribe(out_tx);
        let stage = GeneratorStage::new(emitter, Box::new(model), history.clone(), &GenerationConfig::default());
        Self {
            stage,
            inbox,
            out,
            recognizer: Emitter::new(StageKind::Recognizer, Duration::from_millis(20)),
            history,
        }
    }

    /// Hand the stage a confirmed user turn and run generation for it.
    fn user_says(&mut self, turn_id: TurnId, text: &str) -> TurnOutcome {
        let mut batch = UpdateBatch::new();
        let mut words = Vec::new();
        for word in text.split_whitespace() {
            let iu = self.recognizer.produce(Payload::Text(word.to_string()), vec![], turn_id, 0);
            self.recognizer.confirm(iu.id).unwrap();
            words.push(iu.id);
            batch.push(iu, UpdateOp::Confirm);
        }
        let eot = self.recognizer.produce(Payload::EndOfTurn, words, turn_id, 0);
        self.recognizer.confirm(eot.id).unwrap();
        batch.push(eot, UpdateOp::Confirm);

        self.stage.handle(batch).unwrap();
        assert!(self.stage.has_work());
        self.stage.step(&mut self.inbox).unwrap();
        assert_eq!(self.stage.state(), GeneratorState::Idle);
        self.stage.last_outcome().cloned().unwrap()
    }

    /// Every operation the stage sent downstream, as (text or payload kind, op).
    fn emitted(&mut self) -> Vec<(String, UpdateOp)> {
        let mut ops = Vec::new();
        while let Some(batch) = self.out.try_next() {
            for (iu, op) in batch.iter() {
                let label = iu.text().map(str::to_string).unwrap_or_else(|| iu.payload.kind().to_string());
                ops.push((label, op));
            }
        }
        ops
    }

    fn agent_text(&self) -> Option<String> {
        self.history.lock().last_agent_utterance().map(|u| u.text.clone())
    }
}

fn confirmed(ops: &[(String, UpdateOp)]) -> Vec<&str> {
    ops.iter()
        .filter(|(_, op)| *op == UpdateOp::Confirm)
        .map(|(label, _)| label.as_str())
        .collect()
}

#[test]
fn completed_turn_commits_clauses_and_strips_the_stop_pattern() {
    init_tracing();
    let mut h = Harness::new(ScriptedModel::new(&[HOW_CAN_I_HELP]));

    let outcome = h.user_says(1, "hello there");
    assert_eq!(
        outcome,
        TurnOutcome::Completed {
            turn_id: 1,
            text: "Hi there! How can I help?".to_string(),
            clauses: 2,
            stripped_tokens: 1,
        }
    );

    let records = h.history.lock().records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].speaker, Speaker::User);
    assert_eq!(records[0].text, "hello there");
    assert_eq!(records[1].speaker, Speaker::Agent);
    assert_eq!(records[1].text, "Hi there! How can I help?");

    let ops = h.emitted();
    assert_eq!(
        confirmed(&ops),
        vec!["Hi", " there", "!", " How", " can", " I", " help", "?", "end_of_turn"]
    );
    assert!(ops.iter().all(|(label, _)| label != "\n\n"));
}

#[test]
fn text_sharing_a_token_with_the_stop_pattern_is_kept() {
    let mut h = Harness::new(ScriptedModel::new(&[&[
        "Hi", " there", "!", " How", " can", " I", " help", "?\n\n",
    ]]));

    let outcome = h.user_says(1, "hello there");
    assert_eq!(
        outcome,
        TurnOutcome::Completed {
            turn_id: 1,
            text: "Hi there! How can I help?".to_string(),
            clauses: 2,
            stripped_tokens: 1,
        }
    );
    assert_eq!(h.agent_text().as_deref(), Some("Hi there! How can I help?"));

    let ops = h.emitted();
    assert_eq!(
        confirmed(&ops),
        vec!["Hi", " there", "!", " How", " can", " I", " help", "?", "end_of_turn"]
    );
    assert!(ops.iter().all(|(label, _)| !label.contains('\n')));
}

#[test]
fn pattern_split_across_tokens_keeps_the_leading_text() {
    let mut h = Harness::new(ScriptedModel::new(&[&["Done", " now\n", "\n"]]));

    let outcome = h.user_says(1, "finish up");
    assert_eq!(
        outcome,
        TurnOutcome::Completed {
            turn_id: 1,
            text: "Done now".to_string(),
            clauses: 1,
            stripped_tokens: 2,
        }
    );
    let ops = h.emitted();
    assert!(ops.contains(&(" now\n".to_string(), UpdateOp::Withdraw)));
    assert_eq!(confirmed(&ops), vec!["Done", " now", "end_of_turn"]);
}

#[test]
fn newline_tokens_before_the_stop_pattern_are_stripped() {
    let mut h = Harness::new(ScriptedModel::new(&[&["Sure", ".", "\n", "\n"], &["Okay", "\n", "\n"]]));

    let outcome = h.user_says(1, "can you do that");
    assert_eq!(
        outcome,
        TurnOutcome::Completed {
            turn_id: 1,
            text: "Sure.".to_string(),
            clauses: 1,
            stripped_tokens: 2,
        }
    );
    let ops = h.emitted();
    assert!(ops.contains(&("\n".to_string(), UpdateOp::Withdraw)));
    assert_eq!(confirmed(&ops), vec!["Sure", ".", "end_of_turn"]);

    // No punctuation at all: the leftover words still become the last clause.
    let outcome = h.user_says(2, "and then");
    assert_eq!(
        outcome,
        TurnOutcome::Completed {
            turn_id: 2,
            text: "Okay".to_string(),
            clauses: 1,
            stripped_tokens: 2,
        }
    );
    assert_eq!(confirmed(&h.emitted()), vec!["Okay", "end_of_turn"]);
}

#[test]
fn end_of_sequence_token_stops_the_turn() {
    let mut h = Harness::new(ScriptedModel::new(&[&["Fine", ".", "<eos>"]]));
    let outcome = h.user_says(1, "how are you");
    assert_eq!(
        outcome,
        TurnOutcome::Completed {
            turn_id: 1,
            text: "Fine.".to_string(),
            clauses: 1,
            stripped_tokens: 0,
        }
    );
    assert_eq!(h.agent_text().as_deref(), Some("Fine."));
}

#[test]
fn role_tag_at_the_opening_is_removed() {
    let mut h = Harness::new(ScriptedModel::new(&[&[" Agent", ":", " Hello", ".", "\n\n"]]));
    let outcome = h.user_says(1, "hi");
    let TurnOutcome::Completed { text, clauses, .. } = outcome else {
        panic!("turn did not complete: {outcome:?}");
    };
    assert_eq!(text, "Hello.");
    assert_eq!(clauses, 1);

    let ops = h.emitted();
    assert!(ops.contains(&(" Agent".to_string(), UpdateOp::Withdraw)));
    assert!(ops.contains(&(":".to_string(), UpdateOp::Withdraw)));
    assert_eq!(confirmed(&ops), vec![" Hello", ".", "end_of_turn"]);
}

#[test]
fn failed_generation_abandons_only_that_turn() {
    let mut h = Harness::new(ScriptedModel::new(&[&["Yes", ".", "\n\n"]]).failing_first());

    assert_eq!(h.user_says(1, "first"), TurnOutcome::Abandoned { turn_id: 1 });
    assert_eq!(h.agent_text(), None);
    assert!(!confirmed(&h.emitted()).contains(&"end_of_turn"));

    let outcome = h.user_says(2, "second");
    assert!(matches!(outcome, TurnOutcome::Completed { turn_id: 2, .. }));
    assert_eq!(h.agent_text().as_deref(), Some("Yes."));
}

#[test]
fn turn_failing_after_a_clause_is_still_closed() {
    let mut h = Harness::new(
        ScriptedModel::new(&[&["Yes", ".", " And", " then"], &["Right", ".", "\n\n"]]).failing_after(3),
    );

    assert_eq!(h.user_says(1, "first"), TurnOutcome::Abandoned { turn_id: 1 });
    assert_eq!(h.agent_text(), None);
    let ops = h.emitted();
    assert!(ops.contains(&(" And".to_string(), UpdateOp::Withdraw)));
    // The clause already handed to synthesis gets its end of turn.
    assert_eq!(confirmed(&ops), vec!["Yes", ".", "end_of_turn"]);

    let outcome = h.user_says(2, "second");
    assert!(matches!(outcome, TurnOutcome::Completed { turn_id: 2, .. }));
    assert_eq!(h.agent_text().as_deref(), Some("Right."));
}

#[test]
fn model_ending_without_a_stop_condition_is_fatal() {
    let mut h = Harness::new(ScriptedModel::new(&[&["Well", ","]]));
    let mut batch = UpdateBatch::new();
    let word = h.recognizer.produce(Payload::Text("hm".into()), vec![], 1, 0);
    h.recognizer.confirm(word.id).unwrap();
    let eot = h.recognizer.produce(Payload::EndOfTurn, vec![word.id], 1, 0);
    h.recognizer.confirm(eot.id).unwrap();
    batch.push(word, UpdateOp::Confirm);
    batch.push(eot, UpdateOp::Confirm);
    h.stage.handle(batch).unwrap();

    let err = h.stage.step(&mut h.inbox).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(h.stage.last_outcome(), Some(&TurnOutcome::Abandoned { turn_id: 1 }));
    // The committed clause stays committed and the turn is closed behind it.
    assert_eq!(confirmed(&h.emitted()), vec!["Well", ",", "end_of_turn"]);
}

#[test]
fn hard_interruption_mid_clause_keeps_only_committed_text() {
    init_tracing();
    let script: &[&str] = &[
        "Hi", " there", "!", " How", " can", " I", " help", "?", " Let", " me", " check", ".", "\n\n",
    ];

    let (gen_tx, inbox) = Inbox::channel(CancellationToken::new());
    let mut coordinator = Emitter::new(StageKind::Coordinator, Duration::from_millis(20));
    coordinator.subscribe(gen_tx);
    // The user barges in while " me" is being generated.
    let model = ScriptedModel::new(&[script]).with_hook(9, move || {
        let iu = coordinator.produce(Payload::Control(ControlEvent::HardInterruption), vec![], 1, 0);
        coordinator.confirm(iu.id).unwrap();
        coordinator.flush();
    });
    let history = SharedHistory::new(
        DialogueHistory::new("Be brief.", PromptTemplate::default(), 4000, model.tokenizer()).unwrap(),
    );
    let mut h = Harness::with_inbox(model, history, inbox);

    let outcome = h.user_says(1, "hello");
    assert_eq!(
        outcome,
        TurnOutcome::Interrupted {
            turn_id: 1,
            text: "Hi there! How can I help?".to_string(),
        }
    );

    let ops = h.emitted();
    assert!(ops.contains(&(" Let".to_string(), UpdateOp::Withdraw)));
    assert!(!ops.iter().any(|(label, _)| label == " me" || label == " check"));
    assert!(!confirmed(&ops).contains(&"end_of_turn"));

    {
        let history = h.history.lock();
        assert_eq!(history.awaiting_alignment(), Some(1));
        assert_eq!(history.last_agent_utterance().map(|u| u.text.as_str()), Some("Hi there! How can I help?"));
    }

    // Playback stopped after the fourth word.
    let mut history = h.history.lock();
    assert_eq!(history.align_last_agent_utterance(1, Some(3)), AlignmentOutcome::Applied);
    assert_eq!(history.last_agent_utterance().map(|u| u.text.as_str()), Some("Hi there! How can"));
    assert_eq!(history.awaiting_alignment(), None);
    assert_eq!(history.align_last_agent_utterance(1, Some(3)), AlignmentOutcome::Applied);
    assert_eq!(history.last_agent_utterance().map(|u| u.text.as_str()), Some("Hi there! How can"));
}

#[test]
fn prompt_carries_the_history() {
    let model = ScriptedModel::new(&[HOW_CAN_I_HELP, &["Bye", ".", "\n\n"]]);
    let prompts = model.prompts.clone();
    let mut h = Harness::new(model);
    h.user_says(1, "hello there");
    h.user_says(3, "goodbye");

    let prompts = prompts.lock().unwrap();
    assert_eq!(prompts.len(), 2);
    let second = h.history.lock().build_prompt();
    assert!(second.text.contains("User: hello there\n\nAgent: Hi there! How can I help?\n\nUser: goodbye"));
    assert!(second.text.ends_with("Agent: Bye.\n\nAgent:"));
    // The second prompt was built before the reply was appended.
    assert!(prompts[1].len() < second.tokens.len());
}

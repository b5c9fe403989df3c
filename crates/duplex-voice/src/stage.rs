//! Stage runner: one dedicated thread per stage.
//!
//! A stage drains its inbox in FIFO order, does one unit of work when it has
//! any (play a chunk, synthesize a clause, generate a turn), and otherwise
//! blocks on the inbox. The thread owns a current-thread tokio runtime only
//! to wait on the inbox and the cancellation token together.

use crate::error::VoiceResult;
use duplex_core::{Inbox, StageKind, UpdateBatch};
use std::thread;
use tracing::{error, info, warn};

pub trait Stage {
    fn kind(&self) -> StageKind;

    /// Apply one incoming batch. Must not block on external calls.
    fn handle(&mut self, batch: UpdateBatch) -> VoiceResult<()>;

    /// Whether [`Stage::step`] has something to do.
    fn has_work(&self) -> bool {
        false
    }

    /// Do one unit of queued work. May block on an external call; the inbox
    /// is passed so the stage can watch for control signals meanwhile.
    fn step(&mut self, _inbox: &mut Inbox) -> VoiceResult<()> {
        Ok(())
    }

    /// Send pending operations before the runner goes idle.
    fn flush(&mut self) {}
}

pub type StageHandle = thread::JoinHandle<VoiceResult<()>>;

/// Spawn a stage on its own thread. `build` runs on that thread, so stages
/// holding non-`Send` resources (the WebRTC VAD) can be constructed there.
pub fn spawn_stage<S, F>(name: &str, build: F, inbox: Inbox) -> VoiceResult<StageHandle>
where
    S: Stage,
    F: FnOnce() -> VoiceResult<S> + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(format!("duplex-{name}"))
        .spawn(move || {
            let mut inbox = inbox;
            let mut stage = match build() {
                Ok(stage) => stage,
                Err(e) => {
                    error!("Failed to build stage: {}", e);
                    return Err(e);
                }
            };
            run_stage(&mut stage, &mut inbox)
        })?;
    Ok(handle)
}

/// Drive a stage until its inbox is cancelled or every sender is gone.
pub fn run_stage<S: Stage>(stage: &mut S, inbox: &mut Inbox) -> VoiceResult<()> {
    let kind = stage.kind();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    info!(stage = %kind, "🔄 Stage started");
    loop {
        while let Some(batch) = inbox.try_next() {
            settle(kind, stage.handle(batch))?;
        }
        if inbox.is_cancelled() {
            break;
        }
        if stage.has_work() {
            settle(kind, stage.step(inbox))?;
            continue;
        }
        stage.flush();
        match rt.block_on(inbox.next()) {
            Some(batch) => settle(kind, stage.handle(batch))?,
            None => break,
        }
    }
    stage.flush();
    info!(stage = %kind, "🛑 Stage stopped");
    Ok(())
}

/// Fatal errors end the stage; anything else was scoped to one turn.
fn settle(kind: StageKind, result: VoiceResult<()>) -> VoiceResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => {
            error!(stage = %kind, "Fatal stage error: {}", e);
            Err(e)
        }
        Err(e) if e.is_protocol_violation() => {
            if cfg!(debug_assertions) {
                panic!("{kind}: {e}");
            }
            error!(stage = %kind, "Protocol violation, turn abandoned: {}", e);
            Ok(())
        }
        Err(e) => {
            warn!(stage = %kind, "Stage error, turn abandoned: {}", e);
            Ok(())
        }
    }
}

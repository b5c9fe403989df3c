//! Update channel: ordered batches of (IU, operation) pairs between stages.
//!
//! A stage records its operations through an [`Emitter`], which keeps the
//! arena lifecycle and the outgoing [`UpdateBatch`] in step. Batches are
//! flushed to subscribers at a bounded cadence, or immediately when the stage
//! reaches a clause or turn boundary.

use crate::error::CoreResult;
use crate::iu::{Iu, IuArena, IuId, Lifecycle, StageKind};
use crate::payload::{ClauseId, Payload, TurnId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The three operations exchanged for an IU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Produce,
    Confirm,
    Withdraw,
}

/// An ordered sequence of operations emitted atomically by one stage.
#[derive(Debug, Clone, Default)]
pub struct UpdateBatch {
    entries: Vec<(Arc<Iu>, UpdateOp)>,
}

impl UpdateBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, iu: Arc<Iu>, op: UpdateOp) {
        self.entries.push((iu, op));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arc<Iu>, UpdateOp)> {
        self.entries.iter().map(|(iu, op)| (iu, *op))
    }

    /// Units confirmed in this batch, in order.
    pub fn confirmed(&self) -> impl Iterator<Item = &Arc<Iu>> {
        self.iter()
            .filter(|(_, op)| *op == UpdateOp::Confirm)
            .map(|(iu, _)| iu)
    }

    fn filtered(&self, accepts: PayloadFilter) -> UpdateBatch {
        UpdateBatch {
            entries: self
                .entries
                .iter()
                .filter(|(iu, _)| accepts(&iu.payload))
                .cloned()
                .collect(),
        }
    }
}

impl FromIterator<(Arc<Iu>, UpdateOp)> for UpdateBatch {
    fn from_iter<T: IntoIterator<Item = (Arc<Iu>, UpdateOp)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

pub type BatchSender = mpsc::UnboundedSender<UpdateBatch>;

/// Decides which payloads a subscriber receives.
pub type PayloadFilter = fn(&Payload) -> bool;

fn accept_all(_: &Payload) -> bool {
    true
}

struct Subscriber {
    tx: BatchSender,
    accepts: PayloadFilter,
}

/// Outgoing side of a stage: pending operations plus the subscriber list.
pub struct Outbox {
    creator: StageKind,
    subscribers: Vec<Subscriber>,
    pending: UpdateBatch,
    last_flush: Instant,
    max_delay: Duration,
}

impl Outbox {
    pub fn new(creator: StageKind, max_delay: Duration) -> Self {
        Self {
            creator,
            subscribers: Vec::new(),
            pending: UpdateBatch::new(),
            last_flush: Instant::now(),
            max_delay,
        }
    }

    pub fn subscribe(&mut self, tx: BatchSender) {
        self.subscribe_filtered(tx, accept_all);
    }

    pub fn subscribe_filtered(&mut self, tx: BatchSender, accepts: PayloadFilter) {
        self.subscribers.push(Subscriber { tx, accepts });
    }

    pub fn push(&mut self, iu: Arc<Iu>, op: UpdateOp) {
        self.pending.push(iu, op);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn is_due(&self) -> bool {
        self.has_pending() && self.last_flush.elapsed() >= self.max_delay
    }

    pub fn flush_if_due(&mut self) -> usize {
        if self.is_due() {
            self.flush()
        } else {
            0
        }
    }

    /// Send everything pending. Returns the number of operations flushed.
    ///
    /// Subscribers whose receiving stage has gone away are dropped.
    pub fn flush(&mut self) -> usize {
        self.last_flush = Instant::now();
        if self.pending.is_empty() {
            return 0;
        }
        let batch = std::mem::take(&mut self.pending);
        let creator = self.creator;
        self.subscribers.retain(|sub| {
            let view = batch.filtered(sub.accepts);
            if view.is_empty() {
                return true;
            }
            match sub.tx.send(view) {
                Ok(()) => true,
                Err(_) => {
                    debug!(stage = %creator, "Subscriber closed, dropping it");
                    false
                }
            }
        });
        batch.len()
    }
}

/// Incoming side of a stage: a FIFO of batches with cooperative cancellation.
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<UpdateBatch>,
    cancel: CancellationToken,
}

impl Inbox {
    pub fn channel(cancel: CancellationToken) -> (BatchSender, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Inbox { rx, cancel })
    }

    /// Next queued batch without waiting.
    pub fn try_next(&mut self) -> Option<UpdateBatch> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Wait for the next batch. `None` once cancelled or every sender is gone.
    pub async fn next(&mut self) -> Option<UpdateBatch> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            batch = self.rx.recv() => batch,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// A stage's arena and outbox kept in step.
pub struct Emitter {
    arena: IuArena,
    outbox: Outbox,
}

impl Emitter {
    pub fn new(creator: StageKind, max_delay: Duration) -> Self {
        Self {
            arena: IuArena::new(creator),
            outbox: Outbox::new(creator, max_delay),
        }
    }

    pub fn creator(&self) -> StageKind {
        self.arena.creator()
    }

    pub fn subscribe(&mut self, tx: BatchSender) {
        self.outbox.subscribe(tx);
    }

    pub fn subscribe_filtered(&mut self, tx: BatchSender, accepts: PayloadFilter) {
        self.outbox.subscribe_filtered(tx, accepts);
    }

    /// Create a new uncommitted unit and queue its PRODUCE.
    pub fn produce(
        &mut self,
        payload: Payload,
        grounded_in: Vec<IuId>,
        turn_id: TurnId,
        clause_id: ClauseId,
    ) -> Arc<Iu> {
        let iu = self.arena.alloc(payload, grounded_in, turn_id, clause_id);
        self.outbox.push(Arc::clone(&iu), UpdateOp::Produce);
        iu
    }

    /// Commit one of this stage's units and queue its CONFIRM.
    pub fn confirm(&mut self, id: IuId) -> CoreResult<()> {
        self.arena.commit(id)?;
        let iu = Arc::clone(self.arena.get(id)?);
        self.outbox.push(iu, UpdateOp::Confirm);
        Ok(())
    }

    /// Revoke one of this stage's units and queue its WITHDRAW.
    /// Returns `false` if it was already revoked.
    pub fn withdraw(&mut self, id: IuId) -> CoreResult<bool> {
        if !self.arena.revoke(id)? {
            return Ok(false);
        }
        let iu = Arc::clone(self.arena.get(id)?);
        self.outbox.push(iu, UpdateOp::Withdraw);
        Ok(true)
    }

    /// Withdraw everything this stage already emitted that is grounded in
    /// `upstream`. Committed units cannot be withdrawn and are reported.
    pub fn withdraw_derived_from(&mut self, upstream: IuId) -> CoreResult<Vec<IuId>> {
        let mut withdrawn = Vec::new();
        for id in self.arena.derived_from(upstream) {
            match self.arena.state(id)? {
                Lifecycle::Produced => {
                    self.withdraw(id)?;
                    withdrawn.push(id);
                }
                Lifecycle::Committed => {
                    warn!(%upstream, derived = %id, "Upstream unit withdrawn after derived unit was committed");
                }
                Lifecycle::Revoked => {}
            }
        }
        Ok(withdrawn)
    }

    pub fn state(&self, id: IuId) -> CoreResult<Lifecycle> {
        self.arena.state(id)
    }

    pub fn flush(&mut self) -> usize {
        self.outbox.flush()
    }

    pub fn flush_if_due(&mut self) -> usize {
        self.outbox.flush_if_due()
    }

    pub fn has_pending(&self) -> bool {
        self.outbox.has_pending()
    }

    pub fn retire_before(&mut self, turn_id: TurnId) -> usize {
        self.arena.retire_before(turn_id)
    }

    /// Units still held in the arena.
    pub fn tracked(&self) -> usize {
        self.arena.len()
    }
}

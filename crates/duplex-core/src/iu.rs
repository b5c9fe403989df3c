//! Incremental units and the per-stage arena that owns them.
//!
//! Every fragment a stage produces is an [`Iu`]: an immutable payload shared
//! as `Arc<Iu>` plus a lifecycle flag that lives in the creator's
//! [`IuArena`]. Grounding links are plain [`IuId`]s, so no stage ever holds a
//! strong reference into another stage's arena.

use crate::error::{CoreError, CoreResult};
use crate::payload::{ClauseId, Payload, TurnId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

/// The fixed set of stages in the agent topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Capture,
    Recognizer,
    Coordinator,
    Generator,
    Synthesizer,
    Player,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Capture => "capture",
            StageKind::Recognizer => "recognizer",
            StageKind::Coordinator => "coordinator",
            StageKind::Generator => "generator",
            StageKind::Synthesizer => "synthesizer",
            StageKind::Player => "player",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arena handle: unique and monotonic per creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IuId {
    pub creator: StageKind,
    pub seq: u64,
}

impl fmt::Display for IuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.creator, self.seq)
    }
}

/// An incremental unit. Immutable once created; only the lifecycle flag in
/// the creator's arena changes.
#[derive(Debug, Clone)]
pub struct Iu {
    pub id: IuId,
    pub grounded_in: Vec<IuId>,
    pub payload: Payload,
    pub turn_id: TurnId,
    pub clause_id: ClauseId,
    pub created_at: DateTime<Utc>,
}

impl Iu {
    pub fn creator(&self) -> StageKind {
        self.id.creator
    }

    pub fn text(&self) -> Option<&str> {
        self.payload.as_text()
    }
}

/// Commit state of a unit. `Committed` and `Revoked` are both terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Produced,
    Committed,
    Revoked,
}

impl Lifecycle {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Lifecycle::Produced)
    }
}

#[derive(Debug)]
struct Record {
    iu: Arc<Iu>,
    state: Lifecycle,
}

/// Append-only store of the units one stage has created.
///
/// Records for finished turns can be retired from the front; their ids stay
/// reserved so sequence numbers never repeat.
#[derive(Debug)]
pub struct IuArena {
    creator: StageKind,
    base: u64,
    records: VecDeque<Record>,
}

impl IuArena {
    pub fn new(creator: StageKind) -> Self {
        Self {
            creator,
            base: 0,
            records: VecDeque::new(),
        }
    }

    pub fn creator(&self) -> StageKind {
        self.creator
    }

    /// Create a new uncommitted, unrevoked unit.
    pub fn alloc(
        &mut self,
        payload: Payload,
        grounded_in: Vec<IuId>,
        turn_id: TurnId,
        clause_id: ClauseId,
    ) -> Arc<Iu> {
        let id = IuId {
            creator: self.creator,
            seq: self.base + self.records.len() as u64,
        };
        let iu = Arc::new(Iu {
            id,
            grounded_in,
            payload,
            turn_id,
            clause_id,
            created_at: Utc::now(),
        });
        self.records.push_back(Record {
            iu: Arc::clone(&iu),
            state: Lifecycle::Produced,
        });
        iu
    }

    pub fn get(&self, id: IuId) -> CoreResult<&Arc<Iu>> {
        let idx = self.index(id)?;
        Ok(&self.records[idx].iu)
    }

    pub fn state(&self, id: IuId) -> CoreResult<Lifecycle> {
        let idx = self.index(id)?;
        Ok(self.records[idx].state)
    }

    /// Mark a unit committed. Legal once, and never after a revoke.
    pub fn commit(&mut self, id: IuId) -> CoreResult<()> {
        let idx = self.index(id)?;
        let record = &mut self.records[idx];
        match record.state {
            Lifecycle::Produced => {
                record.state = Lifecycle::Committed;
                Ok(())
            }
            Lifecycle::Committed => Err(CoreError::Protocol(format!("{id} is already committed"))),
            Lifecycle::Revoked => Err(CoreError::Protocol(format!("{id} was revoked and cannot be committed"))),
        }
    }

    /// Mark a unit revoked. Returns `false` when it already was.
    pub fn revoke(&mut self, id: IuId) -> CoreResult<bool> {
        let idx = self.index(id)?;
        let record = &mut self.records[idx];
        match record.state {
            Lifecycle::Produced => {
                record.state = Lifecycle::Revoked;
                Ok(true)
            }
            Lifecycle::Revoked => Ok(false),
            Lifecycle::Committed => Err(CoreError::Protocol(format!("{id} is committed and cannot be withdrawn"))),
        }
    }

    /// Every unit in this arena grounded, directly or transitively, in `upstream`.
    ///
    /// Units are always created after what they are grounded in, so one
    /// forward pass sees the whole chain.
    pub fn derived_from(&self, upstream: IuId) -> Vec<IuId> {
        let mut reached: HashSet<IuId> = HashSet::from([upstream]);
        let mut derived = Vec::new();
        for record in &self.records {
            if record.iu.grounded_in.iter().any(|g| reached.contains(g)) {
                reached.insert(record.iu.id);
                derived.push(record.iu.id);
            }
        }
        derived
    }

    /// Drop records of turns older than `turn_id` from the front of the arena.
    pub fn retire_before(&mut self, turn_id: TurnId) -> usize {
        let mut retired = 0;
        while let Some(front) = self.records.front() {
            if front.iu.turn_id >= turn_id {
                break;
            }
            self.records.pop_front();
            self.base += 1;
            retired += 1;
        }
        retired
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn index(&self, id: IuId) -> CoreResult<usize> {
        if id.creator != self.creator {
            return Err(CoreError::Protocol(format!(
                "{id} belongs to {}, not {}",
                id.creator, self.creator
            )));
        }
        if id.seq < self.base {
            return Err(CoreError::UnknownIu(id));
        }
        let idx = (id.seq - self.base) as usize;
        if idx >= self.records.len() {
            return Err(CoreError::UnknownIu(id));
        }
        Ok(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Payload {
        Payload::Text(s.to_string())
    }

    #[test]
    fn ids_are_monotonic_per_creator() {
        let mut arena = IuArena::new(StageKind::Generator);
        let a = arena.alloc(text("a"), vec![], 1, 0);
        let b = arena.alloc(text("b"), vec![], 1, 0);
        assert!(a.id < b.id);
        assert_eq!(b.id.seq, 1);
        assert_eq!(a.creator(), StageKind::Generator);
    }

    #[test]
    fn committed_and_revoked_are_mutually_terminal() {
        let mut arena = IuArena::new(StageKind::Generator);
        let a = arena.alloc(text("a"), vec![], 1, 0);
        let b = arena.alloc(text("b"), vec![], 1, 0);

        arena.commit(a.id).unwrap();
        assert!(arena.commit(a.id).is_err());
        assert!(arena.revoke(a.id).is_err());

        assert!(arena.revoke(b.id).unwrap());
        assert!(!arena.revoke(b.id).unwrap());
        assert!(matches!(arena.commit(b.id), Err(CoreError::Protocol(_))));
        assert_eq!(arena.state(b.id).unwrap(), Lifecycle::Revoked);
    }

    #[test]
    fn foreign_ids_are_rejected() {
        let mut arena = IuArena::new(StageKind::Synthesizer);
        let foreign = IuId {
            creator: StageKind::Generator,
            seq: 0,
        };
        assert!(matches!(arena.commit(foreign), Err(CoreError::Protocol(_))));
    }

    #[test]
    fn derived_from_follows_the_chain() {
        let upstream = IuId {
            creator: StageKind::Generator,
            seq: 7,
        };
        let mut arena = IuArena::new(StageKind::Synthesizer);
        let first = arena.alloc(text("x"), vec![upstream], 1, 0);
        let _unrelated = arena.alloc(text("y"), vec![], 1, 0);
        let second = arena.alloc(text("z"), vec![first.id], 1, 0);

        assert_eq!(arena.derived_from(upstream), vec![first.id, second.id]);
    }

    #[test]
    fn retired_ids_stay_reserved() {
        let mut arena = IuArena::new(StageKind::Recognizer);
        let old = arena.alloc(text("old"), vec![], 1, 0);
        arena.alloc(text("new"), vec![], 2, 0);

        assert_eq!(arena.retire_before(2), 1);
        assert!(matches!(arena.state(old.id), Err(CoreError::UnknownIu(_))));

        let next = arena.alloc(text("next"), vec![], 2, 0);
        assert_eq!(next.id.seq, 2);
        assert_eq!(arena.len(), 2);
    }
}

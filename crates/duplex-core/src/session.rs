//! Per-session context shared by every stage of one conversation.

use crate::payload::TurnId;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Session-scoped counters. Each concurrent conversation gets its own
/// context, so stages never rely on process-wide state.
#[derive(Debug)]
pub struct SessionContext {
    id: Uuid,
    last_turn: AtomicU64,
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            last_turn: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Allocate the next turn id. Strictly increasing, starting at 1.
    pub fn next_turn_id(&self) -> TurnId {
        self.last_turn.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Most recently allocated turn id, 0 before the first turn.
    pub fn current_turn_id(&self) -> TurnId {
        self.last_turn.load(Ordering::SeqCst)
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_ids_strictly_increase() {
        let session = SessionContext::new();
        assert_eq!(session.current_turn_id(), 0);
        let a = session.next_turn_id();
        let b = session.next_turn_id();
        assert!(b > a);
        assert_eq!(session.current_turn_id(), b);
    }

    #[test]
    fn sessions_are_independent() {
        let first = SessionContext::new();
        let second = SessionContext::new();
        first.next_turn_id();
        assert_eq!(second.current_turn_id(), 0);
        assert_ne!(first.id(), second.id());
    }
}

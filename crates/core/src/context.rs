//! Conversation Context
//!
//! Holds the ordered, final turns of one session. The same accumulator is
//! shared by the live pipeline and the text-chat path, so voice and typed turns
//! interleave in the order they were finalized.

use crate::turn::Turn;
use std::collections::HashSet;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ContextError {
    #[error("Turn {0} is provisional and cannot enter the context")]
    Provisional(Uuid),
}

#[derive(Default)]
struct Inner {
    turns: Vec<Turn>,
    ids: HashSet<Uuid>,
}

/// Append-only record of final turns for one session.
///
/// There is no eviction; only [`ContextAccumulator::clear`] removes turns.
#[derive(Default)]
pub struct ContextAccumulator {
    inner: RwLock<Inner>,
}

impl ContextAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a context with previously persisted turns, keeping their order.
    pub fn with_turns(turns: Vec<Turn>) -> Self {
        let mut inner = Inner::default();
        for turn in turns {
            if turn.is_final() && inner.ids.insert(turn.id) {
                inner.turns.push(turn);
            }
        }
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Appends a final turn.
    ///
    /// Returns `Ok(None)` when a turn with the same id is already present.
    /// Otherwise returns the stored turn, whose timestamp is raised to the
    /// previous turn's if the clock went backwards.
    pub async fn append(&self, mut turn: Turn) -> Result<Option<Turn>, ContextError> {
        if !turn.is_final() {
            return Err(ContextError::Provisional(turn.id));
        }
        let mut inner = self.inner.write().await;
        if inner.ids.contains(&turn.id) {
            return Ok(None);
        }
        if let Some(last) = inner.turns.last() {
            if turn.timestamp < last.timestamp {
                turn.timestamp = last.timestamp;
            }
        }
        inner.ids.insert(turn.id);
        inner.turns.push(turn.clone());
        Ok(Some(turn))
    }

    /// All turns in finalization order.
    pub async fn snapshot(&self) -> Vec<Turn> {
        self.inner.read().await.turns.clone()
    }

    /// The most recent `window` turns, or everything when `window` is `None`.
    pub async fn recent(&self, window: Option<usize>) -> Vec<Turn> {
        let inner = self.inner.read().await;
        match window {
            Some(n) if n < inner.turns.len() => inner.turns[inner.turns.len() - n..].to_vec(),
            _ => inner.turns.clone(),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.turns.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops every turn and returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut inner = self.inner.write().await;
        let removed = inner.turns.len();
        inner.turns.clear();
        inner.ids.clear();
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::{Speaker, TurnStatus};
    use chrono::Duration;

    #[tokio::test]
    async fn test_append_is_idempotent_per_turn_id() {
        let ctx = ContextAccumulator::new();
        let turn = Turn::user("hello");
        assert!(ctx.append(turn.clone()).await.unwrap().is_some());
        assert!(ctx.append(turn.clone()).await.unwrap().is_none());
        assert_eq!(ctx.len().await, 1);
    }

    #[tokio::test]
    async fn test_provisional_turn_rejected() {
        let ctx = ContextAccumulator::new();
        let mut turn = Turn::user("partial");
        turn.status = TurnStatus::Provisional;
        let err = ctx.append(turn.clone()).await.unwrap_err();
        assert_eq!(err, ContextError::Provisional(turn.id));
        assert!(ctx.is_empty().await);
    }

    #[tokio::test]
    async fn test_timestamps_never_decrease() {
        let ctx = ContextAccumulator::new();
        let first = Turn::user("first");
        let mut second = Turn::agent("second");
        second.timestamp = first.timestamp - Duration::seconds(5);

        ctx.append(first.clone()).await.unwrap();
        let stored = ctx.append(second).await.unwrap().unwrap();
        assert_eq!(stored.timestamp, first.timestamp);
    }

    #[tokio::test]
    async fn test_consecutive_same_speaker_turns_allowed() {
        let ctx = ContextAccumulator::new();
        ctx.append(Turn::user("one")).await.unwrap();
        ctx.append(Turn::user("two")).await.unwrap();
        let turns = ctx.snapshot().await;
        assert_eq!(turns.len(), 2);
        assert!(turns.iter().all(|t| t.speaker == Speaker::User));
    }

    #[tokio::test]
    async fn test_recent_window_and_clear() {
        let ctx = ContextAccumulator::new();
        for i in 0..5 {
            ctx.append(Turn::user(format!("m{}", i))).await.unwrap();
        }
        let recent: Vec<_> = ctx
            .recent(Some(2))
            .await
            .into_iter()
            .map(|t| t.content)
            .collect();
        assert_eq!(recent, vec!["m3", "m4"]);
        assert_eq!(ctx.recent(None).await.len(), 5);

        assert_eq!(ctx.clear().await, 5);
        assert!(ctx.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_with_turns_skips_duplicates() {
        let turn = Turn::agent("seeded");
        let ctx = ContextAccumulator::with_turns(vec![turn.clone(), turn]);
        assert_eq!(ctx.len().await, 1);
    }
}

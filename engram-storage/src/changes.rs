//! Bounded in-memory change feed.
//!
//! Every mutation through the adapter appends a [`Change`]; consumers
//! poll with `changes_since(timestamp)`. The ring is capped, so a
//! consumer that lags past the cap sees a truncated window: acceptable
//! for the notification fan-out this feeds, which re-reads records by id.

use engram_core::{now_ms, TimestampMs};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Retained change records per adapter.
const DEFAULT_CAPACITY: usize = 10_000;

/// What kind of record changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Noun,
    Verb,
}

/// The mutation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

/// One observed mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub entity_kind: EntityKind,
    pub operation: ChangeOperation,
    pub timestamp: TimestampMs,
    /// Record snapshot for creates and updates; deletes carry none.
    pub data: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct ChangeFeed {
    entries: RwLock<VecDeque<Change>>,
    capacity: usize,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(
        &self,
        id: String,
        entity_kind: EntityKind,
        operation: ChangeOperation,
        data: Option<serde_json::Value>,
    ) {
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(Change {
            id,
            entity_kind,
            operation,
            timestamp: now_ms(),
            data,
        });
    }

    /// Changes at or after `since`, oldest first, capped at `limit`.
    pub fn changes_since(&self, since: TimestampMs, limit: Option<usize>) -> Vec<Change> {
        let entries = self.entries.read();
        let iter = entries.iter().filter(|c| c.timestamp >= since).cloned();
        match limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changes_since_filters_and_orders() {
        let feed = ChangeFeed::new(100);
        feed.record("a".to_string(), EntityKind::Noun, ChangeOperation::Create, None);
        feed.record("b".to_string(), EntityKind::Verb, ChangeOperation::Delete, None);

        let all = feed.changes_since(0, None);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "a");
        assert_eq!(all[1].id, "b");
        assert!(all[0].timestamp <= all[1].timestamp);

        let none = feed.changes_since(now_ms() + 60_000, None);
        assert!(none.is_empty());
    }

    #[test]
    fn test_limit() {
        let feed = ChangeFeed::new(100);
        for i in 0..10 {
            feed.record(i.to_string(), EntityKind::Noun, ChangeOperation::Update, None);
        }
        let limited = feed.changes_since(0, Some(3));
        assert_eq!(limited.len(), 3);
        assert_eq!(limited[0].id, "0");
    }

    #[test]
    fn test_ring_caps_at_capacity() {
        let feed = ChangeFeed::new(5);
        for i in 0..20 {
            feed.record(i.to_string(), EntityKind::Noun, ChangeOperation::Create, None);
        }
        assert_eq!(feed.len(), 5);
        let entries = feed.changes_since(0, None);
        assert_eq!(entries[0].id, "15");
        assert_eq!(entries[4].id, "19");
    }
}

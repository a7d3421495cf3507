//! Per-partition delivery tracking and commit frontier.
//!
//! Commits must never skip an undelivered record, so the commit point for
//! a partition is the contiguous prefix of delivered offsets, not the
//! highest delivered offset. Anything above a gap waits in
//! `delivered_above` until the gap closes.

use std::collections::{BTreeSet, HashMap};

use crate::types::RecordEnvelope;

#[derive(Debug, Default)]
struct PartitionState {
    /// Lowest offset ever tracked; the frontier starts just below it.
    first_seen: i64,
    /// Highest offset with a contiguous chain of deliveries behind it.
    last_delivered: Option<i64>,
    /// Next-to-read offset acknowledged by the worker as committed.
    committed: Option<i64>,
    /// Tracked but not yet delivered, all above `last_delivered`.
    in_flight: BTreeSet<i64>,
    /// Delivered but not yet contiguous with `last_delivered`.
    delivered_above: BTreeSet<i64>,
}

impl PartitionState {
    /// Next offset to commit, if it advanced past what was committed.
    fn pending_commit(&self) -> Option<i64> {
        let next = self.last_delivered? + 1;
        match self.committed {
            Some(committed) if committed >= next => None,
            _ => Some(next),
        }
    }
}

/// Tracks in-flight deliveries for one sink endpoint and derives the
/// offsets that are safe to commit.
///
/// Mutated on the endpoint task; the worker takes snapshots between polls
/// through a shared `parking_lot::Mutex`.
#[derive(Debug)]
pub struct OffsetTracker {
    topic: String,
    /// tag -> (partition, offset) for every unsettled transfer in flight.
    tags: HashMap<String, (i32, i64)>,
    partitions: HashMap<i32, PartitionState>,
}

impl OffsetTracker {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            tags: HashMap::new(),
            partitions: HashMap::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// True when nothing has been tracked since creation or `clear`.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.partitions.is_empty()
    }

    /// Remember a transfer about to go out unsettled. Offsets at or below
    /// the delivery frontier are not re-tracked.
    pub fn track(&mut self, tag: impl Into<String>, record: &RecordEnvelope) {
        let state = self
            .partitions
            .entry(record.partition)
            .or_insert_with(|| PartitionState {
                first_seen: record.offset,
                ..PartitionState::default()
            });
        if matches!(state.last_delivered, Some(last) if record.offset <= last) {
            return;
        }
        if record.offset < state.first_seen {
            state.first_seen = record.offset;
        }
        state.in_flight.insert(record.offset);
        self.tags.insert(tag.into(), (record.partition, record.offset));
    }

    /// Record a terminal disposition for `tag` and advance the frontier
    /// over any contiguous run it completes. Returns the partition and
    /// offset of the delivered record, or `None` for an unknown tag.
    pub fn delivered(&mut self, tag: &str) -> Option<(i32, i64)> {
        let (partition, offset) = self.tags.remove(tag)?;
        let state = self.partitions.get_mut(&partition)?;
        state.in_flight.remove(&offset);
        state.delivered_above.insert(offset);

        let mut next = match state.last_delivered {
            Some(last) => last + 1,
            None => state.first_seen,
        };
        while state.delivered_above.remove(&next) {
            state.last_delivered = Some(next);
            next += 1;
        }
        Some((partition, offset))
    }

    /// Next offset to commit per partition. Partitions whose frontier has
    /// not moved past the last committed offset are omitted, so a failed
    /// commit is retried on the next call.
    pub fn get_offsets(&self) -> HashMap<i32, i64> {
        self.partitions
            .iter()
            .filter_map(|(&partition, state)| Some((partition, state.pending_commit()?)))
            .collect()
    }

    /// Acknowledge that `offset` was committed for `partition`, pruning
    /// bookkeeping strictly below it.
    pub fn commit(&mut self, partition: i32, offset: i64) {
        if let Some(state) = self.partitions.get_mut(&partition) {
            state.committed = Some(state.committed.map_or(offset, |c| c.max(offset)));
            state.delivered_above.retain(|&o| o >= offset);
            state.in_flight.retain(|&o| o >= offset);
        }
        self.tags.retain(|_, &mut (p, o)| p != partition || o >= offset);
    }

    /// Drop all state. Used on endpoint close.
    pub fn clear(&mut self) {
        self.tags.clear();
        self.partitions.clear();
    }
}

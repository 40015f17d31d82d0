//! Messages waiting for a prerequisite.
//!
//! A bullet's creation can arrive before the creation of the plane that fired
//! it; an impact can arrive before its victim.  Such messages are parked here
//! and retried once per tick, in receipt order, until they apply, until an
//! `EntityRetired` notice for their subject arrives, or until they are older
//! than the maximum age, at which point they are dropped unapplied.

use std::collections::VecDeque;

use tracing::debug;

use skirmish_core::GameId;

use super::link::Inbound;

/// A parked message and how long it has been waiting.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredMessage {
    pub inbound: Inbound,
    /// Seconds of simulation time the message has aged.
    pub age: f64,
}

/// Counts reported by [`DeferredQueue::age_and_take`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgingReport {
    pub expired: usize,
}

/// Bounded FIFO of deferred messages.
#[derive(Debug)]
pub struct DeferredQueue {
    entries: VecDeque<DeferredMessage>,
    max_age: f64,
    capacity: usize,
    overflowed: u64,
}

impl DeferredQueue {
    pub fn new(max_age: f64, capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_age,
            capacity: capacity.max(1),
            overflowed: 0,
        }
    }

    pub fn max_age(&self) -> f64 {
        self.max_age
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries dropped because the queue was full.
    pub fn overflowed(&self) -> u64 {
        self.overflowed
    }

    /// Parks a message.  When full, the oldest entry is dropped.
    pub fn defer(&mut self, inbound: Inbound, age: f64) {
        if self.entries.len() >= self.capacity {
            if let Some(dropped) = self.entries.pop_front() {
                self.overflowed += 1;
                debug!(id = %dropped.inbound.message.id, "deferred queue full, dropping oldest");
            }
        }
        self.entries.push_back(DeferredMessage {
            inbound,
            age: age.max(0.0),
        });
    }

    /// Returns `true` if a message about `id` is already waiting.
    pub fn has_pending_for(&self, id: &GameId) -> bool {
        self.entries.iter().any(|e| e.inbound.message.id == *id)
    }

    /// Drops every waiting message about `id`.  Returns how many were dropped.
    pub fn discard(&mut self, id: &GameId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.inbound.message.id != *id);
        before - self.entries.len()
    }

    /// Drops every waiting message about an entity minted by `player_id`.
    pub fn discard_player(&mut self, player_id: skirmish_core::PlayerId) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| e.inbound.message.id.player_id != player_id);
        before - self.entries.len()
    }

    /// Ages every entry by `dt`, drops those past the maximum age, and hands
    /// back the rest in receipt order.  The queue is left empty; the caller
    /// re-defers whatever still cannot apply.
    pub fn age_and_take(&mut self, dt: f64) -> (Vec<DeferredMessage>, AgingReport) {
        let mut report = AgingReport::default();
        let mut ready = Vec::with_capacity(self.entries.len());
        for mut entry in self.entries.drain(..) {
            entry.age += dt;
            if entry.age > self.max_age {
                report.expired += 1;
                debug!(
                    id = %entry.inbound.message.id,
                    kind = ?entry.inbound.message.kind(),
                    age = entry.age,
                    "deferred message expired"
                );
            } else {
                ready.push(entry);
            }
        }
        (ready, report)
    }

    /// Puts back an entry taken by [`age_and_take`](Self::age_and_take),
    /// keeping its accumulated age.
    pub fn restore(&mut self, entry: DeferredMessage) {
        self.entries.push_back(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::link::PeerId;
    use skirmish_core::protocol::messages::{NetMessage, Payload};

    fn inbound(object_id: u32) -> Inbound {
        Inbound {
            message: NetMessage::new(GameId::new(1, object_id), 0.0, Payload::EntityRetired),
            origin: PeerId(0),
            received_at: 0.0,
        }
    }

    #[test]
    fn test_entries_come_back_in_receipt_order() {
        // Arrange
        let mut queue = DeferredQueue::new(0.4, 16);
        for id in [3, 1, 2] {
            queue.defer(inbound(id), 0.0);
        }

        // Act
        let (ready, report) = queue.age_and_take(0.016);

        // Assert
        let ids: Vec<u32> = ready.iter().map(|e| e.inbound.message.id.object_id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(report.expired, 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_entries_older_than_max_age_are_dropped() {
        // Arrange
        let mut queue = DeferredQueue::new(0.4, 16);
        queue.defer(inbound(1), 0.35);
        queue.defer(inbound(2), 0.0);

        // Act
        let (ready, report) = queue.age_and_take(0.1);

        // Assert
        assert_eq!(report.expired, 1);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].inbound.message.id.object_id, 2);
    }

    #[test]
    fn test_restore_keeps_age() {
        // Arrange
        let mut queue = DeferredQueue::new(0.4, 16);
        queue.defer(inbound(1), 0.0);

        // Act – five 0.1 s ticks, restoring each time
        let mut expired = 0;
        for _ in 0..5 {
            let (ready, report) = queue.age_and_take(0.1);
            expired += report.expired;
            for entry in ready {
                queue.restore(entry);
            }
        }

        // Assert
        assert_eq!(expired, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_discard_removes_only_matching_id() {
        let mut queue = DeferredQueue::new(0.4, 16);
        queue.defer(inbound(1), 0.0);
        queue.defer(inbound(2), 0.0);
        queue.defer(inbound(1), 0.0);

        assert_eq!(queue.discard(&GameId::new(1, 1)), 2);
        assert!(!queue.has_pending_for(&GameId::new(1, 1)));
        assert!(queue.has_pending_for(&GameId::new(1, 2)));
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        // Arrange
        let mut queue = DeferredQueue::new(0.4, 2);

        // Act
        queue.defer(inbound(1), 0.0);
        queue.defer(inbound(2), 0.0);
        queue.defer(inbound(3), 0.0);

        // Assert
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.overflowed(), 1);
        assert!(!queue.has_pending_for(&GameId::new(1, 1)));
    }

    #[test]
    fn test_negative_initial_age_is_clamped() {
        let mut queue = DeferredQueue::new(0.4, 4);
        queue.defer(inbound(1), -3.0);
        let (ready, _) = queue.age_and_take(0.0);
        assert_eq!(ready[0].age, 0.0);
    }
}

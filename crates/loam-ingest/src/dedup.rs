// SEQUENCE DEDUPLICATION
// Per-sensor sliding window of recently seen sequence numbers
//
// SAFETY INVARIANTS:
// 1. A sequence number is accepted at most once, ever
// 2. Numbers below the window's floor are rejected as replays even if
//    unseen (the window cannot prove them fresh)
// 3. Memory per sensor is bounded by the window size, never full history
//
// Out-of-order delivery inside the window is tolerated: [1, 3, 2] accepts
// all three, and the later duplicate 2 is rejected. This is what makes
// failover re-delivery naturally idempotent.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Sliding dedup window for one sensor. Serializable so the windows can
/// be persisted with the rest of the durable node state and carried to
/// whichever node processes the sensor next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceWindow {
    /// Highest sequence number ever accepted
    max_seen: Option<u64>,

    /// Accepted numbers within the window of `capacity` below `max_seen`
    seen: BTreeSet<u64>,

    capacity: u64,
}

impl SequenceWindow {
    pub fn new(capacity: usize) -> SequenceWindow {
        SequenceWindow {
            max_seen: None,
            seen: BTreeSet::new(),
            capacity: capacity.max(1) as u64,
        }
    }

    fn floor(&self) -> u64 {
        match self.max_seen {
            Some(max) => max.saturating_sub(self.capacity - 1),
            None => 0,
        }
    }

    /// Would this sequence number be accepted? Does not mutate.
    pub fn check(&self, sequence: u64) -> bool {
        if self.seen.contains(&sequence) {
            return false;
        }
        match self.max_seen {
            Some(_) if sequence < self.floor() => false,
            _ => true,
        }
    }

    /// Record an accepted sequence number and prune below the new floor.
    /// Returns false (and records nothing) if the number is a duplicate
    /// or replay — callers re-check under the per-sensor lock.
    pub fn commit(&mut self, sequence: u64) -> bool {
        if !self.check(sequence) {
            return false;
        }
        self.seen.insert(sequence);
        self.max_seen = Some(self.max_seen.map_or(sequence, |m| m.max(sequence)));
        let floor = self.floor();
        self.seen = self.seen.split_off(&floor);
        true
    }

    pub fn max_seen(&self) -> Option<u64> {
        self.max_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_acceptance() {
        let mut w = SequenceWindow::new(8);
        for seq in 1..=5 {
            assert!(w.commit(seq), "seq {seq} should be fresh");
        }
        assert_eq!(w.max_seen(), Some(5));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut w = SequenceWindow::new(8);
        assert!(w.commit(1));
        assert!(w.commit(2));
        assert!(!w.commit(2), "second 2 is a duplicate");
        assert!(w.commit(3));
    }

    #[test]
    fn test_out_of_order_within_window_accepted() {
        let mut w = SequenceWindow::new(8);
        assert!(w.commit(1));
        assert!(w.commit(3));
        assert!(w.commit(2), "2 arrives late but is unseen");
        assert!(!w.commit(2), "then its duplicate is rejected");
    }

    #[test]
    fn test_below_window_floor_is_replay() {
        let mut w = SequenceWindow::new(4);
        for seq in [10, 11, 12, 13] {
            assert!(w.commit(seq));
        }
        // Floor is now 10; 5 cannot be proven fresh.
        assert!(!w.commit(5));
        // But an unseen number inside the window still lands.
        assert!(w.commit(14));
    }

    #[test]
    fn test_memory_stays_bounded() {
        let mut w = SequenceWindow::new(16);
        for seq in 0..10_000 {
            w.commit(seq);
        }
        assert!(w.seen.len() <= 16);
    }
}

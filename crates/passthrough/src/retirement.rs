//! Ordering of retire signals.
//!
//! A message that spawns server-internal work may not retire until that work
//! has completed. Retires are held in a FIFO queue; a retire leaves the queue
//! only when nothing blocks it and everything ahead of it has left too.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// A retire response and the messages it is still waiting on.
#[derive(Debug)]
pub struct RetirementTuple<K, T> {
    pub response: T,
    pub blocked_on: HashSet<K>,
}

/// FIFO of pending retires, keyed by message ids of type `K`.
#[derive(Debug)]
pub struct RetirementManager<K, T> {
    pending_defers: HashSet<K>,
    queue: VecDeque<RetirementTuple<K, T>>,
}

impl<K, T> Default for RetirementManager<K, T> {
    fn default() -> Self {
        Self {
            pending_defers: HashSet::new(),
            queue: VecDeque::new(),
        }
    }
}

impl<K: Eq + Hash, T> RetirementManager<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the message currently executing must not retire before
    /// `blocked_on` completes. Applies to the next tuple added.
    pub fn defer_current(&mut self, blocked_on: K) {
        self.pending_defers.insert(blocked_on);
    }

    /// Offers a retire for the message that just finished executing.
    ///
    /// When nothing is queued and nothing was deferred the response comes
    /// straight back to be sent now. Otherwise it is queued with the pending
    /// defers as its blockers and `None` is returned.
    pub fn add_retirement_tuple(&mut self, response: T) -> Option<T> {
        if self.queue.is_empty() && self.pending_defers.is_empty() {
            return Some(response);
        }
        let blocked_on = std::mem::take(&mut self.pending_defers);
        self.queue.push_back(RetirementTuple {
            response,
            blocked_on,
        });
        None
    }

    /// Marks `completed` as done and pops every retire at the head of the
    /// queue that no longer waits on anything, stopping at the first one that
    /// still does.
    pub fn retire_ready_after(&mut self, completed: Option<&K>) -> Vec<T> {
        if let Some(completed) = completed {
            for tuple in self.queue.iter_mut() {
                tuple.blocked_on.remove(completed);
            }
        }
        let mut ready = Vec::new();
        while self
            .queue
            .front()
            .is_some_and(|tuple| tuple.blocked_on.is_empty())
        {
            if let Some(tuple) = self.queue.pop_front() {
                ready.push(tuple.response);
            }
        }
        ready
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.pending_defers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn unblocked_retire_passes_straight_through() {
        let mut manager: RetirementManager<u32, &str> = RetirementManager::new();
        assert_eq!(manager.add_retirement_tuple("a"), Some("a"));
        assert!(manager.is_idle());
    }

    #[test]
    fn deferred_retire_waits_for_its_blocker() {
        let mut manager: RetirementManager<u32, &str> = RetirementManager::new();
        manager.defer_current(7);
        assert_eq!(manager.add_retirement_tuple("a"), None);
        // Anything behind a blocked retire queues too.
        assert_eq!(manager.add_retirement_tuple("b"), None);
        assert!(manager.retire_ready_after(Some(&8)).is_empty());
        assert_eq!(manager.retire_ready_after(Some(&7)), vec!["a", "b"]);
        assert!(manager.is_idle());
    }

    #[test]
    fn early_unblock_waits_for_tuples_ahead() {
        let mut manager: RetirementManager<u32, &str> = RetirementManager::new();
        manager.defer_current(1);
        assert_eq!(manager.add_retirement_tuple("a"), None);
        manager.defer_current(2);
        assert_eq!(manager.add_retirement_tuple("b"), None);

        assert!(manager.retire_ready_after(Some(&2)).is_empty());
        assert_eq!(manager.queued_len(), 2);
        assert_eq!(manager.retire_ready_after(Some(&1)), vec!["a", "b"]);
    }

    #[test]
    fn defers_attach_only_to_the_next_tuple() {
        let mut manager: RetirementManager<u32, &str> = RetirementManager::new();
        manager.defer_current(1);
        manager.defer_current(2);
        assert_eq!(manager.add_retirement_tuple("a"), None);
        assert!(manager.retire_ready_after(Some(&1)).is_empty());
        assert_eq!(manager.retire_ready_after(Some(&2)), vec!["a"]);
        assert_eq!(manager.add_retirement_tuple("b"), Some("b"));
    }

    proptest! {
        /// Whatever the dependencies, retires come out in the order they went
        /// in, and a retire never leaves while it still has blockers.
        #[test]
        fn retires_leave_in_fifo_order(
            blockers in prop::collection::vec(prop::collection::hash_set(0u32..8, 0..3), 1..40),
            completion_order in Just((0u32..8).collect::<Vec<_>>()).prop_shuffle(),
        ) {
            let mut manager: RetirementManager<u32, usize> = RetirementManager::new();
            let mut released = Vec::new();
            for (index, set) in blockers.iter().enumerate() {
                for key in set {
                    manager.defer_current(*key);
                }
                if let Some(index) = manager.add_retirement_tuple(index) {
                    released.push(index);
                }
            }
            let mut completed = HashSet::new();
            for key in completion_order {
                completed.insert(key);
                for index in manager.retire_ready_after(Some(&key)) {
                    prop_assert!(blockers[index].is_subset(&completed));
                    released.push(index);
                }
            }
            prop_assert_eq!(released, (0..blockers.len()).collect::<Vec<_>>());
        }
    }
}

//! Read/write locks over named resources, granted through explicit waiter
//! values instead of callbacks.
//!
//! Every operation that can grant a lock returns the waiters it granted, in
//! grant order. The caller owns what happens next, which keeps every
//! suspension point visible: a fetch parked behind a writer is simply a waiter
//! value sitting in a queue here.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

#[derive(Debug)]
struct Waiting<O, W> {
    owner: O,
    waiter: W,
}

#[derive(Debug)]
struct ResourceLock<O, W> {
    writer: Option<O>,
    readers: HashSet<O>,
    write_queue: VecDeque<Waiting<O, W>>,
    read_queue: VecDeque<Waiting<O, W>>,
}

impl<O, W> Default for ResourceLock<O, W> {
    fn default() -> Self {
        Self {
            writer: None,
            readers: HashSet::new(),
            write_queue: VecDeque::new(),
            read_queue: VecDeque::new(),
        }
    }
}

impl<O: Eq + Hash + Clone, W> ResourceLock<O, W> {
    fn is_idle(&self) -> bool {
        self.writer.is_none()
            && self.readers.is_empty()
            && self.write_queue.is_empty()
            && self.read_queue.is_empty()
    }

    /// Writers win over readers. A queued writer is granted only once all
    /// readers are gone; queued readers are granted as one batch only when no
    /// writer holds or waits.
    fn grant(&mut self) -> Vec<W> {
        if self.writer.is_some() {
            return Vec::new();
        }
        if !self.write_queue.is_empty() {
            if !self.readers.is_empty() {
                return Vec::new();
            }
            return match self.write_queue.pop_front() {
                Some(next) => {
                    self.writer = Some(next.owner);
                    vec![next.waiter]
                }
                None => Vec::new(),
            };
        }
        let mut granted = Vec::with_capacity(self.read_queue.len());
        while let Some(next) = self.read_queue.pop_front() {
            self.readers.insert(next.owner);
            granted.push(next.waiter);
        }
        granted
    }
}

/// Returned when a lock that must be reinstated immediately could not be.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("lock could not be restored without waiting")]
pub struct RestoreConflict;

/// Lock state for every resource, keyed by `R`, owned by `O`, with parked
/// continuations of type `W`.
#[derive(Debug)]
pub struct LockManager<R, O, W> {
    locks: HashMap<R, ResourceLock<O, W>>,
}

impl<R, O, W> Default for LockManager<R, O, W> {
    fn default() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }
}

impl<R, O, W> LockManager<R, O, W>
where
    R: Eq + Hash + Clone,
    O: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a write request and runs the grant routine.
    pub fn acquire_write(&mut self, resource: R, owner: O, waiter: W) -> Vec<W> {
        let lock = self.locks.entry(resource).or_default();
        lock.write_queue.push_back(Waiting { owner, waiter });
        lock.grant()
    }

    /// Takes the write lock only if that needs no waiting. Nothing is queued
    /// when it fails.
    pub fn try_acquire_write(&mut self, resource: R, owner: O) -> bool {
        let lock = self.locks.entry(resource.clone()).or_default();
        let free = lock.writer.is_none()
            && lock.readers.is_empty()
            && lock.write_queue.is_empty();
        if free {
            lock.writer = Some(owner);
        } else if lock.is_idle() {
            self.locks.remove(&resource);
        }
        free
    }

    /// Queues a read request and runs the grant routine.
    pub fn acquire_read(&mut self, resource: R, owner: O, waiter: W) -> Vec<W> {
        let lock = self.locks.entry(resource).or_default();
        lock.read_queue.push_back(Waiting { owner, waiter });
        lock.grant()
    }

    /// Drops `owner`'s write lock and returns whatever that unblocked.
    /// Releasing a lock the owner does not hold grants nothing.
    pub fn release_write(&mut self, resource: &R, owner: &O) -> Vec<W> {
        let Some(lock) = self.locks.get_mut(resource) else {
            return Vec::new();
        };
        if lock.writer.as_ref() != Some(owner) {
            return Vec::new();
        }
        lock.writer = None;
        let granted = lock.grant();
        if lock.is_idle() {
            self.locks.remove(resource);
        }
        granted
    }

    /// Drops one of `owner`'s read locks and returns whatever that unblocked.
    pub fn release_read(&mut self, resource: &R, owner: &O) -> Vec<W> {
        let Some(lock) = self.locks.get_mut(resource) else {
            return Vec::new();
        };
        if !lock.readers.remove(owner) {
            return Vec::new();
        }
        let granted = lock.grant();
        if lock.is_idle() {
            self.locks.remove(resource);
        }
        granted
    }

    /// Reinstates a write lock held before fail-over. The grant has to be
    /// immediate; on conflict nothing is left queued.
    pub fn restore_write(&mut self, resource: R, owner: O) -> Result<(), RestoreConflict> {
        if self.try_acquire_write(resource, owner) {
            Ok(())
        } else {
            Err(RestoreConflict)
        }
    }

    /// Reinstates a read lock held before fail-over, used when a fetched
    /// endpoint reconnects.
    pub fn restore_read(&mut self, resource: R, owner: O) -> Result<(), RestoreConflict> {
        let lock = self.locks.entry(resource.clone()).or_default();
        if lock.writer.is_some() || !lock.write_queue.is_empty() {
            if lock.is_idle() {
                self.locks.remove(&resource);
            }
            return Err(RestoreConflict);
        }
        lock.readers.insert(owner);
        Ok(())
    }

    /// Drops every lock held by, and every request queued for, an owner
    /// `gone` matches. Returns whatever that unblocked.
    pub fn forget_owners(&mut self, gone: impl Fn(&O) -> bool) -> Vec<W> {
        let mut granted = Vec::new();
        self.locks.retain(|_, lock| {
            lock.write_queue.retain(|waiting| !gone(&waiting.owner));
            lock.read_queue.retain(|waiting| !gone(&waiting.owner));
            lock.readers.retain(|owner| !gone(owner));
            if lock.writer.as_ref().is_some_and(&gone) {
                lock.writer = None;
            }
            granted.extend(lock.grant());
            !lock.is_idle()
        });
        granted
    }

    pub fn write_owner(&self, resource: &R) -> Option<&O> {
        self.locks.get(resource).and_then(|lock| lock.writer.as_ref())
    }

    pub fn read_owner_count(&self, resource: &R) -> usize {
        self.locks.get(resource).map_or(0, |lock| lock.readers.len())
    }

    /// Number of requests still parked on `resource`.
    pub fn waiting_count(&self, resource: &R) -> usize {
        self.locks
            .get(resource)
            .map_or(0, |lock| lock.write_queue.len() + lock.read_queue.len())
    }
}

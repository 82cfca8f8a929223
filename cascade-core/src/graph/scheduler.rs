//! Action Schedule
//!
//! The schedule determines the order in which the work of one transaction
//! runs. It ensures that an action queued for a node never runs before an
//! action queued for a node ranked below it.
//!
//! # Algorithm
//!
//! Work is split into three phases, drained strictly in this order:
//!
//! 1. **Prioritized**: a min-heap keyed by `(rank order, sequence)`. Ties run
//!    in the order they were queued. Work discovered while draining is pushed
//!    into the same heap.
//! 2. **Last**: a FIFO, drained once the heap is empty. Used to commit the
//!    pending values of behaviors.
//! 3. **Low**: a FIFO, drained once both of the above are empty.
//!
//! Heap keys capture a rank's order when the action is queued. If a rank is
//! bumped afterwards the schedule is marked stale and the heap is rebuilt
//! from the current orders before the next pop.
//!
//! `next` always prefers the earliest non-empty phase, so an action from a
//! later phase that queues prioritized work (a delayed publish) hands control
//! back to the heap.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;

use super::rank::Rank;

/// A unit of queued work. `C` is the context handed to the action when it runs.
pub type Action<C> = Box<dyn FnOnce(&C) + Send>;

/// The phase an action was queued in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Ranked work, run in ascending rank order.
    Prioritized,

    /// Commit work, run after all prioritized work.
    Last,

    /// Lowest-priority work, run after everything else.
    Low,
}

struct Prioritized<C> {
    order: u64,
    seq: u64,
    rank: Rank,
    action: Action<C>,
}

impl<C> PartialEq for Prioritized<C> {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order && self.seq == other.seq
    }
}

impl<C> Eq for Prioritized<C> {}

impl<C> PartialOrd for Prioritized<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for Prioritized<C> {
    // Reversed so that `BinaryHeap` pops the smallest key first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.order, other.seq).cmp(&(self.order, self.seq))
    }
}

/// Phased work queue for one transaction.
pub struct Schedule<C> {
    prioritized: BinaryHeap<Prioritized<C>>,
    last: VecDeque<Action<C>>,
    low: VecDeque<Action<C>>,
    seq: u64,
    stale: bool,
    resorts: u64,
}

impl<C> Schedule<C> {
    /// Create an empty schedule.
    pub fn new() -> Self {
        Self {
            prioritized: BinaryHeap::new(),
            last: VecDeque::new(),
            low: VecDeque::new(),
            seq: 0,
            stale: false,
            resorts: 0,
        }
    }

    /// Queue ranked work.
    pub fn push_prioritized(&mut self, rank: &Rank, action: Action<C>) {
        let seq = self.next_seq();
        self.prioritized.push(Prioritized {
            order: rank.order(),
            seq,
            rank: rank.clone(),
            action,
        });
    }

    /// Queue commit work.
    pub fn push_last(&mut self, action: Action<C>) {
        self.last.push_back(action);
    }

    /// Queue lowest-priority work.
    pub fn push_low(&mut self, action: Action<C>) {
        self.low.push_back(action);
    }

    /// Record that some rank changed since the heap was keyed.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Take the next action to run, re-sorting first if ranks changed.
    pub fn next(&mut self) -> Option<(Phase, Action<C>)> {
        if self.stale {
            self.resort();
        }

        if let Some(entry) = self.prioritized.pop() {
            return Some((Phase::Prioritized, entry.action));
        }
        if let Some(action) = self.last.pop_front() {
            return Some((Phase::Last, action));
        }
        self.low.pop_front().map(|action| (Phase::Low, action))
    }

    /// Number of queued actions across all phases.
    pub fn len(&self) -> usize {
        self.prioritized.len() + self.last.len() + self.low.len()
    }

    /// Whether every phase is drained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times the heap has been rebuilt.
    pub fn resorts(&self) -> u64 {
        self.resorts
    }

    /// Drop all queued work, returning it so the caller controls when the
    /// actions (and whatever they capture) are released.
    pub fn take_all(&mut self) -> Vec<Action<C>> {
        let mut actions: Vec<Action<C>> = self
            .prioritized
            .drain()
            .map(|entry| entry.action)
            .collect();
        actions.extend(self.last.drain(..));
        actions.extend(self.low.drain(..));
        self.stale = false;
        actions
    }

    /// Rebuild the heap from the current rank orders, keeping queue order
    /// among equal ranks.
    fn resort(&mut self) {
        let entries = std::mem::take(&mut self.prioritized).into_vec();
        self.prioritized = entries
            .into_iter()
            .map(|mut entry| {
                entry.order = entry.rank.order();
                entry
            })
            .collect();
        self.stale = false;
        self.resorts += 1;
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }
}

impl<C> Default for Schedule<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for Schedule<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field("prioritized", &self.prioritized.len())
            .field("last", &self.last.len())
            .field("low", &self.low.len())
            .field("stale", &self.stale)
            .finish()
    }
}

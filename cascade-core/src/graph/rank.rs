//! Ranks
//!
//! A rank is a node's position in the firing order of a transaction. Every
//! rank keeps a list of *superiors*: the ranks that must fire strictly after
//! it. The invariant maintained here is
//!
//! ```text
//! order(superior) > order(rank)   for every recorded edge
//! ```
//!
//! # Algorithm
//!
//! Orders are bumped lazily. Adding an edge `a -> b` only touches `b` (and
//! whatever sits above `b`) when `b` is not already ordered after `a`; the
//! relative order of untouched nodes is preserved. When a bump happens the
//! caller is told so it can re-sort any queue keyed by the old orders.
//!
//! Superiors are held weakly. A rank is owned by the publisher or
//! subscription it belongs to, never by the ranks below it.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::node::NodeId;

/// A node's position in the dependency-ordered firing sequence.
#[derive(Clone)]
pub struct Rank {
    inner: Arc<RankInner>,
}

struct RankInner {
    id: NodeId,
    state: Mutex<RankState>,
}

struct RankState {
    order: u64,
    /// Ranks that must fire after this one. An edge may be recorded more than
    /// once when two subscriptions share a rank.
    superiors: SmallVec<[Weak<RankInner>; 4]>,
}

/// Path of ranks currently being bumped, used to stop at cycles.
type BumpPath = SmallVec<[NodeId; 16]>;

type Cycles = SmallVec<[BumpPath; 1]>;

#[derive(Default)]
struct Bump {
    changed: bool,
    /// Paths that led back to a rank already being bumped.
    cycles: Cycles,
}

impl Rank {
    /// Create a rank with the lowest order.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RankInner {
                id: NodeId::new(),
                state: Mutex::new(RankState {
                    order: 0,
                    superiors: SmallVec::new(),
                }),
            }),
        }
    }

    /// Get the rank's identity.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Current position in the firing order.
    pub fn order(&self) -> u64 {
        self.inner.state.lock().order
    }

    /// Whether `self` is currently ordered strictly before `other`.
    pub fn precedes(&self, other: &Rank) -> bool {
        self.order() < other.order()
    }

    /// Record that `other` must fire after `self`.
    ///
    /// Returns `true` when an existing order had to change, meaning any queue
    /// sorted by rank is now stale.
    pub fn add_superior(&self, other: &Rank) -> bool {
        let bump = self.link(other);
        for cycle in &bump.cycles {
            tracing::debug!(
                rank = %self.inner.id,
                superior = %other.inner.id,
                path = ?cycle.as_slice(),
                "rank cycle, bump stopped"
            );
        }
        if bump.changed {
            tracing::debug!(
                rank = %self.inner.id,
                superior = %other.inner.id,
                order = other.order(),
                "rank bumped"
            );
        }
        bump.changed
    }

    fn link(&self, other: &Rank) -> Bump {
        let limit = {
            let mut state = self.inner.state.lock();
            state.superiors.retain(|w| w.strong_count() > 0);
            state.superiors.push(Arc::downgrade(&other.inner));
            state.order
        };

        let mut bump = Bump::default();
        let mut path = BumpPath::new();
        path.push(self.inner.id);
        bump.changed = other.ensure_above(limit, &mut path, &mut bump.cycles);
        bump
    }

    /// Remove one recorded edge to `other`.
    pub fn remove_superior(&self, other: &Rank) {
        let mut state = self.inner.state.lock();
        if let Some(pos) = state
            .superiors
            .iter()
            .position(|w| w.as_ptr() == Arc::as_ptr(&other.inner))
        {
            state.superiors.remove(pos);
        }
        state.superiors.retain(|w| w.strong_count() > 0);
    }

    /// Drop every outgoing edge.
    pub fn clear_superiors(&self) {
        self.inner.state.lock().superiors.clear();
    }

    /// Number of live outgoing edges.
    pub fn superior_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .superiors
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Raise this rank (and everything above it) past `limit`. A rank met
    /// again on the current path closes a cycle; the path is recorded and
    /// the bump stops there.
    fn ensure_above(&self, limit: u64, path: &mut BumpPath, cycles: &mut Cycles) -> bool {
        if path.contains(&self.inner.id) {
            let mut cycle = path.clone();
            cycle.push(self.inner.id);
            cycles.push(cycle);
            return false;
        }

        let (order, superiors) = {
            let mut state = self.inner.state.lock();
            if state.order > limit {
                return false;
            }
            state.order = limit + 1;
            let superiors: SmallVec<[Arc<RankInner>; 4]> =
                state.superiors.iter().filter_map(Weak::upgrade).collect();
            (state.order, superiors)
        };

        path.push(self.inner.id);
        for inner in superiors {
            Rank { inner }.ensure_above(order, path, cycles);
        }
        path.pop();
        true
    }
}

impl Default for Rank {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Rank {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Rank {}

impl fmt::Debug for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rank")
            .field("id", &self.inner.id)
            .field("order", &self.order())
            .field("superiors", &self.superior_count())
            .finish()
    }
}

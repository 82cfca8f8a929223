//! Graph Nodes
//!
//! Identity and classification for the nodes of the propagation graph.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a node in the propagation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node in the propagation graph.
///
/// Only used for diagnostics; propagation treats every publisher alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// An ingress node fed by `send`. These are the roots of the graph.
    Sink,

    /// A node derived from one or more upstream publishers.
    Derived,

    /// The update stream of a held behavior.
    Cell,

    /// A node whose upstream changes at runtime.
    Switch,

    /// A forward-declared placeholder closed by `bind`.
    Loop,

    /// A node that never fires.
    Never,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::Sink => "sink",
            NodeKind::Derived => "derived",
            NodeKind::Cell => "cell",
            NodeKind::Switch => "switch",
            NodeKind::Loop => "loop",
            NodeKind::Never => "never",
        };
        f.write_str(name)
    }
}

//! Propagation Graph
//!
//! This module implements the ordering machinery that every transaction
//! relies on.
//!
//! # Overview
//!
//! The propagation graph is a directed graph where:
//!
//! - Nodes are publishers (event streams, behavior update streams) and
//!   listeners
//! - Edges are subscriptions: if B subscribes to A, B's rank is a superior of
//!   A's rank and B fires after A within a transaction
//!
//! The graph is discovered incrementally as operators are built and changes
//! shape at runtime (switch, loop binding, unsubscribe).
//!
//! # Design Decisions
//!
//! 1. Firing order is kept as a lazily-bumped ordinal per node rather than a
//!    topological sort recomputed on every change:
//!    - Adding an edge only touches the nodes that actually need to move
//!    - Relative order of untouched nodes is stable
//!    - A bump tells the caller that queued work must be re-sorted
//!
//! 2. Edges point upward weakly, so the graph never keeps a node alive.
//!
//! 3. Work for one transaction is held in a three-phase [`Schedule`].

mod node;
mod rank;
mod scheduler;

pub use node::{NodeId, NodeKind};
pub use rank::Rank;
pub use scheduler::{Action, Phase, Schedule};

//! Cascade Core
//!
//! This crate provides a glitch-free functional reactive propagation engine.
//! It implements:
//!
//! - Events (discrete occurrences) and behaviors (values over time)
//! - Atomic, rank-ordered transactions with prioritized, last and low phases
//! - Dynamic topology through switch, and feedback through loop placeholders
//!
//! Propagation is synchronous: all work triggered by one input runs on the
//! calling thread before `send` returns. Concurrent callers are serialized by
//! the runtime's propagation lock.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: Ranks, node identity and the three-phase schedule
//! - `reactive`: Runtime, transactions, events, behaviors and operators
//! - `config`: Runtime configuration
//! - `error`: The crate-wide error type
//!
//! # Example
//!
//! ```rust,ignore
//! use cascade_core::reactive::{EventSink, Runtime};
//!
//! let rt = Runtime::new();
//! let input = EventSink::<i32>::new(&rt);
//!
//! // A running total, and a stream pairing each input with the old total
//! let total = input.event().accum(0, |n, sum| sum + n);
//! let pairs = input.event().snapshot(&total, |n, before| (n, before));
//!
//! let listener = pairs.listen(|(n, before)| println!("{before} + {n}"));
//!
//! input.send(5)?;   // prints "0 + 5"
//! input.send(2)?;   // prints "5 + 2"
//! assert_eq!(total.sample(), 7);
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::RuntimeConfig;
pub use error::{FrpError, Result};
pub use reactive::{
    Behavior, BehaviorLoop, BehaviorSink, Event, EventLoop, EventSink, Listener, Runtime,
    Transaction,
};

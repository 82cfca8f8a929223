//! Reactive Primitives
//!
//! This module implements the propagation engine: events, behaviors, and the
//! transactions that move values between them.
//!
//! # Concepts
//!
//! ## Events
//!
//! An [`Event`] is a stream of discrete occurrences. Occurrences enter the
//! network through an [`EventSink`] and are transformed by operators (map,
//! filter, merge, snapshot, ...), each of which returns a new event.
//!
//! ## Behaviors
//!
//! A [`Behavior`] is a value that changes over time. It can always be
//! sampled, and it changes only when a transaction commits. Holding an event
//! gives a behavior; lifting combines several.
//!
//! ## Transactions
//!
//! A [`Transaction`] is one atomic propagation pass. All consequences of one
//! external input are computed in dependency order before any behavior
//! commits, so no observer ever sees a half-updated network.
//!
//! # Implementation Notes
//!
//! Every node owns a rank. A subscription raises its own rank above the
//! node it subscribes to, and a transaction runs queued deliveries in
//! ascending rank order. Values are pushed; nothing is recomputed by
//! walking the graph backwards.
//!
//! The current transaction is passed explicitly to every callback rather
//! than kept in a thread-local, and each [`Runtime`] carries its own lock.

mod behavior;
mod event;
mod listener;
mod loops;
mod publisher;
mod runtime;
mod sink;
mod subscriber;
mod switch;
mod transaction;

pub use behavior::{Behavior, Lambda, ValueSource};
pub use event::Event;
pub use listener::{Dispatcher, Listener};
pub use loops::{BehaviorLoop, EventLoop};
pub use publisher::Value;
pub use runtime::Runtime;
pub use sink::{BehaviorSink, EventSink};
pub use subscriber::{Subscription, SubscriptionId};
pub use transaction::{Transaction, TransactionId};

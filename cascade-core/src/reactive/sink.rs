//! Sinks
//!
//! Sinks are where values enter the network. Sending to a sink opens a
//! transaction (or joins the one already running on this thread), publishes,
//! and drains every consequence before returning.
//!
//! # Example
//!
//! ```rust,ignore
//! let rt = Runtime::new();
//! let clicks = EventSink::<u32>::new(&rt);
//! let count = clicks.event().accum(0, |n, total| total + n);
//!
//! clicks.send(1)?;
//! clicks.send(2)?;
//! assert_eq!(count.sample(), 3);
//! ```

use std::fmt;
use std::sync::Arc;

use super::behavior::Behavior;
use super::event::Event;
use super::publisher::{PublisherInner, Value};
use super::runtime::Runtime;
use super::transaction::Transaction;
use crate::error::Result;
use crate::graph::NodeKind;

/// An event fed from outside the network.
pub struct EventSink<T: Value> {
    node: Arc<PublisherInner<T>>,
}

impl<T: Value> EventSink<T> {
    pub fn new(runtime: &Runtime) -> Self {
        Self {
            node: PublisherInner::new(runtime, NodeKind::Sink),
        }
    }

    pub fn event(&self) -> Event<T> {
        Event::from_node(Arc::clone(&self.node))
    }

    /// Fire the event in its own transaction, or in the one in flight if
    /// called from a callback.
    ///
    /// # Errors
    ///
    /// - [`FrpError::UnboundLoop`] if a loop placeholder in this runtime is
    ///   still unbound; nothing is sent.
    /// - [`FrpError::LockTimeout`] if another thread held the propagation
    ///   lock for longer than the configured wait.
    /// - [`FrpError::CallbackFailed`] if a callback panicked while the
    ///   transaction drained. Every other callback still ran.
    ///
    /// [`FrpError::UnboundLoop`]: crate::error::FrpError::UnboundLoop
    /// [`FrpError::LockTimeout`]: crate::error::FrpError::LockTimeout
    /// [`FrpError::CallbackFailed`]: crate::error::FrpError::CallbackFailed
    pub fn send(&self, value: T) -> Result<()> {
        self.node.runtime().ingress(|tx| self.node.publish(tx, value))
    }

    /// Fire the event as part of `tx`.
    pub fn send_in(&self, tx: &Transaction, value: T) {
        self.node.publish(tx, value);
    }

    /// Send each value in its own transaction, stopping at the first error.
    pub fn feed<I>(&self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
    {
        values.into_iter().try_for_each(|value| self.send(value))
    }
}

impl<T: Value> Clone for EventSink<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
        }
    }
}

impl<T: Value> fmt::Debug for EventSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("id", &self.node.id())
            .field("subscribers", &self.node.subscriber_count())
            .finish()
    }
}

/// A behavior set from outside the network.
///
/// A value sent here becomes visible to sampling once its transaction
/// commits.
pub struct BehaviorSink<T: Value> {
    sink: EventSink<T>,
    behavior: Behavior<T>,
}

impl<T: Value> BehaviorSink<T> {
    pub fn new(runtime: &Runtime, initial: T) -> Self {
        let sink = EventSink::new(runtime);
        let behavior = sink.event().hold(initial);
        Self { sink, behavior }
    }

    pub fn behavior(&self) -> Behavior<T> {
        self.behavior.clone()
    }

    /// See [`EventSink::send`].
    pub fn send(&self, value: T) -> Result<()> {
        self.sink.send(value)
    }

    pub fn send_in(&self, tx: &Transaction, value: T) {
        self.sink.send_in(tx, value);
    }

    /// Send a value computed from the current one.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(T) -> T,
    {
        let current = self.behavior.try_sample()?;
        self.send(f(current))
    }
}

impl<T: Value> Clone for BehaviorSink<T> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            behavior: self.behavior.clone(),
        }
    }
}

impl<T: Value> fmt::Debug for BehaviorSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviorSink")
            .field("id", &self.behavior.id())
            .finish()
    }
}

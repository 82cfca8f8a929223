//! Listeners
//!
//! A listener is where values leave the network. It is the handle returned by
//! `listen`; the callback stays registered until the handle is unlistened or
//! dropped.
//!
//! # Dispatch
//!
//! Callbacks run inside the transaction, with the propagation lock held. A
//! callback that has to run somewhere else (a UI thread, an executor) is
//! registered with `listen_on` and a [`Dispatcher`], which receives each
//! invocation as a boxed closure instead.

use std::any::Any;
use std::fmt;

use parking_lot::Mutex;

use super::publisher::Value;
use super::subscriber::{Disposable, Subscription, SubscriptionId};

/// Marshals a callback invocation onto wherever it should run.
///
/// Implemented for any `Fn(Box<dyn FnOnce() + Send>)`.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, action: Box<dyn FnOnce() + Send>);
}

impl<F> Dispatcher for F
where
    F: Fn(Box<dyn FnOnce() + Send>) + Send + Sync,
{
    fn dispatch(&self, action: Box<dyn FnOnce() + Send>) {
        self(action)
    }
}

/// Handle to a registered callback.
///
/// Dropping the handle unlistens, so keep it for as long as the callback
/// should run.
#[must_use = "dropping a Listener unlistens immediately"]
pub struct Listener {
    id: SubscriptionId,
    subscription: Box<dyn Disposable>,
    /// The listened-to node, kept alive while the listener is active.
    source: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl Listener {
    pub(crate) fn new<T: Value, S: Any + Send + Sync>(subscription: Subscription<T>, source: S) -> Self {
        Self {
            id: subscription.id(),
            subscription: Box::new(subscription),
            source: Mutex::new(Some(Box::new(source))),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Whether the callback is still registered.
    pub fn is_active(&self) -> bool {
        self.subscription.is_active()
    }

    /// Stop the callback. It is not invoked again, even for a delivery
    /// already queued in the current transaction. Idempotent.
    pub fn unlisten(&self) {
        self.subscription.dispose();
        let source = self.source.lock().take();
        if source.is_some() {
            tracing::trace!(listener = ?self.id, "unlistened");
        }
        drop(source);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.unlisten();
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

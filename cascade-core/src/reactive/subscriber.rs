//! Subscriptions
//!
//! A subscription is the live link between a publisher and a callback. It
//! carries the rank the callback runs at, and it checks its cancelled flag at
//! invocation time, so a delivery already queued when the subscription is
//! cancelled is dropped instead of run.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::publisher::{PublisherInner, Value};
use super::transaction::Transaction;
use crate::error::Result;
use crate::graph::Rank;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Generate a new unique subscription ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) type Callback<T> = Box<dyn Fn(&Transaction, T) + Send + Sync>;

/// Something that can be torn down once, from any thread.
pub(crate) trait Disposable: Send + Sync {
    fn dispose(&self);

    fn is_active(&self) -> bool;
}

pub(crate) struct SubscriptionInner<T: Value> {
    id: SubscriptionId,
    rank: Rank,
    callback: Callback<T>,
    cancelled: AtomicBool,
    /// Raw id of the last transaction that queued a delivery here.
    last_tx: AtomicU64,
}

impl<T: Value> SubscriptionInner<T> {
    pub(crate) fn new(rank: Rank, callback: Callback<T>) -> Arc<Self> {
        Arc::new(Self {
            id: SubscriptionId::new(),
            rank,
            callback,
            cancelled: AtomicBool::new(false),
            last_tx: AtomicU64::new(0),
        })
    }

    pub(crate) fn rank(&self) -> &Rank {
        &self.rank
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Mark cancelled. Returns `true` only for the first call.
    pub(crate) fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    /// Queue delivery of `value` at this subscription's rank.
    pub(crate) fn schedule(self: &Arc<Self>, tx: &Transaction, value: T) {
        if self.is_cancelled() {
            return;
        }
        self.last_tx.store(tx.id().raw(), Ordering::SeqCst);
        let sub = Arc::clone(self);
        tx.prioritized(&self.rank, move |tx| sub.invoke(tx, value));
    }

    /// Queue delivery of in-flight state to this subscription only.
    ///
    /// The value is produced when the delivery runs; `make` returns `None`
    /// when there is nothing to deliver yet. The replay is skipped if a
    /// regular delivery reached this subscription in the same transaction,
    /// so a subscriber never sees the same update twice.
    pub(crate) fn replay<F>(self: &Arc<Self>, tx: &Transaction, make: F)
    where
        F: FnOnce(&Transaction) -> Result<Option<T>> + Send + 'static,
    {
        let sub = Arc::clone(self);
        tx.prioritized(&self.rank, move |tx| {
            if sub.last_tx.load(Ordering::SeqCst) == tx.id().raw() {
                return;
            }
            match make(tx) {
                Ok(Some(value)) => {
                    sub.last_tx.store(tx.id().raw(), Ordering::SeqCst);
                    sub.invoke(tx, value);
                }
                Ok(None) => {}
                Err(err) => tx.record_failure(err.to_string()),
            }
        });
    }

    fn invoke(&self, tx: &Transaction, value: T) {
        if !self.is_cancelled() {
            (self.callback)(tx, value);
        }
    }
}

/// Handle to a subscription on a publisher.
///
/// Cancelling (or dropping) the handle removes the callback; cancelling more
/// than once is a no-op. The handle only holds its publisher weakly.
pub struct Subscription<T: Value> {
    publisher: Weak<PublisherInner<T>>,
    inner: Arc<SubscriptionInner<T>>,
}

impl<T: Value> Subscription<T> {
    pub(crate) fn new(publisher: Weak<PublisherInner<T>>, inner: Arc<SubscriptionInner<T>>) -> Self {
        Self { publisher, inner }
    }

    pub fn id(&self) -> SubscriptionId {
        self.inner.id
    }

    /// Whether the subscription still receives values.
    pub fn is_active(&self) -> bool {
        !self.inner.is_cancelled()
    }

    /// Stop receiving values and unlink from the publisher.
    pub fn cancel(&self) {
        if !self.inner.cancel() {
            return;
        }
        if let Some(publisher) = self.publisher.upgrade() {
            publisher.remove_subscription(&self.inner);
        }
    }
}

impl<T: Value> Disposable for Subscription<T> {
    fn dispose(&self) {
        self.cancel();
    }

    fn is_active(&self) -> bool {
        Subscription::is_active(self)
    }
}

impl<T: Value> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<T: Value> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("rank", &self.inner.rank)
            .field("active", &self.is_active())
            .finish()
    }
}

//! Publishers
//!
//! Every event and every behavior's update stream is backed by a
//! [`PublisherInner`]: a node with a rank, a list of subscriptions, and the
//! upstream links it owns. Publishing queues one delivery per subscriber on
//! the transaction, at that subscriber's rank; nothing is invoked directly.
//!
//! # Ownership
//!
//! Subscriptions point upstream weakly. A derived node keeps its upstream
//! alive through its keep-alive list, and owns the subscriptions it made so
//! that dropping (or disposing) the node unlinks it from its sources. Nothing
//! upstream holds a derived node strongly, so an unreferenced part of the
//! network is released as soon as its last handle goes away.
//!
//! # Locking
//!
//! Subscriber lists and ranks change only under the runtime's propagation
//! lock. Removed subscriptions are dropped after the node's own mutex is
//! released, because dropping one can cascade into disposing other nodes.

use std::any::Any;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::runtime::Runtime;
use super::subscriber::{Disposable, Subscription, SubscriptionInner};
use super::transaction::Transaction;
use crate::graph::{NodeId, NodeKind, Rank};

/// Anything that can flow through the network.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Value for T {}

/// Runs for each new subscription, inside the subscribing transaction.
pub(crate) type ReplayHook<T> = Box<dyn Fn(&Transaction, &Arc<SubscriptionInner<T>>) + Send + Sync>;

pub(crate) struct PublisherInner<T: Value> {
    id: NodeId,
    kind: NodeKind,
    runtime: Runtime,
    rank: Rank,
    subscriptions: Mutex<Vec<Arc<SubscriptionInner<T>>>>,
    on_subscribe: Option<ReplayHook<T>>,
    /// Upstream subscriptions made on this node's behalf.
    owned: Mutex<Vec<Box<dyn Disposable>>>,
    /// Upstream handles this node needs to stay alive.
    keep_alive: Mutex<Vec<Box<dyn Any + Send + Sync>>>,
    disposed: AtomicBool,
}

impl<T: Value> PublisherInner<T> {
    pub(crate) fn new(runtime: &Runtime, kind: NodeKind) -> Arc<Self> {
        Self::build(runtime, kind, None)
    }

    pub(crate) fn with_replay<F>(runtime: &Runtime, kind: NodeKind, hook: F) -> Arc<Self>
    where
        F: Fn(&Transaction, &Arc<SubscriptionInner<T>>) + Send + Sync + 'static,
    {
        Self::build(runtime, kind, Some(Box::new(hook)))
    }

    fn build(runtime: &Runtime, kind: NodeKind, on_subscribe: Option<ReplayHook<T>>) -> Arc<Self> {
        let rank = Rank::new();
        let id = rank.id();
        tracing::trace!(node = %id, %kind, "publisher created");
        Arc::new(Self {
            id,
            kind,
            runtime: runtime.clone(),
            rank,
            subscriptions: Mutex::new(Vec::new()),
            on_subscribe,
            owned: Mutex::new(Vec::new()),
            keep_alive: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn kind(&self) -> NodeKind {
        self.kind
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) fn rank(&self) -> &Rank {
        &self.rank
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Register `callback` to run at `rank` for every value published here.
    ///
    /// The subscriber's rank is raised above this node's rank first; if that
    /// reorders anything already queued, the transaction re-sorts. A
    /// subscription made on a disposed node is returned already cancelled.
    pub(crate) fn subscribe<F>(self: &Arc<Self>, tx: &Transaction, rank: Rank, callback: F) -> Subscription<T>
    where
        F: Fn(&Transaction, T) + Send + Sync + 'static,
    {
        let inner = SubscriptionInner::new(rank, Box::new(callback));
        let subscription = Subscription::new(Arc::downgrade(self), Arc::clone(&inner));

        if self.is_disposed() {
            inner.cancel();
            return subscription;
        }

        if self.rank.add_superior(inner.rank()) {
            tx.mark_resort();
        }
        self.subscriptions.lock().push(Arc::clone(&inner));
        tracing::trace!(node = %self.id, subscription = ?subscription.id(), "subscribed");

        if let Some(hook) = &self.on_subscribe {
            hook(tx, &inner);
        }
        subscription
    }

    /// Queue delivery of `value` to every current subscriber.
    pub(crate) fn publish(&self, tx: &Transaction, value: T) {
        let targets: SmallVec<[Arc<SubscriptionInner<T>>; 4]> =
            self.subscriptions.lock().iter().cloned().collect();
        tracing::trace!(node = %self.id, tx = %tx.id(), fanout = targets.len(), "publish");
        for sub in targets {
            sub.schedule(tx, value.clone());
        }
    }

    /// Record an upstream subscription made for this node.
    pub(crate) fn own(&self, subscription: impl Disposable + 'static) {
        if self.is_disposed() {
            subscription.dispose();
            return;
        }
        self.owned.lock().push(Box::new(subscription));
    }

    /// Keep `handle` alive for as long as this node is.
    pub(crate) fn keep_alive(&self, handle: impl Any + Send + Sync) {
        if self.is_disposed() {
            return;
        }
        self.keep_alive.lock().push(Box::new(handle));
    }

    /// Cancel the upstream subscriptions this node owns. The node itself
    /// stays usable but receives nothing more.
    pub(crate) fn cancel_upstream(&self) {
        let owned = mem::take(&mut *self.owned.lock());
        for subscription in &owned {
            subscription.dispose();
        }
    }

    /// Detach this node from the network. Idempotent.
    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(node = %self.id, kind = %self.kind, "publisher disposed");

        self.cancel_upstream();

        let downstream = self.runtime.locked(|| {
            let subs = mem::take(&mut *self.subscriptions.lock());
            for sub in &subs {
                sub.cancel();
            }
            self.rank.clear_superiors();
            subs
        });
        drop(downstream);

        let kept = mem::take(&mut *self.keep_alive.lock());
        drop(kept);
    }

    pub(crate) fn remove_subscription(&self, target: &Arc<SubscriptionInner<T>>) {
        let removed = self.runtime.locked(|| {
            let removed = {
                let mut subs = self.subscriptions.lock();
                subs.iter()
                    .position(|sub| Arc::ptr_eq(sub, target))
                    .map(|pos| subs.remove(pos))
            };
            if removed.is_some() {
                self.rank.remove_superior(target.rank());
            }
            removed
        });
        if removed.is_some() {
            tracing::trace!(node = %self.id, "unsubscribed");
        }
    }
}

impl<T: Value> Drop for PublisherInner<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T: Value> fmt::Debug for PublisherInner<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("rank", &self.rank)
            .field("subscribers", &self.subscriber_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

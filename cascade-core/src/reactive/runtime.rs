//! Reactive Runtime
//!
//! The runtime is the central coordinator that serializes transactions. Every
//! event and behavior records the runtime it was built in, and every
//! propagation pass goes through it.
//!
//! # How It Works
//!
//! 1. An external input (`send`) asks the runtime for a transaction.
//!
//! 2. The runtime takes the propagation lock. If this thread already holds it
//!    (the send comes from inside a callback), the transaction in flight is
//!    handed out and the send simply joins it. A send is refused while a
//!    loop placeholder in the runtime is still unbound; that check runs
//!    under the lock.
//!
//! 3. Otherwise a fresh transaction is opened, the caller's closure runs,
//!    and the transaction is drained (prioritized, last, low) before the lock
//!    is released.
//!
//! # Thread Safety
//!
//! The propagation lock is a reentrant mutex around the "current transaction"
//! slot. Threads that fire concurrently are reduced to a strict sequence of
//! non-overlapping transactions. Ingress calls wait at most
//! [`RuntimeConfig::lock_timeout`] for the lock and report
//! [`FrpError::LockTimeout`] rather than retrying.
//!
//! Runtimes are independent: two runtimes never share a lock, so networks
//! built in different runtimes must not be wired together.

use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, ReentrantMutex};

use super::loops::LoopMarker;
use super::transaction::Transaction;
use crate::config::RuntimeConfig;
use crate::error::{FrpError, Result};
use crate::graph::NodeId;

type CurrentSlot = RefCell<Option<Transaction>>;

/// Work parked until a loop placeholder is bound, run in the binding
/// transaction.
pub(crate) type Deferred = Box<dyn FnOnce(&Transaction) + Send>;

struct UnboundLoop {
    marker: Weak<LoopMarker>,
    deferred: Vec<Deferred>,
}

/// Handle to a propagation runtime. Cloning is cheap and shares the runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: RuntimeConfig,

    /// The propagation lock and the transaction in flight, if any.
    current: ReentrantMutex<CurrentSlot>,

    /// Loop placeholders that have not been bound yet, oldest first.
    unbound_loops: Mutex<IndexMap<NodeId, UnboundLoop>>,
}

impl Runtime {
    /// Create a runtime with the default configuration.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        tracing::debug!(runtime = %config.name, lock_timeout = ?config.lock_timeout, "runtime created");
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                current: ReentrantMutex::new(RefCell::new(None)),
                unbound_loops: Mutex::new(IndexMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Run `f` inside one transaction and drain it.
    ///
    /// If this thread is already inside a transaction of this runtime, `f`
    /// joins it and the enclosing call does the draining. Everything `f`
    /// sends is simultaneous.
    pub fn transaction<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction) -> R,
    {
        let waited = self.inner.config.lock_timeout;
        let guard = self
            .inner
            .current
            .try_lock_for(waited)
            .ok_or(FrpError::LockTimeout { waited })?;
        self.run_locked(&guard, f)
    }

    /// Whether this thread is currently inside a transaction of this runtime.
    pub fn in_transaction(&self) -> bool {
        self.inner
            .current
            .try_lock()
            .map_or(false, |slot| slot.borrow().is_some())
    }

    /// Fail if any live loop placeholder is still unbound.
    pub fn ensure_loops_bound(&self) -> Result<()> {
        let (oldest, dropped) = {
            let mut loops = self.inner.unbound_loops.lock();
            let dead: Vec<NodeId> = loops
                .iter()
                .filter(|(_, entry)| entry.marker.strong_count() == 0)
                .map(|(node, _)| *node)
                .collect();
            let dropped: Vec<UnboundLoop> = dead
                .into_iter()
                .filter_map(|node| loops.shift_remove(&node))
                .collect();
            (loops.first().map(|(node, _)| *node), dropped)
        };
        drop(dropped);
        match oldest {
            Some(node) => Err(FrpError::UnboundLoop { node }),
            None => Ok(()),
        }
    }

    /// Run `f` as external input: like [`Runtime::transaction`], but the
    /// unbound-loop check happens under the propagation lock, so it cannot
    /// observe a network another thread is still wiring up.
    pub(crate) fn ingress<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction) -> R,
    {
        let waited = self.inner.config.lock_timeout;
        let guard = self
            .inner
            .current
            .try_lock_for(waited)
            .ok_or(FrpError::LockTimeout { waited })?;
        self.ensure_loops_bound()?;
        self.run_locked(&guard, f)
    }

    /// Whether two handles refer to the same runtime.
    pub fn same(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `f` in a transaction, waiting as long as it takes for the lock.
    ///
    /// Used while building the network, where there is no caller to hand a
    /// timeout to. A callback failure during the drain is re-raised here.
    pub(crate) fn run<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&Transaction) -> R,
    {
        let guard = self.inner.current.lock();
        match self.run_locked(&guard, f) {
            Ok(value) => value,
            Err(err) => panic!("{err}"),
        }
    }

    /// Hold the propagation lock (without opening a transaction) while `f`
    /// runs. Used for subscriber-list and rank mutation outside propagation.
    pub(crate) fn locked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.inner.current.lock();
        f()
    }

    /// Like [`Runtime::locked`] but with the configured bounded wait.
    pub(crate) fn try_locked<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        let waited = self.inner.config.lock_timeout;
        let _guard = self
            .inner
            .current
            .try_lock_for(waited)
            .ok_or(FrpError::LockTimeout { waited })?;
        Ok(f())
    }

    pub(crate) fn register_loop(&self, marker: &Arc<LoopMarker>) {
        let entry = UnboundLoop {
            marker: Arc::downgrade(marker),
            deferred: Vec::new(),
        };
        self.inner.unbound_loops.lock().insert(marker.node(), entry);
    }

    /// Park `action` until the placeholder `node` is bound. Hands the action
    /// back if `node` is not a registered, unbound placeholder.
    pub(crate) fn defer_until_bound(&self, node: NodeId, action: Deferred) -> std::result::Result<(), Deferred> {
        match self.inner.unbound_loops.lock().get_mut(&node) {
            Some(entry) if entry.marker.strong_count() > 0 => {
                entry.deferred.push(action);
                Ok(())
            }
            _ => Err(action),
        }
    }

    /// Remove `node` from the unbound placeholders and return the work
    /// parked on it.
    pub(crate) fn loop_bound(&self, node: NodeId) -> Vec<Deferred> {
        let entry = self.inner.unbound_loops.lock().shift_remove(&node);
        entry.map(|entry| entry.deferred).unwrap_or_default()
    }

    fn run_locked<R, F>(&self, slot: &CurrentSlot, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction) -> R,
    {
        let current = slot.borrow().clone();
        if let Some(tx) = current {
            return Ok(f(&tx));
        }

        let tx = Transaction::new();
        *slot.borrow_mut() = Some(tx.clone());

        let value = match panic::catch_unwind(AssertUnwindSafe(|| f(&tx))) {
            Ok(value) => value,
            Err(payload) => {
                // Nothing was committed yet; drop the queued work and let the
                // panic continue.
                tx.abandon();
                *slot.borrow_mut() = None;
                panic::resume_unwind(payload);
            }
        };

        tx.drain();
        *slot.borrow_mut() = None;
        tx.finish()?;
        Ok(value)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("name", &self.inner.config.name)
            .field("unbound_loops", &self.inner.unbound_loops.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Rank;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::time::Duration;

    #[test]
    fn transaction_returns_closure_result() {
        let rt = Runtime::new();
        let value = rt.transaction(|_| 42).unwrap();
        assert_eq!(value, 42);
        assert!(!rt.in_transaction());
    }

    #[test]
    fn nested_transactions_fold_into_outer() {
        let rt = Runtime::new();
        let outer_id = rt
            .transaction(|outer| {
                assert!(rt.in_transaction());
                let inner_id = rt.transaction(|inner| inner.id()).unwrap();
                assert_eq!(inner_id, outer.id());
                outer.id()
            })
            .unwrap();

        let next_id = rt.transaction(|tx| tx.id()).unwrap();
        assert_ne!(outer_id, next_id);
    }

    #[test]
    fn queued_work_drains_before_returning() {
        let rt = Runtime::new();
        let count = Arc::new(AtomicI32::new(0));
        let rank = Rank::new();

        let count_clone = count.clone();
        rt.transaction(|tx| {
            tx.last(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            });
        })
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let count_clone = count.clone();
        rt.transaction(|tx| {
            tx.prioritized(&rank, move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            });
        })
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn callback_failure_is_reported_after_drain() {
        let rt = Runtime::new();
        let rank = Rank::new();
        let committed = Arc::new(AtomicI32::new(0));

        let committed_clone = committed.clone();
        let err = rt
            .transaction(|tx| {
                tx.prioritized(&rank, |_| panic!("listener exploded"));
                tx.last(move |_| {
                    committed_clone.fetch_add(1, Ordering::SeqCst);
                });
            })
            .unwrap_err();

        assert!(matches!(err, FrpError::CallbackFailed { count: 1, .. }));
        assert_eq!(committed.load(Ordering::SeqCst), 1);
        assert!(!rt.in_transaction());
    }

    #[test]
    fn lock_timeout_is_reported() {
        let rt = Runtime::with_config(
            RuntimeConfig::default().with_lock_timeout(Duration::from_millis(20)),
        );
        let holder = rt.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let handle = std::thread::spawn(move || {
            holder
                .transaction(|_| {
                    ready_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                })
                .unwrap();
        });

        ready_rx.recv().unwrap();
        let err = rt.transaction(|_| ()).unwrap_err();
        assert!(matches!(err, FrpError::LockTimeout { .. }));

        release_tx.send(()).unwrap();
        handle.join().unwrap();
        assert!(rt.transaction(|_| ()).is_ok());
    }

    #[test]
    fn unbound_loops_are_tracked() {
        let rt = Runtime::new();
        assert!(rt.ensure_loops_bound().is_ok());

        let marker = Arc::new(LoopMarker::new(NodeId::new()));
        rt.register_loop(&marker);
        assert!(matches!(
            rt.ensure_loops_bound(),
            Err(FrpError::UnboundLoop { node }) if node == marker.node()
        ));

        assert!(rt.loop_bound(marker.node()).is_empty());
        assert!(rt.ensure_loops_bound().is_ok());

        let dropped = Arc::new(LoopMarker::new(NodeId::new()));
        rt.register_loop(&dropped);
        drop(dropped);
        assert!(rt.ensure_loops_bound().is_ok());
    }

    #[test]
    fn deferred_work_runs_when_loop_is_bound() {
        let rt = Runtime::new();
        let marker = Arc::new(LoopMarker::new(NodeId::new()));
        rt.register_loop(&marker);

        let count = Arc::new(AtomicI32::new(0));
        let count_clone = count.clone();
        let parked = rt.defer_until_bound(
            marker.node(),
            Box::new(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(parked.is_ok());
        assert!(rt.defer_until_bound(NodeId::new(), Box::new(|_| ())).is_err());

        let deferred = rt.loop_bound(marker.node());
        assert_eq!(deferred.len(), 1);
        rt.transaction(|tx| deferred.into_iter().for_each(|action| action(tx)))
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(rt.ensure_loops_bound().is_ok());
    }

    #[test]
    fn ingress_checks_loops_under_the_lock() {
        let rt = Runtime::new();
        let marker = Arc::new(LoopMarker::new(NodeId::new()));
        rt.register_loop(&marker);
        assert!(matches!(rt.ingress(|_| ()), Err(FrpError::UnboundLoop { .. })));

        rt.loop_bound(marker.node());
        assert_eq!(rt.ingress(|_| 3).unwrap(), 3);
    }
}

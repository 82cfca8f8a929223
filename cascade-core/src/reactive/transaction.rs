//! Transactions
//!
//! A transaction is one atomic propagation pass. Everything that happens as a
//! consequence of one external input (every publish, every callback, every
//! behavior commit) is queued on the same transaction and drained before the
//! call that started it returns.
//!
//! # Handle passing
//!
//! The current transaction is passed explicitly: every callback receives
//! `&Transaction`, and operators queue their follow-up work on it. Code that
//! does not have a handle (an external `send`) asks the [`Runtime`] for one;
//! the runtime hands out the transaction already in flight on this thread if
//! there is one, so nested sends join the enclosing update.
//!
//! # Failure handling
//!
//! Each queued action runs under `catch_unwind`. A panicking callback is
//! recorded and the remaining work still runs, so the schedule is never left
//! half-drained. The recorded failures are reported to the triggering call
//! once all phases are empty.
//!
//! [`Runtime`]: super::Runtime

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{FrpError, Result};
use crate::graph::{Rank, Schedule};

/// Unique identifier for a transaction. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// Handle to the transaction currently propagating.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

struct TransactionInner {
    id: TransactionId,
    schedule: Mutex<Schedule<Transaction>>,
    failures: Mutex<Vec<String>>,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        let id = TransactionId::next();
        tracing::trace!(tx = %id, "transaction opened");
        Self {
            inner: Arc::new(TransactionInner {
                id,
                schedule: Mutex::new(Schedule::new()),
                failures: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    /// Queue work to run at `rank`'s position in the firing order.
    pub fn prioritized<F>(&self, rank: &Rank, action: F)
    where
        F: FnOnce(&Transaction) + Send + 'static,
    {
        self.inner
            .schedule
            .lock()
            .push_prioritized(rank, Box::new(action));
    }

    /// Queue work to run once all prioritized work has drained.
    ///
    /// Callers that commit state guard this themselves so that at most one
    /// commit runs per node per transaction.
    pub fn last<F>(&self, action: F)
    where
        F: FnOnce(&Transaction) + Send + 'static,
    {
        self.inner.schedule.lock().push_last(Box::new(action));
    }

    /// Queue work to run after every other phase.
    pub fn low<F>(&self, action: F)
    where
        F: FnOnce(&Transaction) + Send + 'static,
    {
        self.inner.schedule.lock().push_low(Box::new(action));
    }

    /// Note that a rank changed; queued ranked work is re-sorted before the
    /// next action runs.
    pub fn mark_resort(&self) {
        self.inner.schedule.lock().mark_stale();
    }

    /// Number of actions still queued.
    pub fn pending(&self) -> usize {
        self.inner.schedule.lock().len()
    }

    /// Record a failure to be reported when the transaction closes.
    pub(crate) fn record_failure(&self, message: impl Into<String>) {
        self.inner.failures.lock().push(message.into());
    }

    /// Run queued work until every phase is empty.
    pub(crate) fn drain(&self) {
        let mut steps: u64 = 0;
        loop {
            let next = self.inner.schedule.lock().next();
            let Some((phase, action)) = next else {
                break;
            };
            steps += 1;

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| action(self))) {
                let message = panic_message(payload.as_ref());
                tracing::warn!(tx = %self.inner.id, ?phase, %message, "callback panicked");
                self.record_failure(message);
            }
        }

        let resorts = self.inner.schedule.lock().resorts();
        tracing::trace!(tx = %self.inner.id, steps, resorts, "transaction drained");
    }

    /// Discard queued work without running it.
    pub(crate) fn abandon(&self) {
        let dropped = self.inner.schedule.lock().take_all();
        if !dropped.is_empty() {
            tracing::debug!(tx = %self.inner.id, dropped = dropped.len(), "transaction abandoned");
        }
        drop(dropped);
    }

    /// Report the failures recorded while draining, if any.
    pub(crate) fn finish(&self) -> Result<()> {
        let failures = std::mem::take(&mut *self.inner.failures.lock());
        tracing::trace!(tx = %self.inner.id, failures = failures.len(), "transaction closed");

        match failures.first() {
            None => Ok(()),
            Some(first) => Err(FrpError::CallbackFailed {
                count: failures.len(),
                first: first.clone(),
            }),
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("pending", &self.pending())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "callback panicked".to_string()
    }
}

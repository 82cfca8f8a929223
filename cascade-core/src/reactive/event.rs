//! Events
//!
//! An [`Event`] is a stream of discrete occurrences. Each operator here builds
//! a new publisher, subscribes it to its source(s) at its own rank, and
//! republishes from the subscription callback. Because a subscriber's rank is
//! always above its source's, an operator never runs before the values it
//! depends on within a transaction.
//!
//! Events are cheap handles; cloning shares the node. A derived event keeps
//! its sources alive, and dropping the last handle to it (and every listener
//! on it) unlinks it from those sources.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::behavior::{Behavior, CellValue};
use super::listener::{Dispatcher, Listener};
use super::loops::BehaviorLoop;
use super::publisher::{PublisherInner, Value};
use super::runtime::Runtime;
use super::transaction::{Transaction, TransactionId};
use crate::graph::{NodeId, NodeKind, Rank};

/// A stream of discrete occurrences.
pub struct Event<T: Value> {
    node: Arc<PublisherInner<T>>,
}

impl<T: Value> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
        }
    }
}

impl<T: Value> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.node.id())
            .field("kind", &self.node.kind())
            .field("subscribers", &self.node.subscriber_count())
            .finish()
    }
}

impl<T: Value> Event<T> {
    pub(crate) fn from_node(node: Arc<PublisherInner<T>>) -> Self {
        Self { node }
    }

    pub(crate) fn node(&self) -> &Arc<PublisherInner<T>> {
        &self.node
    }

    /// An event that never fires.
    pub fn never(runtime: &Runtime) -> Self {
        Self::from_node(PublisherInner::new(runtime, NodeKind::Never))
    }

    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    pub fn runtime(&self) -> &Runtime {
        self.node.runtime()
    }

    /// Number of live subscriptions on this event.
    pub fn subscriber_count(&self) -> usize {
        self.node.subscriber_count()
    }

    /// Subscribe `out` to this event at `rank`, recording the subscription
    /// and this event in `out` so the link lives exactly as long as `out`.
    pub(crate) fn attach<U, F>(&self, out: &Arc<PublisherInner<U>>, tx: &Transaction, rank: Rank, on_value: F)
    where
        U: Value,
        F: Fn(&Arc<PublisherInner<U>>, &Transaction, T) + Send + Sync + 'static,
    {
        self.link(out, tx, rank, on_value);
        out.keep_alive(self.clone());
    }

    /// Like [`Event::attach`], but `out` does not keep this event alive. The
    /// link ends when either side is dropped.
    pub(crate) fn link<U, F>(&self, out: &Arc<PublisherInner<U>>, tx: &Transaction, rank: Rank, on_value: F)
    where
        U: Value,
        F: Fn(&Arc<PublisherInner<U>>, &Transaction, T) + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(out);
        let subscription = self.node.subscribe(tx, rank, move |tx, value| {
            if let Some(out) = weak.upgrade() {
                on_value(&out, tx, value);
            }
        });
        out.own(subscription);
    }

    /// A new derived event fed by `on_value` for each occurrence.
    pub(crate) fn derive<U, F>(&self, on_value: F) -> Event<U>
    where
        U: Value,
        F: Fn(&Arc<PublisherInner<U>>, &Transaction, T) + Send + Sync + 'static,
    {
        let out = PublisherInner::new(self.runtime(), NodeKind::Derived);
        self.runtime()
            .run(|tx| self.attach(&out, tx, out.rank().clone(), on_value));
        Event::from_node(out)
    }

    /// Call `f` with every occurrence until the returned [`Listener`] is
    /// unlistened or dropped.
    pub fn listen<F>(&self, f: F) -> Listener
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let subscription = self
            .runtime()
            .run(|tx| self.node.subscribe(tx, Rank::new(), move |_, value| f(value)));
        Listener::new(subscription, self.clone())
    }

    /// Like [`Event::listen`], but each invocation of `f` is handed to
    /// `dispatcher` instead of running inside the transaction.
    pub fn listen_on<D, F>(&self, dispatcher: D, f: F) -> Listener
    where
        D: Dispatcher + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.listen(move |value| {
            let f = Arc::clone(&f);
            dispatcher.dispatch(Box::new(move || f(value)));
        })
    }

    pub fn map<U, F>(&self, f: F) -> Event<U>
    where
        U: Value,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.derive(move |out, tx, value| out.publish(tx, f(value)))
    }

    pub fn filter<F>(&self, predicate: F) -> Event<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.derive(move |out, tx, value| {
            if predicate(&value) {
                out.publish(tx, value);
            }
        })
    }

    /// Map and filter in one step: occurrences for which `f` returns `None`
    /// are dropped.
    pub fn filter_map<U, F>(&self, f: F) -> Event<U>
    where
        U: Value,
        F: Fn(T) -> Option<U> + Send + Sync + 'static,
    {
        self.derive(move |out, tx, value| {
            if let Some(mapped) = f(value) {
                out.publish(tx, mapped);
            }
        })
    }

    /// Fire whenever either event fires.
    ///
    /// If both fire in one transaction, or one fires twice, every occurrence
    /// is passed on separately. Use [`Event::merge_with`] or
    /// [`Event::coalesce`] to reduce them to one.
    pub fn merge(&self, other: &Event<T>) -> Event<T> {
        let out = PublisherInner::new(self.runtime(), NodeKind::Derived);
        self.runtime().run(|tx| {
            for source in [self, other] {
                source.attach(&out, tx, out.rank().clone(), |out, tx, value| {
                    out.publish(tx, value)
                });
            }
        });
        Event::from_node(out)
    }

    /// Merge and combine simultaneous occurrences left to right.
    pub fn merge_with<F>(&self, other: &Event<T>, combine: F) -> Event<T>
    where
        F: Fn(T, T) -> T + Send + Sync + 'static,
    {
        self.merge(other).coalesce(combine)
    }

    /// Reduce all occurrences within one transaction to a single one,
    /// `combine(combine(a, b), c)` for occurrences `a`, `b`, `c`.
    ///
    /// Work queued in the low phase (a [`delayed`](Event::delay) event) runs
    /// after the transaction's ranked work has settled and behaviors have
    /// committed, so it is a later instant: occurrences arriving then are
    /// coalesced separately and produce a second occurrence.
    pub fn coalesce<F>(&self, combine: F) -> Event<T>
    where
        F: Fn(T, T) -> T + Send + Sync + 'static,
    {
        let out = PublisherInner::new(self.runtime(), NodeKind::Derived);
        let gather = Rank::new();
        let pending: Gathered<T> = Arc::default();
        self.runtime().run(|tx| {
            if gather.add_superior(out.rank()) {
                tx.mark_resort();
            }
            self.attach(&out, tx, gather, move |out, tx, value| {
                gather_and_flush(out, &pending, tx, value, &combine)
            });
        });
        Event::from_node(out)
    }

    /// On each occurrence, combine the value with `behavior`'s value as of
    /// the start of the transaction.
    pub fn snapshot<B, U, F>(&self, behavior: &Behavior<B>, f: F) -> Event<U>
    where
        B: Value,
        U: Value,
        F: Fn(T, B) -> U + Send + Sync + 'static,
    {
        let behavior = behavior.clone();
        self.derive(move |out, tx, value| match behavior.current() {
            Ok(sampled) => out.publish(tx, f(value, sampled)),
            Err(err) => tx.record_failure(err.to_string()),
        })
    }

    /// A behavior that starts at `initial` and takes each occurrence's value
    /// once the transaction it fired in commits.
    pub fn hold(&self, initial: T) -> Behavior<T> {
        Behavior::hold_with(self, CellValue::Ready(initial))
    }

    /// Running fold: `f(occurrence, previous)` on each occurrence.
    ///
    /// The fold stops, and lets go of this event, when the returned behavior
    /// is dropped.
    pub fn accum<S, F>(&self, initial: S, f: F) -> Behavior<S>
    where
        S: Value,
        F: Fn(T, S) -> S + Send + Sync + 'static,
    {
        let state = BehaviorLoop::internal(self.runtime());
        let out = self.snapshot(&state.behavior(), f).hold(initial);
        bind_fresh(&state, &out);
        out
    }

    /// Stateful map: `f(occurrence, state)` yields an output and the state
    /// carried to the next occurrence.
    pub fn collect<U, S, F>(&self, initial: S, f: F) -> Event<U>
    where
        U: Value,
        S: Value,
        F: Fn(T, S) -> (U, S) + Send + Sync + 'static,
    {
        let state = BehaviorLoop::internal(self.runtime());
        let pairs = self.snapshot(&state.behavior(), f);
        let carried = pairs.map(|(_, s)| s).hold(initial);
        bind_fresh(&state, &carried);

        let out = pairs.map(|(u, _)| u);
        out.node.keep_alive(carried);
        out
    }

    /// Pass on the first occurrence only, then let go of the source.
    pub fn once(&self) -> Event<T> {
        let fired = AtomicBool::new(false);
        self.derive(move |out, tx, value| {
            if fired.swap(true, Ordering::SeqCst) {
                return;
            }
            out.publish(tx, value);
            out.cancel_upstream();
        })
    }

    /// Re-fire each occurrence in the same transaction, after every behavior
    /// has committed.
    pub fn delay(&self) -> Event<T> {
        self.derive(|out, tx, value| {
            let weak = Arc::downgrade(out);
            tx.low(move |tx| {
                if let Some(out) = weak.upgrade() {
                    out.publish(tx, value);
                }
            });
        })
    }

    /// Pass occurrences only while `open` is true, sampled at transaction
    /// start.
    pub fn gate(&self, open: &Behavior<bool>) -> Event<T> {
        self.snapshot(open, |value, open| open.then_some(value))
            .filter_some()
    }

    /// Detach this event from its sources and subscribers. Idempotent.
    pub fn dispose(&self) {
        self.node.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.node.is_disposed()
    }

    /// Occurrences as `()`, for use as a trigger.
    pub(crate) fn unit(&self) -> Event<()> {
        self.map(|_| ())
    }
}

impl<T: Value> Event<Option<T>> {
    /// Drop `None` occurrences and unwrap the rest.
    pub fn filter_some(&self) -> Event<T> {
        self.filter_map(|value| value)
    }
}

/// Fire on any of `events`. An empty list never fires.
pub(crate) fn merge_all<T: Value>(runtime: &Runtime, events: &[Event<T>]) -> Event<T> {
    match events.split_first() {
        None => Event::never(runtime),
        Some((first, rest)) => rest.iter().fold(first.clone(), |acc, next| acc.merge(next)),
    }
}

/// Occurrences gathered since the last flush, tagged with their transaction.
pub(crate) type Gathered<T> = Arc<Mutex<Option<(TransactionId, T)>>>;

/// Fold `value` into `pending` and, on the first value since the last flush,
/// queue a flush at `out`'s rank.
///
/// Callers subscribe at a rank that `out`'s rank sits above, so the flush runs
/// after every occurrence of the instant has been gathered. A value left over
/// from another transaction (one abandoned before its flush ran) is discarded
/// rather than combined.
pub(crate) fn gather_and_flush<T: Value>(
    out: &Arc<PublisherInner<T>>,
    pending: &Gathered<T>,
    tx: &Transaction,
    value: T,
    combine: impl FnOnce(T, T) -> T,
) {
    let (earlier, stale) = match pending.lock().take() {
        Some((id, earlier)) if id == tx.id() => (Some(earlier), None),
        other => (None, other),
    };
    drop(stale);

    let first = earlier.is_none();
    let combined = match earlier {
        Some(earlier) => combine(earlier, value),
        None => value,
    };
    *pending.lock() = Some((tx.id(), combined));

    if first {
        let pending = Arc::clone(pending);
        let weak = Arc::downgrade(out);
        tx.prioritized(out.rank(), move |tx| {
            let value = pending.lock().take();
            if let (Some(out), Some((_, value))) = (weak.upgrade(), value) {
                out.publish(tx, value);
            }
        });
    }
}

fn bind_fresh<S: Value>(state: &BehaviorLoop<S>, target: &Behavior<S>) {
    if let Err(err) = state.bind(target) {
        unreachable!("fresh loop placeholder rejected bind: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::EventSink;
    use std::sync::atomic::AtomicUsize;

    fn collect<T: Value>(event: &Event<T>) -> (Arc<Mutex<Vec<T>>>, Listener) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = event.listen(move |value| sink.lock().push(value));
        (seen, listener)
    }

    #[test]
    fn map_and_filter() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let (seen, _l) = collect(&sink.event().map(|n| n * 10).filter(|n| *n > 10));

        for n in 1..=3 {
            sink.send(n).unwrap();
        }
        assert_eq!(*seen.lock(), vec![20, 30]);
    }

    #[test]
    fn filter_map_and_filter_some() {
        let rt = Runtime::new();
        let sink = EventSink::<&'static str>::new(&rt);
        let parsed = sink.event().map(|s| s.parse::<i32>().ok());
        let (seen, _l) = collect(&parsed.filter_some());
        let (lengths, _l2) = collect(&sink.event().filter_map(|s| (s.len() > 1).then_some(s.len())));

        for s in ["1", "x", "23"] {
            sink.send(s).unwrap();
        }
        assert_eq!(*seen.lock(), vec![1, 23]);
        assert_eq!(*lengths.lock(), vec![2]);
    }

    #[test]
    fn merge_same_event_fires_twice() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let e = sink.event();
        let (seen, _l) = collect(&e.merge(&e));

        sink.send(5).unwrap();
        assert_eq!(*seen.lock(), vec![5, 5]);
    }

    #[test]
    fn coalesce_combines_left_to_right() {
        let rt = Runtime::new();
        let sink = EventSink::<String>::new(&rt);
        let (seen, _l) = collect(&sink.event().coalesce(|a, b| format!("{a}{b}")));

        rt.transaction(|tx| {
            sink.send_in(tx, "a".to_string());
            sink.send_in(tx, "b".to_string());
            sink.send_in(tx, "c".to_string());
        })
        .unwrap();
        sink.send("d".to_string()).unwrap();

        assert_eq!(*seen.lock(), vec!["abc".to_string(), "d".to_string()]);
    }

    #[test]
    fn merge_with_resolves_simultaneous_occurrences() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let e = sink.event();
        let (seen, _l) = collect(&e.map(|n| n * 10).merge_with(&e, |a, b| a + b));

        sink.send(1).unwrap();
        assert_eq!(*seen.lock(), vec![11]);
    }

    #[test]
    fn once_fires_a_single_time_and_releases_source() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let first = sink.event().once();
        let (seen, _l) = collect(&first);

        sink.send(1).unwrap();
        sink.send(2).unwrap();
        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(sink.event().subscriber_count(), 0);
    }

    #[test]
    fn once_within_one_transaction() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let (seen, _l) = collect(&sink.event().once());

        rt.transaction(|tx| {
            sink.send_in(tx, 1);
            sink.send_in(tx, 2);
        })
        .unwrap();
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn delay_sees_committed_state() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let held = sink.event().hold(0);
        let (seen, _l) = collect(&sink.event().delay().snapshot(&held, |a, b| (a, b)));

        sink.send(3).unwrap();
        sink.send(4).unwrap();
        assert_eq!(*seen.lock(), vec![(3, 3), (4, 4)]);
    }

    #[test]
    fn gate_samples_start_of_transaction() {
        let rt = Runtime::new();
        let values = EventSink::<i32>::new(&rt);
        let open = EventSink::<bool>::new(&rt);
        let gate = open.event().hold(false);
        let (seen, _l) = collect(&values.event().gate(&gate));

        values.send(1).unwrap();
        open.send(true).unwrap();
        values.send(2).unwrap();
        rt.transaction(|tx| {
            open.send_in(tx, false);
            values.send_in(tx, 3);
        })
        .unwrap();
        values.send(4).unwrap();

        assert_eq!(*seen.lock(), vec![2, 3]);
    }

    #[test]
    fn accum_and_collect() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let total = sink.event().accum(0, |n, acc| acc + n);
        let (indexed, _l) = collect(&sink.event().collect(0usize, |n, i| ((i, n), i + 1)));

        for n in [4, 5, 6] {
            sink.send(n).unwrap();
        }
        assert_eq!(total.sample(), 15);
        assert_eq!(*indexed.lock(), vec![(0, 4), (1, 5), (2, 6)]);
    }

    #[test]
    fn dropped_accumulators_release_their_source() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let folds = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = folds.clone();
            let total = sink.event().accum(0, move |n, acc| {
                counter.fetch_add(1, Ordering::SeqCst);
                acc + n
            });
            drop(total);
            let indexed = sink.event().collect(0, |n, i| (n + i, i + 1));
            drop(indexed);
        }

        assert_eq!(sink.event().subscriber_count(), 0);
        sink.send(1).unwrap();
        assert_eq!(folds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn collect_state_outlives_intermediate_handles() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let (running, _l) = collect(&sink.event().collect(0, |n, sum| (n + sum, n + sum)));

        sink.feed([1, 2, 3]).unwrap();
        assert_eq!(*running.lock(), vec![1, 3, 6]);
    }

    #[test]
    fn coalesce_flushes_once_per_instant() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let e = sink.event();
        let (ranked, _l) = collect(&e.merge(&e.map(|n| n * 10)).coalesce(|a, b| a + b));
        let (delayed, _l2) = collect(&e.merge(&e.delay()).coalesce(|a, b| a + b));

        sink.send(5).unwrap();
        sink.send(1).unwrap();
        assert_eq!(*ranked.lock(), vec![55, 11]);
        // The delayed copy arrives after the first flush, as a later instant.
        assert_eq!(*delayed.lock(), vec![5, 5, 1, 1]);
    }

    #[test]
    fn never_never_fires() {
        let rt = Runtime::new();
        let never = Event::<i32>::never(&rt);
        let (seen, _l) = collect(&never.map(|n| n + 1));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn listen_on_uses_dispatcher() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let queued: Arc<Mutex<Vec<Box<dyn FnOnce() + Send>>>> = Arc::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let queue = queued.clone();
        let record = seen.clone();
        let _l = sink.event().listen_on(
            move |action: Box<dyn FnOnce() + Send>| queue.lock().push(action),
            move |n| record.lock().push(n),
        );

        sink.send(1).unwrap();
        sink.send(2).unwrap();
        assert!(seen.lock().is_empty());

        let actions = std::mem::take(&mut *queued.lock());
        for action in actions {
            action();
        }
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn dispose_cuts_downstream() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let mapped = sink.event().map(|n| n + 1);
        let (seen, listener) = collect(&mapped);

        sink.send(1).unwrap();
        mapped.dispose();
        mapped.dispose();
        sink.send(2).unwrap();

        assert_eq!(*seen.lock(), vec![2]);
        assert!(!listener.is_active());
        assert_eq!(sink.event().subscriber_count(), 0);
    }
}

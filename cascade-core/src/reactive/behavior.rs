//! Behaviors
//!
//! A [`Behavior`] is a value that changes over time. Sampling it gives the
//! value as of the end of the last settled transaction; an update set during
//! a transaction stays pending until that transaction's commit phase.
//!
//! # Cells
//!
//! A held behavior is backed by a cell with a committed value and at most one
//! pending update, tagged with the transaction that set it. The first pending
//! update in a transaction queues one commit in the `Last` phase. Operators
//! that must see this transaction's update (lift, switch) read the pending
//! value through `new_value`; snapshot and plain sampling never do.
//!
//! # Lazy initial values
//!
//! Derived behaviors (map, lift, switch) compute their initial value on first
//! read instead of at construction, so a network can be wired through a loop
//! placeholder before the placeholder is bound.

use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::event::{merge_all, Event};
use super::listener::Listener;
use super::loops::{BehaviorLoop, LoopSlot};
use super::publisher::{PublisherInner, Value};
use super::runtime::{Deferred, Runtime};
use super::subscriber::SubscriptionInner;
use super::transaction::{Transaction, TransactionId};
use crate::error::{FrpError, Result};
use crate::graph::{NodeId, NodeKind};

/// A function carried inside a behavior, for [`Behavior::apply`].
pub type Lambda<A, B> = Arc<dyn Fn(A) -> B + Send + Sync>;

/// Supplies the current value of a continuous behavior on demand.
///
/// Implemented for any `Fn() -> T`. A source is read each time the behavior
/// is sampled and never fires updates.
pub trait ValueSource<T>: Send + Sync {
    fn get(&self) -> T;
}

impl<T, F> ValueSource<T> for F
where
    F: Fn() -> T + Send + Sync,
{
    fn get(&self) -> T {
        self()
    }
}

type LazyInit<T> = Arc<dyn Fn() -> Result<T> + Send + Sync>;

pub(crate) enum CellValue<T> {
    Ready(T),
    Lazy(LazyInit<T>),
}

impl<T> CellValue<T> {
    pub(crate) fn lazy<F>(init: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        CellValue::Lazy(Arc::new(init))
    }
}

struct CellState<T> {
    value: CellValue<T>,
    pending: Option<(TransactionId, T)>,
}

pub(crate) struct CellNode<T: Value> {
    state: Mutex<CellState<T>>,
}

impl<T: Value> CellNode<T> {
    fn new(value: CellValue<T>) -> Self {
        Self {
            state: Mutex::new(CellState {
                value,
                pending: None,
            }),
        }
    }

    /// The committed value, forcing a lazy initial value if needed.
    fn current(&self) -> Result<T> {
        let init = {
            let state = self.state.lock();
            match &state.value {
                CellValue::Ready(value) => return Ok(value.clone()),
                CellValue::Lazy(init) => Arc::clone(init),
            }
        };

        // The initializer may read other cells; run it unlocked.
        let value = init()?;
        let previous = {
            let mut state = self.state.lock();
            if let CellValue::Ready(committed) = &state.value {
                return Ok(committed.clone());
            }
            mem::replace(&mut state.value, CellValue::Ready(value.clone()))
        };
        drop(previous);
        Ok(value)
    }

    /// This transaction's pending update if there is one, else the
    /// committed value.
    fn new_value(&self, tx: &Transaction) -> Result<T> {
        {
            let state = self.state.lock();
            if let Some((id, value)) = &state.pending {
                if *id == tx.id() {
                    return Ok(value.clone());
                }
            }
        }
        self.current()
    }

    fn set_pending(self: &Arc<Self>, tx: &Transaction, value: T) {
        let (first, previous) = {
            let mut state = self.state.lock();
            let first = !matches!(&state.pending, Some((id, _)) if *id == tx.id());
            let previous = state.pending.replace((tx.id(), value));
            (first, previous)
        };
        drop(previous);

        if first {
            let cell = Arc::clone(self);
            let tx_id = tx.id();
            tx.last(move |_| cell.commit(tx_id));
        }
    }

    fn commit(&self, tx_id: TransactionId) {
        let previous = {
            let mut state = self.state.lock();
            match state.pending.take() {
                Some((id, value)) if id == tx_id => {
                    Some(mem::replace(&mut state.value, CellValue::Ready(value)))
                }
                other => {
                    state.pending = other;
                    None
                }
            }
        };
        drop(previous);
    }
}

enum Backing<T: Value> {
    Cell(Arc<CellNode<T>>),
    Constant(T),
    Continuous(Arc<dyn ValueSource<T>>),
    Loop(Arc<LoopSlot<T>>),
}

impl<T: Value> Clone for Backing<T> {
    fn clone(&self) -> Self {
        match self {
            Backing::Cell(cell) => Backing::Cell(Arc::clone(cell)),
            Backing::Constant(value) => Backing::Constant(value.clone()),
            Backing::Continuous(source) => Backing::Continuous(Arc::clone(source)),
            Backing::Loop(slot) => Backing::Loop(Arc::clone(slot)),
        }
    }
}

/// A behavior reference that does not keep a cell alive. Behaviors with no
/// cell cannot feed back into anything, so they are held as they are.
pub(crate) enum WeakBehavior<T: Value> {
    Cell {
        cell: Weak<CellNode<T>>,
        updates: Weak<PublisherInner<T>>,
    },
    Other(Behavior<T>),
}

impl<T: Value> WeakBehavior<T> {
    pub(crate) fn upgrade(&self) -> Option<Behavior<T>> {
        match self {
            WeakBehavior::Cell { cell, updates } => Some(Behavior {
                backing: Backing::Cell(cell.upgrade()?),
                updates: Event::from_node(updates.upgrade()?),
            }),
            WeakBehavior::Other(behavior) => Some(behavior.clone()),
        }
    }
}

/// A value that changes over time.
pub struct Behavior<T: Value> {
    backing: Backing<T>,
    updates: Event<T>,
}

impl<T: Value> Clone for Behavior<T> {
    fn clone(&self) -> Self {
        Self {
            backing: self.backing.clone(),
            updates: self.updates.clone(),
        }
    }
}

impl<T: Value> fmt::Debug for Behavior<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backing = match &self.backing {
            Backing::Cell(_) => "cell",
            Backing::Constant(_) => "constant",
            Backing::Continuous(_) => "continuous",
            Backing::Loop(_) => "loop",
        };
        f.debug_struct("Behavior")
            .field("id", &self.id())
            .field("backing", &backing)
            .finish()
    }
}

impl<T: Value> Behavior<T> {
    /// A behavior that always has `value`.
    pub fn constant(runtime: &Runtime, value: T) -> Self {
        Self {
            backing: Backing::Constant(value),
            updates: Event::never(runtime),
        }
    }

    /// A continuous behavior read from `source` on every sample.
    pub fn from_source(runtime: &Runtime, source: impl ValueSource<T> + 'static) -> Self {
        Self {
            backing: Backing::Continuous(Arc::new(source)),
            updates: Event::never(runtime),
        }
    }

    pub(crate) fn from_loop(slot: Arc<LoopSlot<T>>, updates: Event<T>) -> Self {
        Self {
            backing: Backing::Loop(slot),
            updates,
        }
    }

    /// Hold the latest occurrence of `source`, starting from `initial`.
    pub(crate) fn hold_with(source: &Event<T>, initial: CellValue<T>) -> Self {
        let runtime = source.runtime().clone();
        let cell = Arc::new(CellNode::new(initial));
        let updates = PublisherInner::new(&runtime, NodeKind::Cell);

        let weak_cell = Arc::downgrade(&cell);
        runtime.run(|tx| {
            source.attach(&updates, tx, updates.rank().clone(), move |out, tx, value: T| {
                if let Some(cell) = weak_cell.upgrade() {
                    cell.set_pending(tx, value.clone());
                }
                out.publish(tx, value);
            })
        });
        updates.keep_alive(Arc::clone(&cell));

        Self {
            backing: Backing::Cell(cell),
            updates: Event::from_node(updates),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakBehavior<T> {
        match &self.backing {
            Backing::Cell(cell) => WeakBehavior::Cell {
                cell: Arc::downgrade(cell),
                updates: Arc::downgrade(self.updates.node()),
            },
            _ => WeakBehavior::Other(self.clone()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.updates.id()
    }

    pub fn runtime(&self) -> &Runtime {
        self.updates.runtime()
    }

    /// The value as of the last settled transaction.
    ///
    /// # Panics
    ///
    /// If [`Behavior::try_sample`] fails: the behavior reads an unbound loop,
    /// was disposed, or the propagation lock timed out.
    pub fn sample(&self) -> T {
        match self.try_sample() {
            Ok(value) => value,
            Err(err) => panic!("cannot sample behavior {}: {err}", self.id()),
        }
    }

    pub fn try_sample(&self) -> Result<T> {
        self.runtime().try_locked(|| self.current())?
    }

    /// Committed value; the caller holds the propagation lock or does not
    /// need one.
    pub(crate) fn current(&self) -> Result<T> {
        match &self.backing {
            Backing::Cell(cell) => {
                if self.updates.is_disposed() {
                    return Err(FrpError::Disposed { node: self.id() });
                }
                cell.current()
            }
            Backing::Constant(value) => Ok(value.clone()),
            Backing::Continuous(source) => Ok(source.get()),
            Backing::Loop(slot) => slot.target()?.current(),
        }
    }

    /// The value including this transaction's pending update.
    pub(crate) fn new_value(&self, tx: &Transaction) -> Result<T> {
        match &self.backing {
            Backing::Cell(cell) => cell.new_value(tx),
            Backing::Loop(slot) => slot.target()?.new_value(tx),
            _ => self.current(),
        }
    }

    /// Occurrences of each change, without the current value.
    pub fn updates(&self) -> Event<T> {
        self.updates.clone()
    }

    /// The current value to each new subscriber, then every change.
    ///
    /// A subscriber added in the middle of a transaction that changes the
    /// behavior receives the new value exactly once. If the value reads a
    /// loop placeholder that is not bound yet, the subscriber receives it in
    /// the transaction that binds the placeholder.
    pub fn values(&self) -> Event<T> {
        let this = self.clone();
        let out = PublisherInner::with_replay(self.runtime(), NodeKind::Derived, move |tx, sub| {
            replay_value(this.clone(), tx, sub);
        });
        self.runtime().run(|tx| {
            self.updates
                .attach(&out, tx, out.rank().clone(), |out, tx, value| out.publish(tx, value))
        });
        Event::from_node(out)
    }

    /// Call `f` with the current value and then with every change.
    pub fn listen<F>(&self, f: F) -> Listener
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.values().listen(f)
    }

    pub fn map<U, F>(&self, f: F) -> Behavior<U>
    where
        U: Value,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        if let Backing::Continuous(source) = &self.backing {
            let source = Arc::clone(source);
            return Behavior::from_source(self.runtime(), move || f(source.get()));
        }

        let f = Arc::new(f);
        let initial = {
            let this = self.clone();
            let f = Arc::clone(&f);
            CellValue::lazy(move || this.current().map(|value| f(value)))
        };
        Behavior::hold_with(&self.updates.map(move |value| f(value)), initial)
    }

    /// Combine with another behavior. `f` runs once per transaction in
    /// which either operand changes, seeing both new values.
    pub fn lift2<B, U, F>(&self, other: &Behavior<B>, f: F) -> Behavior<U>
    where
        B: Value,
        U: Value,
        F: Fn(T, B) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let initial = {
            let (a, b, f) = (self.clone(), other.clone(), Arc::clone(&f));
            CellValue::lazy(move || Ok(f(a.current()?, b.current()?)))
        };
        let (a, b) = (self.clone(), other.clone());
        recompute_on(
            self.runtime(),
            &[self.updates.unit(), other.updates.unit()],
            initial,
            move |tx| Ok(f(a.new_value(tx)?, b.new_value(tx)?)),
        )
    }

    pub fn lift3<B, C, U, F>(&self, b: &Behavior<B>, c: &Behavior<C>, f: F) -> Behavior<U>
    where
        B: Value,
        C: Value,
        U: Value,
        F: Fn(T, B, C) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let initial = {
            let (a, b, c, f) = (self.clone(), b.clone(), c.clone(), Arc::clone(&f));
            CellValue::lazy(move || Ok(f(a.current()?, b.current()?, c.current()?)))
        };
        let triggers = [self.updates.unit(), b.updates.unit(), c.updates.unit()];
        let (a, b, c) = (self.clone(), b.clone(), c.clone());
        recompute_on(self.runtime(), &triggers, initial, move |tx| {
            Ok(f(a.new_value(tx)?, b.new_value(tx)?, c.new_value(tx)?))
        })
    }

    /// Apply a behavior of functions to this behavior.
    pub fn apply<U: Value>(&self, functions: &Behavior<Lambda<T, U>>) -> Behavior<U> {
        functions.lift2(self, |f, value| f(value))
    }

    /// Stateful map over the value: `f(value, state)` yields the output and
    /// the state carried to the next change.
    pub fn collect<U, S, F>(&self, initial: S, f: F) -> Behavior<U>
    where
        U: Value,
        S: Value,
        F: Fn(T, S) -> (U, S) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        // Both cells start from one evaluation of `f`, made by whichever is
        // read first.
        let seeded: Arc<Mutex<Option<(U, S)>>> = Arc::default();
        let seed = {
            let (this, f) = (self.clone(), Arc::clone(&f));
            move || -> Result<(U, S)> {
                if let Some(pair) = seeded.lock().clone() {
                    return Ok(pair);
                }
                let pair = f(this.current()?, initial.clone());
                *seeded.lock() = Some(pair.clone());
                Ok(pair)
            }
        };
        let seed = Arc::new(seed);

        let state = BehaviorLoop::<S>::internal(self.runtime());
        let pairs = self.updates.snapshot(&state.behavior(), move |value, s| f(value, s));

        let carried = {
            let seed = Arc::clone(&seed);
            Behavior::hold_with(
                &pairs.map(|(_, s)| s),
                CellValue::lazy(move || seed().map(|(_, s)| s)),
            )
        };
        if let Err(err) = state.bind(&carried) {
            unreachable!("fresh loop placeholder rejected bind: {err}");
        }

        let out = Behavior::hold_with(
            &pairs.map(|(u, _)| u),
            CellValue::lazy(move || seed().map(|(u, _)| u)),
        );
        out.updates.node().keep_alive(carried);
        out
    }

    /// Detach this behavior's update stream. Idempotent.
    pub fn dispose(&self) {
        self.updates.dispose();
    }
}

/// Queue a replay of `behavior`'s value to `sub`, or park it on the loop
/// placeholder the value is waiting for.
fn replay_value<T: Value>(behavior: Behavior<T>, tx: &Transaction, sub: &Arc<SubscriptionInner<T>>) {
    let retry = Arc::clone(sub);
    sub.replay(tx, move |tx| match behavior.new_value(tx) {
        Ok(value) => Ok(Some(value)),
        Err(FrpError::UnboundLoop { node }) => {
            let runtime = behavior.runtime().clone();
            let parked: Deferred = Box::new(move |tx| replay_value(behavior, tx, &retry));
            match runtime.defer_until_bound(node, parked) {
                Ok(()) => Ok(None),
                Err(_) => Err(FrpError::UnboundLoop { node }),
            }
        }
        Err(err) => Err(err),
    });
}

/// A behavior recomputed by `compute` once per transaction in which any
/// trigger fires.
fn recompute_on<U, C>(runtime: &Runtime, triggers: &[Event<()>], initial: CellValue<U>, compute: C) -> Behavior<U>
where
    U: Value,
    C: Fn(&Transaction) -> Result<U> + Send + Sync + 'static,
{
    let trigger = merge_all(runtime, triggers).coalesce(|_, _| ());
    let values = trigger.derive(move |out, tx, ()| match compute(tx) {
        Ok(value) => out.publish(tx, value),
        Err(err) => tx.record_failure(err.to_string()),
    });
    Behavior::hold_with(&values, initial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{BehaviorSink, EventSink};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collect<T: Value>(event: &Event<T>) -> (Arc<Mutex<Vec<T>>>, Listener) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = event.listen(move |value| sink.lock().push(value));
        (seen, listener)
    }

    #[test]
    fn hold_commits_at_end_of_transaction() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let held = sink.event().hold(0);

        let observed = rt
            .transaction(|tx| {
                sink.send_in(tx, 5);
                held.current().unwrap()
            })
            .unwrap();
        assert_eq!(observed, 0);
        assert_eq!(held.sample(), 5);
    }

    #[test]
    fn last_update_in_a_transaction_wins() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let held = sink.event().hold(0);
        let (updates, _l) = collect(&held.updates());

        rt.transaction(|tx| {
            sink.send_in(tx, 1);
            sink.send_in(tx, 2);
        })
        .unwrap();
        assert_eq!(held.sample(), 2);
        assert_eq!(*updates.lock(), vec![1, 2]);
    }

    #[test]
    fn values_replays_current_then_updates() {
        let rt = Runtime::new();
        let b = BehaviorSink::new(&rt, 1);
        let (seen, _l) = collect(&b.behavior().values());

        b.send(2).unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn values_subscribed_mid_update_sees_new_value_once() {
        let rt = Runtime::new();
        let b = BehaviorSink::new(&rt, 1);
        let values = b.behavior().values();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let record = seen.clone();
        let listener = rt
            .transaction(|tx| {
                b.send_in(tx, 7);
                values.listen(move |n| record.lock().push(n))
            })
            .unwrap();
        assert_eq!(*seen.lock(), vec![7]);
        drop(listener);
    }

    #[test]
    fn map_tracks_source() {
        let rt = Runtime::new();
        let b = BehaviorSink::new(&rt, 2);
        let doubled = b.behavior().map(|n| n * 2);
        assert_eq!(doubled.sample(), 4);

        b.send(5).unwrap();
        assert_eq!(doubled.sample(), 10);
    }

    #[test]
    fn lift_evaluates_once_per_transaction() {
        let rt = Runtime::new();
        let a = BehaviorSink::new(&rt, 1);
        let b = BehaviorSink::new(&rt, 10);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let sum = a.behavior().lift2(&b.behavior(), move |x, y| {
            counter.fetch_add(1, Ordering::SeqCst);
            x + y
        });
        let (seen, _l) = collect(&sum.updates());

        rt.transaction(|tx| {
            a.send_in(tx, 2);
            b.send_in(tx, 20);
        })
        .unwrap();

        assert_eq!(*seen.lock(), vec![22]);
        assert_eq!(sum.sample(), 22);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lift3_and_apply() {
        let rt = Runtime::new();
        let a = BehaviorSink::new(&rt, 1);
        let b = Behavior::constant(&rt, 2);
        let c = Behavior::constant(&rt, 3);
        let total = a.behavior().lift3(&b, &c, |x, y, z| x * 100 + y * 10 + z);
        assert_eq!(total.sample(), 123);

        let f: Lambda<i32, String> = Arc::new(|n: i32| format!("<{n}>"));
        let functions = BehaviorSink::new(&rt, f);
        let applied = a.behavior().apply(&functions.behavior());
        assert_eq!(applied.sample(), "<1>");

        a.send(4).unwrap();
        assert_eq!(total.sample(), 423);
        assert_eq!(applied.sample(), "<4>");

        let bracketed: Lambda<i32, String> = Arc::new(|n: i32| format!("[{n}]"));
        functions.send(bracketed).unwrap();
        assert_eq!(applied.sample(), "[4]");
    }

    #[test]
    fn behavior_collect_carries_state() {
        let rt = Runtime::new();
        let b = BehaviorSink::new(&rt, 1);
        let running = b.behavior().collect(0, |value, total| {
            let total = total + value;
            (format!("{value}/{total}"), total)
        });
        assert_eq!(running.sample(), "1/1");

        b.send(2).unwrap();
        b.send(3).unwrap();
        assert_eq!(running.sample(), "3/6");
    }

    #[test]
    fn behavior_collect_seeds_once() {
        let rt = Runtime::new();
        let b = BehaviorSink::new(&rt, 3);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let tagged = b.behavior().collect(0, move |n: i32, count: i32| {
            counter.fetch_add(1, Ordering::SeqCst);
            (n * 10 + count, count + 1)
        });
        assert_eq!(tagged.sample(), 30);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        b.send(4).unwrap();
        assert_eq!(tagged.sample(), 41);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropped_collect_releases_source() {
        let rt = Runtime::new();
        let b = BehaviorSink::new(&rt, 1);
        let updates = b.behavior().updates();

        let running = b.behavior().collect(0, |n, s| (n + s, s + 1));
        assert_eq!(updates.subscriber_count(), 1);
        drop(running);
        assert_eq!(updates.subscriber_count(), 0);
    }

    #[test]
    fn continuous_source_is_read_on_sample() {
        let rt = Runtime::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let source = ticks.clone();
        let b = Behavior::from_source(&rt, move || source.fetch_add(1, Ordering::SeqCst));
        let labelled = b.map(|n| format!("tick {n}"));

        assert_eq!(b.sample(), 0);
        assert_eq!(b.sample(), 1);
        assert_eq!(labelled.sample(), "tick 2");
    }

    #[test]
    fn disposed_cell_cannot_be_sampled() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let held = sink.event().hold(3);
        held.dispose();
        held.dispose();
        assert!(matches!(held.try_sample(), Err(FrpError::Disposed { .. })));
    }
}

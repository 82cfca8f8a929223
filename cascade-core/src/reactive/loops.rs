//! Forward references
//!
//! Cyclic networks (an accumulator that reads its own state, a counter fed
//! back into its input) are built by declaring a placeholder first, using it
//! as an ordinary event or behavior, and binding it to its real source once
//! that source exists.
//!
//! A placeholder accepts subscriptions while unbound. Binding subscribes the
//! placeholder to its source at the placeholder's own rank, which raises the
//! rank of everything already downstream of it. A runtime refuses external
//! input while any live placeholder in it is still unbound.
//!
//! A subscriber that asks for the current value of something that reads an
//! unbound behavior placeholder gets that value in the transaction that binds
//! it.
//!
//! A behavior placeholder refers to its target weakly. The target belongs to
//! whoever built it, usually the output of the cycle, so dropping that output
//! releases the whole cycle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use super::behavior::{Behavior, WeakBehavior};
use super::event::Event;
use super::publisher::{PublisherInner, Value};
use super::runtime::Runtime;
use super::transaction::Transaction;
use crate::error::{FrpError, Result};
use crate::graph::{NodeId, NodeKind};

/// Registry entry for a placeholder. The runtime only holds it weakly, so a
/// placeholder that is dropped without being bound stops blocking input.
pub(crate) struct LoopMarker {
    node: NodeId,
    bound: AtomicBool,
}

impl LoopMarker {
    pub(crate) fn new(node: NodeId) -> Self {
        Self {
            node,
            bound: AtomicBool::new(false),
        }
    }

    pub(crate) fn node(&self) -> NodeId {
        self.node
    }

    fn is_bound(&self) -> bool {
        self.bound.load(Ordering::SeqCst)
    }

    /// Claim the single bind. Fails for every call after the first.
    fn claim(&self) -> Result<()> {
        if self.bound.swap(true, Ordering::SeqCst) {
            return Err(FrpError::LoopAlreadyBound { node: self.node });
        }
        Ok(())
    }
}

/// A forward-declared event.
///
/// ```ignore
/// let ticks = EventLoop::<i32>::new(&rt);
/// let doubled = ticks.event().map(|n| n * 2);
/// ticks.bind(&input.event())?;
/// ```
pub struct EventLoop<T: Value> {
    out: Arc<PublisherInner<T>>,
    marker: Arc<LoopMarker>,
}

impl<T: Value> EventLoop<T> {
    pub fn new(runtime: &Runtime) -> Self {
        let looped = Self::internal(runtime);
        runtime.register_loop(&looped.marker);
        tracing::debug!(node = %looped.out.id(), "event loop declared");
        looped
    }

    /// A placeholder the runtime does not track. For cycles an operator
    /// builds and binds itself before returning.
    pub(crate) fn internal(runtime: &Runtime) -> Self {
        let out = PublisherInner::new(runtime, NodeKind::Loop);
        let marker = Arc::new(LoopMarker::new(out.id()));
        Self { out, marker }
    }

    /// The placeholder event. Usable before [`EventLoop::bind`].
    pub fn event(&self) -> Event<T> {
        Event::from_node(Arc::clone(&self.out))
    }

    pub fn is_bound(&self) -> bool {
        self.marker.is_bound()
    }

    /// Make the placeholder fire whenever `source` fires.
    ///
    /// # Errors
    ///
    /// [`FrpError::LoopAlreadyBound`] if this placeholder was bound before.
    pub fn bind(&self, source: &Event<T>) -> Result<()> {
        self.connect(source, true)
    }

    /// Bind without keeping `source` alive.
    fn bind_weak(&self, source: &Event<T>) -> Result<()> {
        self.connect(source, false)
    }

    fn connect(&self, source: &Event<T>, retain: bool) -> Result<()> {
        self.marker.claim()?;
        let runtime = self.out.runtime().clone();
        runtime.run(|tx| {
            let rank = self.out.rank().clone();
            let forward = |out: &Arc<PublisherInner<T>>, tx: &Transaction, value: T| out.publish(tx, value);
            if retain {
                source.attach(&self.out, tx, rank, forward);
            } else {
                source.link(&self.out, tx, rank, forward);
            }
            for deferred in runtime.loop_bound(self.marker.node()) {
                deferred(tx);
            }
        });
        tracing::debug!(node = %self.marker.node(), source = %source.id(), "event loop bound");
        Ok(())
    }
}

impl<T: Value> Clone for EventLoop<T> {
    fn clone(&self) -> Self {
        Self {
            out: Arc::clone(&self.out),
            marker: Arc::clone(&self.marker),
        }
    }
}

impl<T: Value> fmt::Debug for EventLoop<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("node", &self.marker.node())
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// Target of a behavior placeholder, set once by [`BehaviorLoop::bind`].
pub(crate) struct LoopSlot<T: Value> {
    node: NodeId,
    target: OnceLock<WeakBehavior<T>>,
}

impl<T: Value> LoopSlot<T> {
    /// The bound target. Fails while unbound, and with
    /// [`FrpError::Disposed`] once the target has been dropped.
    pub(crate) fn target(&self) -> Result<Behavior<T>> {
        let target = self
            .target
            .get()
            .ok_or(FrpError::UnboundLoop { node: self.node })?;
        target
            .upgrade()
            .ok_or(FrpError::Disposed { node: self.node })
    }
}

/// A forward-declared behavior.
///
/// Sampling the placeholder before it is bound fails with
/// [`FrpError::UnboundLoop`]. Once bound it reads and updates exactly like
/// its target.
pub struct BehaviorLoop<T: Value> {
    slot: Arc<LoopSlot<T>>,
    updates: EventLoop<T>,
}

impl<T: Value> BehaviorLoop<T> {
    pub fn new(runtime: &Runtime) -> Self {
        Self::with_updates(EventLoop::new(runtime))
    }

    /// See [`EventLoop::internal`].
    pub(crate) fn internal(runtime: &Runtime) -> Self {
        Self::with_updates(EventLoop::internal(runtime))
    }

    fn with_updates(updates: EventLoop<T>) -> Self {
        let slot = Arc::new(LoopSlot {
            node: updates.marker.node(),
            target: OnceLock::new(),
        });
        Self { slot, updates }
    }

    /// The placeholder behavior. Usable before [`BehaviorLoop::bind`].
    pub fn behavior(&self) -> Behavior<T> {
        Behavior::from_loop(Arc::clone(&self.slot), self.updates.event())
    }

    pub fn is_bound(&self) -> bool {
        self.slot.target.get().is_some()
    }

    /// Make the placeholder read and update as `target`.
    ///
    /// The placeholder does not keep `target` alive. Once the target is
    /// dropped, sampling the placeholder fails with [`FrpError::Disposed`].
    pub fn bind(&self, target: &Behavior<T>) -> Result<()> {
        if self.slot.target.set(target.downgrade()).is_err() {
            return Err(FrpError::LoopAlreadyBound {
                node: self.slot.node,
            });
        }
        self.updates.bind_weak(&target.updates())
    }
}

impl<T: Value> Clone for BehaviorLoop<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            updates: self.updates.clone(),
        }
    }
}

impl<T: Value> fmt::Debug for BehaviorLoop<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviorLoop")
            .field("node", &self.slot.node)
            .field("bound", &self.is_bound())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{BehaviorSink, EventSink, Listener};
    use parking_lot::Mutex;

    fn collect<T: Value>(event: &Event<T>) -> (Arc<Mutex<Vec<T>>>, Listener) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = event.listen(move |value| sink.lock().push(value));
        (seen, listener)
    }

    #[test]
    fn unbound_event_loop_blocks_input() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let lp = EventLoop::<i32>::new(&rt);

        let err = sink.send(1).unwrap_err();
        assert!(matches!(err, FrpError::UnboundLoop { node } if node == lp.event().id()));

        lp.bind(&sink.event()).unwrap();
        assert!(sink.send(1).is_ok());
    }

    #[test]
    fn dropped_placeholder_stops_blocking() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let lp = EventLoop::<i32>::new(&rt);
        drop(lp);
        assert!(sink.send(1).is_ok());
    }

    #[test]
    fn subscribers_before_bind_receive_values() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let lp = EventLoop::<i32>::new(&rt);
        let (seen, _l) = collect(&lp.event().map(|n| n + 1));

        lp.bind(&sink.event()).unwrap();
        sink.send(1).unwrap();
        sink.send(2).unwrap();
        assert_eq!(*seen.lock(), vec![2, 3]);
    }

    #[test]
    fn event_loop_binds_once() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let lp = EventLoop::<i32>::new(&rt);
        lp.bind(&sink.event()).unwrap();
        assert!(lp.is_bound());
        assert!(matches!(
            lp.bind(&sink.event()),
            Err(FrpError::LoopAlreadyBound { .. })
        ));
    }

    #[test]
    fn listening_before_bind_gets_value_on_bind() {
        let rt = Runtime::new();
        let source = BehaviorSink::new(&rt, 5);
        let lp = BehaviorLoop::<i32>::new(&rt);
        let (seen, _l) = collect(&lp.behavior().map(|n| n + 1).values());
        let (direct, _l2) = collect(&lp.behavior().values());
        assert!(seen.lock().is_empty());

        lp.bind(&source.behavior()).unwrap();
        assert_eq!(*seen.lock(), vec![6]);
        assert_eq!(*direct.lock(), vec![5]);

        source.send(7).unwrap();
        assert_eq!(*seen.lock(), vec![6, 8]);
        assert_eq!(*direct.lock(), vec![5, 7]);
    }

    #[test]
    fn dropped_target_reads_as_disposed() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let lp = BehaviorLoop::<i32>::new(&rt);
        let held = sink.event().hold(3);
        lp.bind(&held).unwrap();
        assert_eq!(lp.behavior().sample(), 3);

        drop(held);
        assert!(matches!(
            lp.behavior().try_sample(),
            Err(FrpError::Disposed { .. })
        ));
    }

    #[test]
    fn internal_placeholders_do_not_block_input() {
        let rt = Runtime::new();
        let sink = EventSink::<i32>::new(&rt);
        let state = BehaviorLoop::<i32>::internal(&rt);
        assert!(sink.send(1).is_ok());
        assert!(!state.is_bound());
    }

    #[test]
    fn unbound_behavior_loop_cannot_be_sampled() {
        let rt = Runtime::new();
        let lp = BehaviorLoop::<i32>::new(&rt);
        let placeholder = lp.behavior();
        assert!(matches!(
            placeholder.try_sample(),
            Err(FrpError::UnboundLoop { .. })
        ));

        let target = Behavior::constant(&rt, 4);
        lp.bind(&target).unwrap();
        assert_eq!(placeholder.sample(), 4);
        assert!(matches!(
            lp.bind(&target),
            Err(FrpError::LoopAlreadyBound { .. })
        ));
    }
}

//! Switch
//!
//! Flattening a behavior whose value is itself a behavior or an event. The
//! switch node keeps a slot holding its subscription to the currently
//! selected inner source and swaps it whenever the outer behavior changes.
//!
//! - `Behavior<Behavior<T>>` swaps immediately, during the prioritized
//!   phase, and emits the newly selected behavior's value in the switching
//!   transaction. If both the old and new inner fire in that transaction,
//!   only the last firing reaches the output.
//! - `Behavior<Event<T>>` swaps in the `Last` phase. Occurrences in the
//!   switching transaction still come from the previously selected event;
//!   the new one takes over from the next transaction.

use std::sync::Arc;

use parking_lot::Mutex;

use super::behavior::{Behavior, CellValue};
use super::event::{gather_and_flush, Event, Gathered};
use super::publisher::{PublisherInner, Value};
use super::subscriber::{Disposable, Subscription};
use crate::graph::{NodeKind, Rank};

/// The current inner subscription and the event it listens to.
///
/// The subscription is declared first so it is cancelled before the event
/// handle is released.
type Selected<T> = Option<(Subscription<T>, Event<T>)>;

struct InnerSlot<T: Value>(Arc<Mutex<Selected<T>>>);

impl<T: Value> InnerSlot<T> {
    fn replace(&self, next: (Subscription<T>, Event<T>)) {
        let previous = self.0.lock().replace(next);
        drop(previous);
    }
}

impl<T: Value> Clone for InnerSlot<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Value> Disposable for InnerSlot<T> {
    fn dispose(&self) {
        let previous = self.0.lock().take();
        drop(previous);
    }

    fn is_active(&self) -> bool {
        self.0.lock().is_some()
    }
}

impl<T: Value> Behavior<Behavior<T>> {
    /// Track whichever behavior the outer behavior currently holds.
    pub fn switch_behavior(&self) -> Behavior<T> {
        let runtime = self.runtime().clone();
        let out = PublisherInner::new(&runtime, NodeKind::Switch);
        let gather = Rank::new();
        let latest: Gathered<T> = Arc::default();
        let slot = InnerSlot(Arc::default());
        let outer = self.values();

        runtime.run(|tx| {
            if gather.add_superior(out.rank()) {
                tx.mark_resort();
            }
            let slot = slot.clone();
            let gather_rank = gather.clone();
            outer.attach(&out, tx, gather.clone(), move |out, tx, inner: Behavior<T>| {
                let values = inner.values();
                let weak = Arc::downgrade(out);
                let latest = Arc::clone(&latest);
                let subscription = values.node().subscribe(tx, gather_rank.clone(), move |tx, value| {
                    if let Some(out) = weak.upgrade() {
                        gather_and_flush(&out, &latest, tx, value, |_, newer| newer);
                    }
                });
                tracing::debug!(node = %out.id(), inner = %inner.id(), "switched behavior");
                slot.replace((subscription, values));
            });
        });
        out.own(slot);

        let this = self.clone();
        Behavior::hold_with(
            &Event::from_node(out),
            CellValue::lazy(move || this.current()?.current()),
        )
    }
}

impl<T: Value> Behavior<Event<T>> {
    /// Fire with whichever event the outer behavior currently holds.
    pub fn switch_event(&self) -> Event<T> {
        let runtime = self.runtime().clone();
        let out = PublisherInner::new(&runtime, NodeKind::Switch);
        let slot = InnerSlot(Arc::default());
        let outer = self.values();

        runtime.run(|tx| {
            let slot = slot.clone();
            outer.attach(&out, tx, out.rank().clone(), move |out, tx, inner: Event<T>| {
                let weak = Arc::downgrade(out);
                let slot = slot.clone();
                tx.last(move |tx| {
                    let Some(out) = weak.upgrade() else {
                        return;
                    };
                    let forward = Arc::downgrade(&out);
                    let subscription = inner.node().subscribe(tx, out.rank().clone(), move |tx, value| {
                        if let Some(out) = forward.upgrade() {
                            out.publish(tx, value);
                        }
                    });
                    tracing::debug!(node = %out.id(), inner = %inner.id(), "switched event");
                    slot.replace((subscription, inner));
                });
            });
        });
        out.own(slot);
        Event::from_node(out)
    }
}

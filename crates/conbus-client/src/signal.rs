//! Typed signals.
//!
//! One strongly-typed [`Signal`] per event class, owned by its emitter;
//! there is no global registry. Subscribers live in a vector and emission
//! calls them in connect order. Everything here is single-threaded: the
//! engine, its services and every handler run on one cooperative loop, so
//! no handler can observe a signal mid-emission from another thread.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Identifies one connected handler so it can be disconnected later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(u64);

type Slot<T> = (SlotId, Rc<dyn Fn(&T)>);

/// A typed signal with a vector of subscribers.
pub struct Signal<T> {
    slots: RefCell<Vec<Slot<T>>>,
    next_id: Cell<u64>,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Signal<T> {
    /// Create a signal with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self { slots: RefCell::new(Vec::new()), next_id: Cell::new(0) }
    }

    /// Connect a handler; returns its slot id.
    pub fn connect(&self, handler: impl Fn(&T) + 'static) -> SlotId {
        let id = SlotId(self.next_id.get());
        self.next_id.set(self.next_id.get() + 1);
        self.slots.borrow_mut().push((id, Rc::new(handler)));
        id
    }

    /// Disconnect a handler. Returns false if it was already gone.
    pub fn disconnect(&self, id: SlotId) -> bool {
        let mut slots = self.slots.borrow_mut();
        let before = slots.len();
        slots.retain(|(slot, _)| *slot != id);
        slots.len() != before
    }

    /// Disconnect every handler.
    pub fn clear(&self) {
        self.slots.borrow_mut().clear();
    }

    /// Number of connected handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    /// True when nothing is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }

    /// Call every handler with `value`, in connect order.
    ///
    /// The slot list is snapshotted first, so handlers may connect or
    /// disconnect (including themselves) during emission; such changes
    /// take effect from the next emission.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Rc<dyn Fn(&T)>> =
            self.slots.borrow().iter().map(|(_, handler)| Rc::clone(handler)).collect();
        for handler in snapshot {
            handler(value);
        }
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal").field("slots", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handlers_run_in_connect_order() {
        let signal = Signal::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let first = Rc::clone(&seen);
        signal.connect(move |v: &u32| first.borrow_mut().push(("first", *v)));
        let second = Rc::clone(&seen);
        signal.connect(move |v: &u32| second.borrow_mut().push(("second", *v)));

        signal.emit(&7);
        assert_eq!(*seen.borrow(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn disconnect_removes_only_that_slot() {
        let signal = Signal::new();
        let count = Rc::new(Cell::new(0));

        let keep = Rc::clone(&count);
        signal.connect(move |(): &()| keep.set(keep.get() + 1));
        let gone = Rc::clone(&count);
        let id = signal.connect(move |(): &()| gone.set(gone.get() + 100));

        assert!(signal.disconnect(id));
        assert!(!signal.disconnect(id));
        signal.emit(&());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn reentrant_disconnect_during_emission_is_safe() {
        let signal = Rc::new(Signal::new());
        let count = Rc::new(Cell::new(0));

        let id_cell = Rc::new(Cell::new(None));
        let inner_signal = Rc::clone(&signal);
        let inner_id = Rc::clone(&id_cell);
        let inner_count = Rc::clone(&count);
        let id = signal.connect(move |(): &()| {
            inner_count.set(inner_count.get() + 1);
            if let Some(id) = inner_id.get() {
                inner_signal.disconnect(id);
            }
        });
        id_cell.set(Some(id));

        signal.emit(&());
        signal.emit(&());
        assert_eq!(count.get(), 1, "handler removed itself after the first emission");
    }

    #[test]
    fn clear_disconnects_everything() {
        let signal: Signal<()> = Signal::new();
        signal.connect(|(): &()| {});
        signal.connect(|(): &()| {});
        assert_eq!(signal.len(), 2);
        signal.clear();
        assert!(signal.is_empty());
    }
}

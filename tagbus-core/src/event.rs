//! Pooled, recyclable events
//!
//! An [`Event`] is a cheap handle to a pooled cell holding the owning bus, a
//! tag and a [`Payload`]. The cell carries a usage count:
//!
//! - `0` after [`Event::acquire`]: the event may still be edited
//! - `> 0` while posted: tag and payload are frozen
//! - back to `0`: the cell is cleared and returned to the [`EventPool`]
//!
//! Usage is tracked with [`Delivery`] leases. The poster holds one lease while
//! the event sits in the delivery queue and every hand-off to a subscriber gets
//! its own; dropping a lease releases it, on whichever thread that happens.

use crate::bus::{DEFAULT_TAG, EventBus};
use crate::error::{BusError, Result};
use crate::payload::Payload;
use crate::pool::EventPool;
use parking_lot::RwLock;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::warn;

#[derive(Default)]
struct EventState {
    target: Option<EventBus>,
    tag: String,
    payload: Payload,
}

/// Storage behind an [`Event`] handle; this is what the pool recycles.
pub(crate) struct EventCell {
    state: RwLock<EventState>,
    in_use: AtomicUsize,
    recycled: AtomicBool,
}

impl EventCell {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(EventState::default()),
            in_use: AtomicUsize::new(0),
            recycled: AtomicBool::new(false),
        }
    }

    pub(crate) fn reset(&self) {
        *self.state.write() = EventState::default();
        self.in_use.store(0, Ordering::SeqCst);
        self.recycled.store(false, Ordering::SeqCst);
    }
}

/// A tagged event
#[derive(Clone)]
pub struct Event {
    cell: Arc<EventCell>,
}

impl Event {
    /// Obtain an event from the pool, or allocate a new one.
    ///
    /// The returned event is not recycled and has a usage count of zero.
    pub fn acquire(bus: &EventBus, tag: impl Into<String>, payload: impl Into<Payload>) -> Self {
        let cell = EventPool::global().take();
        {
            let mut state = cell.state.write();
            state.target = Some(bus.clone());
            state.tag = tag.into();
            state.payload = payload.into();
        }
        Self { cell }
    }

    /// Obtain an event under the default tag
    pub fn acquire_default(bus: &EventBus, payload: impl Into<Payload>) -> Self {
        Self::acquire(bus, DEFAULT_TAG, payload)
    }

    /// Obtain a fresh event with the same target, tag and payload as `orig`
    pub fn copy_of(orig: &Event) -> Self {
        let (target, tag, payload) = {
            let state = orig.cell.state.read();
            (state.target.clone(), state.tag.clone(), state.payload.clone())
        };

        let cell = EventPool::global().take();
        {
            let mut state = cell.state.write();
            state.target = target;
            state.tag = tag;
            state.payload = payload;
        }
        Self { cell }
    }

    /// The bus this event posts to
    pub fn target(&self) -> Option<EventBus> {
        self.cell.state.read().target.clone()
    }

    pub fn tag(&self) -> String {
        self.cell.state.read().tag.clone()
    }

    /// Change the tag. Fails while the event is in use or after recycling.
    pub fn set_tag(&self, tag: impl Into<String>) -> Result<()> {
        self.ensure_editable()?;
        self.cell.state.write().tag = tag.into();
        Ok(())
    }

    /// A snapshot of the payload (cheap: values are shared)
    pub fn payload(&self) -> Payload {
        self.cell.state.read().payload.clone()
    }

    /// Inspect the payload in place without cloning it
    pub fn with_payload<R>(&self, f: impl FnOnce(&Payload) -> R) -> R {
        f(&self.cell.state.read().payload)
    }

    pub fn payload_len(&self) -> usize {
        self.cell.state.read().payload.len()
    }

    /// Replace the payload. Fails while the event is in use or after recycling.
    pub fn set_payload(&self, payload: impl Into<Payload>) -> Result<()> {
        self.ensure_editable()?;
        self.cell.state.write().payload = payload.into();
        Ok(())
    }

    /// Current usage count
    pub fn usage(&self) -> usize {
        self.cell.in_use.load(Ordering::SeqCst)
    }

    pub fn is_in_use(&self) -> bool {
        self.usage() > 0
    }

    pub fn is_recycled(&self) -> bool {
        self.cell.recycled.load(Ordering::SeqCst)
    }

    /// Post this event to its own bus
    pub fn post(&self) -> Result<()> {
        let bus = self.target().ok_or(BusError::Detached)?;
        bus.post_event(self.clone())
    }

    /// Whether two handles point at the same pooled cell
    pub fn ptr_eq(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    fn ensure_editable(&self) -> Result<()> {
        if self.is_recycled() {
            return Err(BusError::EventRecycled);
        }
        if self.is_in_use() {
            return Err(BusError::EventInUse);
        }
        Ok(())
    }

    /// Take one usage and wrap it in a lease
    pub(crate) fn lease(&self) -> Delivery {
        self.cell.in_use.fetch_add(1, Ordering::SeqCst);
        Delivery {
            event: self.clone(),
        }
    }

    /// Give back one usage; the last release recycles the event.
    pub(crate) fn release(&self) -> Result<()> {
        if self.is_recycled() {
            return Err(BusError::EventRecycled);
        }

        let previous = self
            .cell
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_err(|_| BusError::EventRecycled)?;

        if previous == 1 {
            self.recycle();
        }
        Ok(())
    }

    fn recycle(&self) {
        if self.cell.recycled.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.cell.state.write() = EventState::default();
        EventPool::global().give(Arc::clone(&self.cell));
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.cell.state.read();
        f.debug_struct("Event")
            .field("target", &state.target)
            .field("tag", &state.tag)
            .field("payload", &state.payload)
            .field("recycled", &self.is_recycled())
            .field("in_use", &self.usage())
            .finish()
    }
}

/// One usage of an [`Event`], released when dropped.
///
/// Execution policies receive a `Delivery` per subscriber hand-off and must
/// keep it alive until the callback has run.
pub struct Delivery {
    event: Event,
}

impl Delivery {
    pub fn event(&self) -> &Event {
        &self.event
    }
}

impl Deref for Delivery {
    type Target = Event;

    fn deref(&self) -> &Event {
        &self.event
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Err(e) = self.event.release() {
            warn!("Failed to release event usage: {}", e);
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Delivery").field(&self.event).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> EventBus {
        EventBus::builder("event-tests").build()
    }

    #[test]
    fn test_acquire_is_fresh() {
        let bus = bus();
        let event = Event::acquire(&bus, "tag", (1_i32,));

        assert_eq!(event.tag(), "tag");
        assert_eq!(event.payload_len(), 1);
        assert_eq!(event.usage(), 0);
        assert!(!event.is_recycled());
        assert!(event.target().is_some());
    }

    #[test]
    fn test_in_use_event_is_frozen() {
        let bus = bus();
        let event = Event::acquire(&bus, "a", ());
        let lease = event.lease();

        assert!(matches!(event.set_tag("b"), Err(BusError::EventInUse)));
        assert!(matches!(event.set_payload((1_u8,)), Err(BusError::EventInUse)));
        assert_eq!(lease.tag(), "a");
    }

    #[test]
    fn test_idle_event_is_editable() {
        let bus = bus();
        let event = Event::acquire_default(&bus, ());

        event.set_tag("x").unwrap();
        event.set_payload((true, 2_u64)).unwrap();
        assert_eq!(event.tag(), "x");
        assert!(event.with_payload(|p| p.is::<u64>(1)));
    }

    #[test]
    fn test_last_release_recycles() {
        let bus = bus();
        let event = Event::acquire(&bus, "a", (String::from("data"),));

        let first = event.lease();
        let second = event.lease();
        assert_eq!(event.usage(), 2);

        drop(first);
        assert!(!event.is_recycled());

        drop(second);
        assert!(event.is_recycled());
        assert_eq!(event.usage(), 0);
        assert!(event.target().is_none());
        assert_eq!(event.tag(), "");
        assert_eq!(event.payload_len(), 0);
    }

    #[test]
    fn test_recycled_event_rejects_everything() {
        let bus = bus();
        let event = Event::acquire(&bus, "a", ());
        drop(event.lease());

        assert!(matches!(event.set_tag("b"), Err(BusError::EventRecycled)));
        assert!(matches!(event.release(), Err(BusError::EventRecycled)));
        assert!(matches!(event.post(), Err(BusError::Detached)));
    }

    #[test]
    fn test_release_without_use_fails() {
        let bus = bus();
        let event = Event::acquire(&bus, "a", ());
        assert!(event.release().is_err());
        assert!(!event.is_recycled());
    }

    #[test]
    fn test_copy_of_is_independent() {
        let bus = bus();
        let orig = Event::acquire(&bus, "orig", (5_i32,));
        let copy = Event::copy_of(&orig);

        assert!(!copy.ptr_eq(&orig));
        assert_eq!(copy.tag(), "orig");
        assert_eq!(copy.payload().get::<i32>(0), Some(&5));

        copy.set_tag("changed").unwrap();
        assert_eq!(orig.tag(), "orig");
    }
}

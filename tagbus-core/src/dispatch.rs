//! Thread-local delivery loop
//!
//! Each thread that posts to a bus gets its own delivery context for that
//! bus while it is delivering:
//!
//! ```text
//! post ─▶ enqueue ─▶ delivering? ── yes ─▶ return (outer loop picks it up)
//!                         │
//!                         no
//!                         ▼
//!           loop { pop ─▶ for each subscription: alive? accept? hand off }
//! ```
//!
//! Nested posts from a handler are queued, not recursed into, so stack depth
//! stays constant. Each queued entry keeps the lease taken at post time and the
//! subscription snapshot of its own tag. The context is removed when the
//! outermost loop exits, normally or on a handler error; events still queued
//! at that point are released without delivery.

use crate::bus::{EventBus, Subscription};
use crate::error::{BusError, Result};
use crate::event::Delivery;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, trace};

/// An event waiting in a delivery queue
pub(crate) struct Pending {
    delivery: Delivery,
    subscriptions: Arc<Vec<Subscription>>,
}

impl Pending {
    pub(crate) fn new(delivery: Delivery, subscriptions: Arc<Vec<Subscription>>) -> Self {
        Self {
            delivery,
            subscriptions,
        }
    }
}

#[derive(Default)]
struct DeliveryContext {
    queue: RefCell<VecDeque<Pending>>,
    canceled: Cell<bool>,
}

thread_local! {
    /// Active delivery contexts of this thread, keyed by bus id
    static CONTEXTS: RefCell<HashMap<u64, Rc<DeliveryContext>>> = RefCell::new(HashMap::new());
}

fn current(bus_id: u64) -> Option<Rc<DeliveryContext>> {
    CONTEXTS.with(|contexts| contexts.borrow().get(&bus_id).cloned())
}

/// Removes the context and releases whatever is left in its queue
struct ContextGuard {
    bus_id: u64,
    context: Rc<DeliveryContext>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let _ = CONTEXTS.try_with(|contexts| contexts.borrow_mut().remove(&self.bus_id));
        self.context.canceled.set(false);

        let leftover = std::mem::take(&mut *self.context.queue.borrow_mut());
        if !leftover.is_empty() {
            debug!(dropped = leftover.len(), "Discarding queued events after failed delivery");
        }
        drop(leftover);
    }
}

/// Queue `pending` on this thread and deliver, unless a delivery for the
/// same bus is already running further up the stack.
pub(crate) fn post(bus: &EventBus, pending: Pending) -> Result<()> {
    let bus_id = bus.id();

    if let Some(context) = current(bus_id) {
        let mut queue = context.queue.borrow_mut();
        let max = bus.config().max_queue_depth;
        if queue.len() >= max {
            return Err(BusError::QueueOverflow { depth: queue.len() });
        }
        queue.push_back(pending);
        if bus.config().debug {
            trace!(bus = %bus, queued = queue.len(), "Nested post queued");
        }
        return Ok(());
    }

    let context = Rc::new(DeliveryContext::default());
    context.queue.borrow_mut().push_back(pending);
    CONTEXTS.with(|contexts| contexts.borrow_mut().insert(bus_id, Rc::clone(&context)));
    let _guard = ContextGuard {
        bus_id,
        context: Rc::clone(&context),
    };

    loop {
        let next = context.queue.borrow_mut().pop_front();
        let Some(pending) = next else { break };
        context.canceled.set(false);
        deliver(bus, &context, pending)?;
    }
    Ok(())
}

fn deliver(bus: &EventBus, context: &DeliveryContext, pending: Pending) -> Result<()> {
    let Pending {
        delivery,
        subscriptions,
    } = pending;
    let debug = bus.config().debug;

    for subscription in subscriptions.iter() {
        if context.canceled.get() {
            if debug {
                debug!(bus = %bus, tag = %delivery.tag(), "Delivery canceled");
            }
            break;
        }

        let subscriber = subscription.subscriber();
        if !subscriber.is_alive() {
            if debug {
                trace!(subscriber = subscriber.name(), "Skipping dead subscriber");
            }
            continue;
        }
        if !subscriber.accept(delivery.event()) {
            continue;
        }

        subscription
            .handler()
            .handle(Arc::clone(subscriber), delivery.lease())?;
    }
    Ok(())
}

/// Stop handing the current event to the remaining subscriptions
pub(crate) fn cancel(bus_id: u64) -> Result<()> {
    let context = current(bus_id).ok_or(BusError::NotDelivering)?;
    context.canceled.set(true);
    Ok(())
}

/// Whether this thread is inside a delivery loop for the bus
pub(crate) fn is_delivering(bus_id: u64) -> bool {
    current(bus_id).is_some()
}

/// Events queued on this thread for the bus, the current one excluded
pub(crate) fn queued(bus_id: u64) -> usize {
    current(bus_id).map_or(0, |context| context.queue.borrow().len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::handler::ThreadMode;
    use crate::subscriber::Subscriber;
    use parking_lot::Mutex;

    #[test]
    fn test_context_only_exists_while_delivering() {
        let bus = EventBus::builder("dispatch-tests").build();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let inner = bus.clone();

        bus.register_listener(
            Arc::new(move |_e: &Event| -> std::result::Result<(), crate::HandlerError> {
                record.lock().push(is_delivering(inner.id()));
                Ok(())
            }),
            "",
            ThreadMode::Post,
        );

        assert!(!is_delivering(bus.id()));
        bus.post_default(()).unwrap();
        assert!(!is_delivering(bus.id()));
        assert_eq!(*seen.lock(), vec![true]);
    }

    #[test]
    fn test_cancel_outside_delivery() {
        assert!(matches!(cancel(u64::MAX), Err(BusError::NotDelivering)));
    }

    #[test]
    fn test_contexts_are_per_bus() {
        let first = EventBus::builder("dispatch-a").build();
        let second = EventBus::builder("dispatch-b").build();
        let order = Arc::new(Mutex::new(Vec::new()));

        let record = Arc::clone(&order);
        let nested = second.clone();
        first.register_listener(
            Arc::new(move |_e: &Event| -> std::result::Result<(), crate::HandlerError> {
                record.lock().push("first");
                // Different bus, so this delivers immediately
                nested.post("b", ())?;
                record.lock().push("first done");
                Ok(())
            }),
            "a",
            ThreadMode::Post,
        );

        let record = Arc::clone(&order);
        second.register_listener(
            Arc::new(move |_e: &Event| -> std::result::Result<(), crate::HandlerError> {
                record.lock().push("second");
                Ok(())
            }),
            "b",
            ThreadMode::Post,
        );

        first.post("a", ()).unwrap();
        assert_eq!(*order.lock(), vec!["first", "second", "first done"]);
    }

    #[test]
    fn test_failed_delivery_releases_queue() {
        let bus = EventBus::builder("dispatch-tests").build();
        let queued_events = Arc::new(Mutex::new(Vec::new()));

        let record = Arc::clone(&queued_events);
        let inner = bus.clone();
        bus.register_listener(
            Arc::new(move |e: &Event| -> std::result::Result<(), crate::HandlerError> {
                if e.tag() == "fail" {
                    let follow_up = Event::acquire(&inner, "later", ());
                    record.lock().push(follow_up.clone());
                    follow_up.post()?;
                    assert_eq!(queued(inner.id()), 1);
                    return Err(crate::HandlerError::msg("boom"));
                }
                Ok(())
            }),
            "fail",
            ThreadMode::Post,
        );
        let later: Arc<dyn Subscriber> = Arc::new(crate::subscriber::StrongSubscriber::new(Arc::new(
            |_e: &Event| -> std::result::Result<(), crate::HandlerError> { panic!("must not run") },
        )));
        bus.register_subscriber(later, "later", ThreadMode::Post);

        assert!(matches!(bus.post("fail", ()), Err(BusError::Handler(_))));
        assert!(!is_delivering(bus.id()));
        assert!(queued_events.lock()[0].is_recycled());
    }
}

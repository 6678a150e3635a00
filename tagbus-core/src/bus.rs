//! Event bus
//!
//! The registry maps each tag to a copy-on-write list of [`Subscription`]s.
//! Readers clone the `Arc` of the list they need and never block writers for
//! longer than a shard lookup; writers are serialized by a single registry
//! lock and publish a whole new list on every change.
//!
//! Posting is thread-affine: each thread runs its own delivery loop over
//! the snapshot it fetched, so concurrent posters never share a queue.

use crate::binding::{MethodBinding, Projection, SubscribeRegister};
use crate::config::{BusConfig, EventBusBuilder};
use crate::dispatch::{self, Pending};
use crate::error::{BusError, Result};
use crate::event::Event;
use crate::handler::{
    AsyncHandler, EventHandler, Executor, MainLoop, MainThreadHandler, PostingHandler, ThreadMode,
};
use crate::payload::Payload;
use crate::subscriber::{Listener, StrongSubscriber, Subscriber, SubscriberKey};
use crate::units;
use crate::weak::WeakSubscriber;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Tag used when none is given
pub const DEFAULT_TAG: &str = "";

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

static GLOBAL_BUS: Lazy<EventBus> = Lazy::new(|| {
    let config = BusConfig::from_env().unwrap_or_else(|e| {
        warn!("Ignoring invalid bus configuration from environment: {}", e);
        BusConfig::default()
    });
    EventBusBuilder::new("EventBus").config(config).build()
});

// ============================================================================
// Subscription
// ============================================================================

/// A subscriber registered under one tag with one execution policy.
///
/// Two subscriptions are equal when subscriber key and tag are equal; the
/// handler does not take part.
#[derive(Clone)]
pub struct Subscription {
    subscriber: Arc<dyn Subscriber>,
    tag: String,
    handler: Arc<dyn EventHandler>,
}

impl Subscription {
    pub fn subscriber(&self) -> &Arc<dyn Subscriber> {
        &self.subscriber
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }

    pub fn key(&self) -> SubscriberKey {
        self.subscriber.key()
    }

    pub fn mode(&self) -> ThreadMode {
        self.handler.mode()
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key() && self.tag == other.tag
    }
}

impl Eq for Subscription {}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subscriber", &self.subscriber.name())
            .field("tag", &self.tag)
            .field("mode", &self.mode())
            .finish()
    }
}

// ============================================================================
// Event Bus
// ============================================================================

struct BusInner {
    id: u64,
    config: BusConfig,
    registry: DashMap<String, Arc<Vec<Subscription>>>,
    write_lock: Mutex<()>,
    default_handler: Arc<dyn EventHandler>,
    post_handler: Arc<dyn EventHandler>,
    main_handler: Arc<dyn EventHandler>,
    async_handler: Arc<dyn EventHandler>,
    main_loop: Arc<MainLoop>,
}

/// Tag-based event bus. Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// The process-wide bus, configured from `TAGBUS_*` variables on first use
    pub fn global() -> &'static EventBus {
        &GLOBAL_BUS
    }

    pub fn builder(descriptor: impl Into<String>) -> EventBusBuilder {
        EventBusBuilder::new(descriptor)
    }

    pub(crate) fn from_parts(
        config: BusConfig,
        default_handler: Option<Arc<dyn EventHandler>>,
        executor: Option<Arc<dyn Executor>>,
        main_loop: Option<Arc<MainLoop>>,
    ) -> Self {
        let main_loop = main_loop.unwrap_or_default();
        let post_handler: Arc<dyn EventHandler> = Arc::new(PostingHandler);
        let main_handler: Arc<dyn EventHandler> = Arc::new(MainThreadHandler::new(Arc::clone(&main_loop)));
        let async_handler: Arc<dyn EventHandler> = Arc::new(match executor {
            Some(executor) => AsyncHandler::new(executor),
            None => AsyncHandler::lazy(config.worker_threads),
        });

        let default_handler = default_handler.unwrap_or_else(|| match config.default_mode {
            ThreadMode::Main => Arc::clone(&main_handler),
            ThreadMode::Async => Arc::clone(&async_handler),
            ThreadMode::Default | ThreadMode::Post => Arc::clone(&post_handler),
        });

        let bus = Self {
            inner: Arc::new(BusInner {
                id: NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed),
                config,
                registry: DashMap::new(),
                write_lock: Mutex::new(()),
                default_handler,
                post_handler,
                main_handler,
                async_handler,
                main_loop,
            }),
        };

        if bus.inner.config.debug {
            info!(bus = %bus, default_mode = %bus.inner.default_handler.mode(), "Event bus created");
        }
        bus
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn descriptor(&self) -> &str {
        &self.inner.config.descriptor
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Queue drained by the thread that runs [`ThreadMode::Main`] deliveries
    pub fn main_loop(&self) -> &Arc<MainLoop> {
        &self.inner.main_loop
    }

    /// Handler used for `mode`
    pub fn handler_for(&self, mode: ThreadMode) -> Arc<dyn EventHandler> {
        let inner = &self.inner;
        Arc::clone(match mode {
            ThreadMode::Default => &inner.default_handler,
            ThreadMode::Post => &inner.post_handler,
            ThreadMode::Main => &inner.main_handler,
            ThreadMode::Async => &inner.async_handler,
        })
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register every `#[subscribe]` method of `target`.
    ///
    /// The bus keeps only weak references; dropping the last `Arc` ends the
    /// subscriptions.
    pub fn register<S: SubscribeRegister>(&self, target: &Arc<S>) -> Result<()> {
        units::install::<S>();
        S::register_bindings(self, target, Projection::identity())
    }

    /// Register a type-erased instance through its installed registration unit.
    ///
    /// Returns `Ok(false)` without registering anything if the concrete type
    /// has no unit, i.e. it was never passed to [`register`](Self::register)
    /// or [`units::install`].
    pub fn register_dyn(&self, target: Arc<dyn Any + Send + Sync>) -> Result<bool> {
        match units::lookup((*target).type_id()) {
            Some(unit) => {
                unit.register(self, target)?;
                Ok(true)
            }
            None => {
                debug!(bus = %self, "No registration unit for instance, nothing registered");
                Ok(false)
            }
        }
    }

    /// Register a listener the bus keeps alive
    pub fn register_listener<L: Listener>(&self, listener: Arc<L>, tag: impl Into<String>, mode: ThreadMode) {
        self.register_subscriber(Arc::new(StrongSubscriber::new(listener)), tag, mode);
    }

    /// Register a callback on `target` without keeping it alive
    pub fn register_weak<T, F>(&self, target: &Arc<T>, tag: impl Into<String>, mode: ThreadMode, callback: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&T, &Event) -> std::result::Result<(), crate::HandlerError> + Send + Sync + 'static,
    {
        self.register_subscriber(Arc::new(WeakSubscriber::new(target, callback)), tag, mode);
    }

    pub fn register_subscriber(&self, subscriber: Arc<dyn Subscriber>, tag: impl Into<String>, mode: ThreadMode) {
        let handler = self.handler_for(mode);
        self.register_with_handler(subscriber, tag, handler);
    }

    /// Register with an explicit execution policy.
    ///
    /// Registering the same subscriber under the same tag again keeps its
    /// position; the handler is swapped only if it differs.
    pub fn register_with_handler(
        &self,
        subscriber: Arc<dyn Subscriber>,
        tag: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) {
        let subscription = Subscription {
            subscriber,
            tag: tag.into(),
            handler,
        };

        let write_guard = self.inner.write_lock.lock();
        let mut list: Vec<Subscription> = self
            .inner
            .registry
            .get(&subscription.tag)
            .map(|list| Vec::clone(&list))
            .unwrap_or_default();

        let replaced = match list.iter().position(|existing| *existing == subscription) {
            Some(index) if Arc::ptr_eq(&list[index].handler, &subscription.handler) => return,
            Some(index) => {
                list[index] = subscription.clone();
                true
            }
            None => {
                list.push(subscription.clone());
                false
            }
        };

        if self.inner.config.debug {
            debug!(
                bus = %self,
                tag = %subscription.tag,
                subscriber = subscription.subscriber.name(),
                mode = %subscription.mode(),
                replaced,
                "Subscriber registered"
            );
        }
        let previous = self.inner.registry.insert(subscription.tag, Arc::new(list));
        drop(write_guard);

        // Subscriber destructors may call back into the bus
        drop(previous);
    }

    /// Register one method binding of `target`, once per declared tag
    pub fn register_binding<T, P>(&self, target: &Arc<T>, project: &Projection<T, P>, binding: MethodBinding<P>)
    where
        T: Send + Sync + 'static,
        P: 'static,
    {
        let descriptor = binding.descriptor;
        for tag in descriptor.effective_tags() {
            let project = project.clone();
            let invoke = binding.invoke;
            let subscriber = WeakSubscriber::new(target, move |target: &T, event: &Event| {
                invoke(project.apply(target), event)
            })
            .with_accept(binding.accept)
            .with_binding(descriptor.signature);

            self.register_subscriber(Arc::new(subscriber), *tag, descriptor.mode);
        }
    }

    // ========================================================================
    // Unregistration
    // ========================================================================

    /// Remove every subscription of `target`, whatever the tag or binding.
    /// Also sweeps subscriptions whose weak target is gone. Returns the
    /// number of subscriptions removed.
    pub fn unregister_subscriber<T: ?Sized>(&self, target: &Arc<T>) -> usize {
        let key = SubscriberKey::of(target);
        self.remove_where(|subscription| subscription.key().same_target(&key))
    }

    /// Remove the subscriptions with exactly this key, sweeping dead ones too
    pub fn unregister_key(&self, key: SubscriberKey) -> usize {
        self.remove_where(|subscription| subscription.key() == key)
    }

    /// Remove every subscription under `tag`
    pub fn unregister_tag(&self, tag: &str) -> usize {
        let write_guard = self.inner.write_lock.lock();
        let previous = self.inner.registry.remove(tag);
        drop(write_guard);

        let removed = previous.map_or(0, |(_, list)| list.len());
        if self.inner.config.debug {
            debug!(bus = %self, tag, removed, "Tag unregistered");
        }
        removed
    }

    fn remove_where(&self, matches: impl Fn(&Subscription) -> bool) -> usize {
        let write_guard = self.inner.write_lock.lock();
        let tags: Vec<String> = self.inner.registry.iter().map(|entry| entry.key().clone()).collect();

        let mut removed = 0;
        let mut replaced = Vec::new();
        for tag in tags {
            let Some(list) = self.inner.registry.get(&tag).map(|list| Arc::clone(&list)) else {
                continue;
            };
            let kept: Vec<Subscription> = list
                .iter()
                .filter(|subscription| !matches(subscription) && subscription.subscriber.is_alive())
                .cloned()
                .collect();

            if kept.len() == list.len() {
                continue;
            }
            removed += list.len() - kept.len();
            if kept.is_empty() {
                self.inner.registry.remove(&tag);
            } else {
                self.inner.registry.insert(tag, Arc::new(kept));
            }
            replaced.push(list);
        }
        drop(write_guard);

        // Subscriber destructors may call back into the bus
        drop(replaced);

        if self.inner.config.debug && removed > 0 {
            debug!(bus = %self, removed, "Subscriptions removed");
        }
        removed
    }

    // ========================================================================
    // Posting
    // ========================================================================

    /// Post a payload under `tag`.
    ///
    /// Synchronous subscribers have run by the time this returns, unless the
    /// call is nested inside a delivery on this thread, in which case the
    /// event is queued behind the current one.
    pub fn post(&self, tag: impl Into<String>, payload: impl Into<Payload>) -> Result<()> {
        let payload = payload.into();
        self.check_len(payload.len())?;
        self.dispatch(Event::acquire(self, tag, payload))
    }

    /// Post under the default tag
    pub fn post_default(&self, payload: impl Into<Payload>) -> Result<()> {
        self.post(DEFAULT_TAG, payload)
    }

    /// Post an event obtained with [`Event::acquire`]
    pub fn post_event(&self, event: Event) -> Result<()> {
        if event.is_recycled() {
            return Err(BusError::EventRecycled);
        }
        if event.is_in_use() {
            return Err(BusError::EventInUse);
        }
        self.check_len(event.payload_len())?;
        self.dispatch(event)
    }

    fn check_len(&self, len: usize) -> Result<()> {
        let max = self.inner.config.max_payload_len;
        if len > max {
            return Err(BusError::PayloadTooLong { len, max });
        }
        Ok(())
    }

    fn dispatch(&self, event: Event) -> Result<()> {
        let tag = event.tag();
        let subscriptions = self.snapshot(&tag);
        let delivery = event.lease();

        if subscriptions.is_empty() {
            if self.inner.config.debug {
                debug!(bus = %self, tag = %tag, "No subscribers for tag");
            }
            return Ok(());
        }
        dispatch::post(self, Pending::new(delivery, subscriptions))
    }

    fn snapshot(&self, tag: &str) -> Arc<Vec<Subscription>> {
        self.inner
            .registry
            .get(tag)
            .map(|list| Arc::clone(&list))
            .unwrap_or_default()
    }

    /// Stop delivering the current event to the remaining subscribers.
    ///
    /// Only valid from inside a delivery on the calling thread; queued events
    /// are not affected.
    pub fn cancel_current_delivery(&self) -> Result<()> {
        dispatch::cancel(self.id())
    }

    /// Whether the calling thread is delivering for this bus
    pub fn is_delivering(&self) -> bool {
        dispatch::is_delivering(self.id())
    }

    /// Events waiting behind the current delivery on the calling thread
    pub fn queued_events(&self) -> usize {
        dispatch::queued(self.id())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Subscriptions under `tag`, in delivery order
    pub fn subscriptions(&self, tag: &str) -> Vec<Subscription> {
        Vec::clone(&self.snapshot(tag))
    }

    pub fn subscription_count(&self, tag: &str) -> usize {
        self.snapshot(tag).len()
    }

    /// Tags with at least one subscription, sorted
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.inner.registry.iter().map(|entry| entry.key().clone()).collect();
        tags.sort();
        tags
    }
}

impl PartialEq for EventBus {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EventBus {}

impl fmt::Display for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[EventBus '{}']", self.inner.config.descriptor)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("descriptor", &self.inner.config.descriptor)
            .field("id", &self.inner.id)
            .field("tags", &self.inner.registry.len())
            .finish()
    }
}

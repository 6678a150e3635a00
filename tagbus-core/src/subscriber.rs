//! Subscriber contracts
//!
//! The bus stores every subscription as an `Arc<dyn Subscriber>`. Three
//! implementations ship with the crate:
//!
//! - [`StrongSubscriber`] owns a [`Listener`] and keeps it alive
//! - [`WeakSubscriber`](crate::WeakSubscriber) holds a `Weak` reference and
//!   goes quiet once its referent is dropped
//! - generated method bindings, which are weak subscribers with an accept
//!   predicate and a binding signature

use crate::error::HandlerError;
use crate::event::{Delivery, Event};
use std::any::type_name;
use std::fmt;
use std::sync::Arc;

/// Identity of a subscriber inside the registry.
///
/// Two subscriptions are the same when their keys and tags are equal. The
/// address identifies the subscribed object; `binding` distinguishes the
/// methods of one object that were bound separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberKey {
    addr: usize,
    binding: Option<&'static str>,
}

impl SubscriberKey {
    /// Key of a shared object
    pub fn of<T: ?Sized>(target: &Arc<T>) -> Self {
        Self {
            addr: Arc::as_ptr(target) as *const () as usize,
            binding: None,
        }
    }

    /// Same object, narrowed to one binding
    pub fn with_binding(self, binding: &'static str) -> Self {
        Self {
            binding: Some(binding),
            ..self
        }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn binding(&self) -> Option<&'static str> {
        self.binding
    }

    /// Whether this key belongs to the object at `addr`, whatever the binding
    pub fn same_target(&self, other: &SubscriberKey) -> bool {
        self.addr == other.addr
    }
}

impl fmt::Display for SubscriberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.binding {
            Some(binding) => write!(f, "{:#x}/{}", self.addr, binding),
            None => write!(f, "{:#x}", self.addr),
        }
    }
}

/// Something the bus can deliver events to
pub trait Subscriber: Send + Sync + 'static {
    /// Registry identity
    fn key(&self) -> SubscriberKey;

    /// Display name used in logs
    fn name(&self) -> &str;

    /// `false` once the subscriber can no longer receive anything.
    /// Dead subscribers are skipped and swept on the next unregister.
    fn is_alive(&self) -> bool {
        true
    }

    /// Filter run before every hand-off
    fn accept(&self, _event: &Event) -> bool {
        true
    }

    /// Receive one delivery. The usage is released when `delivery` drops.
    fn on_event(&self, delivery: Delivery) -> Result<(), HandlerError>;
}

/// Plain event callback
pub trait Listener: Send + Sync + 'static {
    fn on_event(&self, event: &Event) -> Result<(), HandlerError>;
}

impl<F> Listener for F
where
    F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn on_event(&self, event: &Event) -> Result<(), HandlerError> {
        self(event)
    }
}

/// Owning subscriber around a [`Listener`]
pub struct StrongSubscriber<L: Listener> {
    listener: Arc<L>,
    key: SubscriberKey,
    name: String,
}

impl<L: Listener> StrongSubscriber<L> {
    pub fn new(listener: Arc<L>) -> Self {
        let key = SubscriberKey::of(&listener);
        let short = type_name::<L>().rsplit("::").next().unwrap_or_default();
        Self {
            listener,
            key,
            name: format!("Subscriber:{{ {} }}", short),
        }
    }

    pub fn listener(&self) -> &Arc<L> {
        &self.listener
    }
}

impl<L: Listener> Subscriber for StrongSubscriber<L> {
    fn key(&self) -> SubscriberKey {
        self.key
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, delivery: Delivery) -> Result<(), HandlerError> {
        self.listener.on_event(delivery.event())
    }
}

impl<L: Listener> fmt::Debug for StrongSubscriber<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrongSubscriber")
            .field("key", &self.key)
            .field("name", &self.name)
            .finish()
    }
}

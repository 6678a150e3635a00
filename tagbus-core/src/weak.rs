//! Weak subscriptions
//!
//! A [`WeakSubscriber`] does not keep its target alive. Identity and display
//! name are captured when it is built, so a subscription whose target is
//! gone can still be matched and removed by `unregister_*` calls.

use crate::error::HandlerError;
use crate::event::{Delivery, Event};
use crate::subscriber::{Subscriber, SubscriberKey};
use std::any::type_name;
use std::fmt;
use std::sync::{Arc, Weak};

/// Typed callback invoked with the live target
pub type WeakCallback<T> = Arc<dyn Fn(&T, &Event) -> Result<(), HandlerError> + Send + Sync>;

/// Subscriber holding a non-owning reference to its target
pub struct WeakSubscriber<T: Send + Sync + 'static> {
    target: Weak<T>,
    key: SubscriberKey,
    name: String,
    accept: Option<fn(&Event) -> bool>,
    callback: WeakCallback<T>,
}

impl<T: Send + Sync + 'static> WeakSubscriber<T> {
    pub fn new<F>(target: &Arc<T>, callback: F) -> Self
    where
        F: Fn(&T, &Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self {
            target: Arc::downgrade(target),
            key: SubscriberKey::of(target),
            name: format!("Subscriber:{{ [WEAK]{} }}", type_name::<T>()),
            accept: None,
            callback: Arc::new(callback),
        }
    }

    /// Only deliver events the predicate accepts
    pub fn with_accept(mut self, accept: fn(&Event) -> bool) -> Self {
        self.accept = Some(accept);
        self
    }

    /// Narrow the identity to one binding of the target
    pub fn with_binding(mut self, signature: &'static str) -> Self {
        self.key = self.key.with_binding(signature);
        self.name = format!("MethodSubscriber{{ {} }}", signature);
        self
    }

    /// The target, if it is still alive
    pub fn get(&self) -> Option<Arc<T>> {
        self.target.upgrade()
    }
}

impl<T: Send + Sync + 'static> Subscriber for WeakSubscriber<T> {
    fn key(&self) -> SubscriberKey {
        self.key
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_alive(&self) -> bool {
        self.target.strong_count() > 0
    }

    fn accept(&self, event: &Event) -> bool {
        self.accept.is_none_or(|accept| accept(event))
    }

    fn on_event(&self, delivery: Delivery) -> Result<(), HandlerError> {
        match self.target.upgrade() {
            Some(target) => (self.callback)(&target, delivery.event()),
            None => Ok(()),
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for WeakSubscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakSubscriber")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("alive", &self.is_alive())
            .finish()
    }
}

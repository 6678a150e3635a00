//! Tag-based in-process event bus
//!
//! This crate is the runtime behind `tagbus`: the bus itself, pooled events,
//! subscriber contracts and the execution policies that decide where a
//! callback runs.
//!
//! ## Features
//!
//! - **Tags** - Subscribers register under string tags; `""` is the default tag
//! - **Positional payloads** - Up to [`BusConfig::max_payload_len`] values of
//!   any `Send + Sync` type, matched by exact runtime type
//! - **Reentrant delivery** - Posting from a handler queues instead of recursing
//! - **Weak subscribers** - Registered objects are not kept alive by the bus
//! - **Thread modes** - Posting thread, a main loop thread, or a worker pool
//! - **Pooled events** - Recycled events are reused instead of reallocated
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tagbus_core::*;
//! use std::sync::Arc;
//!
//! let bus = EventBus::builder("app").build();
//!
//! bus.register_listener(
//!     Arc::new(|event: &Event| -> Result<(), HandlerError> {
//!         println!("{} carries {} values", event.tag(), event.payload_len());
//!         Ok(())
//!     }),
//!     "saved",
//!     ThreadMode::Post,
//! );
//!
//! bus.post("saved", (42_u64, String::from("report.pdf")))?;
//! ```
//!
//! Most applications use the `#[subscriber]` attribute from `tagbus` instead
//! of registering listeners by hand.

pub mod binding;
pub mod bus;
pub mod config;
mod dispatch;
pub mod error;
pub mod event;
pub mod handler;
pub mod payload;
pub mod pool;
pub mod subscriber;
pub mod units;
pub mod weak;

pub use binding::{
    BindingDescriptor, IntoHandlerResult, MethodBinding, ParamShape, Projection, SubscribeRegister, arg, arg_ref,
    arg_str, is_str, register_declared,
};
pub use bus::{DEFAULT_TAG, EventBus, Subscription};
pub use config::{BusConfig, ConfigError, EventBusBuilder};
pub use error::{BoxError, BusError, HandlerError};
pub use event::{Delivery, Event};
pub use handler::{
    AsyncHandler, EventHandler, Executor, Job, MainLoop, MainThreadHandler, PostingHandler, ThreadMode, WorkerPool,
};
pub use payload::{Payload, Value};
pub use pool::{EventPool, MAX_POOL_SIZE, PoolStats};
pub use subscriber::{Listener, StrongSubscriber, Subscriber, SubscriberKey};
pub use weak::{WeakCallback, WeakSubscriber};

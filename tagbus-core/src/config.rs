//! Bus configuration
//!
//! # Environment Variables
//!
//! [`BusConfig::from_env`] reads:
//!
//! - `TAGBUS_DEBUG=1|true` - Verbose registry and delivery logging
//! - `TAGBUS_MAX_PAYLOAD=<n>` - Maximum payload length per event (default 5)
//! - `TAGBUS_DEFAULT_MODE=post|main|async` - Policy for `ThreadMode::Default`
//! - `TAGBUS_MAX_QUEUE_DEPTH=<n>` - Nested posts queued per thread (default 1024)
//! - `TAGBUS_WORKER_THREADS=<n>` - Size of the lazily started worker pool
//!
//! Unset variables keep their defaults; set but unparsable ones are an error.

use crate::bus::EventBus;
use crate::handler::{EventHandler, Executor, MainLoop, ThreadMode};
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Default maximum payload length
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 5;

/// Default bound on events queued by nested posts on one thread
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Unknown thread mode: {0:?}")]
    UnknownMode(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Event bus configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Name shown in logs and `Display`
    pub descriptor: String,
    /// Events with a longer payload are rejected at post time
    pub max_payload_len: usize,
    /// Policy used for `ThreadMode::Default` subscriptions
    pub default_mode: ThreadMode,
    /// Log registrations and deliveries
    pub debug: bool,
    /// Events that nested posts may queue on one thread
    pub max_queue_depth: usize,
    /// Worker pool size; `None` uses the tokio default
    pub worker_threads: Option<usize>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            descriptor: "EventBus".to_string(),
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            default_mode: ThreadMode::Post,
            debug: false,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            worker_threads: None,
        }
    }
}

impl BusConfig {
    /// Read `TAGBUS_*` variables from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read `TAGBUS_*` variables through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup("TAGBUS_DEBUG") {
            config.debug = value == "1" || value.eq_ignore_ascii_case("true");
        }
        if let Some(value) = lookup("TAGBUS_MAX_PAYLOAD") {
            config.max_payload_len = parse("TAGBUS_MAX_PAYLOAD", &value)?;
        }
        if let Some(value) = lookup("TAGBUS_DEFAULT_MODE") {
            config.default_mode = value.parse()?;
        }
        if let Some(value) = lookup("TAGBUS_MAX_QUEUE_DEPTH") {
            config.max_queue_depth = parse("TAGBUS_MAX_QUEUE_DEPTH", &value)?;
        }
        if let Some(value) = lookup("TAGBUS_WORKER_THREADS") {
            config.worker_threads = Some(parse("TAGBUS_WORKER_THREADS", &value)?);
        }

        Ok(config)
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Builder for event bus
pub struct EventBusBuilder {
    config: BusConfig,
    default_handler: Option<Arc<dyn EventHandler>>,
    executor: Option<Arc<dyn Executor>>,
    main_loop: Option<Arc<MainLoop>>,
}

impl EventBusBuilder {
    /// Create new event bus builder
    pub fn new(descriptor: impl Into<String>) -> Self {
        Self {
            config: BusConfig {
                descriptor: descriptor.into(),
                ..BusConfig::default()
            },
            default_handler: None,
            executor: None,
            main_loop: None,
        }
    }

    /// Replace the configuration, keeping the descriptor given to `new`
    pub fn config(mut self, config: BusConfig) -> Self {
        let descriptor = std::mem::take(&mut self.config.descriptor);
        self.config = BusConfig { descriptor, ..config };
        self
    }

    pub fn max_payload_len(mut self, len: usize) -> Self {
        self.config.max_payload_len = len;
        self
    }

    /// Policy for `ThreadMode::Default` subscriptions
    pub fn default_mode(mut self, mode: ThreadMode) -> Self {
        self.config.default_mode = mode;
        self
    }

    /// Custom handler for `ThreadMode::Default` subscriptions; takes
    /// precedence over [`default_mode`](Self::default_mode)
    pub fn default_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.default_handler = Some(handler);
        self
    }

    /// Executor for `ThreadMode::Async` deliveries instead of the worker pool
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn main_loop(mut self, main_loop: Arc<MainLoop>) -> Self {
        self.main_loop = Some(main_loop);
        self
    }

    /// Enable/disable debug logging
    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    pub fn max_queue_depth(mut self, depth: usize) -> Self {
        self.config.max_queue_depth = depth;
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = Some(threads);
        self
    }

    /// Build the event bus
    pub fn build(self) -> EventBus {
        EventBus::from_parts(self.config, self.default_handler, self.executor, self.main_loop)
    }
}

impl std::fmt::Debug for EventBusBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBusBuilder")
            .field("config", &self.config)
            .field("custom_default_handler", &self.default_handler.is_some())
            .field("custom_executor", &self.executor.is_some())
            .finish()
    }
}

//! Error types for the event bus

use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error raised from inside a subscriber callback.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Bus errors
///
/// Everything except [`BusError::Handler`] is a protocol misuse by the caller
/// and is reported immediately; nothing is retried.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Cannot modify or post this event because it is still in use")]
    EventInUse,

    #[error("Event already recycled")]
    EventRecycled,

    #[error("No event is being delivered on the current thread")]
    NotDelivering,

    #[error("Payload length > {max} : {len}")]
    PayloadTooLong { len: usize, max: usize },

    #[error("Delivery queue overflow: {depth} events already pending on this thread")]
    QueueOverflow { depth: usize },

    #[error("Event is not attached to a bus")]
    Detached,

    #[error("Unable to register subscriber for {subscriber}: {reason}")]
    Registration {
        subscriber: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Errors raised while invoking a subscriber
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Subscriber {binding} failed: {source}")]
    Failed {
        binding: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("Argument {index} of {binding} is missing or not a {expected}")]
    Argument {
        binding: &'static str,
        index: usize,
        expected: &'static str,
    },

    #[error("Handler failed: {0}")]
    Message(String),

    #[error("Executor unavailable: {0}")]
    Executor(String),

    /// A bus call made from inside the handler failed
    #[error(transparent)]
    Bus(Box<BusError>),
}

impl From<BusError> for HandlerError {
    fn from(err: BusError) -> Self {
        Self::Bus(Box::new(err))
    }
}

impl HandlerError {
    /// Create a free-form handler failure
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

pub type Result<T> = std::result::Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_too_long_message() {
        let err = BusError::PayloadTooLong { len: 7, max: 5 };
        assert_eq!(err.to_string(), "Payload length > 5 : 7");
    }

    #[test]
    fn test_handler_error_is_transparent() {
        let err: BusError = HandlerError::msg("boom").into();
        assert_eq!(err.to_string(), "Handler failed: boom");
        assert!(matches!(err, BusError::Handler(HandlerError::Message(_))));
    }

    #[test]
    fn test_bus_error_inside_handler() {
        fn nested() -> std::result::Result<(), HandlerError> {
            Err(BusError::NotDelivering)?;
            Ok(())
        }
        let err = nested().unwrap_err();
        assert!(matches!(err, HandlerError::Bus(ref inner) if matches!(**inner, BusError::NotDelivering)));
    }

    #[test]
    fn test_failed_keeps_source() {
        let io = std::io::Error::other("disk gone");
        let err = HandlerError::Failed {
            binding: "Foo::on_save()",
            source: Box::new(io),
        };
        assert!(err.to_string().contains("Foo::on_save()"));
        assert!(err.source().is_some());
    }
}

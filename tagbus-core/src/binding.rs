//! Method bindings
//!
//! `#[subscriber]` turns every `#[subscribe]` method into a [`MethodBinding`]:
//! a static [`BindingDescriptor`] plus two plain function pointers, one that
//! decides whether an event's payload fits the method signature and one that
//! unpacks the payload and calls the method.
//!
//! A type's bindings form a registration unit exposed through
//! [`SubscribeRegister`]. Registering an instance creates one weak
//! subscription per binding and tag.
//!
//! ```rust,ignore
//! #[subscriber]
//! impl Inbox {
//!     #[subscribe(tag = "mail")]
//!     fn on_mail(&self, from: &str, unread: u32) { /* ... */ }
//! }
//!
//! bus.register(&inbox)?;
//! bus.post("mail", (String::from("ops"), 3_u32))?;
//! ```

use crate::bus::{DEFAULT_TAG, EventBus};
use crate::error::{BoxError, HandlerError, Result};
use crate::event::Event;
use crate::handler::ThreadMode;
use crate::payload::Payload;
use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

/// How a bound method consumes the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamShape {
    /// No payload arguments; only empty payloads are accepted
    Empty,
    /// A single `Event` argument; every payload is accepted
    Event,
    /// `n` positional arguments matched by exact runtime type
    Positional(usize),
}

/// Static description of one bound method
#[derive(Debug)]
pub struct BindingDescriptor {
    /// Declaring type
    pub subscriber: &'static str,
    pub method: &'static str,
    /// `Type::method(params)`, unique per binding
    pub signature: &'static str,
    /// Declared tags; empty means the default tag
    pub tags: &'static [&'static str],
    pub mode: ThreadMode,
    /// Type names of the payload parameters, tag parameter excluded
    pub params: &'static [&'static str],
    /// Whether the first parameter receives the event tag
    pub tag_param: bool,
    pub shape: ParamShape,
}

impl BindingDescriptor {
    /// Tags this binding registers under
    pub fn effective_tags(&self) -> &'static [&'static str] {
        if self.tags.is_empty() {
            &[DEFAULT_TAG]
        } else {
            self.tags
        }
    }
}

/// A bound method of `P`
pub struct MethodBinding<P: 'static> {
    pub descriptor: &'static BindingDescriptor,
    pub accept: fn(&Event) -> bool,
    pub invoke: fn(&P, &Event) -> std::result::Result<(), HandlerError>,
}

impl<P: 'static> MethodBinding<P> {
    pub const fn new(
        descriptor: &'static BindingDescriptor,
        accept: fn(&Event) -> bool,
        invoke: fn(&P, &Event) -> std::result::Result<(), HandlerError>,
    ) -> Self {
        Self {
            descriptor,
            accept,
            invoke,
        }
    }
}

// Derives would require `P: Clone`
impl<P: 'static> Clone for MethodBinding<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: 'static> Copy for MethodBinding<P> {}

impl<P: 'static> fmt::Debug for MethodBinding<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodBinding")
            .field("signature", &self.descriptor.signature)
            .field("mode", &self.descriptor.mode)
            .finish()
    }
}

/// Path from a registered instance `T` to the type `P` that declares a binding.
///
/// For a plain unit this is the identity. A unit declared with
/// `#[subscriber(extends = Parent)]` hands its parent a projection extended
/// with `AsRef<Parent>`, so the parent's bindings run against the embedded
/// parent value while the subscription stays keyed on the registered `T`.
pub struct Projection<T: 'static, P: 'static> {
    f: Arc<dyn for<'a> Fn(&'a T) -> &'a P + Send + Sync>,
}

impl<T: 'static, P: 'static> Projection<T, P> {
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a T) -> &'a P + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    #[inline]
    pub fn apply<'a>(&self, target: &'a T) -> &'a P {
        (self.f)(target)
    }

    /// Extend the path by one step
    pub fn then<Q: 'static>(&self, step: fn(&P) -> &Q) -> Projection<T, Q> {
        let f = Arc::clone(&self.f);
        Projection::new(move |target: &T| step(f(target)))
    }
}

impl<T: 'static> Projection<T, T> {
    pub fn identity() -> Self {
        Self::new(|target: &T| target)
    }
}

impl<T: 'static, P: 'static> Clone for Projection<T, P> {
    fn clone(&self) -> Self {
        Self {
            f: Arc::clone(&self.f),
        }
    }
}

impl<T: 'static, P: 'static> fmt::Debug for Projection<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Projection<{} -> {}>", type_name::<T>(), type_name::<P>())
    }
}

/// Registration unit of a subscriber type.
///
/// Implemented by `#[subscriber]`; hand-written implementations only need
/// [`BINDINGS`](SubscribeRegister::BINDINGS).
pub trait SubscribeRegister: Send + Sync + Sized + 'static {
    /// Bindings declared directly on this type
    const BINDINGS: &'static [MethodBinding<Self>];

    /// Register every binding of this unit for `target`, ancestors first
    fn register_bindings<T: Send + Sync + 'static>(
        bus: &EventBus,
        target: &Arc<T>,
        project: Projection<T, Self>,
    ) -> Result<()> {
        register_declared(bus, target, &project)
    }

    /// Descriptors of this unit, ancestors first
    fn collect_bindings(out: &mut Vec<&'static BindingDescriptor>) {
        out.extend(Self::BINDINGS.iter().map(|binding| binding.descriptor));
    }

    /// All descriptors of this unit
    fn descriptors() -> Vec<&'static BindingDescriptor> {
        let mut out = Vec::new();
        Self::collect_bindings(&mut out);
        out
    }
}

/// Register the bindings declared directly on `S`
pub fn register_declared<S, T>(bus: &EventBus, target: &Arc<T>, project: &Projection<T, S>) -> Result<()>
where
    S: SubscribeRegister,
    T: Send + Sync + 'static,
{
    for binding in S::BINDINGS {
        bus.register_binding(target, project, *binding);
    }
    Ok(())
}

/// Return types allowed on a subscriber method
pub trait IntoHandlerResult {
    fn into_handler_result(self, binding: &'static str) -> std::result::Result<(), HandlerError>;
}

impl IntoHandlerResult for () {
    #[inline]
    fn into_handler_result(self, _binding: &'static str) -> std::result::Result<(), HandlerError> {
        Ok(())
    }
}

impl<T, E> IntoHandlerResult for std::result::Result<T, E>
where
    E: Into<BoxError>,
{
    fn into_handler_result(self, binding: &'static str) -> std::result::Result<(), HandlerError> {
        self.map(|_| ()).map_err(|e| HandlerError::Failed {
            binding,
            source: e.into(),
        })
    }
}

/// Clone the argument at `index` out of the payload
pub fn arg<T: Any + Clone>(
    payload: &Payload,
    index: usize,
    binding: &'static str,
) -> std::result::Result<T, HandlerError> {
    arg_ref::<T>(payload, index, binding).cloned()
}

/// Borrow the argument at `index`
pub fn arg_ref<'a, T: Any>(
    payload: &'a Payload,
    index: usize,
    binding: &'static str,
) -> std::result::Result<&'a T, HandlerError> {
    payload.get::<T>(index).ok_or_else(|| HandlerError::Argument {
        binding,
        index,
        expected: type_name::<T>(),
    })
}

/// Whether the value at `index` can be passed as `&str`
pub fn is_str(payload: &Payload, index: usize) -> bool {
    payload.is::<String>(index) || payload.is::<&'static str>(index)
}

/// Borrow a `String` or `&'static str` argument as `&str`
pub fn arg_str<'a>(
    payload: &'a Payload,
    index: usize,
    binding: &'static str,
) -> std::result::Result<&'a str, HandlerError> {
    if let Some(s) = payload.get::<String>(index) {
        return Ok(s.as_str());
    }
    payload
        .get::<&'static str>(index)
        .copied()
        .ok_or(HandlerError::Argument {
            binding,
            index,
            expected: "&str",
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Gauge {
        seen: AtomicUsize,
    }

    impl Gauge {
        fn on_reading(&self, value: u32) {
            self.seen.fetch_add(value as usize, Ordering::SeqCst);
        }
    }

    fn accept_reading(event: &Event) -> bool {
        event.with_payload(|p| p.len() == 1 && p.is::<u32>(0))
    }

    fn invoke_reading(target: &Gauge, event: &Event) -> std::result::Result<(), HandlerError> {
        let payload = event.payload();
        let value = arg::<u32>(&payload, 0, READING.signature)?;
        target.on_reading(value).into_handler_result(READING.signature)
    }

    static READING: BindingDescriptor = BindingDescriptor {
        subscriber: "Gauge",
        method: "on_reading",
        signature: "Gauge::on_reading(u32)",
        tags: &["reading"],
        mode: ThreadMode::Post,
        params: &["u32"],
        tag_param: false,
        shape: ParamShape::Positional(1),
    };

    impl SubscribeRegister for Gauge {
        const BINDINGS: &'static [MethodBinding<Self>] =
            &[MethodBinding::new(&READING, accept_reading, invoke_reading)];
    }

    struct Panel {
        gauge: Gauge,
    }

    impl AsRef<Gauge> for Panel {
        fn as_ref(&self) -> &Gauge {
            &self.gauge
        }
    }

    #[test]
    fn test_effective_tags_default() {
        let descriptor = BindingDescriptor {
            tags: &[],
            ..READING
        };
        assert_eq!(descriptor.effective_tags(), &[""]);
        assert_eq!(READING.effective_tags(), &["reading"]);
    }

    #[test]
    fn test_register_and_deliver() {
        let bus = EventBus::builder("binding-tests").build();
        let gauge = Arc::new(Gauge {
            seen: AtomicUsize::new(0),
        });

        Gauge::register_bindings(&bus, &gauge, Projection::identity()).unwrap();
        assert_eq!(bus.subscription_count("reading"), 1);

        bus.post("reading", (7_u32,)).unwrap();
        bus.post("reading", (7_i32,)).unwrap();
        assert_eq!(gauge.seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_projection_reaches_embedded_parent() {
        let bus = EventBus::builder("binding-tests").build();
        let panel = Arc::new(Panel {
            gauge: Gauge {
                seen: AtomicUsize::new(0),
            },
        });

        let project = Projection::<Panel, Panel>::identity().then(<Panel as AsRef<Gauge>>::as_ref);
        Gauge::register_bindings(&bus, &panel, project).unwrap();

        bus.post("reading", (3_u32,)).unwrap();
        assert_eq!(panel.gauge.seen.load(Ordering::SeqCst), 3);

        bus.unregister_subscriber(&panel);
        assert_eq!(bus.subscription_count("reading"), 0);
    }

    #[test]
    fn test_descriptors() {
        let descriptors = Gauge::descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].signature, "Gauge::on_reading(u32)");
    }

    #[test]
    fn test_argument_helpers() {
        let payload = Payload::from((1_u8, String::from("owned"), "static"));

        assert_eq!(arg::<u8>(&payload, 0, "sig").unwrap(), 1);
        assert_eq!(arg_str(&payload, 1, "sig").unwrap(), "owned");
        assert_eq!(arg_str(&payload, 2, "sig").unwrap(), "static");
        assert!(is_str(&payload, 1) && is_str(&payload, 2) && !is_str(&payload, 0));

        let err = arg_ref::<u16>(&payload, 0, "sig").unwrap_err();
        assert!(matches!(err, HandlerError::Argument { index: 0, .. }));
        assert!(arg_str(&payload, 9, "sig").is_err());
    }

    #[test]
    fn test_into_handler_result() {
        assert!(().into_handler_result("sig").is_ok());
        assert!(Ok::<_, std::io::Error>(5).into_handler_result("sig").is_ok());

        let err = Err::<(), _>("bad input").into_handler_result("Gauge::on_x()").unwrap_err();
        assert!(matches!(err, HandlerError::Failed { binding: "Gauge::on_x()", .. }));
    }
}

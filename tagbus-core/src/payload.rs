//! Event payloads
//!
//! A payload is an ordered list of opaque values. Subscribers match on the
//! runtime type of each position, so every value keeps its `TypeId` (through
//! `dyn Any`) and the name of its type for diagnostics.
//!
//! Tuples convert directly into payloads:
//!
//! ```rust,ignore
//! bus.post("", (42, true, String::from("hi")))?;
//! bus.post("refresh", ())?;
//! ```

use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

/// A single payload element
#[derive(Clone)]
pub struct Value {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Value {
    /// Wrap a value
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: type_name::<T>(),
        }
    }

    /// Check the runtime type of this value
    #[inline]
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Borrow the value as `T`
    #[inline]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Name of the wrapped type
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.type_name)
    }
}

/// Ordered event payload
#[derive(Clone, Default)]
pub struct Payload {
    values: Vec<Value>,
}

impl Payload {
    /// Create an empty payload
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value (builder style)
    pub fn with<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.push(value);
        self
    }

    /// Append a value
    pub fn push<T: Any + Send + Sync>(&mut self, value: T) {
        self.values.push(Value::new(value));
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether the value at `index` exists and is a `T`
    #[inline]
    pub fn is<T: Any>(&self, index: usize) -> bool {
        self.values.get(index).is_some_and(Value::is::<T>)
    }

    /// Borrow the value at `index` as `T`
    #[inline]
    pub fn get<T: Any>(&self, index: usize) -> Option<&T> {
        self.values.get(index).and_then(Value::downcast_ref::<T>)
    }

    /// Type name of the value at `index`
    pub fn type_name(&self, index: usize) -> Option<&'static str> {
        self.values.get(index).map(Value::type_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.values.iter()).finish()
    }
}

impl From<()> for Payload {
    fn from(_: ()) -> Self {
        Self::new()
    }
}

impl From<Vec<Value>> for Payload {
    fn from(values: Vec<Value>) -> Self {
        Self { values }
    }
}

impl FromIterator<Value> for Payload {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

macro_rules! payload_from_tuple {
    ($($name:ident),+) => {
        impl<$($name),+> From<($($name,)+)> for Payload
        where
            $($name: Any + Send + Sync),+
        {
            #[allow(non_snake_case)]
            fn from(($($name,)+): ($($name,)+)) -> Self {
                Self {
                    values: vec![$(Value::new($name)),+],
                }
            }
        }
    };
}

payload_from_tuple!(A);
payload_from_tuple!(A, B);
payload_from_tuple!(A, B, C);
payload_from_tuple!(A, B, C, D);
payload_from_tuple!(A, B, C, D, E);
payload_from_tuple!(A, B, C, D, E, F);
payload_from_tuple!(A, B, C, D, E, F, G);
payload_from_tuple!(A, B, C, D, E, F, G, H);

//! Process-wide registry of registration units
//!
//! Maps the `TypeId` of a subscriber type to the routine that registers its
//! bindings. [`EventBus::register`](crate::EventBus::register) installs a
//! type's unit the first time it is registered; afterwards an instance can be
//! registered as `Arc<dyn Any + Send + Sync>` through
//! [`EventBus::register_dyn`](crate::EventBus::register_dyn).
//!
//! All access goes through one `parking_lot::RwLock`. [`reset`] clears the
//! registry for test isolation.

use crate::binding::{Projection, SubscribeRegister};
use crate::bus::EventBus;
use crate::error::{BusError, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

type Registrar = fn(&EventBus, Arc<dyn Any + Send + Sync>) -> Result<()>;

/// Registration unit of one subscriber type
#[derive(Clone, Copy)]
pub struct UnitEntry {
    type_name: &'static str,
    registrar: Registrar,
}

impl UnitEntry {
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Register `target` on `bus` through this unit
    pub fn register(&self, bus: &EventBus, target: Arc<dyn Any + Send + Sync>) -> Result<()> {
        (self.registrar)(bus, target)
    }
}

impl std::fmt::Debug for UnitEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitEntry")
            .field("type_name", &self.type_name)
            .finish()
    }
}

static UNITS: Lazy<RwLock<HashMap<TypeId, UnitEntry>>> = Lazy::new(|| RwLock::new(HashMap::new()));

fn register_erased<S: SubscribeRegister>(bus: &EventBus, target: Arc<dyn Any + Send + Sync>) -> Result<()> {
    let target = target.downcast::<S>().map_err(|_| BusError::Registration {
        subscriber: type_name::<S>(),
        reason: "registration unit does not match the instance type".to_string(),
    })?;
    S::register_bindings(bus, &target, Projection::identity())
}

/// Install the unit of `S`. Returns `false` if it was already installed.
pub fn install<S: SubscribeRegister>() -> bool {
    let id = TypeId::of::<S>();
    if UNITS.read().contains_key(&id) {
        return false;
    }

    let mut units = UNITS.write();
    if units.contains_key(&id) {
        return false;
    }
    units.insert(
        id,
        UnitEntry {
            type_name: type_name::<S>(),
            registrar: register_erased::<S>,
        },
    );
    trace!(unit = type_name::<S>(), "Registration unit installed");
    true
}

/// Find the unit for a concrete type
pub fn lookup(id: TypeId) -> Option<UnitEntry> {
    UNITS.read().get(&id).copied()
}

/// Names of all installed units
pub fn installed() -> Vec<&'static str> {
    let mut names: Vec<_> = UNITS.read().values().map(UnitEntry::type_name).collect();
    names.sort_unstable();
    names
}

/// Forget every installed unit
pub fn reset() {
    UNITS.write().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::MethodBinding;
    use parking_lot::Mutex;

    // The unit registry is process-wide; `reset` must not race the others
    static REGISTRY: Mutex<()> = Mutex::new(());

    struct Quiet;

    impl SubscribeRegister for Quiet {
        const BINDINGS: &'static [MethodBinding<Self>] = &[];
    }

    struct Unknown;

    #[test]
    fn test_install_is_idempotent() {
        let _registry = REGISTRY.lock();
        install::<Quiet>();
        assert!(!install::<Quiet>());

        let entry = lookup(TypeId::of::<Quiet>()).unwrap();
        assert!(entry.type_name().ends_with("Quiet"));
        assert!(installed().iter().any(|name| name.ends_with("Quiet")));
    }

    #[test]
    fn test_lookup_miss() {
        let _registry = REGISTRY.lock();
        assert!(lookup(TypeId::of::<Unknown>()).is_none());
    }

    #[test]
    fn test_registrar_rejects_wrong_instance() {
        let _registry = REGISTRY.lock();
        install::<Quiet>();
        let entry = lookup(TypeId::of::<Quiet>()).unwrap();
        let bus = EventBus::builder("units-tests").build();

        assert!(entry.register(&bus, Arc::new(Quiet)).is_ok());
        assert!(matches!(
            entry.register(&bus, Arc::new(Unknown)),
            Err(BusError::Registration { .. })
        ));
    }

    #[test]
    fn test_reset_forgets_units() {
        let _registry = REGISTRY.lock();
        install::<Quiet>();
        assert!(lookup(TypeId::of::<Quiet>()).is_some());

        reset();
        assert!(lookup(TypeId::of::<Quiet>()).is_none());
        assert!(installed().is_empty());

        let bus = EventBus::builder("units-tests").build();
        assert!(!bus.register_dyn(Arc::new(Quiet)).unwrap());

        assert!(install::<Quiet>());
        assert!(bus.register_dyn(Arc::new(Quiet)).unwrap());
    }
}

//! Event dispatch registry
//!
//! Routing is two-level. The dispatcher maps (dispatch context, event name) to a set of
//! [`EventClosure`]s; the context's delegate then matches each closure's component name
//! against the component that raised the event. The same event name ("Click") can therefore
//! be used by components in any number of contexts without colliding.

use super::component::Component;
use super::lock;
use log::{debug, info};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// A registered (component name, event name) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventClosure {
    component_name: String,
    event_name: String,
}

impl EventClosure {
    pub fn new(component_name: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            component_name: component_name.into(),
            event_name: event_name.into(),
        }
    }

    pub fn component_name(&self) -> &str {
        &self.component_name
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }
}

/// All closures registered by one Form or Task.
#[derive(Debug)]
struct EventRegistry {
    context: String,
    serial: u64,
    // One closure per component/event pair; multiple handlers for one event are not supported.
    closures: HashMap<String, HashSet<EventClosure>>,
}

impl EventRegistry {
    fn new(context: &str, serial: u64) -> Self {
        Self {
            context: context.to_string(),
            serial,
            closures: HashMap::new(),
        }
    }
}

/// Runtime-owned registry of event closures, one [`EventRegistry`] per dispatch context.
#[derive(Debug, Default)]
pub struct EventDispatcher {
    registries: Mutex<HashMap<String, EventRegistry>>,
    next_serial: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `component_name.event_name` under `context`. Registering the same pair twice
    /// keeps a single closure.
    pub fn register_event_for_delegation(&self, context: &str, component_name: &str, event_name: &str) {
        let mut registries = lock(&self.registries);
        let registry = registries.entry(context.to_string()).or_insert_with(|| {
            let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
            debug!("Creating event registry #{} for context {}", serial, context);
            EventRegistry::new(context, serial)
        });
        registry
            .closures
            .entry(event_name.to_string())
            .or_default()
            .insert(EventClosure::new(component_name, event_name));
        info!("Registered event closure for {}.{} in {}", component_name, event_name, context);
    }

    /// Removes every closure for `event_name` whose component is `component_name`.
    pub fn unregister_event_for_delegation(&self, context: &str, component_name: &str, event_name: &str) {
        let mut registries = lock(&self.registries);
        let Some(closures) = registries
            .get_mut(context)
            .and_then(|registry| registry.closures.get_mut(event_name))
        else {
            return;
        };
        closures.retain(|closure| {
            let keep = closure.component_name != component_name;
            if !keep {
                info!("Deleting event closure for {}.{}", closure.component_name, closure.event_name);
            }
            keep
        });
    }

    /// Clears every registry's closures. The registries themselves stay.
    pub fn unregister_all_events_for_delegation(&self) {
        info!("unregisterAllEventsForDelegation");
        for registry in lock(&self.registries).values_mut() {
            registry.closures.clear();
        }
    }

    /// Clears the closures of a single context.
    pub fn unregister_all_events_of_context(&self, context: &str) {
        info!("unregisterAllEventsOfContext: {}", context);
        if let Some(registry) = lock(&self.registries).get_mut(context) {
            registry.closures.clear();
        }
    }

    /// Deletes the registry for `context`. Called once when a Form or Task is torn down.
    pub fn remove_dispatch_context(&self, context: &str) {
        if let Some(mut registry) = lock(&self.registries).remove(context) {
            debug!("Removed event registry #{} for context {}", registry.serial, registry.context);
            registry.closures.clear();
        }
    }

    pub fn has_dispatch_context(&self, context: &str) -> bool {
        lock(&self.registries).contains_key(context)
    }

    /// Creation serial of the registry currently bound to `context`. A registry recreated
    /// after [`remove_dispatch_context`](Self::remove_dispatch_context) has a new serial.
    pub fn registry_serial(&self, context: &str) -> Option<u64> {
        lock(&self.registries).get(context).map(|registry| registry.serial)
    }

    /// Closures registered for `event_name` in `context`, sorted by component name.
    pub fn registered_closures(&self, context: &str, event_name: &str) -> Vec<EventClosure> {
        let mut closures: Vec<EventClosure> = lock(&self.registries)
            .get(context)
            .and_then(|registry| registry.closures.get(event_name))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        closures.sort();
        closures
    }

    /// Dispatches `event_name` raised by `component` to its registered handler.
    ///
    /// Returns true if at least one delegate-level dispatch ran a handler. The registry lock
    /// is released before the delegate runs, so handlers may register or unregister events.
    pub fn dispatch_event(&self, component: &dyn Component, event_name: &str, args: &[Value]) -> bool {
        debug!("Trying to dispatch event {} from {}", event_name, component.component_name());
        let Some(delegate) = component.dispatch_delegate() else {
            debug!("{} has no dispatch delegate", component.component_name());
            return false;
        };

        if !delegate.can_dispatch_event(component, event_name) {
            debug!("Delegate refused {} from {}", event_name, component.component_name());
            return false;
        }

        let context = delegate.dispatch_context();
        let closures: Vec<EventClosure> = {
            let registries = lock(&self.registries);
            match registries
                .get(&context)
                .and_then(|registry| registry.closures.get(event_name))
            {
                Some(set) => set.iter().cloned().collect(),
                None => return false,
            }
        };

        let mut dispatched = false;
        for closure in &closures {
            if delegate.dispatch_event(component, &closure.component_name, &closure.event_name, args) {
                info!("Successfully dispatched event {}.{}", closure.component_name, closure.event_name);
                dispatched = true;
            }
        }
        dispatched
    }
}

/// Stable key for a component's event handler.
pub fn make_full_event_name(component_name: &str, event_name: &str) -> String {
    format!("{}${}", component_name, event_name)
}

//! Lifecycle listener sets

use super::lock;
use std::sync::{Arc, Mutex};

pub trait OnInitializeListener: Send + Sync {
    fn on_initialize(&self);
}

pub trait OnStopListener: Send + Sync {
    fn on_stop(&self);
}

pub trait OnDestroyListener: Send + Sync {
    fn on_destroy(&self);
}

/// Identity set of listeners. Adding the same `Arc` twice keeps one entry.
pub struct ListenerSet<T: ?Sized> {
    listeners: Mutex<Vec<Arc<T>>>,
}

impl<T: ?Sized> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<T>) {
        let mut listeners = lock(&self.listeners);
        if !listeners.iter().any(|existing| Arc::ptr_eq(existing, &listener)) {
            listeners.push(listener);
        }
    }

    /// Removes `listener`, returning whether it was present.
    pub fn remove(&self, listener: &Arc<T>) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|existing| !Arc::ptr_eq(existing, listener));
        listeners.len() != before
    }

    pub fn contains(&self, listener: &Arc<T>) -> bool {
        lock(&self.listeners)
            .iter()
            .any(|existing| Arc::ptr_eq(existing, listener))
    }

    pub fn clear(&self) {
        lock(&self.listeners).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.listeners).is_empty()
    }

    /// Copy of the current listeners, so callbacks run without holding the lock.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        lock(&self.listeners).clone()
    }
}

impl<T: ?Sized> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The three listener sets every context carries.
#[derive(Default)]
pub struct LifecycleListeners {
    pub on_initialize: ListenerSet<dyn OnInitializeListener>,
    pub on_stop: ListenerSet<dyn OnStopListener>,
    pub on_destroy: ListenerSet<dyn OnDestroyListener>,
}

impl LifecycleListeners {
    pub fn fire_initialize(&self) {
        for listener in self.on_initialize.snapshot() {
            listener.on_initialize();
        }
    }

    pub fn fire_stop(&self) {
        for listener in self.on_stop.snapshot() {
            listener.on_stop();
        }
    }

    pub fn fire_destroy(&self) {
        for listener in self.on_destroy.snapshot() {
            listener.on_destroy();
        }
    }

    pub fn clear(&self) {
        self.on_initialize.clear();
        self.on_stop.clear();
        self.on_destroy.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.on_initialize.is_empty() && self.on_stop.is_empty() && self.on_destroy.is_empty()
    }
}

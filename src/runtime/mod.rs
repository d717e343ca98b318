//! Task and Form runtime
//!
//! Execution contexts (forms and background tasks), the event dispatcher that routes
//! component events to them, and the thread bindings that serialize each context's code.

pub mod broadcast;
pub mod channel;
pub mod component;
pub mod dispatcher;
pub mod errors;
pub mod form;
pub mod intent;
pub mod listeners;
pub mod notification;
pub mod repl;
pub mod store;
pub mod task;
pub mod thread;
pub mod worker;

pub use channel::{ChannelStrategy, Dedicated, Multiplexed};
pub use component::{
    Component, ComponentContainer, ContainerKind, ContextProgram, ContextSupport,
    HandlesEventDispatching, Initializable, NonvisibleComponent,
};
pub use dispatcher::{EventClosure, EventDispatcher};
pub use errors::{ErrorCode, RuntimeError};
pub use form::Form;
pub use intent::Intent;
pub use repl::ReplHost;
pub use store::{Runtime, RuntimeBuilder, RuntimeConfig};
pub use task::{StartCommandResult, Task, TaskType};
pub use thread::{TaskState, TaskThread};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the data if a panicking job poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

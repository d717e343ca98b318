//! Task thread bindings
//!
//! A [`TaskThread`] binds a task name to a dedicated worker and carries the per-task state
//! the worker's jobs need: lifecycle state, task type, listener sets and the notification.
//! In companion mode a binding outlives individual program definitions; [`TaskThread::reset`]
//! wipes the state and keeps the thread.

use super::errors::RuntimeError;
use super::listeners::LifecycleListeners;
use super::lock;
use super::notification::TaskNotification;
use super::task::TaskType;
use super::worker::Worker;
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskState {
    Created,
    ThreadStarted,
    Initializing,
    Initialized,
    Stopping,
    Stopped,
    Destroyed,
}

impl TaskState {
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            (Created, ThreadStarted)
            | (ThreadStarted, Initializing)
            | (Initializing, Initialized)
            | (ThreadStarted | Initializing | Initialized, Stopping)
            | (Stopping, Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskState::Created => "CREATED",
            TaskState::ThreadStarted => "THREAD_STARTED",
            TaskState::Initializing => "INITIALIZING",
            TaskState::Initialized => "INITIALIZED",
            TaskState::Stopping => "STOPPING",
            TaskState::Stopped => "STOPPED",
            TaskState::Destroyed => "DESTROYED",
        };
        f.write_str(label)
    }
}

#[derive(Debug)]
struct BindingState {
    task_type: TaskType,
    lifecycle: TaskState,
    initialized: bool,
    stopped: bool,
}

/// A task name bound to its worker thread and per-task state.
pub struct TaskThread {
    name: String,
    worker: Worker,
    state: Mutex<BindingState>,
    listeners: LifecycleListeners,
    notification: TaskNotification,
}

impl TaskThread {
    pub fn spawn(name: &str, notification: TaskNotification) -> Result<Arc<Self>, RuntimeError> {
        let worker = Worker::spawn(name)?;
        info!("TaskThread {} started", name);
        Ok(Arc::new(Self {
            name: name.to_string(),
            worker,
            state: Mutex::new(BindingState {
                task_type: TaskType::default(),
                lifecycle: TaskState::ThreadStarted,
                initialized: false,
                stopped: false,
            }),
            listeners: LifecycleListeners::default(),
            notification,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> Result<(), RuntimeError> {
        self.worker.post(job)
    }

    /// Blocks until every job posted so far has run.
    pub fn flush(&self) -> Result<(), RuntimeError> {
        self.worker.flush()
    }

    pub fn is_alive(&self) -> bool {
        self.worker.is_alive()
    }

    pub fn task_type(&self) -> TaskType {
        lock(&self.state).task_type
    }

    pub fn set_task_type(&self, task_type: TaskType) {
        lock(&self.state).task_type = task_type;
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.state).initialized
    }

    pub fn set_initialized(&self, initialized: bool) {
        lock(&self.state).initialized = initialized;
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.state).stopped
    }

    /// Latches the stopped flag. Returns false if the task was already stopped.
    pub fn mark_stopped(&self) -> bool {
        let mut state = lock(&self.state);
        if state.stopped {
            return false;
        }
        state.stopped = true;
        true
    }

    pub fn state(&self) -> TaskState {
        lock(&self.state).lifecycle
    }

    /// Moves to `next` if the state machine allows it.
    pub fn transition(&self, next: TaskState) -> bool {
        let mut state = lock(&self.state);
        if !state.lifecycle.can_transition_to(next) {
            warn!("Task {}: refusing transition {} -> {}", self.name, state.lifecycle, next);
            return false;
        }
        debug!("Task {}: {} -> {}", self.name, state.lifecycle, next);
        state.lifecycle = next;
        true
    }

    pub fn listeners(&self) -> &LifecycleListeners {
        &self.listeners
    }

    pub fn notification(&self) -> &TaskNotification {
        &self.notification
    }

    /// Clears flags, listeners and the notification so a new program definition can run on
    /// the same thread. The worker and its queue are untouched.
    pub fn reset(&self) {
        {
            let mut state = lock(&self.state);
            state.initialized = false;
            state.stopped = false;
            state.lifecycle = TaskState::ThreadStarted;
        }
        self.listeners.clear();
        self.notification.reset();
        info!("TaskThread {} reset", self.name);
    }

    /// [`reset`](Self::reset), and the task type goes back to the default.
    pub fn clear(&self) {
        self.reset();
        lock(&self.state).task_type = TaskType::default();
    }

    /// Stops the worker once its queue drains.
    pub fn shutdown(&self) {
        self.worker.shutdown();
    }
}

impl fmt::Debug for TaskThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskThread")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

//! Execution-channel strategies
//!
//! A task gets its worker through a [`ChannelStrategy`] chosen at construction.
//! [`Dedicated`] gives every task a fresh thread for the life of the service.
//! [`Multiplexed`] is the companion mode: many logical tasks live in one host process and
//! each task name keeps a stable thread binding that is reset, not recreated, when the
//! browser pushes a new definition.

use super::errors::RuntimeError;
use super::store::Runtime;
use super::task::{StartCommandResult, TaskType};
use super::thread::TaskThread;
use log::{debug, warn};
use std::sync::Arc;

pub trait ChannelStrategy: Send + Sync {
    fn label(&self) -> &'static str;

    /// Returns the worker binding for `task_name`, registering it in the runtime's thread map.
    fn acquire(&self, runtime: &Runtime, task_name: &str) -> Result<Arc<TaskThread>, RuntimeError>;

    /// Restart policy reported back to the host from `on_start_command`.
    fn start_result(&self, task_type: TaskType) -> StartCommandResult;

    /// Whether a task of `task_type` is stopped when the form stops.
    fn stops_with_form(&self, task_type: TaskType) -> bool;
}

/// One new thread per created task.
#[derive(Debug, Default, Clone, Copy)]
pub struct Dedicated;

impl ChannelStrategy for Dedicated {
    fn label(&self) -> &'static str {
        "dedicated"
    }

    fn acquire(&self, runtime: &Runtime, task_name: &str) -> Result<Arc<TaskThread>, RuntimeError> {
        if let Some(stale) = runtime.task_thread(task_name) {
            warn!("Replacing stale thread binding for {}", task_name);
            stale.shutdown();
        }
        runtime.spawn_task_thread(task_name)
    }

    fn start_result(&self, task_type: TaskType) -> StartCommandResult {
        match task_type {
            // Restart with the last intent if the host kills us.
            TaskType::Screen | TaskType::Sticky => StartCommandResult::RedeliverIntent,
            TaskType::Repeating | TaskType::Quick => StartCommandResult::NotSticky,
        }
    }

    fn stops_with_form(&self, task_type: TaskType) -> bool {
        task_type == TaskType::Screen
    }
}

/// Stable thread per task name, shared across redefinitions.
#[derive(Debug, Default, Clone, Copy)]
pub struct Multiplexed;

impl ChannelStrategy for Multiplexed {
    fn label(&self) -> &'static str {
        "multiplexed"
    }

    fn acquire(&self, runtime: &Runtime, task_name: &str) -> Result<Arc<TaskThread>, RuntimeError> {
        match runtime.task_thread(task_name) {
            Some(thread) if thread.is_alive() => {
                debug!("Reusing thread binding for {}", task_name);
                thread.reset();
                Ok(thread)
            }
            _ => runtime.spawn_task_thread(task_name),
        }
    }

    fn start_result(&self, _task_type: TaskType) -> StartCommandResult {
        StartCommandResult::NotSticky
    }

    fn stops_with_form(&self, _task_type: TaskType) -> bool {
        // Companion tasks never outlive the companion screen.
        true
    }
}

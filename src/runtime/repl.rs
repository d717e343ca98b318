//! Companion task host
//!
//! During live development the browser pushes task definitions over and over. [`ReplHost`]
//! keeps one thread binding per task name and reuses it across definitions, so code already
//! queued for a task keeps its ordering. Bindings are created lazily on first use.

use super::channel::Multiplexed;
use super::component::ContextProgram;
use super::errors::RuntimeError;
use super::intent::{self, Intent, SERVICE_ARG, SERVICE_NAME};
use super::store::Runtime;
use super::task::{StartCommandResult, Task, TaskType};
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;

pub struct ReplHost {
    runtime: Arc<Runtime>,
    strategy: Arc<Multiplexed>,
}

impl ReplHost {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            strategy: Arc::new(Multiplexed),
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Installs a (re)definition of `task_name` on its existing binding.
    ///
    /// Event registrations left by the previous definition are dropped and the binding is
    /// reset before the new program runs.
    pub fn define_task(
        &self,
        task_name: &str,
        task_type: TaskType,
        program: Arc<dyn ContextProgram>,
    ) -> Result<Arc<Task>, RuntimeError> {
        if self.runtime.task(task_name).is_some() {
            info!("Redefining task {}", task_name);
            self.runtime
                .dispatcher()
                .unregister_all_events_of_context(task_name);
        }
        let task = Task::new(&self.runtime, task_name, task_type, program, self.strategy.clone());
        task.on_create()?;
        Ok(task)
    }

    /// Start requests from the companion. Without a task name the host just keeps running.
    pub fn on_start_command(&self, intent: &Intent) -> Result<StartCommandResult, RuntimeError> {
        let Some(task_name) = intent.extra(SERVICE_NAME) else {
            debug!("Start command without a task name");
            return Ok(StartCommandResult::Sticky);
        };
        let raw = intent.extra(SERVICE_ARG);
        let start_value = match intent::decode_json_value(raw, "get start value") {
            Ok(value) => value,
            Err(err) => {
                warn!("{:#}", err);
                Value::String(raw.unwrap_or_default().to_string())
            }
        };
        let name = task_name.to_string();
        self.run_task_code(task_name, move |task| match task {
            Some(task) => task.task_started(start_value),
            None => warn!("Start command for {} before it was defined", name),
        })?;
        Ok(StartCommandResult::NotSticky)
    }

    /// Queues `job` on the binding for `task_name`, creating the binding if needed.
    /// The job receives the task currently defined under that name, if any.
    pub fn run_task_code(
        &self,
        task_name: &str,
        job: impl FnOnce(Option<Arc<Task>>) + Send + 'static,
    ) -> Result<(), RuntimeError> {
        let thread = self.runtime.get_or_spawn_task_thread(task_name)?;
        let runtime = self.runtime.clone();
        let name = task_name.to_string();
        thread.post(move || job(runtime.task(&name)))
    }

    /// Resets the binding for `task_name` without stopping its thread.
    pub fn reset_task(&self, task_name: &str) -> bool {
        match self.runtime.task_thread(task_name) {
            Some(thread) => {
                thread.reset();
                true
            }
            None => false,
        }
    }

    /// Stops `task_name` on its own thread.
    pub fn clear_single_task(&self, task_name: &str) -> Result<(), RuntimeError> {
        if self.runtime.task(task_name).is_some() {
            return self.runtime.run_on_task_thread(task_name, |task| task.do_stop());
        }
        // A binding with no definition behind it only needs its thread stopped.
        if let Some(thread) = self.runtime.task_thread(task_name) {
            let runtime = self.runtime.clone();
            let name = task_name.to_string();
            let binding = thread.clone();
            thread.post(move || {
                runtime.remove_task_thread(&name, &binding);
                binding.shutdown();
            })?;
        }
        Ok(())
    }

    /// Stops every task and prunes dead bindings.
    pub fn clear_all_tasks(&self) -> Result<(), RuntimeError> {
        for task_name in self.runtime.thread_names() {
            if let Err(err) = self.clear_single_task(&task_name) {
                warn!("Could not clear task {}: {}", task_name, err);
            }
        }
        self.runtime.collect_garbage();
        Ok(())
    }
}

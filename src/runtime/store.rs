//! Runtime-owned state
//!
//! [`Runtime`] holds everything that would otherwise be process-wide: the task map, the
//! thread bindings, the event dispatcher, live forms, and the service registry the host uses
//! to create tasks on demand. Independent runtimes never share state, which keeps tests
//! isolated.

use super::broadcast::{LocalBroadcastManager, ReceiverId};
use super::channel::Dedicated;
use super::component::{ComponentContainer, ContextProgram};
use super::dispatcher::EventDispatcher;
use super::errors::{ErrorCode, RuntimeError};
use super::form::Form;
use super::intent::{
    self, Intent, LOCAL_ACTION_SEND_MESSAGE, PARAM_FORM_NAME, PARAM_MESSAGE, PARAM_TASK_NAME,
    PARAM_TITLE, SERVICE_NAME,
};
use super::lock;
use super::notification::{
    LogNotificationManager, LogNotifier, NotificationManager, Notifier, TaskNotification,
};
use super::task::{StartCommandResult, Task, TaskType};
use super::thread::TaskThread;
use super::worker;
use anyhow::Context;
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Tunables for a runtime instance.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Minimum time between two default error alerts from one context.
    pub toast_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            toast_interval: Duration::from_secs(10),
        }
    }
}

/// A service the host can start by name.
#[derive(Clone)]
struct ServiceDefinition {
    task_type: TaskType,
    program: Arc<dyn ContextProgram>,
}

pub struct Runtime {
    config: RuntimeConfig,
    dispatcher: EventDispatcher,
    broadcast: LocalBroadcastManager,
    tasks: Mutex<HashMap<String, Arc<Task>>>,
    threads: Mutex<HashMap<String, Arc<TaskThread>>>,
    forms: Mutex<HashMap<String, Arc<Form>>>,
    active_form: Mutex<Option<String>>,
    services: Mutex<HashMap<String, ServiceDefinition>>,
    task_receiver: Mutex<Option<ReceiverId>>,
    notifications: Arc<dyn NotificationManager>,
    notifier: Arc<dyn Notifier>,
    notification_counter: AtomicU32,
    self_ref: Weak<Runtime>,
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    notifications: Arc<dyn NotificationManager>,
    notifier: Arc<dyn Notifier>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            notifications: Arc::new(LogNotificationManager),
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn toast_interval(mut self, interval: Duration) -> Self {
        self.config.toast_interval = interval;
        self
    }

    pub fn notification_manager(mut self, manager: Arc<dyn NotificationManager>) -> Self {
        self.notifications = manager;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn build(self) -> Arc<Runtime> {
        Arc::new_cyclic(|self_ref| Runtime {
            config: self.config,
            dispatcher: EventDispatcher::new(),
            broadcast: LocalBroadcastManager::new(),
            tasks: Mutex::new(HashMap::new()),
            threads: Mutex::new(HashMap::new()),
            forms: Mutex::new(HashMap::new()),
            active_form: Mutex::new(None),
            services: Mutex::new(HashMap::new()),
            task_receiver: Mutex::new(None),
            notifications: self.notifications,
            notifier: self.notifier,
            notification_counter: AtomicU32::new(0),
            self_ref: self_ref.clone(),
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Runtime with default configuration and logging notification backends.
    pub fn new() -> Arc<Self> {
        RuntimeBuilder::new().build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn broadcast(&self) -> &LocalBroadcastManager {
        &self.broadcast
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn notification_manager(&self) -> &Arc<dyn NotificationManager> {
        &self.notifications
    }

    fn arc(&self) -> Result<Arc<Runtime>, RuntimeError> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| RuntimeError::ContextDestroyed("runtime".to_string()))
    }

    // Task map

    /// The live task registered as `task_name`.
    pub fn task(&self, task_name: &str) -> Option<Arc<Task>> {
        lock(&self.tasks).get(task_name).cloned()
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.tasks).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn task_count(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Adds `task` to the task map; the first task installs the shared message receiver.
    pub(crate) fn register_task(&self, task: Arc<Task>) {
        let was_empty = {
            let mut tasks = lock(&self.tasks);
            let was_empty = tasks.is_empty();
            if let Some(previous) = tasks.insert(task.name().to_string(), task.clone()) {
                if !Arc::ptr_eq(&previous, &task) {
                    info!("Task {} replaced by a new definition", task.name());
                }
            }
            was_empty
        };
        if was_empty {
            self.install_task_receiver();
        }
    }

    /// Removes `task` from the map if it is still the registered instance.
    pub(crate) fn remove_task(&self, task: &Task) -> bool {
        let mut tasks = lock(&self.tasks);
        let owned = tasks
            .get(task.name())
            .is_some_and(|registered| std::ptr::eq(registered.as_ref(), task));
        if owned {
            tasks.remove(task.name());
        }
        owned
    }

    // Thread bindings

    pub fn task_thread(&self, task_name: &str) -> Option<Arc<TaskThread>> {
        lock(&self.threads).get(task_name).cloned()
    }

    pub fn thread_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.threads).keys().cloned().collect();
        names.sort();
        names
    }

    /// Starts a new binding for `task_name`, replacing any existing entry.
    pub fn spawn_task_thread(&self, task_name: &str) -> Result<Arc<TaskThread>, RuntimeError> {
        let sequence = self.notification_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let notification = TaskNotification::new(task_name, sequence, self.notifications.clone());
        let thread = TaskThread::spawn(task_name, notification)?;
        lock(&self.threads).insert(task_name.to_string(), thread.clone());
        Ok(thread)
    }

    /// The live binding for `task_name`, started on first use.
    pub fn get_or_spawn_task_thread(&self, task_name: &str) -> Result<Arc<TaskThread>, RuntimeError> {
        match self.task_thread(task_name) {
            Some(thread) if thread.is_alive() => Ok(thread),
            _ => self.spawn_task_thread(task_name),
        }
    }

    /// Removes the binding for `task_name` if it is still `thread`.
    pub(crate) fn remove_task_thread(&self, task_name: &str, thread: &Arc<TaskThread>) -> bool {
        let mut threads = lock(&self.threads);
        let owned = threads
            .get(task_name)
            .is_some_and(|registered| Arc::ptr_eq(registered, thread));
        if owned {
            threads.remove(task_name);
        }
        owned
    }

    /// Drops bindings whose worker has exited and releases spare map capacity.
    pub fn collect_garbage(&self) -> usize {
        let mut threads = lock(&self.threads);
        let before = threads.len();
        threads.retain(|_, thread| thread.is_alive());
        threads.shrink_to_fit();
        lock(&self.tasks).shrink_to_fit();
        let pruned = before - threads.len();
        debug!("Collected {} dead thread bindings", pruned);
        pruned
    }

    /// Posts `job` to the worker of `task_name`. The job receives the task handle.
    pub fn run_on_task_thread(
        &self,
        task_name: &str,
        job: impl FnOnce(&Arc<Task>) + Send + 'static,
    ) -> Result<(), RuntimeError> {
        let task = self
            .task(task_name)
            .ok_or_else(|| RuntimeError::NoSuchTask(task_name.to_string()))?;
        task.post(job)
    }

    /// The task whose worker is running the calling code.
    pub fn current_task(&self) -> Result<Arc<Task>, RuntimeError> {
        let thread = std::thread::current().name().unwrap_or("<unnamed>").to_string();
        let context = worker::current_context().ok_or_else(|| RuntimeError::NotOnTaskThread {
            thread: thread.clone(),
        })?;
        self.task(&context).ok_or_else(|| {
            debug!("There is no task for TaskThread: {}", context);
            RuntimeError::NotOnTaskThread { thread }
        })
    }

    /// The binding whose worker is running the calling code.
    pub fn current_task_thread(&self) -> Result<Arc<TaskThread>, RuntimeError> {
        let thread = std::thread::current().name().unwrap_or("<unnamed>").to_string();
        worker::current_context()
            .and_then(|context| self.task_thread(&context))
            .ok_or(RuntimeError::NotOnTaskThread { thread })
    }

    pub fn current_task_name(&self) -> Result<String, RuntimeError> {
        Ok(self.current_task()?.name().to_string())
    }

    // Service host

    /// Makes `task_name` startable through [`start_service`](Self::start_service).
    pub fn register_service(
        &self,
        task_name: &str,
        task_type: TaskType,
        program: Arc<dyn ContextProgram>,
    ) {
        lock(&self.services).insert(
            task_name.to_string(),
            ServiceDefinition { task_type, program },
        );
    }

    /// Starts the service named by the intent's `SERVICE_NAME`, creating it on first start,
    /// then delivers the start command.
    pub fn start_service(&self, intent: &Intent) -> anyhow::Result<StartCommandResult> {
        let task_name = intent
            .extra(SERVICE_NAME)
            .context("Start intent carries no SERVICE_NAME")?;

        let task = match self.task(task_name) {
            Some(task) => task,
            None => {
                let definition = lock(&self.services)
                    .get(task_name)
                    .cloned()
                    .with_context(|| format!("No service registered as '{}'", task_name))?;
                let task = Task::new(
                    &self.arc()?,
                    task_name,
                    definition.task_type,
                    definition.program,
                    Arc::new(Dedicated),
                );
                task.on_create()?;
                task
            }
        };
        Ok(task.on_start_command(intent)?)
    }

    // Forms

    pub fn form(&self, form_name: &str) -> Option<Arc<Form>> {
        lock(&self.forms).get(form_name).cloned()
    }

    pub(crate) fn register_form(&self, form: Arc<Form>) {
        let name = form.name().to_string();
        lock(&self.forms).insert(name.clone(), form);
        *lock(&self.active_form) = Some(name);
    }

    pub(crate) fn remove_form(&self, form: &Form) {
        let mut forms = lock(&self.forms);
        let owned = forms
            .get(form.name())
            .is_some_and(|registered| std::ptr::eq(registered.as_ref(), form));
        if owned {
            forms.remove(form.name());
        }
        let mut active = lock(&self.active_form);
        if active.as_deref() == Some(form.name()) {
            *active = None;
        }
    }

    /// The most recently created form that is still alive.
    pub fn active_form(&self) -> Option<Arc<Form>> {
        let name = lock(&self.active_form).clone()?;
        self.form(&name)
    }

    pub fn set_active_form(&self, form_name: &str) {
        *lock(&self.active_form) = Some(form_name.to_string());
    }

    /// Called when a form stops: stops every task that must not outlive the screen.
    pub fn on_form_stop(&self) {
        let tasks: Vec<Arc<Task>> = lock(&self.tasks).values().cloned().collect();
        for task in tasks {
            if !task.strategy().stops_with_form(task.task_type()) {
                continue;
            }
            info!("Stopping task {} with its form", task.name());
            if let Err(err) = task.post(|task| task.do_stop()) {
                warn!("Could not stop task {}: {}", task.name(), err);
            }
        }
    }

    // Inter-context messaging

    fn install_task_receiver(&self) {
        let mut receiver = lock(&self.task_receiver);
        if receiver.is_some() {
            return;
        }
        let runtime = self.self_ref.clone();
        let id = self.broadcast.register_receiver(
            LOCAL_ACTION_SEND_MESSAGE,
            Arc::new(move |intent: &Intent| {
                // Only messages sent by a form are addressed to tasks.
                let Some(form_name) = intent.extra(PARAM_FORM_NAME) else {
                    return;
                };
                let Some(runtime) = runtime.upgrade() else {
                    return;
                };
                let task_name = intent.extra(PARAM_TASK_NAME).unwrap_or_default();
                let title = intent.extra(PARAM_TITLE).unwrap_or_default();
                debug!("Received from form {} for task {}: {}", form_name, task_name, title);
                let message = decode_message(intent.extra(PARAM_MESSAGE), "receive from screen");
                runtime.trigger_received_from_screen(task_name, title, message);
            }),
        );
        *receiver = Some(id);
    }

    /// Unregisters the shared task receiver once no task is left.
    pub(crate) fn release_task_receiver(&self) {
        if self.task_count() > 0 {
            return;
        }
        if let Some(id) = lock(&self.task_receiver).take() {
            self.broadcast.unregister_receiver(id);
            debug!("Last task gone; task message receiver removed");
        }
    }

    pub fn has_task_receiver(&self) -> bool {
        lock(&self.task_receiver).is_some()
    }

    /// Delivers a form's message to `task_name`, or reports it to the active form when the
    /// task is not running.
    pub fn trigger_received_from_screen(&self, task_name: &str, title: &str, message: Value) {
        match self.task(task_name) {
            Some(task) => {
                let title = title.to_string();
                if let Err(err) = task.post(move |task| task.received_from_screen(&title, message)) {
                    warn!("Could not deliver message to {}: {}", task_name, err);
                }
            }
            None => {
                warn!("Message for task {} which is not running", task_name);
                if let Some(form) = self.active_form() {
                    form.dispatch_error_occurred_event(
                        form.name(),
                        "SendToTask",
                        ErrorCode::SendingMessageToUnavailableTask,
                        &[task_name.to_string()],
                    );
                }
            }
        }
    }

    /// Stops every worker and forgets all contexts.
    pub fn shutdown(&self) {
        let threads: Vec<Arc<TaskThread>> = lock(&self.threads).drain().map(|(_, t)| t).collect();
        for thread in threads {
            thread.shutdown();
        }
        lock(&self.tasks).clear();
        let forms: Vec<Arc<Form>> = lock(&self.forms).drain().map(|(_, f)| f).collect();
        for form in forms {
            form.worker().shutdown();
        }
        if let Some(id) = lock(&self.task_receiver).take() {
            self.broadcast.unregister_receiver(id);
        }
        info!("Runtime shut down");
    }
}

/// Decodes a JSON message extra, falling back to the raw text.
pub(crate) fn decode_message(text: Option<&str>, purpose: &str) -> Value {
    match intent::decode_json_value(text, purpose) {
        Ok(value) => value,
        Err(err) => {
            warn!("{:#}", err);
            Value::String(text.unwrap_or_default().to_string())
        }
    }
}

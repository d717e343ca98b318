//! Background tasks
//!
//! A [`Task`] is a headless execution context: it owns components, receives events through
//! the dispatcher, and runs all of its program code on one worker thread. The host drives it
//! through `on_create`, `on_start_command` and `on_destroy`; everything else happens on the
//! worker.
//!
//! ```text
//! on_create ──► [worker] define ─► Initialize ─► initialized
//! on_start_command ──► [worker] TaskStarted(start value)
//! stop / form stop ──► do_stop ─► on_stop ─► on_destroy
//! ```

use super::channel::ChannelStrategy;
use super::component::{
    self, Component, ComponentContainer, ContainerKind, ContextProgram, HandlesEventDispatching,
};
use super::errors::{ErrorCode, RuntimeError, format_message};
use super::form::Form;
use super::intent::{
    self, Intent, LOCAL_ACTION_SEND_MESSAGE, PARAM_MESSAGE, PARAM_TASK_NAME, PARAM_TITLE,
    SERVICE_ARG,
};
use super::listeners::{OnDestroyListener, OnInitializeListener, OnStopListener};
use super::lock;
use super::notification::ToastThrottle;
use super::store::Runtime;
use super::thread::{TaskState, TaskThread};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// How a task relates to the screen and to the host's restart policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Lives and dies with the form.
    #[default]
    Screen,
    /// Foreground task with an ongoing notification.
    Sticky,
    Repeating,
    Quick,
}

impl TaskType {
    pub fn code(self) -> i32 {
        match self {
            TaskType::Screen => 0,
            TaskType::Sticky => 1,
            TaskType::Repeating => 2,
            TaskType::Quick => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(TaskType::Screen),
            1 => Some(TaskType::Sticky),
            2 => Some(TaskType::Repeating),
            3 => Some(TaskType::Quick),
            _ => None,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskType::Screen => "screen",
            TaskType::Sticky => "sticky",
            TaskType::Repeating => "repeating",
            TaskType::Quick => "quick",
        };
        f.write_str(label)
    }
}

impl FromStr for TaskType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "screen" => Ok(TaskType::Screen),
            "sticky" => Ok(TaskType::Sticky),
            "repeating" => Ok(TaskType::Repeating),
            "quick" => Ok(TaskType::Quick),
            other => other
                .parse::<i32>()
                .ok()
                .and_then(TaskType::from_code)
                .ok_or_else(|| anyhow::anyhow!("Unknown task type: {}", s)),
        }
    }
}

/// Restart policy handed back to the host from `on_start_command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StartCommandResult {
    Sticky,
    NotSticky,
    RedeliverIntent,
}

pub struct Task {
    name: String,
    runtime: Arc<Runtime>,
    program: Arc<dyn ContextProgram>,
    strategy: Arc<dyn ChannelStrategy>,
    initial_type: TaskType,
    thread: Mutex<Option<Arc<TaskThread>>>,
    components: Mutex<Vec<Arc<dyn Component>>>,
    toast: ToastThrottle,
    destroyed: AtomicBool,
    self_ref: Weak<Task>,
}

impl Task {
    pub fn new(
        runtime: &Arc<Runtime>,
        name: &str,
        task_type: TaskType,
        program: Arc<dyn ContextProgram>,
        strategy: Arc<dyn ChannelStrategy>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            name: name.to_string(),
            runtime: runtime.clone(),
            program,
            strategy,
            initial_type: task_type,
            thread: Mutex::new(None),
            components: Mutex::new(Vec::new()),
            toast: ToastThrottle::new(runtime.config().toast_interval),
            destroyed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> &Arc<dyn ChannelStrategy> {
        &self.strategy
    }

    /// The worker binding, once `on_create` has run.
    pub fn thread(&self) -> Option<Arc<TaskThread>> {
        lock(&self.thread).clone()
    }

    fn bound_thread(&self) -> Result<Arc<TaskThread>, RuntimeError> {
        self.thread()
            .ok_or_else(|| RuntimeError::ContextDestroyed(self.name.clone()))
    }

    fn arc(&self) -> Result<Arc<Task>, RuntimeError> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| RuntimeError::ContextDestroyed(self.name.clone()))
    }

    /// Posts `job` to this task's worker.
    pub fn post(&self, job: impl FnOnce(&Arc<Task>) + Send + 'static) -> Result<(), RuntimeError> {
        let thread = self.bound_thread()?;
        let task = self.arc()?;
        thread.post(move || job(&task))
    }

    /// Blocks until every job posted so far has run.
    pub fn flush(&self) -> Result<(), RuntimeError> {
        self.bound_thread()?.flush()
    }

    pub fn state(&self) -> TaskState {
        if self.destroyed.load(Ordering::SeqCst) {
            return TaskState::Destroyed;
        }
        self.thread()
            .map_or(TaskState::Created, |thread| thread.state())
    }

    pub fn is_initialized(&self) -> bool {
        self.thread().is_some_and(|thread| thread.is_initialized())
    }

    // Host lifecycle

    /// Binds the worker, registers the task, and queues definition and initialization.
    pub fn on_create(&self) -> Result<(), RuntimeError> {
        let thread = self.strategy.acquire(&self.runtime, &self.name)?;
        thread.set_task_type(self.initial_type);
        *lock(&self.thread) = Some(thread.clone());
        self.runtime.register_task(self.arc()?);
        info!("Task {} created ({})", self.name, self.strategy.label());

        self.post(|task| {
            if let Some(thread) = task.thread() {
                thread.transition(TaskState::Initializing);
            }
            if let Err(err) = task.define() {
                error!("Task {} failed to define: {:#}", task.name, err);
                task.dispatch_error_occurred_event(
                    &task.name,
                    "$define",
                    ErrorCode::DefineFailed,
                    &[task.name.clone(), err.to_string()],
                );
                return;
            }
            task.initialize();
        })
    }

    fn define(self: &Arc<Self>) -> anyhow::Result<()> {
        let container: Arc<dyn ComponentContainer> = self.clone();
        self.program.define(&container)?;
        for child in self.components() {
            component::call_initialize(child.as_ref())?;
        }
        Ok(())
    }

    /// Delivers a start request. Sticky tasks go to the foreground first; the start value is
    /// decoded from JSON and handed to `TaskStarted` on the worker.
    pub fn on_start_command(&self, intent: &Intent) -> Result<StartCommandResult, RuntimeError> {
        let thread = self.bound_thread()?;
        let task_type = thread.task_type();
        info!("Task {} got start command ({})", self.name, task_type);
        if task_type == TaskType::Sticky {
            thread.notification().show();
        }

        let raw = intent.extra(SERVICE_ARG);
        let start_value = match intent::decode_json_value(raw, "get start value") {
            Ok(value) => value,
            Err(err) => {
                warn!("Task {}: {:#}", self.name, err);
                self.dispatch_error_occurred_event(
                    &self.name,
                    "TaskStarted",
                    ErrorCode::DecodeJsonValue,
                    &[raw.unwrap_or_default().to_string(), "get start value".to_string()],
                );
                Value::String(raw.unwrap_or_default().to_string())
            }
        };
        self.post(move |task| task.task_started(start_value))?;
        Ok(self.strategy.start_result(task_type))
    }

    /// Fires `Initialize`, then opens the gate for other events and notifies listeners.
    pub fn initialize(&self) {
        let Some(thread) = self.thread() else {
            return;
        };
        info!("Task {} initializing", self.name);
        self.runtime
            .dispatcher()
            .dispatch_event(self, "Initialize", &[]);
        thread.set_initialized(true);
        if thread.state() != TaskState::Initialized {
            thread.transition(TaskState::Initialized);
        }
        if thread.task_type() == TaskType::Sticky && !thread.notification().is_showing() {
            thread.notification().show();
        }
        thread.listeners().fire_initialize();
    }

    pub fn task_started(&self, start_value: Value) {
        debug!("Task {} started with {}", self.name, start_value);
        self.runtime
            .dispatcher()
            .dispatch_event(self, "TaskStarted", &[start_value]);
    }

    /// True once a newer definition has taken over this task's name. The binding, its
    /// listeners and its registry then belong to that definition.
    fn is_superseded(&self) -> bool {
        self.runtime
            .task(&self.name)
            .is_some_and(|current| !std::ptr::eq(current.as_ref(), self))
    }

    /// Stops the task once: stop listeners, `on_stop`, then teardown.
    pub fn do_stop(&self) {
        let Some(thread) = self.thread() else {
            return;
        };
        if self.is_superseded() {
            debug!("Task {} superseded; stop ignored", self.name);
            self.destroyed.store(true, Ordering::SeqCst);
            return;
        }
        if !thread.mark_stopped() {
            debug!("Task {} already stopped", self.name);
            return;
        }
        info!("Task {} stopping", self.name);
        if thread.task_type() != TaskType::Screen {
            thread.transition(TaskState::Stopping);
        }
        thread.listeners().fire_stop();
        self.on_stop();
        self.on_destroy();
    }

    pub fn on_stop(&self) {
        let Some(thread) = self.thread() else {
            return;
        };
        thread.notification().hide();
        if thread.task_type() != TaskType::Screen {
            thread.transition(TaskState::Stopped);
        }
    }

    /// Tears the task down. Safe to call more than once.
    pub fn on_destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(thread) = self.thread() else {
            return;
        };
        if self.is_superseded() {
            debug!("Task {} superseded; leaving its binding alone", self.name);
            return;
        }
        info!("Task {} destroyed", self.name);
        thread.listeners().fire_destroy();
        self.runtime.remove_task(self);
        self.runtime.release_task_receiver();

        self.runtime
            .dispatcher()
            .remove_dispatch_context(&self.name);
        thread.transition(TaskState::Destroyed);
        self.runtime.remove_task_thread(&self.name, &thread);
        thread.shutdown();
    }

    // Task functions

    pub fn stop(&self) {
        self.do_stop();
    }

    /// Broadcasts a message to the forms.
    pub fn send_to_screen(&self, title: &str, message: &Value) {
        let intent = Intent::with_action(LOCAL_ACTION_SEND_MESSAGE)
            .put_extra(PARAM_TASK_NAME, self.name.clone())
            .put_extra(PARAM_TITLE, title)
            .put_extra(PARAM_MESSAGE, message.to_string());
        let delivered = self.runtime.broadcast().send_broadcast(&intent);
        debug!("Task {} sent '{}' to {} receivers", self.name, title, delivered);
    }

    pub fn received_from_screen(&self, title: &str, message: Value) {
        self.runtime.dispatcher().dispatch_event(
            self,
            "ReceivedFromScreen",
            &[json!(title), message],
        );
    }

    /// Runs the `ErrorOccurred` handler, or shows a throttled alert when none handled it.
    pub fn error_occurred(
        &self,
        component_name: &str,
        function_name: &str,
        error_number: i32,
        message: &str,
    ) {
        error!(
            "Task {} error in {}.{}: {} {}",
            self.name, component_name, function_name, error_number, message
        );
        let args = [
            json!(component_name),
            json!(function_name),
            json!(error_number),
            json!(message),
        ];
        let handled = self
            .runtime
            .dispatcher()
            .dispatch_event(self, "ErrorOccurred", &args);
        if handled || !self.is_initialized() {
            return;
        }
        if self.toast.allow() {
            self.runtime
                .notifier()
                .show_alert(&self.name, &format!("Error {}: {}", error_number, message));
        } else {
            debug!("Alert suppressed for task {}", self.name);
        }
    }

    pub fn show_notification(&self) {
        if let Some(thread) = self.thread() {
            thread.notification().show();
        }
    }

    pub fn hide_notification(&self) {
        if let Some(thread) = self.thread() {
            thread.notification().hide();
        }
    }

    pub fn notification_title(&self) -> String {
        self.thread()
            .map(|thread| thread.notification().content_title())
            .unwrap_or_default()
    }

    pub fn set_notification_title(&self, title: &str) {
        if let Some(thread) = self.thread() {
            thread.notification().set_content_title(title);
            thread.notification().update();
        }
    }

    pub fn notification_text(&self) -> String {
        self.thread()
            .map(|thread| thread.notification().content_text())
            .unwrap_or_default()
    }

    pub fn set_notification_text(&self, text: &str) {
        if let Some(thread) = self.thread() {
            thread.notification().set_content_text(text);
            thread.notification().update();
        }
    }

    pub fn task_type(&self) -> TaskType {
        self.thread()
            .map_or(self.initial_type, |thread| thread.task_type())
    }

    pub fn set_task_type(&self, task_type: TaskType) {
        if let Some(thread) = self.thread() {
            thread.set_task_type(task_type);
        }
    }

    pub fn register_for_on_initialize(&self, listener: Arc<dyn OnInitializeListener>) {
        if let Some(thread) = self.thread() {
            thread.listeners().on_initialize.add(listener);
        }
    }

    pub fn register_for_on_stop(&self, listener: Arc<dyn OnStopListener>) {
        if let Some(thread) = self.thread() {
            thread.listeners().on_stop.add(listener);
        }
    }

    pub fn register_for_on_destroy(&self, listener: Arc<dyn OnDestroyListener>) {
        if let Some(thread) = self.thread() {
            thread.listeners().on_destroy.add(listener);
        }
    }

    /// Destroys a component right away and drops its destroy registration.
    pub fn delete_component(&self, component: &Arc<dyn OnDestroyListener>) {
        if let Some(thread) = self.thread() {
            thread.listeners().on_destroy.remove(component);
        }
        component.on_destroy();
    }
}

impl Component for Task {
    fn component_name(&self) -> &str {
        &self.name
    }

    fn dispatch_delegate(&self) -> Option<Arc<dyn HandlesEventDispatching>> {
        let task: Arc<dyn HandlesEventDispatching> = self.self_ref.upgrade()?;
        Some(task)
    }
}

impl HandlesEventDispatching for Task {
    fn can_dispatch_event(&self, component: &dyn Component, event_name: &str) -> bool {
        if self.is_initialized() {
            return true;
        }
        component::same_component(component, self) && event_name == "Initialize"
    }

    fn dispatch_context(&self) -> String {
        self.name.clone()
    }

    fn dispatch_event(
        &self,
        component: &dyn Component,
        component_name: &str,
        event_name: &str,
        args: &[Value],
    ) -> bool {
        if component.component_name() != component_name {
            return false;
        }
        self.program
            .handle_event(self, component_name, event_name, args)
    }
}

impl ComponentContainer for Task {
    fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    fn context_name(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> ContainerKind {
        ContainerKind::Task
    }

    fn form(&self) -> Option<Arc<Form>> {
        None
    }

    fn task(&self) -> Option<Arc<Task>> {
        self.self_ref.upgrade()
    }

    fn delegate(&self) -> Option<Arc<dyn HandlesEventDispatching>> {
        self.dispatch_delegate()
    }

    fn add(&self, component: Arc<dyn Component>) {
        lock(&self.components).push(component);
    }

    fn components(&self) -> Vec<Arc<dyn Component>> {
        lock(&self.components).clone()
    }

    fn run_on_context_thread(&self, job: Box<dyn FnOnce() + Send>) -> Result<(), RuntimeError> {
        self.bound_thread()?.post(job)
    }

    fn dispatch_error_occurred_event(
        &self,
        component_name: &str,
        function_name: &str,
        code: ErrorCode,
        message_args: &[String],
    ) {
        let message = format_message(code, message_args);
        let component_name = component_name.to_string();
        let function_name = function_name.to_string();
        let number = code.number();
        let posted = self.post(move |task| {
            task.error_occurred(&component_name, &function_name, number, &message)
        });
        if let Err(err) = posted {
            warn!("Task {} could not report error {}: {}", self.name, number, err);
        }
    }

    /// Tasks have no screen to show a dialog on, so this reports like
    /// [`dispatch_error_occurred_event`](Self::dispatch_error_occurred_event) and falls back to
    /// the throttled alert.
    fn dispatch_error_occurred_event_dialog(
        &self,
        component_name: &str,
        function_name: &str,
        code: ErrorCode,
        message_args: &[String],
    ) {
        debug!("Task {} cannot show a dialog for error {}", self.name, code.number());
        self.dispatch_error_occurred_event(component_name, function_name, code, message_args);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("strategy", &self.strategy.label())
            .finish()
    }
}

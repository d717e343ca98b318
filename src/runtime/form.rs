//! Screens
//!
//! A [`Form`] is the foreground context. It runs its program on its own worker (the UI
//! thread), starts tasks through the runtime's service host, and exchanges messages with
//! tasks over the local broadcast channel.

use super::broadcast::ReceiverId;
use super::component::{
    self, Component, ComponentContainer, ContainerKind, ContextProgram, HandlesEventDispatching,
};
use super::errors::{ErrorCode, RuntimeError, format_message};
use super::intent::{
    Intent, LOCAL_ACTION_SEND_MESSAGE, PARAM_FORM_NAME, PARAM_MESSAGE, PARAM_TASK_NAME,
    PARAM_TITLE,
};
use super::listeners::LifecycleListeners;
use super::lock;
use super::notification::ToastThrottle;
use super::store::{Runtime, decode_message};
use super::task::{StartCommandResult, Task};
use super::worker::Worker;
use log::{debug, error, info, warn};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub struct Form {
    name: String,
    runtime: Arc<Runtime>,
    program: Arc<dyn ContextProgram>,
    worker: Worker,
    initialized: AtomicBool,
    destroyed: AtomicBool,
    components: Mutex<Vec<Arc<dyn Component>>>,
    listeners: LifecycleListeners,
    receiver: Mutex<Option<ReceiverId>>,
    toast: ToastThrottle,
    self_ref: Weak<Form>,
}

impl Form {
    pub fn new(
        runtime: &Arc<Runtime>,
        name: &str,
        program: Arc<dyn ContextProgram>,
    ) -> Result<Arc<Self>, RuntimeError> {
        let worker = Worker::spawn(name)?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            name: name.to_string(),
            runtime: runtime.clone(),
            program,
            worker,
            initialized: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            components: Mutex::new(Vec::new()),
            listeners: LifecycleListeners::default(),
            receiver: Mutex::new(None),
            toast: ToastThrottle::new(runtime.config().toast_interval),
            self_ref: self_ref.clone(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn listeners(&self) -> &LifecycleListeners {
        &self.listeners
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn arc(&self) -> Result<Arc<Form>, RuntimeError> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| RuntimeError::ContextDestroyed(self.name.clone()))
    }

    /// Posts `job` to the form's worker.
    pub fn post(&self, job: impl FnOnce(&Arc<Form>) + Send + 'static) -> Result<(), RuntimeError> {
        let form = self.arc()?;
        self.worker.post(move || job(&form))
    }

    pub fn flush(&self) -> Result<(), RuntimeError> {
        self.worker.flush()
    }

    /// Registers the form as active, subscribes to task messages and queues the program.
    pub fn on_create(&self) -> Result<(), RuntimeError> {
        let form = self.arc()?;
        self.runtime.register_form(form);

        let weak = self.self_ref.clone();
        let id = self.runtime.broadcast().register_receiver(
            LOCAL_ACTION_SEND_MESSAGE,
            Arc::new(move |intent: &Intent| {
                // Messages carrying a form name go the other way.
                if intent.extra(PARAM_FORM_NAME).is_some() {
                    return;
                }
                let Some(form) = weak.upgrade() else {
                    return;
                };
                let task_name = intent.extra(PARAM_TASK_NAME).unwrap_or_default().to_string();
                let title = intent.extra(PARAM_TITLE).unwrap_or_default().to_string();
                let message = decode_message(intent.extra(PARAM_MESSAGE), "receive from task");
                if let Err(err) =
                    form.post(move |form| form.received_from_task(&task_name, &title, message))
                {
                    warn!("Form {} dropped a task message: {}", form.name, err);
                }
            }),
        );
        *lock(&self.receiver) = Some(id);
        info!("Form {} created", self.name);

        self.post(|form| {
            if let Err(err) = form.define() {
                error!("Form {} failed to define: {:#}", form.name, err);
                form.dispatch_error_occurred_event(
                    &form.name,
                    "$define",
                    ErrorCode::DefineFailed,
                    &[form.name.clone(), err.to_string()],
                );
                return;
            }
            form.initialize();
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

    pub fn initialize(&self) {
        self.runtime
            .dispatcher()
            .dispatch_event(self, "Initialize", &[]);
        self.initialized.store(true, Ordering::SeqCst);
        self.listeners.fire_initialize();
    }

    /// Starts (or restarts) the task `task_name` with a JSON start value.
    pub fn start_task(&self, task_name: &str, start_value: &Value) -> anyhow::Result<StartCommandResult> {
        info!("Form {} starting task {}", self.name, task_name);
        self.runtime
            .start_service(&Intent::for_service(task_name, start_value))
    }

    /// Sends a message to a running task.
    pub fn send_to_task(&self, task_name: &str, title: &str, message: &Value) {
        let intent = Intent::with_action(LOCAL_ACTION_SEND_MESSAGE)
            .put_extra(PARAM_FORM_NAME, self.name.clone())
            .put_extra(PARAM_TASK_NAME, task_name)
            .put_extra(PARAM_TITLE, title)
            .put_extra(PARAM_MESSAGE, message.to_string());
        self.runtime.broadcast().send_broadcast(&intent);
    }

    pub fn received_from_task(&self, task_name: &str, title: &str, message: Value) {
        self.runtime.dispatcher().dispatch_event(
            self,
            "ReceivedFromTask",
            &[json!(task_name), json!(title), message],
        );
    }

    pub fn error_occurred(
        &self,
        component_name: &str,
        function_name: &str,
        error_number: i32,
        message: &str,
    ) {
        error!(
            "Form {} error in {}.{}: {} {}",
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
            debug!("Alert suppressed for form {}", self.name);
        }
    }

    /// Fires stop listeners and stops the tasks bound to the screen.
    pub fn on_stop(&self) {
        info!("Form {} stopping", self.name);
        self.listeners.fire_stop();
        self.runtime.on_form_stop();
    }

    pub fn on_destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Form {} destroyed", self.name);
        self.listeners.fire_destroy();
        if let Some(id) = lock(&self.receiver).take() {
            self.runtime.broadcast().unregister_receiver(id);
        }
        self.runtime.dispatcher().remove_dispatch_context(&self.name);
        self.runtime.remove_form(self);
        self.worker.shutdown();
    }
}

impl Component for Form {
    fn component_name(&self) -> &str {
        &self.name
    }

    fn dispatch_delegate(&self) -> Option<Arc<dyn HandlesEventDispatching>> {
        let form: Arc<dyn HandlesEventDispatching> = self.self_ref.upgrade()?;
        Some(form)
    }
}

impl HandlesEventDispatching for Form {
    fn can_dispatch_event(&self, component: &dyn Component, event_name: &str) -> bool {
        self.is_initialized() || (component::same_component(component, self) && event_name == "Initialize")
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

impl ComponentContainer for Form {
    fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    fn context_name(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> ContainerKind {
        ContainerKind::Form
    }

    fn form(&self) -> Option<Arc<Form>> {
        self.self_ref.upgrade()
    }

    fn task(&self) -> Option<Arc<Task>> {
        None
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
        self.worker.post(job)
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
        debug!("Form {} queueing error {}", self.name, number);
        if let Err(err) =
            self.post(move |form| form.error_occurred(&component_name, &function_name, number, &message))
        {
            warn!("Form {} could not report error {}: {}", self.name, number, err);
        }
    }
}

//! Component model shared by Forms and Tasks
//!
//! A context (Form or Task) is both a [`Component`] and a [`ComponentContainer`], and acts as
//! the [`HandlesEventDispatching`] delegate for every component it contains. Compiled programs
//! plug in through [`ContextProgram`].

use super::errors::{ErrorCode, RuntimeError};
use super::form::Form;
use super::store::Runtime;
use super::task::Task;
use log::{debug, info};
use serde_json::Value;
use std::sync::{Arc, Weak};

/// Decides whether and how an event reaches a registered handler.
pub trait HandlesEventDispatching: Send + Sync {
    /// Whether `component` may raise `event_name` right now.
    fn can_dispatch_event(&self, component: &dyn Component, event_name: &str) -> bool;

    /// Name of the event registry this delegate dispatches from.
    fn dispatch_context(&self) -> String;

    /// Runs the handler registered as `component_name.event_name` if `component` is the one
    /// registered under that name. Returns true when a handler ran.
    fn dispatch_event(
        &self,
        component: &dyn Component,
        component_name: &str,
        event_name: &str,
        args: &[Value],
    ) -> bool;
}

/// Anything that can raise events.
pub trait Component: Send + Sync {
    /// The name the component was registered under in its context.
    fn component_name(&self) -> &str;

    /// The object that routes this component's events, if it is still attached.
    fn dispatch_delegate(&self) -> Option<Arc<dyn HandlesEventDispatching>>;

    /// Components with an `Initialize` hook return themselves here.
    fn as_initializable(&self) -> Option<&dyn Initializable> {
        None
    }
}

/// Components that run setup code when their context initializes.
pub trait Initializable {
    fn initialize(&self) -> anyhow::Result<()>;
}

/// Identity comparison for trait objects.
pub fn same_component(a: &dyn Component, b: &dyn Component) -> bool {
    std::ptr::addr_eq(a as *const dyn Component, b as *const dyn Component)
}

/// Runs a component's `Initialize` hook.
///
/// Components without a hook are skipped. Errors from the hook are returned unchanged.
pub fn call_initialize(component: &dyn Component) -> anyhow::Result<()> {
    match component.as_initializable() {
        None => {
            debug!("{} has no Initialize hook", component.component_name());
            Ok(())
        }
        Some(initializable) => {
            info!("calling Initialize for {}", component.component_name());
            initializable.initialize()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    Form,
    Task,
}

/// Contexts that hold components.
pub trait ComponentContainer: Send + Sync {
    fn runtime(&self) -> &Arc<Runtime>;

    fn context_name(&self) -> String;

    fn kind(&self) -> ContainerKind;

    /// Only Forms and Tasks implement this trait, so every container is a context.
    fn is_context(&self) -> bool {
        true
    }

    fn is_form(&self) -> bool {
        self.kind() == ContainerKind::Form
    }

    fn is_task(&self) -> bool {
        self.kind() == ContainerKind::Task
    }

    fn in_form(&self) -> bool {
        self.is_form()
    }

    fn in_task(&self) -> bool {
        self.is_task()
    }

    fn form(&self) -> Option<Arc<Form>>;

    fn task(&self) -> Option<Arc<Task>>;

    /// The delegate that routes events for components in this container.
    fn delegate(&self) -> Option<Arc<dyn HandlesEventDispatching>>;

    fn add(&self, component: Arc<dyn Component>);

    fn components(&self) -> Vec<Arc<dyn Component>>;

    /// Queues `job` on the container's own thread.
    fn run_on_context_thread(&self, job: Box<dyn FnOnce() + Send>) -> Result<(), RuntimeError>;

    /// Raises `ErrorOccurred` on the container's own thread.
    fn dispatch_error_occurred_event(
        &self,
        component_name: &str,
        function_name: &str,
        code: ErrorCode,
        message_args: &[String],
    );

    /// Like [`dispatch_error_occurred_event`](Self::dispatch_error_occurred_event), for errors a
    /// screen would show in a dialog.
    fn dispatch_error_occurred_event_dialog(
        &self,
        component_name: &str,
        function_name: &str,
        code: ErrorCode,
        message_args: &[String],
    ) {
        self.dispatch_error_occurred_event(component_name, function_name, code, message_args);
    }

    /// Registers `component_name.event_name` in this container's dispatch context.
    fn register_event(&self, component_name: &str, event_name: &str) {
        self.runtime().dispatcher().register_event_for_delegation(
            &self.context_name(),
            component_name,
            event_name,
        );
    }

    fn unregister_event(&self, component_name: &str, event_name: &str) {
        self.runtime().dispatcher().unregister_event_for_delegation(
            &self.context_name(),
            component_name,
            event_name,
        );
    }
}

/// The compiled program behind a context.
pub trait ContextProgram: Send + Sync {
    /// `$define`: creates the context's components and registers its event handlers.
    fn define(&self, container: &Arc<dyn ComponentContainer>) -> anyhow::Result<()>;

    /// Runs the user handler for `component_name.event_name`. Returns false when the program
    /// has no such handler.
    fn handle_event(
        &self,
        container: &dyn ComponentContainer,
        component_name: &str,
        event_name: &str,
        args: &[Value],
    ) -> bool;
}

/// Which contexts a component may live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextSupport {
    FormOnly,
    TaskOnly,
    Any,
}

impl ContextSupport {
    pub fn allows(self, kind: ContainerKind) -> bool {
        match self {
            ContextSupport::Any => true,
            ContextSupport::FormOnly => kind == ContainerKind::Form,
            ContextSupport::TaskOnly => kind == ContainerKind::Task,
        }
    }
}

/// A component with no view, attached to a Form or a Task.
pub struct NonvisibleComponent {
    name: String,
    container: Weak<dyn ComponentContainer>,
    support: ContextSupport,
}

impl NonvisibleComponent {
    /// Creates the component and adds it to `container`.
    ///
    /// Creating it in a context it does not support reports an error through the container
    /// but still attaches it, so the program keeps running.
    pub fn new(
        container: &Arc<dyn ComponentContainer>,
        name: impl Into<String>,
        support: ContextSupport,
    ) -> Arc<Self> {
        let name = name.into();
        if !support.allows(container.kind()) {
            let code = match container.kind() {
                ContainerKind::Task => ErrorCode::ComponentNotSupportedInTask,
                ContainerKind::Form => ErrorCode::ComponentNotSupportedInForm,
            };
            container.dispatch_error_occurred_event(&name, "Create", code, &[name.clone()]);
        }

        let component = Arc::new(Self {
            name,
            container: Arc::downgrade(container),
            support,
        });
        container.add(component.clone());
        component
    }

    pub fn container(&self) -> Option<Arc<dyn ComponentContainer>> {
        self.container.upgrade()
    }

    pub fn support(&self) -> ContextSupport {
        self.support
    }
}

impl Component for NonvisibleComponent {
    fn component_name(&self) -> &str {
        &self.name
    }

    fn dispatch_delegate(&self) -> Option<Arc<dyn HandlesEventDispatching>> {
        self.container.upgrade()?.delegate()
    }
}

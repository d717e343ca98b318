//! Intents delivered to tasks and broadcast between contexts

use anyhow::Context;
use serde_json::Value;
use std::collections::HashMap;

/// Extra holding the logical task name of a service start.
pub const SERVICE_NAME: &str = "SERVICE_NAME";
/// Extra holding the JSON-encoded start value.
pub const SERVICE_ARG: &str = "SERVICE_ARG";

/// Local broadcast action used for Task <-> Form messages.
pub const LOCAL_ACTION_SEND_MESSAGE: &str = "TaskSendMessage";
pub const PARAM_TASK_NAME: &str = "Task";
pub const PARAM_FORM_NAME: &str = "Form";
pub const PARAM_TITLE: &str = "Title";
pub const PARAM_MESSAGE: &str = "Message";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Intent {
    action: Option<String>,
    extras: HashMap<String, String>,
}

impl Intent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_action(action: impl Into<String>) -> Self {
        Self {
            action: Some(action.into()),
            extras: HashMap::new(),
        }
    }

    /// Intent that starts the service for `task_name` with a JSON start value.
    pub fn for_service(task_name: impl Into<String>, start_value: &Value) -> Self {
        Self::new()
            .put_extra(SERVICE_NAME, task_name)
            .put_extra(SERVICE_ARG, start_value.to_string())
    }

    pub fn put_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extras.get(key).map(String::as_str)
    }
}

/// Decodes a JSON-encoded value carried by an intent. A missing value decodes to null.
pub fn decode_json_value(text: Option<&str>, purpose: &str) -> anyhow::Result<Value> {
    match text {
        None => Ok(Value::Null),
        Some(text) => serde_json::from_str(text)
            .with_context(|| format!("Unable to decode JSON value while trying to {}", purpose)),
    }
}

//! Runtime error taxonomy
//!
//! Two kinds of failure live here. [`RuntimeError`] covers contract violations in the
//! runtime wiring (posting to a task that does not exist, asking for the current task off a
//! task thread). [`ErrorCode`] numbers the component-reported errors that travel through
//! `ErrorOccurred` events instead of being returned.

use thiserror::Error;

/// Contract violations raised by the runtime itself.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A task-only API was called from a thread that is not bound to a task.
    #[error("There is no Task for the thread: {thread}")]
    NotOnTaskThread { thread: String },

    /// Work was posted to a task name that is not registered.
    #[error("Tried to run on non-existent task: {0}")]
    NoSuchTask(String),

    /// The worker queue of a context has already been shut down.
    #[error("Worker thread for '{0}' is no longer accepting work")]
    WorkerClosed(String),

    /// The OS refused to start a worker thread.
    #[error("Failed to spawn worker thread '{name}'")]
    WorkerSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The context was destroyed while an operation still needed it.
    #[error("Context '{0}' has been destroyed")]
    ContextDestroyed(String),
}

/// Numbered errors reported by components through `ErrorOccurred`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A JSON-encoded start value or message could not be decoded.
    DecodeJsonValue,
    /// A form tried to message a task that is not running.
    SendingMessageToUnavailableTask,
    /// A form-only component was created inside a task.
    ComponentNotSupportedInTask,
    /// A task-only component was created inside a form.
    ComponentNotSupportedInForm,
    /// `$define` failed while populating a context.
    DefineFailed,
    /// The translation service has no API key configured.
    TranslateNoKeyFound,
    /// The translation service could not be reached.
    TranslateServiceNotAvailable,
    /// The translation service returned malformed JSON.
    TranslateJsonResponse,
}

impl ErrorCode {
    pub fn number(self) -> i32 {
        match self {
            ErrorCode::DecodeJsonValue => 906,
            ErrorCode::TranslateNoKeyFound => 2201,
            ErrorCode::TranslateServiceNotAvailable => 2202,
            ErrorCode::TranslateJsonResponse => 2203,
            ErrorCode::SendingMessageToUnavailableTask => 4101,
            ErrorCode::ComponentNotSupportedInTask => 4102,
            ErrorCode::ComponentNotSupportedInForm => 4103,
            ErrorCode::DefineFailed => 4104,
        }
    }

    pub fn from_number(number: i32) -> Option<Self> {
        [
            ErrorCode::DecodeJsonValue,
            ErrorCode::SendingMessageToUnavailableTask,
            ErrorCode::ComponentNotSupportedInTask,
            ErrorCode::ComponentNotSupportedInForm,
            ErrorCode::DefineFailed,
            ErrorCode::TranslateNoKeyFound,
            ErrorCode::TranslateServiceNotAvailable,
            ErrorCode::TranslateJsonResponse,
        ]
        .into_iter()
        .find(|code| code.number() == number)
    }

    /// Message template; each `%s` is replaced by one argument in order.
    fn template(self) -> &'static str {
        match self {
            ErrorCode::DecodeJsonValue => "Unable to decode the JSON text %s while trying to %s",
            ErrorCode::SendingMessageToUnavailableTask => {
                "Unable to send a message to task %s because it is not running"
            }
            ErrorCode::ComponentNotSupportedInTask => "The component %s cannot be used in a Task",
            ErrorCode::ComponentNotSupportedInForm => "The component %s cannot be used in a Screen",
            ErrorCode::DefineFailed => "Unable to set up %s: %s",
            ErrorCode::TranslateNoKeyFound => "No API key was found for the translation service",
            ErrorCode::TranslateServiceNotAvailable => "The translation service is not available",
            ErrorCode::TranslateJsonResponse => "The translation service returned an invalid response",
        }
    }
}

/// Formats the message for `code`, substituting `args` into the template.
///
/// Missing arguments leave the placeholder empty and extra arguments are ignored.
pub fn format_message(code: ErrorCode, args: &[String]) -> String {
    let template = code.template();
    let mut out = String::with_capacity(template.len());
    let mut args = args.iter();
    let mut rest = template;
    while let Some(idx) = rest.find("%s") {
        out.push_str(&rest[..idx]);
        if let Some(arg) = args.next() {
            out.push_str(arg);
        }
        rest = &rest[idx + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_message_substitutes_in_order() {
        let msg = format_message(
            ErrorCode::DecodeJsonValue,
            &["{oops".to_string(), "get start value".to_string()],
        );
        assert_eq!(
            msg,
            "Unable to decode the JSON text {oops while trying to get start value"
        );
    }

    #[test]
    fn test_format_message_missing_args() {
        let msg = format_message(ErrorCode::SendingMessageToUnavailableTask, &[]);
        assert_eq!(msg, "Unable to send a message to task  because it is not running");
    }

    #[test]
    fn test_error_numbers_round_trip() {
        let code = ErrorCode::SendingMessageToUnavailableTask;
        assert_eq!(ErrorCode::from_number(code.number()), Some(code));
        assert_eq!(ErrorCode::from_number(-1), None);
    }

    #[test]
    fn test_runtime_error_display() {
        let err = RuntimeError::NoSuchTask("T9".to_string());
        assert_eq!(err.to_string(), "Tried to run on non-existent task: T9");
    }
}

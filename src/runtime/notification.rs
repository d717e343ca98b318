//! Task notifications and user-facing alerts
//!
//! A [`TaskNotification`] is touched from both the host's lifecycle callbacks and the task's
//! own worker thread, so all of its state sits behind one mutex.

use super::lock;
use chrono::{DateTime, Utc};
use log::{info, warn};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_CONTENT_TEXT: &str = "In progress";
pub const ID_BASE_ADD: u32 = 10000;
pub const DEFAULT_LAUNCH_SCREEN: &str = "Screen1";

/// What the platform is asked to show for a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationContent {
    pub title: String,
    pub text: String,
    pub content_intent: Option<String>,
    pub ongoing: bool,
    pub posted_at: DateTime<Utc>,
}

/// Platform notification service.
pub trait NotificationManager: Send + Sync {
    fn notify(&self, id: u32, content: &NotificationContent);
    fn cancel(&self, id: u32);
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct LogNotificationManager;

impl NotificationManager for LogNotificationManager {
    fn notify(&self, id: u32, content: &NotificationContent) {
        info!("Notification {} shown: {} - {}", id, content.title, content.text);
    }

    fn cancel(&self, id: u32) {
        info!("Notification {} cancelled", id);
    }
}

/// Default visible error reporter, used when no user `ErrorOccurred` handler ran.
pub trait Notifier: Send + Sync {
    fn show_alert(&self, context: &str, message: &str);
}

#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn show_alert(&self, context: &str, message: &str) {
        warn!("[{}] {}", context, message);
    }
}

#[derive(Debug)]
struct NotificationState {
    title: String,
    text: String,
    content_intent: Option<String>,
    showing: bool,
}

/// The notification owned by one task.
pub struct TaskNotification {
    id: u32,
    default_title: String,
    state: Mutex<NotificationState>,
    manager: Arc<dyn NotificationManager>,
}

impl TaskNotification {
    /// `sequence` comes from the runtime's shared notification counter.
    pub fn new(task_name: &str, sequence: u32, manager: Arc<dyn NotificationManager>) -> Self {
        Self {
            id: ID_BASE_ADD + sequence,
            default_title: task_name.to_string(),
            state: Mutex::new(NotificationState {
                title: task_name.to_string(),
                text: DEFAULT_CONTENT_TEXT.to_string(),
                content_intent: Some(DEFAULT_LAUNCH_SCREEN.to_string()),
                showing: false,
            }),
            manager,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Blank titles are ignored.
    pub fn set_content_title(&self, title: &str) {
        let title = title.trim();
        if title.is_empty() {
            return;
        }
        lock(&self.state).title = title.to_string();
    }

    pub fn content_title(&self) -> String {
        lock(&self.state).title.clone()
    }

    /// Blank texts are ignored.
    pub fn set_content_text(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        lock(&self.state).text = text.to_string();
    }

    pub fn content_text(&self) -> String {
        lock(&self.state).text.clone()
    }

    pub fn set_content_intent(&self, screen: Option<String>) {
        lock(&self.state).content_intent = screen;
    }

    pub fn content_intent(&self) -> Option<String> {
        lock(&self.state).content_intent.clone()
    }

    pub fn content(&self) -> NotificationContent {
        let state = lock(&self.state);
        Self::build(&state)
    }

    fn build(state: &NotificationState) -> NotificationContent {
        NotificationContent {
            title: state.title.clone(),
            text: state.text.clone(),
            content_intent: state.content_intent.clone(),
            ongoing: true,
            posted_at: Utc::now(),
        }
    }

    pub fn show(&self) {
        let mut state = lock(&self.state);
        state.showing = true;
        self.manager.notify(self.id, &Self::build(&state));
    }

    /// Re-posts the notification if it is showing.
    pub fn update(&self) {
        let state = lock(&self.state);
        if state.showing {
            self.manager.notify(self.id, &Self::build(&state));
        }
    }

    pub fn hide(&self) {
        let mut state = lock(&self.state);
        self.manager.cancel(self.id);
        state.showing = false;
    }

    /// Marks the notification as showing without posting it; used when the host already
    /// displays it as a foreground-service notification.
    pub fn set_showing(&self, showing: bool) {
        lock(&self.state).showing = showing;
    }

    pub fn is_showing(&self) -> bool {
        lock(&self.state).showing
    }

    /// Hides the notification and restores the default title and text.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        self.manager.cancel(self.id);
        state.showing = false;
        state.title = self.default_title.clone();
        state.text = DEFAULT_CONTENT_TEXT.to_string();
        state.content_intent = Some(DEFAULT_LAUNCH_SCREEN.to_string());
    }
}

/// Limits how often default error alerts are shown.
#[derive(Debug)]
pub struct ToastThrottle {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl ToastThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// True if an alert may be shown now; records the time when it is.
    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut last = lock(&self.last);
        match *last {
            Some(previous) if now.duration_since(previous) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

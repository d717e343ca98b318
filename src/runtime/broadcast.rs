//! In-process broadcast of intents between contexts

use super::intent::Intent;
use super::lock;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub type Receiver = Arc<dyn Fn(&Intent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverId(u64);

/// Delivers intents to receivers registered for their action.
///
/// Receivers run synchronously on the sending thread; they are expected to hand real work to
/// their own context's worker.
#[derive(Default)]
pub struct LocalBroadcastManager {
    receivers: Mutex<HashMap<String, Vec<(ReceiverId, Receiver)>>>,
    next_id: AtomicU64,
}

impl LocalBroadcastManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_receiver(&self, action: &str, receiver: Receiver) -> ReceiverId {
        let id = ReceiverId(self.next_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.receivers)
            .entry(action.to_string())
            .or_default()
            .push((id, receiver));
        debug!("Registered receiver {:?} for {}", id, action);
        id
    }

    pub fn unregister_receiver(&self, id: ReceiverId) {
        let mut receivers = lock(&self.receivers);
        for list in receivers.values_mut() {
            list.retain(|(existing, _)| *existing != id);
        }
        receivers.retain(|_, list| !list.is_empty());
        debug!("Unregistered receiver {:?}", id);
    }

    pub fn receiver_count(&self, action: &str) -> usize {
        lock(&self.receivers).get(action).map_or(0, Vec::len)
    }

    /// Sends `intent` to every receiver of its action. Returns the number of receivers.
    pub fn send_broadcast(&self, intent: &Intent) -> usize {
        let Some(action) = intent.action() else {
            return 0;
        };
        let targets: Vec<Receiver> = lock(&self.receivers)
            .get(action)
            .map(|list| list.iter().map(|(_, receiver)| receiver.clone()).collect())
            .unwrap_or_default();
        for receiver in &targets {
            receiver(intent);
        }
        targets.len()
    }
}

//! Results going back to the browser
//!
//! Everything the device reports to the blocks editor (finished asset transfers, block return
//! values, errors) is a small JSON object. With a data channel attached, each result is pushed
//! immediately; otherwise results queue until the browser polls with [`RetValManager::fetch`].

use crate::runtime::lock;
use log::{debug, warn};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

/// Where pushed results go.
pub trait RetValSink: Send + Sync {
    fn send_text(&self, text: &str) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct RetValManager {
    pending: Mutex<Vec<Value>>,
    sink: Mutex<Option<Arc<dyn RetValSink>>>,
}

impl RetValManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes results straight to `sink` from now on. Anything already queued goes first.
    pub fn attach_sink(&self, sink: Arc<dyn RetValSink>) {
        *lock(&self.sink) = Some(sink);
        let queued: Vec<Value> = lock(&self.pending).drain(..).collect();
        for item in queued {
            self.push(item);
        }
    }

    pub fn detach_sink(&self) {
        *lock(&self.sink) = None;
    }

    pub fn asset_transferred(&self, asset: &str) {
        self.push(json!({
            "status": "OK",
            "type": "assetTransferred",
            "value": asset,
        }));
    }

    /// A block's evaluation result. `ok` selects the `OK`/`BAD` status.
    pub fn append_return_value(&self, block_id: &str, ok: bool, value: &str) {
        self.push(json!({
            "status": if ok { "OK" } else { "BAD" },
            "type": "return",
            "blockid": block_id,
            "value": value,
        }));
    }

    pub fn send_error(&self, message: &str) {
        self.push(json!({
            "status": "OK",
            "type": "error",
            "value": message,
        }));
    }

    /// Drains the queue as `{"status":"OK","values":[...]}`.
    pub fn fetch(&self) -> Value {
        let values: Vec<Value> = lock(&self.pending).drain(..).collect();
        json!({ "status": "OK", "values": values })
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    fn push(&self, item: Value) {
        let sink = lock(&self.sink).clone();
        if let Some(sink) = sink {
            let text = json!({ "status": "OK", "values": [item.clone()] }).to_string();
            match sink.send_text(&text) {
                Ok(()) => {
                    debug!("Pushed result: {}", text);
                    return;
                }
                Err(err) => warn!("Data channel send failed, queueing result: {:#}", err),
            }
        }
        lock(&self.pending).push(item);
    }
}

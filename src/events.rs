//! Outbound notifications to the frontend.
//!
//! The desktop shell forwards these through `tauri::Emitter`; tests record
//! them. Event names are the channel names the frontend listens on.

use serde_json::Value;
use std::sync::Mutex;

pub const DELIVERIES_CHANGED: &str = "deliveries_changed";
pub const SALES_CHANGED: &str = "sales_changed";
pub const PAYMENTS_CHANGED: &str = "payments_changed";
pub const SYNC_STATUS: &str = "sync_status";
pub const OPERATOR_ALERT: &str = "operator_alert";
pub const SESSION_CHANGED: &str = "session_changed";

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, payload: Value);
}

/// Sink used before the UI is attached (and by headless tools).
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &str, _payload: Value) {}
}

/// Keeps every emitted event in memory.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, Value)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .map(|events| events.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn payloads(&self, event: &str) -> Vec<Value> {
        self.events
            .lock()
            .map(|events| {
                events
                    .iter()
                    .filter(|(name, _)| name == event)
                    .map(|(_, payload)| payload.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &str, payload: Value) {
        if let Ok(mut events) = self.events.lock() {
            events.push((event.to_string(), payload));
        }
    }
}

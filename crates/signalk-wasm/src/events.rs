//! Status and lifecycle events published by the runtime.
//!
//! Rendering is left to subscribers; the runtime only keeps the latest status
//! and error message per plugin and broadcasts every change.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::supervisor::LifecycleState;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PluginEvent {
    StateChanged {
        plugin_id: String,
        from: LifecycleState,
        to: LifecycleState,
        at: DateTime<Utc>,
    },
    Status {
        plugin_id: String,
        message: String,
        at: DateTime<Utc>,
    },
    Error {
        plugin_id: String,
        message: String,
        at: DateTime<Utc>,
    },
}

impl PluginEvent {
    pub fn plugin_id(&self) -> &str {
        match self {
            PluginEvent::StateChanged { plugin_id, .. }
            | PluginEvent::Status { plugin_id, .. }
            | PluginEvent::Error { plugin_id, .. } => plugin_id,
        }
    }
}

/// Latest user-facing status of one plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub status: Option<String>,
    pub error: Option<String>,
}

/// Broadcast channel plus the last reported status per plugin.
pub struct EventBus {
    sender: broadcast::Sender<PluginEvent>,
    board: RwLock<HashMap<String, StatusReport>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sender,
            board: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, event: PluginEvent) {
        // no subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn set_status(&self, plugin_id: &str, message: &str) {
        self.board
            .write()
            .entry(plugin_id.to_string())
            .or_default()
            .status = Some(message.to_string());
        self.publish(PluginEvent::Status {
            plugin_id: plugin_id.to_string(),
            message: message.to_string(),
            at: Utc::now(),
        });
    }

    pub fn set_error(&self, plugin_id: &str, message: &str) {
        self.board
            .write()
            .entry(plugin_id.to_string())
            .or_default()
            .error = Some(message.to_string());
        self.publish(PluginEvent::Error {
            plugin_id: plugin_id.to_string(),
            message: message.to_string(),
            at: Utc::now(),
        });
    }

    pub fn state_changed(&self, plugin_id: &str, from: LifecycleState, to: LifecycleState) {
        self.publish(PluginEvent::StateChanged {
            plugin_id: plugin_id.to_string(),
            from,
            to,
            at: Utc::now(),
        });
    }

    pub fn report(&self, plugin_id: &str) -> StatusReport {
        self.board.read().get(plugin_id).cloned().unwrap_or_default()
    }

    /// Forget a plugin's error, keeping its last status.
    pub fn clear_error(&self, plugin_id: &str) {
        if let Some(report) = self.board.write().get_mut(plugin_id) {
            report.error = None;
        }
    }
}

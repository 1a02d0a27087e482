//! PUT handler registrations keyed by `(context, path)`.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::abi::CallingConvention;
use crate::error::PluginError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutHandlerRegistration {
    pub plugin_id: String,
    pub export: String,
    pub convention: CallingConvention,
}

/// Export a guest must provide to handle PUTs on `(context, path)`.
///
/// `vessels.self` + `navigation.anchor.position` gives
/// `handle_put_vessels_self_navigation_anchor_position`.
pub fn put_export_name(context: &str, path: &str) -> String {
    format!("handle_put_{context}_{path}").replace('.', "_")
}

#[derive(Default)]
pub struct PutHandlerTable {
    handlers: RwLock<HashMap<(String, String), PutHandlerRegistration>>,
}

impl PutHandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A key owned by another plugin is not taken over.
    pub fn register(
        &self,
        plugin_id: &str,
        context: &str,
        path: &str,
        convention: CallingConvention,
    ) -> Result<PutHandlerRegistration, PluginError> {
        let key = (context.to_string(), path.to_string());
        let mut handlers = self.handlers.write();
        if let Some(existing) = handlers.get(&key) {
            if existing.plugin_id != plugin_id {
                return Err(PluginError::AlreadyExists(format!(
                    "PUT handler for {context}/{path} is owned by {}",
                    existing.plugin_id
                )));
            }
        }
        let registration = PutHandlerRegistration {
            plugin_id: plugin_id.to_string(),
            export: put_export_name(context, path),
            convention,
        };
        handlers.insert(key, registration.clone());
        tracing::info!(plugin = %plugin_id, context = %context, path = %path, "registered PUT handler");
        Ok(registration)
    }

    pub fn lookup(&self, context: &str, path: &str) -> Option<PutHandlerRegistration> {
        self.handlers
            .read()
            .get(&(context.to_string(), path.to_string()))
            .cloned()
    }

    pub fn unregister_plugin(&self, plugin_id: &str) -> usize {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|_, r| r.plugin_id != plugin_id);
        before - handlers.len()
    }

    pub fn count_for(&self, plugin_id: &str) -> usize {
        self.handlers
            .read()
            .values()
            .filter(|r| r.plugin_id == plugin_id)
            .count()
    }
}

//! The host server as seen from plugins.
//!
//! The data model, ingestion pipeline and streaming layers live outside this
//! crate. Plugins reach them only through [`ServerApp`].

use serde::Serialize;
use serde_json::Value;

/// Which ingestion entry a delta document is handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeltaVersion {
    /// The default entry, backed by the cached full state tree.
    V1,
    /// The resource entry, which bypasses the state cache.
    V2,
}

pub trait ServerApp: Send + Sync + 'static {
    /// Ingest one delta document emitted by a plugin.
    fn handle_message(&self, plugin_id: &str, delta: Value, version: DeltaVersion);

    /// Current value at a dotted path under the self vessel, if any.
    fn self_path(&self, path: &str) -> Option<Value>;

    fn emit_binary_stream(&self, plugin_id: &str, stream_id: &str, data: Vec<u8>);

    fn emit_radar_spokes(&self, plugin_id: &str, radar_id: &str, data: Vec<u8>);
}

/// Data a guest produced during a call, held until that call returns.
#[derive(Debug, Clone, PartialEq)]
pub enum DataEffect {
    Delta { delta: Value, version: DeltaVersion },
    BinaryStream { stream_id: String, data: Vec<u8> },
    RadarSpokes { radar_id: String, data: Vec<u8> },
}

pub(crate) fn deliver(app: &dyn ServerApp, plugin_id: &str, effects: Vec<DataEffect>) {
    for effect in effects {
        match effect {
            DataEffect::Delta { delta, version } => app.handle_message(plugin_id, delta, version),
            DataEffect::BinaryStream { stream_id, data } => {
                app.emit_binary_stream(plugin_id, &stream_id, data)
            }
            DataEffect::RadarSpokes { radar_id, data } => {
                app.emit_radar_spokes(plugin_id, &radar_id, data)
            }
        }
    }
}

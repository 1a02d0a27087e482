// Shared test utilities for integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use signalk_wasm::{
    CapabilitySet, DeltaVersion, PluginManifest, PluginSupervisor, SandboxConfig, ServerApp,
};

/// Offset where the guest allocator starts handing out memory.
const HEAP_BASE: u32 = 16 * 1024;

/// Server double that records everything plugins hand to it.
#[derive(Default)]
pub struct RecordingApp {
    pub deltas: Mutex<Vec<(String, Value, DeltaVersion)>>,
    pub streams: Mutex<Vec<(String, String, Vec<u8>)>>,
    pub spokes: Mutex<Vec<(String, String, Vec<u8>)>>,
    pub self_state: Mutex<HashMap<String, Value>>,
}

impl RecordingApp {
    pub fn delta_count(&self) -> usize {
        self.deltas.lock().len()
    }
}

impl ServerApp for RecordingApp {
    fn handle_message(&self, plugin_id: &str, delta: Value, version: DeltaVersion) {
        self.deltas.lock().push((plugin_id.to_string(), delta, version));
    }

    fn self_path(&self, path: &str) -> Option<Value> {
        self.self_state.lock().get(path).cloned()
    }

    fn emit_binary_stream(&self, plugin_id: &str, stream_id: &str, data: Vec<u8>) {
        self.streams
            .lock()
            .push((plugin_id.to_string(), stream_id.to_string(), data));
    }

    fn emit_radar_spokes(&self, plugin_id: &str, radar_id: &str, data: Vec<u8>) {
        self.spokes
            .lock()
            .push((plugin_id.to_string(), radar_id.to_string(), data));
    }
}

/// Sandbox settings sized for the small test guests.
pub fn test_config(dir: &Path) -> SandboxConfig {
    SandboxConfig {
        memory_limit: 16 * 1024 * 1024,
        data_dir: dir.join("plugin-data"),
        http_timeout_secs: 5,
        response_buffer_size: 4096,
        ..SandboxConfig::default()
    }
}

pub async fn supervisor(dir: &Path) -> (PluginSupervisor, Arc<RecordingApp>) {
    supervisor_with(test_config(dir)).await
}

pub async fn supervisor_with(config: SandboxConfig) -> (PluginSupervisor, Arc<RecordingApp>) {
    let app = Arc::new(RecordingApp::default());
    let supervisor = PluginSupervisor::new(config, app.clone()).await.unwrap();
    (supervisor, app)
}

/// Compile `guest` into `dir` and describe it as plugin `id`.
pub fn manifest(dir: &Path, id: &str, capabilities: CapabilitySet, guest: &Guest) -> PluginManifest {
    let binary_path = dir.join(format!("{id}.wasm"));
    let bytes = wat::parse_str(guest.wat()).unwrap();
    std::fs::write(&binary_path, bytes).unwrap();
    PluginManifest {
        id: id.to_string(),
        name: id.to_string(),
        version: Some("0.1.0".into()),
        binary_path,
        capabilities,
        storage_root: dir.join("plugin-data").join(id),
    }
}

/// Discover and enable in one step.
pub async fn start(supervisor: &PluginSupervisor, manifest: PluginManifest) {
    let id = manifest.id.clone();
    supervisor.discover(manifest).await.unwrap();
    supervisor.enable(&id, serde_json::json!({})).await.unwrap();
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Builder for buffer-passing guests written in WAT.
///
/// Every guest exports `memory`, a bump `allocate` and a no-op
/// `deallocate`. String constants live below the heap.
pub struct Guest {
    imports: Vec<String>,
    items: Vec<String>,
    next_data: u32,
}

impl Default for Guest {
    fn default() -> Self {
        Self::new()
    }
}

impl Guest {
    pub fn new() -> Self {
        Self {
            imports: Vec::new(),
            items: Vec::new(),
            next_data: 1024,
        }
    }

    /// Add an `env` import, e.g. `(func $sk_debug (param i32 i32))`.
    pub fn import(mut self, name: &str, signature: &str) -> Self {
        self.imports
            .push(format!("(import \"env\" \"{name}\" (func ${name} {signature}))"));
        self
    }

    /// Place a string constant and return its `(offset, len)`.
    pub fn constant(&mut self, text: &str) -> (u32, u32) {
        let offset = self.next_data;
        let len = text.len() as u32;
        self.items
            .push(format!("(data (i32.const {offset}) \"{}\")", escape(text)));
        self.next_data = (offset + len + 8) & !7;
        assert!(self.next_data < HEAP_BASE, "test guest constants overflow");
        (offset, len)
    }

    /// Add raw module items.
    pub fn item(mut self, wat: &str) -> Self {
        self.items.push(wat.to_string());
        self
    }

    /// A text export that ignores its input and replies with `text`.
    pub fn reply(mut self, export: &str, text: &str) -> Self {
        let (offset, len) = self.constant(text);
        self.items.push(format!(
            "(func (export \"{export}\") (param i32 i32) (param $out i32) (param $max i32) (result i32)
               (memory.copy (local.get $out) (i32.const {offset}) (i32.const {len}))
               (i32.const {len}))"
        ));
        self
    }

    /// A text export taking no input, as used for identity exports.
    pub fn identity(mut self, export: &str, text: &str) -> Self {
        let (offset, len) = self.constant(text);
        self.items.push(format!(
            "(func (export \"{export}\") (param $out i32) (param $max i32) (result i32)
               (memory.copy (local.get $out) (i32.const {offset}) (i32.const {len}))
               (i32.const {len}))"
        ));
        self
    }

    /// `plugin_start` running `body`, which must leave an i32 status.
    pub fn start(self, body: &str) -> Self {
        let func = format!("(func (export \"plugin_start\") (param i32 i32) (result i32) {body})");
        self.item(&func)
    }

    pub fn wat(&self) -> String {
        format!(
            r#"(module
  {imports}
  (memory (export "memory") 4)
  (global $heap (mut i32) (i32.const {HEAP_BASE}))
  (func (export "allocate") (param $size i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap
      (i32.and
        (i32.add (i32.add (global.get $heap) (local.get $size)) (i32.const 7))
        (i32.const -8)))
    (local.get $ptr))
  (func (export "deallocate") (param i32 i32))
  {items}
)"#,
            imports = self.imports.join("\n  "),
            items = self.items.join("\n  "),
        )
    }
}

/// Call `import` with a string constant and drop any result.
pub fn call_with_constant(guest: &mut Guest, import: &str, text: &str, returns: bool) -> String {
    let (offset, len) = guest.constant(text);
    let call = format!("(call ${import} (i32.const {offset}) (i32.const {len}))");
    if returns {
        format!("(drop {call})")
    } else {
        call
    }
}

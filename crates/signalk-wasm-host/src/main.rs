use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use signalk_wasm::{
    DeltaVersion, PluginError, PluginEvent, PluginManifest, PluginSupervisor, SandboxConfig,
    ServerApp,
};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Server stand-in that logs whatever plugins emit.
struct LoggingApp;

impl ServerApp for LoggingApp {
    fn handle_message(&self, plugin_id: &str, delta: Value, version: DeltaVersion) {
        tracing::info!(plugin = %plugin_id, ?version, %delta, "delta");
    }

    fn self_path(&self, _path: &str) -> Option<Value> {
        None
    }

    fn emit_binary_stream(&self, plugin_id: &str, stream_id: &str, data: Vec<u8>) {
        tracing::info!(plugin = %plugin_id, stream = %stream_id, bytes = data.len(), "binary stream");
    }

    fn emit_radar_spokes(&self, plugin_id: &str, radar_id: &str, data: Vec<u8>) {
        tracing::debug!(plugin = %plugin_id, radar = %radar_id, bytes = data.len(), "radar spokes");
    }
}

fn read_manifest(path: &Path, data_dir: &Path) -> Result<PluginManifest, PluginError> {
    let text = std::fs::read_to_string(path)?;
    let plugin_dir = path.parent().unwrap_or_else(|| Path::new("."));
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => PluginManifest::from_toml(&text, plugin_dir, data_dir),
        _ => PluginManifest::from_package_json(&text, plugin_dir, data_dir),
    }
}

/// Saved plugin configuration, `<data_dir>/<id>.json`, if any.
fn read_plugin_config(data_dir: &Path, plugin_id: &str) -> Value {
    let path = data_dir.join(format!("{plugin_id}.json"));
    let Ok(text) = std::fs::read_to_string(&path) else {
        return Value::Object(Default::default());
    };
    match serde_json::from_str::<Value>(&text) {
        // the saved file wraps the plugin's own settings
        Ok(saved) => saved
            .get("configuration")
            .cloned()
            .unwrap_or(saved),
        Err(e) => {
            tracing::warn!(plugin = %plugin_id, path = %path.display(), "ignoring unreadable config: {e}");
            Value::Object(Default::default())
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let manifests: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if manifests.is_empty() {
        tracing::error!("usage: signalk-wasm-host <package.json|plugin.toml>...");
        std::process::exit(2);
    }

    let config = SandboxConfig::from_env();
    let data_dir = config.data_dir.clone();
    tracing::info!(data_dir = %data_dir.display(), "starting plugin host");
    let supervisor = PluginSupervisor::new(config, Arc::new(LoggingApp))
        .await
        .expect("failed to create plugin supervisor");

    let mut events = supervisor.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PluginEvent::Status { plugin_id, message, .. }) => {
                    tracing::info!(plugin = %plugin_id, "status: {message}")
                }
                Ok(PluginEvent::Error { plugin_id, message, .. }) => {
                    tracing::warn!(plugin = %plugin_id, "error: {message}")
                }
                Ok(PluginEvent::StateChanged { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "plugin event listener lagged")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    for path in &manifests {
        let manifest = match read_manifest(path, &data_dir) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::error!(path = %path.display(), "skipping plugin: {e}");
                continue;
            }
        };
        let plugin_id = manifest.id.clone();
        if let Err(e) = supervisor.discover(manifest).await {
            tracing::error!(plugin = %plugin_id, "failed to register plugin: {e}");
            continue;
        }
        let plugin_config = read_plugin_config(&data_dir, &plugin_id);
        if let Err(e) = supervisor.enable(&plugin_id, plugin_config).await {
            tracing::error!(plugin = %plugin_id, "failed to start plugin: {e}");
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
    }
    tracing::info!("shutting down plugins");
    supervisor.shutdown().await;
}

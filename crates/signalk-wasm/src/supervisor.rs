//! Plugin lifecycle supervisor.
//!
//! Owns every plugin entry and the process-wide tables its instances write
//! into. All calls into one instance go through that instance's mutex, so
//! they are strictly sequential; a suspended call keeps the mutex until its
//! replay has returned. The plugin table lock is never held while waiting on
//! an instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot, Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::abi::{GuestCall, GuestValue};
use crate::app::{self, ServerApp};
use crate::command::CommandPolicy;
use crate::error::PluginError;
use crate::events::{EventBus, PluginEvent, StatusReport};
use crate::host_functions::HostServices;
use crate::loader::PluginLoader;
use crate::manifest::PluginManifest;
use crate::providers::ProviderRegistry;
use crate::put_handlers::PutHandlerTable;
use crate::sandbox::{CallStep, PluginSandbox, SandboxConfig};
use crate::sockets::SocketManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Discovered,
    Loading,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

/// What the guest reports about itself through its identity exports.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PluginIdentity {
    pub id: Option<String>,
    pub name: Option<String>,
    pub schema: Option<Value>,
}

/// One entry of a guest's `http_endpoints()` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpEndpoint {
    pub method: String,
    pub path: String,
    pub handler: String,
}

type SharedSandbox = Arc<Mutex<PluginSandbox>>;

/// Handle on the instance currently serving a plugin.
#[derive(Clone)]
pub(crate) struct LiveInstance {
    pub(crate) id: Uuid,
    sandbox: SharedSandbox,
    accepting: Arc<AtomicBool>,
}

struct PluginEntry {
    manifest: PluginManifest,
    state: LifecycleState,
    last_error: Option<String>,
    instance: Option<LiveInstance>,
    identity: PluginIdentity,
    endpoints: Vec<HttpEndpoint>,
}

/// Result of the blocking part of a start.
struct Started {
    sandbox: PluginSandbox,
    identity: PluginIdentity,
    endpoints: Vec<HttpEndpoint>,
}

pub struct PluginSupervisor {
    loader: Arc<PluginLoader>,
    services: Arc<HostServices>,
    plugins: RwLock<HashMap<String, PluginEntry>>,
}

fn panicked(plugin_id: &str, error: tokio::task::JoinError) -> PluginError {
    PluginError::Trap {
        plugin: plugin_id.to_string(),
        message: format!("host call task failed: {error}"),
    }
}

type Guard = OwnedMutexGuard<PluginSandbox>;

/// Drive one call through both phases, keeping the instance locked.
async fn run_phases(
    plugin_id: &str,
    mut guard: Guard,
    call: GuestCall,
) -> Result<(Guard, Result<GuestValue, PluginError>), PluginError> {
    let (mut guard, step) = tokio::task::spawn_blocking(move || {
        let step = guard.begin_call(&call);
        (guard, step)
    })
    .await
    .map_err(|e| panicked(plugin_id, e))?;

    match step {
        Ok(CallStep::Done(value)) => Ok((guard, Ok(value))),
        Err(e) => Ok((guard, Err(e))),
        Ok(CallStep::Suspended { pending, completion }) => {
            tracing::debug!(plugin = %plugin_id, export = %pending.export(), "awaiting host operation");
            let outcome = completion
                .await
                .unwrap_or_else(|_| Err("host operation was abandoned".into()));
            let (guard, result) = tokio::task::spawn_blocking(move || {
                let result = guard.resume_call(pending, outcome);
                (guard, result)
            })
            .await
            .map_err(|e| panicked(plugin_id, e))?;
            Ok((guard, result))
        }
    }
}

/// Run a call on its own task.
///
/// A caller that stops waiting only loses the reply: a suspended call is
/// still replayed, and the instance is unlocked with no suspension pending.
/// Effects of an unclaimed call are dropped; an unclaimed fault retires the
/// instance so the next caller crashes it.
async fn execute(
    plugin_id: &str,
    guard: Guard,
    call: GuestCall,
) -> Result<(Guard, Result<GuestValue, PluginError>), PluginError> {
    let (tx, rx) = oneshot::channel();
    let task_plugin = plugin_id.to_string();
    tokio::spawn(async move {
        let outcome = run_phases(&task_plugin, guard, call).await;
        let Err(Ok((mut guard, result))) = tx.send(outcome) else {
            return;
        };
        match result {
            Err(e) if e.is_fatal() => {
                tracing::warn!(plugin = %task_plugin, "unclaimed call faulted: {e}");
                guard.retire();
            }
            _ => {
                let dropped = guard.take_effects().len();
                tracing::debug!(plugin = %task_plugin, dropped, "caller stopped waiting for call");
            }
        }
    });
    rx.await.map_err(|_| PluginError::Trap {
        plugin: plugin_id.to_string(),
        message: "host call task was lost".into(),
    })?
}

fn read_identity(sandbox: &mut PluginSandbox) -> Result<PluginIdentity, PluginError> {
    let mut text = |export: &str| -> Result<Option<String>, PluginError> {
        if !sandbox.has_function(export) {
            return Ok(None);
        }
        match sandbox.call_blocking(&GuestCall::text(export, None)) {
            Ok(value) => Ok(value.into_text()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(plugin = %sandbox.plugin_id(), export, "identity export failed: {e}");
                Ok(None)
            }
        }
    };
    let id = text("plugin_id")?;
    let name = text("plugin_name")?;
    let schema = text("plugin_schema")?
        .map(|raw| serde_json::from_str(&raw).unwrap_or(Value::String(raw)));
    Ok(PluginIdentity { id, name, schema })
}

fn read_endpoints(sandbox: &mut PluginSandbox) -> Result<Vec<HttpEndpoint>, PluginError> {
    let raw = match sandbox.call_blocking(&GuestCall::text("http_endpoints", None)) {
        Ok(value) => value.into_text(),
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            tracing::warn!(plugin = %sandbox.plugin_id(), "http_endpoints failed: {e}");
            None
        }
    };
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    match serde_json::from_str(&raw) {
        Ok(endpoints) => Ok(endpoints),
        Err(e) => {
            tracing::warn!(plugin = %sandbox.plugin_id(), "invalid http_endpoints response: {e}");
            Ok(Vec::new())
        }
    }
}

/// Load, identify and start one plugin. Runs on a blocking thread.
fn start_instance(
    loader: &PluginLoader,
    manifest: &PluginManifest,
    services: Arc<HostServices>,
    accepting: Arc<AtomicBool>,
    config: &Value,
) -> Result<Started, PluginError> {
    let mut sandbox = loader.load(manifest, services, accepting)?;

    let identity = read_identity(&mut sandbox)?;
    if let Some(reported) = identity.id.as_deref() {
        if reported != manifest.id {
            tracing::warn!(
                plugin = %manifest.id,
                reported = %reported,
                "plugin_id export does not match the manifest id"
            );
        }
    }

    if sandbox.has_function("plugin_start") {
        let input = serde_json::to_string(config)?;
        let status = sandbox
            .call_blocking(&GuestCall::status("plugin_start", Some(input)))?
            .status()
            .unwrap_or(0);
        if status != 0 {
            return Err(PluginError::Protocol(format!(
                "plugin_start returned status {status}"
            )));
        }
    } else {
        tracing::warn!(plugin = %manifest.id, "module has no plugin_start export");
    }

    let endpoints = if manifest.capabilities.http_endpoints && sandbox.has_function("http_endpoints") {
        read_endpoints(&mut sandbox)?
    } else {
        Vec::new()
    };

    Ok(Started {
        sandbox,
        identity,
        endpoints,
    })
}

impl PluginSupervisor {
    /// Create a supervisor with its own socket, provider and PUT tables.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn new(config: SandboxConfig, app: Arc<dyn ServerApp>) -> Result<Self, PluginError> {
        let runtime = Handle::current();
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .user_agent(concat!("signalk-wasm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PluginError::Http(format!("failed to build HTTP client: {e}")))?;
        let services = Arc::new(HostServices {
            app,
            events: Arc::new(EventBus::new()),
            sockets: Arc::new(SocketManager::new(config.socket_queue_limit, runtime.clone())),
            providers: Arc::new(ProviderRegistry::new()),
            put_handlers: Arc::new(PutHandlerTable::new()),
            commands: CommandPolicy::log_retrieval(
                Duration::from_secs(config.command_timeout_secs),
                config.command_output_limit,
            )?,
            http_client,
            runtime,
        });
        let loader = Arc::new(PluginLoader::new(&config)?);

        tracing::info!(
            memory_limit = config.memory_limit,
            fuel_limit = ?config.fuel_limit,
            data_dir = %config.data_dir.display(),
            "plugin supervisor ready"
        );
        Ok(Self {
            loader,
            services,
            plugins: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        self.loader.config()
    }

    pub(crate) fn services(&self) -> &HostServices {
        &self.services
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.services.events.subscribe()
    }

    fn transition(&self, plugin_id: &str, entry: &mut PluginEntry, to: LifecycleState) {
        let from = entry.state;
        entry.state = to;
        tracing::info!(plugin = %plugin_id, ?from, ?to, "plugin state changed");
        self.services.events.state_changed(plugin_id, from, to);
    }

    /// Register a plugin in the `Discovered` state.
    pub async fn discover(&self, manifest: PluginManifest) -> Result<(), PluginError> {
        let mut plugins = self.plugins.write().await;
        if plugins.contains_key(&manifest.id) {
            return Err(PluginError::AlreadyExists(manifest.id));
        }
        tracing::info!(plugin = %manifest.id, binary = %manifest.binary_path.display(), "discovered plugin");
        plugins.insert(
            manifest.id.clone(),
            PluginEntry {
                manifest,
                state: LifecycleState::Discovered,
                last_error: None,
                instance: None,
                identity: PluginIdentity::default(),
                endpoints: Vec::new(),
            },
        );
        Ok(())
    }

    /// Load and start a plugin with its JSON configuration.
    ///
    /// A failure leaves the plugin `Crashed` with the error retained; the
    /// error is also returned.
    pub async fn enable(&self, plugin_id: &str, config: Value) -> Result<(), PluginError> {
        let manifest = {
            let mut plugins = self.plugins.write().await;
            let entry = plugins
                .get_mut(plugin_id)
                .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
            if matches!(
                entry.state,
                LifecycleState::Loading | LifecycleState::Running | LifecycleState::Stopping
            ) {
                return Err(PluginError::InvalidState(format!(
                    "cannot enable '{plugin_id}' while {:?}",
                    entry.state
                )));
            }
            entry.last_error = None;
            self.transition(plugin_id, entry, LifecycleState::Loading);
            entry.manifest.clone()
        };
        self.services.events.clear_error(plugin_id);

        let accepting = Arc::new(AtomicBool::new(true));
        let loader = self.loader.clone();
        let services = self.services.clone();
        let task_accepting = accepting.clone();
        let started = tokio::task::spawn_blocking(move || {
            start_instance(&loader, &manifest, services, task_accepting, &config)
        })
        .await
        .map_err(|e| panicked(plugin_id, e))
        .and_then(|result| result);

        let mut started = match started {
            Ok(started) => started,
            Err(e) => {
                accepting.store(false, Ordering::Release);
                self.teardown_tables(plugin_id);
                self.record_crash(plugin_id, &e).await;
                return Err(e);
            }
        };

        let effects = started.sandbox.take_effects();
        let instance = LiveInstance {
            id: Uuid::new_v4(),
            sandbox: Arc::new(Mutex::new(started.sandbox)),
            accepting,
        };
        {
            let mut plugins = self.plugins.write().await;
            let entry = plugins
                .get_mut(plugin_id)
                .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
            tracing::info!(plugin = %plugin_id, instance = %instance.id, "plugin started");
            entry.instance = Some(instance);
            entry.identity = started.identity;
            entry.endpoints = started.endpoints;
            self.transition(plugin_id, entry, LifecycleState::Running);
        }
        app::deliver(&*self.services.app, plugin_id, effects);
        Ok(())
    }

    /// Stop a plugin and tear down everything its instance created.
    pub async fn disable(&self, plugin_id: &str) -> Result<(), PluginError> {
        let instance = {
            let mut plugins = self.plugins.write().await;
            let entry = plugins
                .get_mut(plugin_id)
                .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
            match entry.state {
                LifecycleState::Running => {}
                LifecycleState::Crashed => {
                    self.transition(plugin_id, entry, LifecycleState::Stopped);
                    return Ok(());
                }
                state => {
                    return Err(PluginError::InvalidState(format!(
                        "cannot disable '{plugin_id}' while {state:?}"
                    )))
                }
            }
            self.transition(plugin_id, entry, LifecycleState::Stopping);
            entry.endpoints.clear();
            entry.instance.take()
        };

        if let Some(instance) = instance {
            instance.accepting.store(false, Ordering::Release);
            let guard = instance.sandbox.clone().lock_owned().await;
            let mut guard = if guard.has_function("plugin_stop") {
                match execute(plugin_id, guard, GuestCall::status("plugin_stop", None)).await {
                    Ok((mut guard, result)) => {
                        match result {
                            Ok(value) if value.status().unwrap_or(0) != 0 => tracing::warn!(
                                plugin = %plugin_id,
                                status = value.status().unwrap_or(0),
                                "plugin_stop reported failure"
                            ),
                            Ok(_) => {
                                let effects = guard.take_effects();
                                app::deliver(&*self.services.app, plugin_id, effects);
                            }
                            Err(e) => tracing::warn!(plugin = %plugin_id, "plugin_stop failed: {e}"),
                        }
                        Some(guard)
                    }
                    Err(e) => {
                        tracing::warn!(plugin = %plugin_id, "plugin_stop failed: {e}");
                        None
                    }
                }
            } else {
                Some(guard)
            };
            self.teardown_tables(plugin_id);
            if let Some(guard) = guard.as_mut() {
                guard.retire();
            }
            drop(guard);
            drop(instance);
        }

        let mut plugins = self.plugins.write().await;
        if let Some(entry) = plugins.get_mut(plugin_id) {
            self.transition(plugin_id, entry, LifecycleState::Stopped);
        }
        Ok(())
    }

    /// Disable (if running) then enable with a brand-new instance.
    pub async fn reload(&self, plugin_id: &str, config: Value) -> Result<(), PluginError> {
        if self.state(plugin_id).await? == LifecycleState::Running {
            self.disable(plugin_id).await?;
        }
        self.enable(plugin_id, config).await
    }

    /// Disable every running plugin.
    pub async fn shutdown(&self) {
        let running: Vec<String> = self
            .plugins
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.state == LifecycleState::Running)
            .map(|(id, _)| id.clone())
            .collect();
        for plugin_id in running {
            if let Err(e) = self.disable(&plugin_id).await {
                tracing::warn!(plugin = %plugin_id, "failed to stop plugin during shutdown: {e}");
            }
        }
    }

    /// Remove everything the plugin registered in the shared tables.
    fn teardown_tables(&self, plugin_id: &str) {
        let sockets = self.services.sockets.close_all_for(plugin_id);
        let providers = self.services.providers.unregister_plugin(plugin_id);
        let put_handlers = self.services.put_handlers.unregister_plugin(plugin_id);
        tracing::debug!(plugin = %plugin_id, sockets, providers, put_handlers, "tore down plugin state");
    }

    async fn record_crash(&self, plugin_id: &str, error: &PluginError) {
        tracing::error!(plugin = %plugin_id, "plugin crashed: {error}");
        let message = error.to_string();
        {
            let mut plugins = self.plugins.write().await;
            if let Some(entry) = plugins.get_mut(plugin_id) {
                entry.last_error = Some(message.clone());
                entry.instance = None;
                entry.endpoints.clear();
                self.transition(plugin_id, entry, LifecycleState::Crashed);
            }
        }
        self.services.events.set_error(plugin_id, &message);
    }

    async fn is_current(&self, plugin_id: &str, instance_id: Uuid) -> bool {
        self.plugins
            .read()
            .await
            .get(plugin_id)
            .and_then(|entry| entry.instance.as_ref())
            .is_some_and(|instance| instance.id == instance_id)
    }

    /// Move a running instance to `Crashed` after a fatal guest fault.
    async fn crash(&self, plugin_id: &str, instance_id: Uuid, guard: &mut PluginSandbox, error: &PluginError) {
        if !self.is_current(plugin_id, instance_id).await {
            guard.retire();
            return;
        }
        self.teardown_tables(plugin_id);
        guard.retire();
        self.record_crash(plugin_id, error).await;
    }

    pub(crate) async fn live_instance(&self, plugin_id: &str) -> Result<LiveInstance, PluginError> {
        let plugins = self.plugins.read().await;
        let entry = plugins
            .get(plugin_id)
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
        match (&entry.state, &entry.instance) {
            (LifecycleState::Running, Some(instance)) => Ok(instance.clone()),
            (state, _) => Err(PluginError::InvalidState(format!(
                "plugin '{plugin_id}' is {state:?}"
            ))),
        }
    }

    /// Call into a running plugin, delivering its effects on success.
    ///
    /// A fatal guest fault crashes the instance.
    pub(crate) async fn call_guest(&self, plugin_id: &str, call: GuestCall) -> Result<GuestValue, PluginError> {
        let instance = self.live_instance(plugin_id).await?;
        let mut guard = instance.sandbox.clone().lock_owned().await;
        if guard.is_retired() {
            if !self.is_current(plugin_id, instance.id).await {
                return Err(PluginError::InvalidState(format!(
                    "plugin '{plugin_id}' instance has been torn down"
                )));
            }
            // a call nobody waited for faulted
            let error = PluginError::Trap {
                plugin: plugin_id.to_string(),
                message: "instance faulted during an earlier call".into(),
            };
            self.crash(plugin_id, instance.id, &mut guard, &error).await;
            return Err(error);
        }
        let (mut guard, result) = match execute(plugin_id, guard, call).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // the guard went down with the task
                if self.is_current(plugin_id, instance.id).await {
                    self.teardown_tables(plugin_id);
                    self.record_crash(plugin_id, &e).await;
                }
                return Err(e);
            }
        };
        match result {
            Ok(value) => {
                let effects = guard.take_effects();
                drop(guard);
                app::deliver(&*self.services.app, plugin_id, effects);
                Ok(value)
            }
            Err(e) => {
                if e.is_fatal() {
                    self.crash(plugin_id, instance.id, &mut guard, &e).await;
                }
                Err(e)
            }
        }
    }

    /// Call a text export with optional input.
    pub async fn call_export(
        &self,
        plugin_id: &str,
        export: &str,
        input: Option<String>,
    ) -> Result<Option<String>, PluginError> {
        self.call_guest(plugin_id, GuestCall::text(export, input))
            .await
            .map(GuestValue::into_text)
    }

    /// Call a status export with optional input.
    pub async fn call_status_export(
        &self,
        plugin_id: &str,
        export: &str,
        input: Option<String>,
    ) -> Result<i32, PluginError> {
        let value = self.call_guest(plugin_id, GuestCall::status(export, input)).await?;
        Ok(value.status().unwrap_or(0))
    }

    // ── Introspection ────────────────────────────────────────────────

    pub async fn state(&self, plugin_id: &str) -> Result<LifecycleState, PluginError> {
        self.plugins
            .read()
            .await
            .get(plugin_id)
            .map(|entry| entry.state)
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))
    }

    pub async fn last_error(&self, plugin_id: &str) -> Option<String> {
        self.plugins
            .read()
            .await
            .get(plugin_id)
            .and_then(|entry| entry.last_error.clone())
    }

    pub fn status(&self, plugin_id: &str) -> StatusReport {
        self.services.events.report(plugin_id)
    }

    pub async fn identity(&self, plugin_id: &str) -> Option<PluginIdentity> {
        self.plugins
            .read()
            .await
            .get(plugin_id)
            .map(|entry| entry.identity.clone())
    }

    pub async fn instance_id(&self, plugin_id: &str) -> Option<Uuid> {
        self.plugins
            .read()
            .await
            .get(plugin_id)
            .and_then(|entry| entry.instance.as_ref().map(|i| i.id))
    }

    pub async fn manifest(&self, plugin_id: &str) -> Option<PluginManifest> {
        self.plugins
            .read()
            .await
            .get(plugin_id)
            .map(|entry| entry.manifest.clone())
    }

    pub(crate) async fn endpoints(&self, plugin_id: &str) -> Vec<HttpEndpoint> {
        self.plugins
            .read()
            .await
            .get(plugin_id)
            .map(|entry| entry.endpoints.clone())
            .unwrap_or_default()
    }

    pub async fn plugin_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn socket_count(&self, plugin_id: &str) -> usize {
        self.services.sockets.count_for(plugin_id)
    }

    pub fn provider_count(&self, plugin_id: &str) -> usize {
        self.services.providers.count_for(plugin_id)
    }

    pub fn put_handler_count(&self, plugin_id: &str) -> usize {
        self.services.put_handlers.count_for(plugin_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::DeltaVersion;
    use crate::manifest::CapabilitySet;

    struct NullApp;

    impl ServerApp for NullApp {
        fn handle_message(&self, _: &str, _: Value, _: DeltaVersion) {}
        fn self_path(&self, _: &str) -> Option<Value> {
            None
        }
        fn emit_binary_stream(&self, _: &str, _: &str, _: Vec<u8>) {}
        fn emit_radar_spokes(&self, _: &str, _: &str, _: Vec<u8>) {}
    }

    fn manifest(id: &str, dir: &std::path::Path) -> PluginManifest {
        PluginManifest {
            id: id.to_string(),
            name: id.to_string(),
            version: None,
            binary_path: dir.join("missing.wasm"),
            capabilities: CapabilitySet::default(),
            storage_root: dir.join("data").join(id),
        }
    }

    #[test]
    fn test_lifecycle_state_serialization() {
        assert_eq!(serde_json::to_value(LifecycleState::Crashed).unwrap(), "crashed");
        assert_eq!(serde_json::to_value(LifecycleState::Running).unwrap(), "running");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_discover_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = PluginSupervisor::new(SandboxConfig::default(), Arc::new(NullApp))
            .await
            .unwrap();
        supervisor.discover(manifest("alpha", dir.path())).await.unwrap();
        let err = supervisor
            .discover(manifest("alpha", dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::AlreadyExists(_)));
        assert_eq!(supervisor.state("alpha").await.unwrap(), LifecycleState::Discovered);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_enable_missing_binary_crashes() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = PluginSupervisor::new(SandboxConfig::default(), Arc::new(NullApp))
            .await
            .unwrap();
        supervisor.discover(manifest("alpha", dir.path())).await.unwrap();

        let err = supervisor.enable("alpha", Value::Null).await.unwrap_err();
        assert!(matches!(err, PluginError::BinaryLoad(_)));
        assert_eq!(supervisor.state("alpha").await.unwrap(), LifecycleState::Crashed);
        assert!(supervisor.last_error("alpha").await.is_some());
        assert!(supervisor.status("alpha").error.is_some());
        assert!(dir.path().join("data").join("alpha").is_dir());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_plugin() {
        let supervisor = PluginSupervisor::new(SandboxConfig::default(), Arc::new(NullApp))
            .await
            .unwrap();
        assert!(matches!(
            supervisor.enable("ghost", Value::Null).await,
            Err(PluginError::NotFound(_))
        ));
        assert!(matches!(
            supervisor.call_export("ghost", "plugin_id", None).await,
            Err(PluginError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disable_requires_running() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = PluginSupervisor::new(SandboxConfig::default(), Arc::new(NullApp))
            .await
            .unwrap();
        supervisor.discover(manifest("alpha", dir.path())).await.unwrap();
        assert!(matches!(
            supervisor.disable("alpha").await,
            Err(PluginError::InvalidState(_))
        ));
    }
}

//! WASM plugin sandbox on wasmtime.
//!
//! Each plugin runs in its own store with a memory cap and an optional
//! per-call fuel budget. A call into the guest is driven in two phases so a
//! suspension can be awaited outside the store: [`PluginSandbox::begin_call`]
//! runs the export until it returns or unwinds, and
//! [`PluginSandbox::resume_call`] replays it once the awaited operation has
//! completed.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::oneshot;
use wasmtime::{Instance, Store, Trap};
use wasmtime_wasi::I32Exit;

use crate::abi::{self, CallingConvention, GuestCall, GuestValue, PreparedCall};
use crate::app::DataEffect;
use crate::asyncify::{self, AsyncOutcome, AsyncifyState, ASYNCIFY_DATA_SIZE};
use crate::error::PluginError;
use crate::host_functions::HostState;
use crate::loader::ExportTable;

// ─── Configuration ──────────────────────────────────────────────────────

/// Configuration for the WASM sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum linear memory in bytes (default: 64 MB).
    pub memory_limit: usize,
    /// Instruction budget per guest call; `None` disables metering.
    pub fuel_limit: Option<u64>,
    /// HTTP request timeout in seconds (default: 30).
    pub http_timeout_secs: u64,
    /// Parent directory of every plugin's isolated storage root.
    pub data_dir: PathBuf,
    /// Timeout for allow-listed commands in seconds (default: 10).
    pub command_timeout_secs: u64,
    /// Output cap for allow-listed commands in bytes (default: 512 KB).
    pub command_output_limit: usize,
    /// Inbound datagrams buffered per socket before the oldest is dropped.
    pub socket_queue_limit: usize,
    /// Output buffer handed to buffer-passing exports, in bytes.
    pub response_buffer_size: u32,
    /// Whether guests share the host's stdout/stderr.
    pub inherit_stdio: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 64 * 1024 * 1024,
            fuel_limit: None,
            http_timeout_secs: 30,
            data_dir: PathBuf::from("./plugin-config-data"),
            command_timeout_secs: 10,
            command_output_limit: 512 * 1024,
            socket_queue_limit: 1000,
            response_buffer_size: 256 * 1024,
            inherit_stdio: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            memory_limit: env_parse::<usize>("PLUGIN_MEMORY_LIMIT_MB")
                .map(|mb| mb * 1024 * 1024)
                .unwrap_or(defaults.memory_limit),
            fuel_limit: env_parse("PLUGIN_FUEL_LIMIT"),
            http_timeout_secs: env_parse("PLUGIN_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            data_dir: std::env::var("PLUGIN_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            command_timeout_secs: env_parse("PLUGIN_COMMAND_TIMEOUT_SECS")
                .unwrap_or(defaults.command_timeout_secs),
            command_output_limit: env_parse::<usize>("PLUGIN_COMMAND_OUTPUT_LIMIT_KB")
                .map(|kb| kb * 1024)
                .unwrap_or(defaults.command_output_limit),
            socket_queue_limit: env_parse("PLUGIN_SOCKET_QUEUE_LIMIT")
                .unwrap_or(defaults.socket_queue_limit),
            response_buffer_size: env_parse::<u32>("PLUGIN_RESPONSE_BUFFER_KB")
                .map(|kb| kb * 1024)
                .unwrap_or(defaults.response_buffer_size),
            inherit_stdio: std::env::var("PLUGIN_WASI_INHERIT_STDIO")
                .unwrap_or_default()
                .eq_ignore_ascii_case("true"),
        }
    }
}

/// Classify an error raised while guest code was running.
pub(crate) fn guest_fault(plugin: &str, error: wasmtime::Error) -> PluginError {
    if let Some(Trap::OutOfFuel) = error.downcast_ref::<Trap>() {
        return PluginError::FuelExhausted(plugin.to_string());
    }
    if let Some(exit) = error.downcast_ref::<I32Exit>() {
        return PluginError::Trap {
            plugin: plugin.to_string(),
            message: format!("guest exited with status {}", exit.0),
        };
    }
    let message = format!("{error:#}");
    if message.contains("forcing trap when growing memory") {
        return PluginError::MemoryExceeded(plugin.to_string());
    }
    PluginError::Trap {
        plugin: plugin.to_string(),
        message,
    }
}

// ─── Sandbox ────────────────────────────────────────────────────────────

/// A call that unwound and waits for its host operation.
#[derive(Debug)]
pub struct PendingCall {
    prepared: PreparedCall,
}

impl PendingCall {
    pub fn export(&self) -> &str {
        &self.prepared.export
    }
}

#[derive(Debug)]
pub enum CallStep {
    Done(GuestValue),
    /// The guest suspended; complete `completion`, then call
    /// [`PluginSandbox::resume_call`].
    Suspended {
        pending: PendingCall,
        completion: oneshot::Receiver<AsyncOutcome>,
    },
}

/// A loaded WASM plugin instance.
pub struct PluginSandbox {
    plugin_id: String,
    store: Store<HostState>,
    instance: Instance,
    exports: Arc<ExportTable>,
    fuel_limit: Option<u64>,
    response_buffer_size: u32,
    retired: bool,
}

impl std::fmt::Debug for PluginSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSandbox")
            .field("plugin_id", &self.plugin_id)
            .field("convention", &self.exports.convention)
            .field("asyncify", &self.exports.asyncify)
            .finish_non_exhaustive()
    }
}

impl PluginSandbox {
    /// Run the module's initializer and reserve the asyncify data region.
    pub(crate) fn new(
        plugin_id: &str,
        store: Store<HostState>,
        instance: Instance,
        exports: Arc<ExportTable>,
        fuel_limit: Option<u64>,
        response_buffer_size: u32,
    ) -> Result<Self, PluginError> {
        let mut sandbox = Self {
            plugin_id: plugin_id.to_string(),
            store,
            instance,
            exports,
            fuel_limit,
            response_buffer_size,
            retired: false,
        };
        sandbox.initialize()?;

        if sandbox.exports.asyncify {
            sandbox.refuel()?;
            let ptr = abi::allocate_region(
                &mut sandbox.store,
                &sandbox.instance,
                &sandbox.plugin_id,
                sandbox.exports.convention,
                ASYNCIFY_DATA_SIZE,
            )?;
            sandbox.store.data_mut().bridge.set_data_region(ptr);
        }
        sandbox.store.data_mut().outbox.clear();
        Ok(sandbox)
    }

    fn initialize(&mut self) -> Result<(), PluginError> {
        self.refuel()?;
        if self.exports.has("_initialize") {
            abi::call_export(&mut self.store, &self.instance, &self.plugin_id, "_initialize", &[])?;
        } else if self.exports.has("_start") {
            let start = self
                .instance
                .get_typed_func::<(), ()>(&mut self.store, "_start")
                .map_err(|e| PluginError::Protocol(format!("_start: {e}")))?;
            if let Err(e) = start.call(&mut self.store, ()) {
                match e.downcast_ref::<I32Exit>() {
                    Some(I32Exit(0)) => {}
                    _ => return Err(guest_fault(&self.plugin_id, e)),
                }
            }
        }
        Ok(())
    }

    fn refuel(&mut self) -> Result<(), PluginError> {
        if let Some(fuel) = self.fuel_limit {
            self.store
                .set_fuel(fuel)
                .map_err(|e| PluginError::Sandbox(format!("failed to set fuel: {e}")))?;
        }
        Ok(())
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn exports(&self) -> &ExportTable {
        &self.exports
    }

    pub fn convention(&self) -> CallingConvention {
        self.exports.convention
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.exports.has(name)
    }

    pub fn async_state(&self) -> AsyncifyState {
        self.store.data().bridge.state()
    }

    /// Hand over the data effects of the call that just completed.
    pub fn take_effects(&mut self) -> Vec<DataEffect> {
        std::mem::take(&mut self.store.data_mut().outbox)
    }

    /// Drop any suspension state and buffered effects.
    pub fn clear_async(&mut self) {
        let state = self.store.data_mut();
        state.bridge.clear();
        state.outbox.clear();
    }

    /// Mark the instance torn down; later calls are refused.
    pub fn retire(&mut self) {
        self.clear_async();
        self.retired = true;
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    fn invoke(&mut self, prepared: &PreparedCall) -> Result<Vec<wasmtime::Val>, PluginError> {
        let mut results = prepared.result_slots();
        prepared
            .func
            .call(&mut self.store, &prepared.args, &mut results)
            .map_err(|e| guest_fault(&self.plugin_id, e))?;
        if let Some(violation) = self.store.data_mut().bridge.take_violation() {
            return Err(PluginError::Protocol(format!(
                "export '{}': {violation}",
                prepared.export
            )));
        }
        Ok(results)
    }

    fn fail(&mut self, prepared: &PreparedCall, error: PluginError) -> PluginError {
        if !error.is_fatal() {
            abi::release(&mut self.store, &self.instance, &self.plugin_id, prepared);
        }
        self.clear_async();
        error
    }

    fn finish(&mut self, prepared: PreparedCall, results: &[wasmtime::Val]) -> Result<GuestValue, PluginError> {
        let value = abi::lift(&mut self.store, &self.instance, &prepared, results);
        abi::release(&mut self.store, &self.instance, &self.plugin_id, &prepared);
        match value {
            Ok(value) => {
                self.store.data_mut().bridge.disarm();
                Ok(value)
            }
            Err(e) => {
                self.clear_async();
                Err(e)
            }
        }
    }

    /// Start a call. The continuation is armed before the export runs.
    pub fn begin_call(&mut self, call: &GuestCall) -> Result<CallStep, PluginError> {
        if self.retired {
            return Err(PluginError::InvalidState(format!(
                "plugin '{}' instance has been torn down",
                self.plugin_id
            )));
        }
        self.refuel()?;
        let completion = self.store.data_mut().bridge.arm()?;
        let prepared = match abi::prepare(
            &mut self.store,
            &self.instance,
            &self.plugin_id,
            self.exports.convention,
            call,
            self.response_buffer_size,
        ) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.clear_async();
                return Err(e);
            }
        };

        let results = match self.invoke(&prepared) {
            Ok(results) => results,
            Err(e) => return Err(self.fail(&prepared, e)),
        };
        if self.async_state() == AsyncifyState::Unwound {
            if let Err(e) = asyncify::stop_unwind(&mut self.store, &self.instance) {
                return Err(self.fail(&prepared, e));
            }
            tracing::debug!(plugin = %self.plugin_id, export = %prepared.export, "guest suspended");
            return Ok(CallStep::Suspended {
                pending: PendingCall { prepared },
                completion,
            });
        }
        self.finish(prepared, &results).map(CallStep::Done)
    }

    /// Replay a suspended call with the outcome of its host operation.
    ///
    /// The export is invoked exactly once more; unwinding again is a
    /// protocol violation.
    pub fn resume_call(&mut self, pending: PendingCall, outcome: AsyncOutcome) -> Result<GuestValue, PluginError> {
        let PendingCall { prepared } = pending;
        if let Err(e) = self.replay(&prepared, outcome) {
            return Err(self.fail(&prepared, e));
        }
        let results = match self.invoke(&prepared) {
            Ok(results) => results,
            Err(e) => return Err(self.fail(&prepared, e)),
        };
        match self.async_state() {
            AsyncifyState::Normal => self.finish(prepared, &results),
            AsyncifyState::Unwound => {
                // leave the guest in a callable state before reporting
                if let Err(e) = asyncify::stop_unwind(&mut self.store, &self.instance) {
                    tracing::warn!(plugin = %self.plugin_id, export = %prepared.export, "failed to stop unwinding: {e}");
                }
                let error = PluginError::Protocol(format!(
                    "export '{}' suspended again while resuming",
                    prepared.export
                ));
                Err(self.fail(&prepared, error))
            }
            AsyncifyState::Rewound => {
                let error = PluginError::Protocol(format!(
                    "export '{}' returned without reaching its suspension point",
                    prepared.export
                ));
                Err(self.fail(&prepared, error))
            }
        }
    }

    fn replay(&mut self, prepared: &PreparedCall, outcome: AsyncOutcome) -> Result<(), PluginError> {
        self.refuel()?;
        self.store.data_mut().bridge.mark_rewound(outcome)?;
        asyncify::start_rewind(&mut self.store, &self.instance)?;
        tracing::debug!(plugin = %self.plugin_id, export = %prepared.export, "resuming guest");
        Ok(())
    }

    /// Run a call to completion on the current thread.
    ///
    /// A suspension is awaited by blocking on the runtime, so this must run
    /// on a blocking thread. Used where no other work can interleave, such as
    /// while the sandbox is still being set up.
    pub fn call_blocking(&mut self, call: &GuestCall) -> Result<GuestValue, PluginError> {
        match self.begin_call(call)? {
            CallStep::Done(value) => Ok(value),
            CallStep::Suspended { pending, completion } => {
                let outcome = completion
                    .blocking_recv()
                    .unwrap_or_else(|_| Err("host operation was abandoned".into()));
                self.resume_call(pending, outcome)
            }
        }
    }

    /// Guest-side asyncify state, for diagnostics.
    pub fn guest_async_state(&mut self) -> Result<i32, PluginError> {
        if !self.exports.asyncify {
            return Ok(asyncify::GUEST_STATE_NORMAL);
        }
        asyncify::guest_state(&mut self.store, &self.instance)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

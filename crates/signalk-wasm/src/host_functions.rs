//! Host functions exposed to WASM plugins.
//!
//! [`HostContext`] holds one plugin's identity, its capabilities and the
//! shared runtime services, and implements every privileged operation with a
//! capability check first. [`link_host_functions`] binds those operations
//! into the guest's `env` import namespace: each binding decodes its
//! arguments from guest memory, calls the context, and turns any error into
//! the binding's failure value. Nothing a binding does can raise into the
//! guest except the AssemblyScript `abort` shim, which is a deliberate trap.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use wasmtime::{Caller, Linker, Memory, StoreLimits};
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::abi::{self, CallingConvention};
use crate::app::{DataEffect, ServerApp};
use crate::asyncify::{self, AsyncBridge, Resumption};
use crate::command::CommandPolicy;
use crate::delta;
use crate::error::PluginError;
use crate::events::EventBus;
use crate::loader::ExportTable;
use crate::manifest::{Capability, CapabilitySet};
use crate::memory;
use crate::providers::{ProviderKind, ProviderRegistration, ProviderRegistry};
use crate::put_handlers::PutHandlerTable;
use crate::sockets::{SocketFamily, SocketId, SocketManager};

/// Maximum HTTP response body size (10 MB).
const MAX_HTTP_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Maximum log message length from plugins.
const MAX_LOG_MESSAGE_LEN: usize = 2048;

/// Room for the textual form of any IPv6 address plus its NUL.
const ADDRESS_OUT_LEN: u32 = 46;

const IMPORT_MODULE: &str = "env";

/// Sanitize a log message from a plugin.
///
/// Strips control characters (except newline/tab), truncates to max length.
fn sanitize_log_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(MAX_LOG_MESSAGE_LEN)
        .collect();
    if message.chars().count() > MAX_LOG_MESSAGE_LEN {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}

// ─── Shared services ──────────────────────────────────────────────────

/// Process-wide state shared by every plugin's bindings.
///
/// Owned by the supervisor; bindings only add entries tagged with their own
/// plugin id.
pub struct HostServices {
    pub app: Arc<dyn ServerApp>,
    pub events: Arc<EventBus>,
    pub sockets: Arc<SocketManager>,
    pub providers: Arc<ProviderRegistry>,
    pub put_handlers: Arc<PutHandlerTable>,
    pub commands: CommandPolicy,
    /// Shared HTTP client for connection pooling.
    pub http_client: reqwest::Client,
    pub runtime: Handle,
}

/// HTTP response handed back to `sk_fetch` callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Options accepted by `sk_fetch`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FetchOptions {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

// ─── Host context ─────────────────────────────────────────────────────

/// Per-instance binding state, created once at load.
#[derive(Clone)]
pub struct HostContext {
    plugin_id: String,
    capabilities: Arc<CapabilitySet>,
    pub(crate) exports: Arc<ExportTable>,
    storage_root: PathBuf,
    services: Arc<HostServices>,
    /// Whether provider and PUT registrations are currently accepted.
    accepting: Arc<AtomicBool>,
}

impl HostContext {
    pub fn new(
        plugin_id: &str,
        capabilities: Arc<CapabilitySet>,
        exports: Arc<ExportTable>,
        storage_root: &Path,
        services: Arc<HostServices>,
        accepting: Arc<AtomicBool>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            capabilities,
            exports,
            storage_root: storage_root.to_path_buf(),
            services,
            accepting,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn convention(&self) -> CallingConvention {
        self.exports.convention
    }

    fn check(&self, capability: Capability) -> Result<(), PluginError> {
        if self.capabilities.allows(capability) {
            Ok(())
        } else {
            Err(PluginError::CapabilityDenied(format!(
                "plugin '{}' does not declare {}",
                self.plugin_id,
                capability.key()
            )))
        }
    }

    fn check_accepting(&self) -> Result<(), PluginError> {
        if self.accepting.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(PluginError::InvalidState(format!(
                "plugin '{}' is not starting or running",
                self.plugin_id
            )))
        }
    }

    // ── Logging and status (no capability) ───────────────────────────

    pub fn log_debug(&self, message: &str) {
        let msg = sanitize_log_message(message);
        tracing::debug!(plugin = %self.plugin_id, "{msg}");
    }

    pub fn set_status(&self, message: &str) {
        let msg = sanitize_log_message(message);
        tracing::info!(plugin = %self.plugin_id, "status: {msg}");
        self.services.events.set_status(&self.plugin_id, &msg);
    }

    pub fn set_error(&self, message: &str) {
        let msg = sanitize_log_message(message);
        tracing::warn!(plugin = %self.plugin_id, "error: {msg}");
        self.services.events.set_error(&self.plugin_id, &msg);
    }

    pub fn has_capability(&self, key: &str) -> bool {
        Capability::from_key(key).is_some_and(|cap| self.capabilities.allows(cap))
    }

    // ── Data (no capability) ─────────────────────────────────────────

    /// Parse a delta document and route it by path prefix.
    pub fn route_message(&self, json: &str) -> Result<Vec<DataEffect>, PluginError> {
        let delta: Value = serde_json::from_str(json)?;
        Ok(delta::route_delta(delta)?
            .into_iter()
            .map(|(delta, version)| DataEffect::Delta { delta, version })
            .collect())
    }

    pub fn self_path(&self, path: &str) -> Option<Value> {
        self.services.app.self_path(path)
    }

    // ── Privileged commands (allow-list) ─────────────────────────────

    pub async fn exec_command(&self, command: &str) -> Result<String, PluginError> {
        let output = self.services.commands.run(command).await?;
        tracing::info!(plugin = %self.plugin_id, command = %command, bytes = output.len(), "ran command");
        Ok(output)
    }

    // ── Network (requires network) ───────────────────────────────────

    /// Perform an HTTP request. Requires the `network` capability.
    pub async fn fetch(&self, url: &str, options: FetchOptions) -> Result<HttpResponse, PluginError> {
        self.check(Capability::Network)?;
        let parsed = url::Url::parse(url)
            .map_err(|e| PluginError::Http(format!("invalid URL '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(PluginError::Http(format!(
                "unsupported URL scheme '{}'",
                parsed.scheme()
            )));
        }
        let method = options.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| PluginError::Http(format!("invalid HTTP method '{method}'")))?;

        let mut req = self.services.http_client.request(method, parsed);
        for (k, v) in &options.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(body) = options.body {
            req = req.body(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| PluginError::Http(e.to_string()))?;
        read_response(resp).await
    }

    // ── Registrations ────────────────────────────────────────────────

    pub fn register_put_handler(&self, context: &str, path: &str) -> Result<(), PluginError> {
        self.check(Capability::PutHandlers)?;
        self.check_accepting()?;
        self.services
            .put_handlers
            .register(&self.plugin_id, context, path, self.convention())?;
        Ok(())
    }

    pub fn register_provider(&self, kind: ProviderKind, name: &str) -> Result<(), PluginError> {
        let capability = match kind {
            ProviderKind::Resource => Capability::ResourceProvider,
            ProviderKind::Weather => Capability::WeatherProvider,
            ProviderKind::Radar => Capability::RadarProvider,
        };
        self.check(capability)?;
        self.check_accepting()?;
        if name.trim().is_empty() {
            return Err(PluginError::Protocol("provider name must not be empty".into()));
        }
        let exports = self.exports.clone();
        self.services.providers.register(ProviderRegistration::new(
            &self.plugin_id,
            kind,
            name,
            self.convention(),
            |export| exports.has(export),
        ))
    }

    // ── Streams ──────────────────────────────────────────────────────

    pub fn binary_stream(&self, stream_id: &str, data: Vec<u8>) -> Result<DataEffect, PluginError> {
        self.check(Capability::DataWrite)?;
        Ok(DataEffect::BinaryStream {
            stream_id: stream_id.to_string(),
            data,
        })
    }

    pub fn radar_spokes(&self, radar_id: &str, data: Vec<u8>) -> Result<DataEffect, PluginError> {
        self.check(Capability::RadarProvider)?;
        Ok(DataEffect::RadarSpokes {
            radar_id: radar_id.to_string(),
            data,
        })
    }

    // ── Raw sockets (requires rawSockets) ────────────────────────────

    pub fn sockets(&self) -> Result<&SocketManager, PluginError> {
        self.check(Capability::RawSockets)?;
        Ok(&self.services.sockets)
    }
}

/// Read HTTP response with body size limit.
async fn read_response(resp: reqwest::Response) -> Result<HttpResponse, PluginError> {
    let status = resp.status().as_u16();
    let headers: HashMap<String, String> = resp
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();

    let body_bytes = resp
        .bytes()
        .await
        .map_err(|e| PluginError::Http(e.to_string()))?;

    if body_bytes.len() > MAX_HTTP_RESPONSE_BYTES {
        return Err(PluginError::Http(format!(
            "response body too large: {} bytes (max: {} bytes)",
            body_bytes.len(),
            MAX_HTTP_RESPONSE_BYTES
        )));
    }

    Ok(HttpResponse {
        status,
        headers,
        body: String::from_utf8_lossy(&body_bytes).to_string(),
    })
}

// ─── Store state ──────────────────────────────────────────────────────

/// Everything a plugin's store carries.
pub struct HostState {
    pub(crate) ctx: HostContext,
    pub(crate) bridge: AsyncBridge,
    pub(crate) wasi: WasiP1Ctx,
    pub(crate) limits: StoreLimits,
    /// Data effects of the call in progress.
    pub(crate) outbox: Vec<DataEffect>,
}

impl HostState {
    pub fn new(ctx: HostContext, wasi: WasiP1Ctx, limits: StoreLimits) -> Self {
        Self {
            ctx,
            bridge: AsyncBridge::new(),
            wasi,
            limits,
            outbox: Vec::new(),
        }
    }

    pub fn context(&self) -> &HostContext {
        &self.ctx
    }
}

// ─── Bindings ─────────────────────────────────────────────────────────

type HostCaller<'a> = Caller<'a, HostState>;

fn guest_memory(caller: &mut HostCaller<'_>) -> Result<Memory, PluginError> {
    caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| PluginError::Protocol("module does not export its memory".into()))
}

fn read_str(caller: &mut HostCaller<'_>, ptr: i32, len: i32) -> Result<String, PluginError> {
    let (ptr, len) = memory::guest_region(ptr, len)?;
    let memory = guest_memory(caller)?;
    memory::read_utf8(&*caller, &memory, ptr, len)
}

/// Like [`read_str`], but a zero length means "not given".
fn read_opt_str(caller: &mut HostCaller<'_>, ptr: i32, len: i32) -> Result<Option<String>, PluginError> {
    if len == 0 {
        return Ok(None);
    }
    read_str(caller, ptr, len).map(Some)
}

fn read_bytes(caller: &mut HostCaller<'_>, ptr: i32, len: i32) -> Result<Vec<u8>, PluginError> {
    let (ptr, len) = memory::guest_region(ptr, len)?;
    let memory = guest_memory(caller)?;
    memory::read_binary(&*caller, &memory, ptr, len)
}

/// All-or-nothing write into a guest output buffer.
fn write_out(caller: &mut HostCaller<'_>, value: &[u8], out: i32, max: i32) -> Result<i32, PluginError> {
    if max <= 0 {
        return Ok(0);
    }
    let memory = guest_memory(caller)?;
    let written = memory::write_binary(&mut *caller, &memory, value, out as u32, max as u32)?;
    Ok(written as i32)
}

/// Fail unless `[ptr, ptr + len)` lies inside guest memory.
fn check_out(caller: &mut HostCaller<'_>, ptr: i32, len: i32) -> Result<(), PluginError> {
    let (ptr, len) = memory::guest_region(ptr, len)?;
    let memory = guest_memory(caller)?;
    memory::checked_range(ptr, len, memory.data_size(&*caller))?;
    Ok(())
}

fn port_arg(port: i32) -> Result<u16, PluginError> {
    u16::try_from(port).map_err(|_| PluginError::Socket(format!("invalid port {port}")))
}

/// Resolve a binding's outcome to the value the guest sees.
fn settle<T>(caller: &HostCaller<'_>, import: &str, failure: T, result: Result<T, PluginError>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            let plugin = caller.data().ctx.plugin_id();
            match e {
                PluginError::CapabilityDenied(_) | PluginError::CommandNotAllowed(_) => {
                    tracing::warn!(plugin = %plugin, import, "{e}")
                }
                _ => tracing::debug!(plugin = %plugin, import, "{e}"),
            }
            failure
        }
    }
}

fn link_error(e: wasmtime::Error) -> PluginError {
    PluginError::Sandbox(format!("failed to link host function: {e}"))
}

/// Bind the whole `env` namespace into `linker`.
///
/// AssemblyScript runtime shims are only provided to wrapped-bindings
/// modules, since other toolchains may import `env.abort` with a different
/// signature.
pub fn link_host_functions(
    linker: &mut Linker<HostState>,
    convention: CallingConvention,
) -> Result<(), PluginError> {
    link_reporting(linker).map_err(link_error)?;
    link_data(linker).map_err(link_error)?;
    link_registrations(linker).map_err(link_error)?;
    link_network(linker).map_err(link_error)?;
    link_sockets(linker).map_err(link_error)?;
    if convention == CallingConvention::WrappedBindings {
        link_runtime_shims(linker).map_err(link_error)?;
    }
    Ok(())
}

fn link_reporting(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap(IMPORT_MODULE, "sk_debug", |mut caller: HostCaller<'_>, ptr: i32, len: i32| {
        let result = read_str(&mut caller, ptr, len).map(|msg| caller.data().ctx.log_debug(&msg));
        settle(&caller, "sk_debug", (), result)
    })?;
    linker.func_wrap(IMPORT_MODULE, "sk_set_status", |mut caller: HostCaller<'_>, ptr: i32, len: i32| {
        let result = read_str(&mut caller, ptr, len).map(|msg| caller.data().ctx.set_status(&msg));
        settle(&caller, "sk_set_status", (), result)
    })?;
    linker.func_wrap(IMPORT_MODULE, "sk_set_error", |mut caller: HostCaller<'_>, ptr: i32, len: i32| {
        let result = read_str(&mut caller, ptr, len).map(|msg| caller.data().ctx.set_error(&msg));
        settle(&caller, "sk_set_error", (), result)
    })?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sk_has_capability",
        |mut caller: HostCaller<'_>, ptr: i32, len: i32| -> i32 {
            let result = read_str(&mut caller, ptr, len)
                .map(|key| i32::from(caller.data().ctx.has_capability(&key)));
            settle(&caller, "sk_has_capability", 0, result)
        },
    )?;
    Ok(())
}

fn link_data(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap(IMPORT_MODULE, "sk_handle_message", |mut caller: HostCaller<'_>, ptr: i32, len: i32| {
        let result = read_str(&mut caller, ptr, len).and_then(|json| {
            let effects = caller.data().ctx.route_message(&json)?;
            caller.data_mut().outbox.extend(effects);
            Ok(())
        });
        settle(&caller, "sk_handle_message", (), result)
    })?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sk_get_self_path",
        |mut caller: HostCaller<'_>, path_ptr: i32, path_len: i32, out: i32, max: i32| -> i32 {
            let result = read_str(&mut caller, path_ptr, path_len).and_then(|path| {
                match caller.data().ctx.self_path(&path) {
                    Some(value) => {
                        let json = serde_json::to_vec(&value)?;
                        write_out(&mut caller, &json, out, max)
                    }
                    None => Ok(0),
                }
            });
            settle(&caller, "sk_get_self_path", 0, result)
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sk_exec_command",
        |mut caller: HostCaller<'_>, cmd_ptr: i32, cmd_len: i32, out: i32, max: i32| -> i32 {
            let result = read_str(&mut caller, cmd_ptr, cmd_len).and_then(|command| {
                let ctx = caller.data().ctx.clone();
                let output = ctx.services.runtime.block_on(ctx.exec_command(&command))?;
                write_out(&mut caller, output.as_bytes(), out, max)
            });
            settle(&caller, "sk_exec_command", 0, result)
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sk_emit_binary_stream",
        |mut caller: HostCaller<'_>, id_ptr: i32, id_len: i32, data_ptr: i32, data_len: i32| -> i32 {
            let result = caller
                .data()
                .ctx
                .check(Capability::DataWrite)
                .and_then(|()| read_str(&mut caller, id_ptr, id_len))
                .and_then(|id| {
                    let data = read_bytes(&mut caller, data_ptr, data_len)?;
                    let effect = caller.data().ctx.binary_stream(&id, data)?;
                    caller.data_mut().outbox.push(effect);
                    Ok(1)
                });
            settle(&caller, "sk_emit_binary_stream", 0, result)
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sk_radar_emit_spokes",
        |mut caller: HostCaller<'_>, id_ptr: i32, id_len: i32, data_ptr: i32, data_len: i32| -> i32 {
            let result = caller
                .data()
                .ctx
                .check(Capability::RadarProvider)
                .and_then(|()| read_str(&mut caller, id_ptr, id_len))
                .and_then(|id| {
                    let data = read_bytes(&mut caller, data_ptr, data_len)?;
                    let effect = caller.data().ctx.radar_spokes(&id, data)?;
                    caller.data_mut().outbox.push(effect);
                    Ok(1)
                });
            settle(&caller, "sk_radar_emit_spokes", 0, result)
        },
    )?;
    Ok(())
}

fn link_registrations(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        IMPORT_MODULE,
        "sk_register_put_handler",
        |mut caller: HostCaller<'_>, ctx_ptr: i32, ctx_len: i32, path_ptr: i32, path_len: i32| -> i32 {
            let result = caller
                .data()
                .ctx
                .check(Capability::PutHandlers)
                .and_then(|()| {
                    let context = read_str(&mut caller, ctx_ptr, ctx_len)?;
                    let path = read_str(&mut caller, path_ptr, path_len)?;
                    caller.data().ctx.register_put_handler(&context, &path)?;
                    Ok(1)
                });
            settle(&caller, "sk_register_put_handler", 0, result)
        },
    )?;

    for (import, kind) in [
        ("sk_register_resource_provider", ProviderKind::Resource),
        ("sk_register_weather_provider", ProviderKind::Weather),
        ("sk_register_radar_provider", ProviderKind::Radar),
    ] {
        linker.func_wrap(
            IMPORT_MODULE,
            import,
            move |mut caller: HostCaller<'_>, ptr: i32, len: i32| -> i32 {
                let result = read_str(&mut caller, ptr, len).and_then(|name| {
                    caller.data().ctx.register_provider(kind, &name)?;
                    Ok(1)
                });
                settle(&caller, import, 0, result)
            },
        )?;
    }
    Ok(())
}

fn link_network(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    // Suspends the guest on the first pass and completes on the replay.
    linker.func_wrap(
        IMPORT_MODULE,
        "sk_fetch",
        |mut caller: HostCaller<'_>,
         url_ptr: i32,
         url_len: i32,
         opts_ptr: i32,
         opts_len: i32,
         out: i32,
         max: i32|
         -> i32 {
            let result = caller
                .data()
                .ctx
                .check(Capability::Network)
                .and_then(|()| {
                    let url = read_str(&mut caller, url_ptr, url_len)?;
                    let options = match read_opt_str(&mut caller, opts_ptr, opts_len)? {
                        Some(json) => serde_json::from_str::<FetchOptions>(&json)?,
                        None => FetchOptions::default(),
                    };
                    let ctx = caller.data().ctx.clone();
                    let resumption = asyncify::suspend_or_resume(&mut caller, move |done| {
                        let runtime = ctx.services.runtime.clone();
                        runtime.spawn(async move {
                            let outcome = ctx
                                .fetch(&url, options)
                                .await
                                .and_then(|resp| Ok(serde_json::to_vec(&resp)?))
                                .map_err(|e| e.to_string());
                            // the waiting call may have been torn down
                            let _ = done.send(outcome);
                        });
                    })?;
                    match resumption {
                        Resumption::Suspended => Ok(0),
                        Resumption::Resumed(Ok(body)) => write_out(&mut caller, &body, out, max),
                        Resumption::Resumed(Err(e)) => Err(PluginError::Http(e)),
                    }
                });
            settle(&caller, "sk_fetch", -1, result)
        },
    )?;
    Ok(())
}

fn link_sockets(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap(IMPORT_MODULE, "sk_udp_create", |caller: HostCaller<'_>, family: i32| -> i32 {
        let ctx = &caller.data().ctx;
        let result = ctx.sockets().and_then(|sockets| {
            let family = SocketFamily::from_abi(family)
                .ok_or_else(|| PluginError::Socket(format!("unknown socket family {family}")))?;
            Ok(sockets.create(ctx.plugin_id(), family))
        });
        settle(&caller, "sk_udp_create", -1, result)
    })?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sk_udp_bind",
        |mut caller: HostCaller<'_>, id: SocketId, port: i32, addr_ptr: i32, addr_len: i32| -> i32 {
            let result = caller.data().ctx.check(Capability::RawSockets).and_then(|()| {
                let address = read_opt_str(&mut caller, addr_ptr, addr_len)?;
                let port = port_arg(port)?;
                let ctx = &caller.data().ctx;
                ctx.sockets()?.bind(ctx.plugin_id(), id, port, address.as_deref())?;
                Ok(0)
            });
            settle(&caller, "sk_udp_bind", -1, result)
        },
    )?;
    for (import, join) in [("sk_udp_join_multicast", true), ("sk_udp_leave_multicast", false)] {
        linker.func_wrap(
            IMPORT_MODULE,
            import,
            move |mut caller: HostCaller<'_>, id: SocketId, grp_ptr: i32, grp_len: i32, if_ptr: i32, if_len: i32| -> i32 {
                let result = caller.data().ctx.check(Capability::RawSockets).and_then(|()| {
                    let group = read_str(&mut caller, grp_ptr, grp_len)?;
                    let iface = read_opt_str(&mut caller, if_ptr, if_len)?;
                    let ctx = &caller.data().ctx;
                    let sockets = ctx.sockets()?;
                    if join {
                        sockets.join_multicast(ctx.plugin_id(), id, &group, iface.as_deref())?;
                    } else {
                        sockets.leave_multicast(ctx.plugin_id(), id, &group, iface.as_deref())?;
                    }
                    Ok(0)
                });
                settle(&caller, import, -1, result)
            },
        )?;
    }
    linker.func_wrap(
        IMPORT_MODULE,
        "sk_udp_set_multicast_ttl",
        |caller: HostCaller<'_>, id: SocketId, ttl: i32| -> i32 {
            let ctx = &caller.data().ctx;
            let result = ctx.sockets().and_then(|sockets| {
                let ttl = u8::try_from(ttl)
                    .map_err(|_| PluginError::Socket(format!("invalid multicast TTL {ttl}")))?;
                sockets.set_multicast_ttl(ctx.plugin_id(), id, u32::from(ttl))?;
                Ok(0)
            });
            settle(&caller, "sk_udp_set_multicast_ttl", -1, result)
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sk_udp_set_multicast_loopback",
        |caller: HostCaller<'_>, id: SocketId, enabled: i32| -> i32 {
            let ctx = &caller.data().ctx;
            let result = ctx
                .sockets()
                .and_then(|sockets| sockets.set_multicast_loopback(ctx.plugin_id(), id, enabled != 0))
                .map(|()| 0);
            settle(&caller, "sk_udp_set_multicast_loopback", -1, result)
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sk_udp_set_broadcast",
        |caller: HostCaller<'_>, id: SocketId, enabled: i32| -> i32 {
            let ctx = &caller.data().ctx;
            let result = ctx
                .sockets()
                .and_then(|sockets| sockets.set_broadcast(ctx.plugin_id(), id, enabled != 0))
                .map(|()| 0);
            settle(&caller, "sk_udp_set_broadcast", -1, result)
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sk_udp_send",
        |mut caller: HostCaller<'_>,
         id: SocketId,
         addr_ptr: i32,
         addr_len: i32,
         port: i32,
         data_ptr: i32,
         data_len: i32|
         -> i32 {
            let result = caller.data().ctx.check(Capability::RawSockets).and_then(|()| {
                let host = read_str(&mut caller, addr_ptr, addr_len)?;
                let port = port_arg(port)?;
                let data = read_bytes(&mut caller, data_ptr, data_len)?;
                let ctx = &caller.data().ctx;
                let sent = ctx.sockets()?.send(ctx.plugin_id(), id, &host, port, data)?;
                Ok(sent as i32)
            });
            settle(&caller, "sk_udp_send", -1, result)
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sk_udp_recv",
        |mut caller: HostCaller<'_>, id: SocketId, buf_ptr: i32, buf_max: i32, addr_out: i32, port_out: i32| -> i32 {
            let result = caller.data().ctx.check(Capability::RawSockets).and_then(|()| {
                // a bad destination must not cost the guest its datagram
                if buf_max > 0 {
                    check_out(&mut caller, buf_ptr, buf_max)?;
                }
                if addr_out != 0 {
                    check_out(&mut caller, addr_out, ADDRESS_OUT_LEN as i32)?;
                }
                if port_out != 0 {
                    check_out(&mut caller, port_out, 2)?;
                }
                let ctx = &caller.data().ctx;
                let Some(datagram) = ctx.sockets()?.recv(ctx.plugin_id(), id)? else {
                    return Ok(0);
                };
                if datagram.data.len() > buf_max.max(0) as usize {
                    return Err(PluginError::Socket(format!(
                        "dropped {} byte datagram larger than the {buf_max} byte buffer",
                        datagram.data.len()
                    )));
                }
                let written = write_out(&mut caller, &datagram.data, buf_ptr, buf_max)?;
                if addr_out != 0 {
                    let mut address = datagram.from.ip().to_string().into_bytes();
                    address.push(0);
                    write_out(&mut caller, &address, addr_out, ADDRESS_OUT_LEN as i32)?;
                }
                if port_out != 0 {
                    write_out(&mut caller, &datagram.from.port().to_le_bytes(), port_out, 2)?;
                }
                Ok(written)
            });
            settle(&caller, "sk_udp_recv", -1, result)
        },
    )?;
    linker.func_wrap(IMPORT_MODULE, "sk_udp_pending", |caller: HostCaller<'_>, id: SocketId| -> i32 {
        let ctx = &caller.data().ctx;
        let result = ctx
            .sockets()
            .and_then(|sockets| sockets.pending(ctx.plugin_id(), id))
            .map(|n| n as i32);
        settle(&caller, "sk_udp_pending", -1, result)
    })?;
    linker.func_wrap(IMPORT_MODULE, "sk_udp_close", |caller: HostCaller<'_>, id: SocketId| -> i32 {
        let ctx = &caller.data().ctx;
        let result = ctx
            .sockets()
            .and_then(|sockets| sockets.close(ctx.plugin_id(), id))
            .map(|()| 0);
        settle(&caller, "sk_udp_close", -1, result)
    })?;
    Ok(())
}

fn managed_string(caller: &mut HostCaller<'_>, ptr: i32) -> String {
    if ptr == 0 {
        return String::new();
    }
    guest_memory(caller)
        .and_then(|memory| abi::read_managed_string(&*caller, &memory, ptr as u32))
        .unwrap_or_else(|e| format!("<unreadable: {e}>"))
}

fn link_runtime_shims(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        IMPORT_MODULE,
        "abort",
        |mut caller: HostCaller<'_>, msg: i32, file: i32, line: i32, column: i32| -> wasmtime::Result<()> {
            let message = managed_string(&mut caller, msg);
            let file = managed_string(&mut caller, file);
            caller
                .data()
                .ctx
                .set_error(&format!("abort: {message} at {file}:{line}:{column}"));
            Err(wasmtime::Error::msg(format!(
                "abort: {message} at {file}:{line}:{column}"
            )))
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "trace",
        |mut caller: HostCaller<'_>, msg: i32, n: i32, a0: f64, a1: f64, a2: f64, a3: f64, a4: f64| {
            let message = managed_string(&mut caller, msg);
            let args: Vec<String> = [a0, a1, a2, a3, a4]
                .iter()
                .take(n.clamp(0, 5) as usize)
                .map(f64::to_string)
                .collect();
            caller.data().ctx.log_debug(&format!("trace: {message} {}", args.join(", ")));
        },
    )?;
    linker.func_wrap(IMPORT_MODULE, "seed", |_caller: HostCaller<'_>| -> f64 {
        rand::random::<u32>() as f64
    })?;
    linker.func_wrap(IMPORT_MODULE, "console.log", |mut caller: HostCaller<'_>, msg: i32| {
        let message = managed_string(&mut caller, msg);
        caller.data().ctx.log_debug(&message);
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::DeltaVersion;
    use std::time::Duration;

    struct NoApp;

    impl ServerApp for NoApp {
        fn handle_message(&self, _: &str, _: Value, _: DeltaVersion) {}
        fn self_path(&self, path: &str) -> Option<Value> {
            (path == "navigation.speedOverGround").then(|| serde_json::json!(3.2))
        }
        fn emit_binary_stream(&self, _: &str, _: &str, _: Vec<u8>) {}
        fn emit_radar_spokes(&self, _: &str, _: &str, _: Vec<u8>) {}
    }

    fn services() -> Arc<HostServices> {
        Arc::new(HostServices {
            app: Arc::new(NoApp),
            events: Arc::new(EventBus::new()),
            sockets: Arc::new(SocketManager::new(16, Handle::current())),
            providers: Arc::new(ProviderRegistry::new()),
            put_handlers: Arc::new(PutHandlerTable::new()),
            commands: CommandPolicy::log_retrieval(Duration::from_secs(1), 1024).unwrap(),
            http_client: reqwest::Client::new(),
            runtime: Handle::current(),
        })
    }

    fn test_context(capabilities: CapabilitySet, accepting: bool) -> HostContext {
        let exports = ExportTable::from_names(
            ["allocate", "deallocate", "resource_list", "resource_get"],
            CallingConvention::BufferPassing,
        );
        HostContext::new(
            "test-plugin",
            Arc::new(capabilities),
            Arc::new(exports),
            Path::new("/tmp/test-plugin"),
            services(),
            Arc::new(AtomicBool::new(accepting)),
        )
    }

    #[test]
    fn test_sanitize_log_message() {
        assert_eq!(sanitize_log_message("hello world"), "hello world");
        assert_eq!(sanitize_log_message("line1\nline2"), "line1\nline2");
        assert_eq!(sanitize_log_message("tab\there"), "tab\there");
        assert_eq!(sanitize_log_message("bad\x00\x01\x02chars"), "badchars");
        let long = "x".repeat(3000);
        let result = sanitize_log_message(&long);
        assert!(result.len() < 3000);
        assert!(result.ends_with("… (truncated)"));
    }

    #[test]
    fn test_http_response_serialization() {
        let resp = HttpResponse {
            status: 200,
            headers: HashMap::from([("content-type".into(), "application/json".into())]),
            body: "{}".into(),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], 200);
        assert_eq!(json["headers"]["content-type"], "application/json");
    }

    #[test]
    fn test_fetch_options_defaults() {
        let opts: FetchOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.method.is_none());
        assert!(opts.headers.is_empty());
        let opts: FetchOptions =
            serde_json::from_str(r#"{"method":"POST","body":"x","headers":{"a":"b"}}"#).unwrap();
        assert_eq!(opts.method.as_deref(), Some("POST"));
        assert_eq!(opts.headers["a"], "b");
    }

    #[tokio::test]
    async fn test_fetch_without_network_is_denied() {
        let ctx = test_context(CapabilitySet::default(), true);
        let err = ctx
            .fetch("http://127.0.0.1:9/", FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::CapabilityDenied(_)));
    }

    #[tokio::test]
    async fn test_fetch_rejects_non_http_scheme() {
        let caps = CapabilitySet {
            network: true,
            ..Default::default()
        };
        let ctx = test_context(caps, true);
        let err = ctx
            .fetch("file:///etc/passwd", FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Http(_)));
    }

    #[tokio::test]
    async fn test_sockets_require_capability() {
        let ctx = test_context(CapabilitySet::default(), true);
        assert!(matches!(ctx.sockets(), Err(PluginError::CapabilityDenied(_))));
        assert_eq!(ctx.services.sockets.count_for("test-plugin"), 0);
    }

    #[tokio::test]
    async fn test_provider_registration_checks_capability() {
        let ctx = test_context(CapabilitySet::default(), true);
        assert!(ctx.register_provider(ProviderKind::Resource, "charts").is_err());
        assert_eq!(ctx.services.providers.count_for("test-plugin"), 0);

        let caps = CapabilitySet {
            resource_provider: true,
            ..Default::default()
        };
        let ctx = test_context(caps, true);
        ctx.register_provider(ProviderKind::Resource, "charts").unwrap();
        let reg = ctx
            .services
            .providers
            .owned_by("test-plugin", ProviderKind::Resource)
            .unwrap();
        assert_eq!(reg.exports, vec!["resource_list", "resource_get"]);
        assert!(ctx.register_provider(ProviderKind::Weather, "met").is_err());
    }

    #[tokio::test]
    async fn test_registration_refused_when_not_accepting() {
        let caps = CapabilitySet {
            put_handlers: true,
            ..Default::default()
        };
        let ctx = test_context(caps, false);
        let err = ctx.register_put_handler("vessels.self", "a.b").unwrap_err();
        assert!(matches!(err, PluginError::InvalidState(_)));
        assert_eq!(ctx.services.put_handlers.count_for("test-plugin"), 0);
    }

    #[tokio::test]
    async fn test_route_message_produces_effects() {
        let ctx = test_context(CapabilitySet::default(), true);
        let effects = ctx
            .route_message(
                r#"{"updates":[{"values":[{"path":"resources.charts.c1","value":{}},{"path":"a.b","value":1}]}]}"#,
            )
            .unwrap();
        assert_eq!(effects.len(), 2);
        assert!(matches!(effects[0], DataEffect::Delta { version: DeltaVersion::V1, .. }));
        assert!(matches!(effects[1], DataEffect::Delta { version: DeltaVersion::V2, .. }));
        assert!(ctx.route_message("not json").is_err());
    }

    #[tokio::test]
    async fn test_streams_are_capability_gated() {
        let ctx = test_context(CapabilitySet::default(), true);
        assert!(ctx.binary_stream("s1", vec![1]).is_err());
        assert!(ctx.radar_spokes("r1", vec![1]).is_err());
        let caps = CapabilitySet {
            data_write: true,
            radar_provider: true,
            ..Default::default()
        };
        let ctx = test_context(caps, true);
        assert!(ctx.binary_stream("s1", vec![1]).is_ok());
        assert!(ctx.radar_spokes("r1", vec![1]).is_ok());
    }

    #[tokio::test]
    async fn test_capability_query() {
        let caps = CapabilitySet {
            network: true,
            ..Default::default()
        };
        let ctx = test_context(caps, true);
        assert!(ctx.has_capability("network"));
        assert!(!ctx.has_capability("rawSockets"));
        assert!(!ctx.has_capability("teleport"));
        assert_eq!(ctx.self_path("navigation.speedOverGround"), Some(serde_json::json!(3.2)));
    }

    #[test]
    fn test_port_arg_bounds() {
        assert_eq!(port_arg(10110).unwrap(), 10110);
        assert!(port_arg(-1).is_err());
        assert!(port_arg(70000).is_err());
    }
}

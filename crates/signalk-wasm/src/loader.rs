//! Module compilation and instantiation.
//!
//! The loader validates a plugin binary (import namespaces, calling
//! convention, asyncify support), builds its WASI context with the storage
//! the manifest grants, links the host functions and instantiates it. It
//! runs no guest code itself beyond the module's own initializer.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use wasmtime::{Config, Engine, Linker, Module, Store, StoreLimitsBuilder};
use wasmtime_wasi::{preview1, DirPerms, FilePerms, WasiCtxBuilder};

use crate::abi::CallingConvention;
use crate::asyncify::ASYNCIFY_EXPORTS;
use crate::error::PluginError;
use crate::host_functions::{link_host_functions, HostContext, HostServices, HostState};
use crate::manifest::{PluginManifest, StorageMode};
use crate::sandbox::{PluginSandbox, SandboxConfig};

/// Allowed WASM import namespaces.
pub const ALLOWED_IMPORT_NAMESPACES: &[&str] = &["env", "wasi_snapshot_preview1"];

/// What a module exports, scanned once at load.
#[derive(Debug, Clone)]
pub struct ExportTable {
    names: HashSet<String>,
    pub convention: CallingConvention,
    /// Whether the module carries the full asyncify export set.
    pub asyncify: bool,
}

impl ExportTable {
    /// Scan a binary's import and export sections.
    pub fn from_binary(bytes: &[u8]) -> Result<Self, PluginError> {
        use wasmparser::{Parser, Payload};

        let mut names = HashSet::new();
        for payload in Parser::new(0).parse_all(bytes) {
            let payload = payload
                .map_err(|e| PluginError::BinaryLoad(format!("failed to parse WASM: {e}")))?;
            match payload {
                Payload::ImportSection(reader) => {
                    for import in reader {
                        let import = import.map_err(|e| {
                            PluginError::BinaryLoad(format!("failed to read import: {e}"))
                        })?;
                        if !ALLOWED_IMPORT_NAMESPACES.contains(&import.module) {
                            return Err(PluginError::BinaryLoad(format!(
                                "unauthorized import namespace: '{}' (function: '{}'); \
                                 allowed namespaces: {:?}",
                                import.module, import.name, ALLOWED_IMPORT_NAMESPACES
                            )));
                        }
                    }
                }
                Payload::ExportSection(reader) => {
                    for export in reader {
                        let export = export.map_err(|e| {
                            PluginError::BinaryLoad(format!("failed to read export: {e}"))
                        })?;
                        names.insert(export.name.to_string());
                    }
                }
                _ => {}
            }
        }

        let convention = CallingConvention::detect(|name| names.contains(name)).ok_or_else(|| {
            PluginError::BinaryLoad(
                "module exports neither '__new' nor 'allocate'/'deallocate'".into(),
            )
        })?;
        if !names.contains("memory") {
            return Err(PluginError::BinaryLoad("module does not export 'memory'".into()));
        }
        Ok(Self::from_names(names, convention))
    }

    pub fn from_names<I, S>(names: I, convention: CallingConvention) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: HashSet<String> = names.into_iter().map(Into::into).collect();
        let asyncify = ASYNCIFY_EXPORTS.iter().all(|name| names.contains(*name));
        Self {
            names,
            convention,
            asyncify,
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

/// Compiles and instantiates plugins against one shared engine.
pub struct PluginLoader {
    engine: Engine,
    config: SandboxConfig,
}

impl PluginLoader {
    pub fn new(config: &SandboxConfig) -> Result<Self, PluginError> {
        let mut engine_config = Config::new();
        if config.fuel_limit.is_some() {
            engine_config.consume_fuel(true);
        }
        let engine = Engine::new(&engine_config)
            .map_err(|e| PluginError::Sandbox(format!("failed to create engine: {e}")))?;
        Ok(Self {
            engine,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Load `manifest` into a fresh sandbox.
    ///
    /// Runs the module's initializer, which may call host functions, so this
    /// must not be called from an async worker thread.
    pub fn load(
        &self,
        manifest: &PluginManifest,
        services: Arc<HostServices>,
        accepting: Arc<AtomicBool>,
    ) -> Result<PluginSandbox, PluginError> {
        std::fs::create_dir_all(&manifest.storage_root)?;

        let bytes = std::fs::read(&manifest.binary_path).map_err(|e| {
            PluginError::BinaryLoad(format!(
                "failed to read {}: {e}",
                manifest.binary_path.display()
            ))
        })?;
        let exports = Arc::new(ExportTable::from_binary(&bytes)?);
        let module = Module::from_binary(&self.engine, &bytes)
            .map_err(|e| PluginError::BinaryLoad(format!("failed to compile: {e}")))?;

        let mut wasi = WasiCtxBuilder::new();
        if self.config.inherit_stdio {
            wasi.inherit_stdio();
        }
        if manifest.capabilities.storage == StorageMode::IsolatedFilesystem {
            wasi.preopened_dir(&manifest.storage_root, "/", DirPerms::all(), FilePerms::all())
                .map_err(|e| {
                    PluginError::Sandbox(format!(
                        "failed to preopen {}: {e}",
                        manifest.storage_root.display()
                    ))
                })?;
        }

        let ctx = HostContext::new(
            &manifest.id,
            Arc::new(manifest.capabilities.clone()),
            exports.clone(),
            &manifest.storage_root,
            services,
            accepting,
        );
        let limits = StoreLimitsBuilder::new()
            .memory_size(self.config.memory_limit)
            .trap_on_grow_failure(true)
            .build();
        let mut store = Store::new(&self.engine, HostState::new(ctx, wasi.build_p1(), limits));
        store.limiter(|state| &mut state.limits);
        if let Some(fuel) = self.config.fuel_limit {
            store
                .set_fuel(fuel)
                .map_err(|e| PluginError::Sandbox(format!("failed to set fuel: {e}")))?;
        }

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        preview1::add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi)
            .map_err(|e| PluginError::Sandbox(format!("failed to link WASI: {e}")))?;
        link_host_functions(&mut linker, exports.convention)?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| PluginError::BinaryLoad(format!("failed to instantiate: {e:#}")))?;

        tracing::info!(
            plugin = %manifest.id,
            convention = ?exports.convention,
            asyncify = exports.asyncify,
            "instantiated plugin module"
        );
        PluginSandbox::new(
            &manifest.id,
            store,
            instance,
            exports,
            self.config.fuel_limit,
            self.config.response_buffer_size,
        )
    }
}

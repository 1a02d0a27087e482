//! Signal K WASM Plugin Runtime
//!
//! Sandboxed host runtime for plugins compiled to WASM/WASI. Plugins run in
//! isolated wasmtime stores with memory and fuel limits, reach the server
//! only through capability-gated host functions, may register as resource,
//! weather or radar providers, and can suspend on real host I/O through
//! Binaryen's asyncify transform. The supervisor owns each plugin's
//! lifecycle and tears down everything an instance created when it stops
//! or crashes.

pub mod abi;
pub mod app;
pub mod asyncify;
pub mod command;
pub mod delta;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod host_functions;
pub mod loader;
pub mod manifest;
pub mod memory;
pub mod providers;
pub mod put_handlers;
pub mod sandbox;
pub mod sockets;
pub mod supervisor;

pub use abi::{CallingConvention, GuestCall, GuestValue};
pub use app::{DataEffect, DeltaVersion, ServerApp};
pub use dispatch::{PluginHttpRequest, PluginHttpResponse};
pub use error::PluginError;
pub use events::{EventBus, PluginEvent, StatusReport};
pub use host_functions::{HostContext, HttpResponse};
pub use loader::{ExportTable, PluginLoader};
pub use manifest::{Capability, CapabilitySet, PluginManifest, StorageMode};
pub use providers::{ProviderKind, ProviderRegistry};
pub use sandbox::{PluginSandbox, SandboxConfig};
pub use supervisor::{HttpEndpoint, LifecycleState, PluginIdentity, PluginSupervisor};

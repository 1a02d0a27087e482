//! Plugin manifest parsing and capability declarations.
//!
//! A plugin is described either by its package descriptor (`package.json`
//! with `wasmManifest` and `wasmCapabilities` keys) or by a `plugin.toml`.
//! Both produce the same immutable [`PluginManifest`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PluginError;

/// Storage mode a plugin may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    #[default]
    None,
    IsolatedFilesystem,
}

impl StorageMode {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(StorageMode::None),
            "isolated-filesystem" => Some(StorageMode::IsolatedFilesystem),
            _ => None,
        }
    }
}

/// A single privilege a host binding can be gated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Network,
    RawSockets,
    Storage,
    DataRead,
    DataWrite,
    HttpEndpoints,
    ResourceProvider,
    WeatherProvider,
    RadarProvider,
    PutHandlers,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Capability::Network,
        Capability::RawSockets,
        Capability::Storage,
        Capability::DataRead,
        Capability::DataWrite,
        Capability::HttpEndpoints,
        Capability::ResourceProvider,
        Capability::WeatherProvider,
        Capability::RadarProvider,
        Capability::PutHandlers,
    ];

    /// Declaration key as written in the manifest.
    pub fn key(self) -> &'static str {
        match self {
            Capability::Network => "network",
            Capability::RawSockets => "rawSockets",
            Capability::Storage => "storage",
            Capability::DataRead => "dataRead",
            Capability::DataWrite => "dataWrite",
            Capability::HttpEndpoints => "httpEndpoints",
            Capability::ResourceProvider => "resourceProvider",
            Capability::WeatherProvider => "weatherProvider",
            Capability::RadarProvider => "radarProvider",
            Capability::PutHandlers => "putHandlers",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|cap| cap.key() == key)
    }
}

/// Capabilities declared by a plugin, fixed at load time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySet {
    pub network: bool,
    pub raw_sockets: bool,
    pub storage: StorageMode,
    pub data_read: bool,
    pub data_write: bool,
    pub http_endpoints: bool,
    pub resource_provider: bool,
    pub weather_provider: bool,
    pub radar_provider: bool,
    pub put_handlers: bool,
    /// Declaration keys this host did not recognise.
    #[serde(skip)]
    pub ignored_keys: Vec<String>,
}

impl CapabilitySet {
    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::Network => self.network,
            Capability::RawSockets => self.raw_sockets,
            Capability::Storage => self.storage == StorageMode::IsolatedFilesystem,
            Capability::DataRead => self.data_read,
            Capability::DataWrite => self.data_write,
            Capability::HttpEndpoints => self.http_endpoints,
            Capability::ResourceProvider => self.resource_provider,
            Capability::WeatherProvider => self.weather_provider,
            Capability::RadarProvider => self.radar_provider,
            Capability::PutHandlers => self.put_handlers,
        }
    }

    /// Build a set from a declaration object.
    ///
    /// Unknown keys are kept in `ignored_keys` and logged; a known key with
    /// the wrong type, or an unrecognised storage mode, is rejected.
    pub fn from_declaration(declaration: &Value) -> Result<Self, PluginError> {
        let Some(entries) = declaration.as_object() else {
            return Err(PluginError::ManifestInvalid(
                "capability declaration must be an object".into(),
            ));
        };

        let mut set = CapabilitySet::default();
        for (key, value) in entries {
            let Some(capability) = Capability::from_key(key) else {
                tracing::warn!(key = %key, "ignoring unknown capability key");
                set.ignored_keys.push(key.clone());
                continue;
            };

            if capability == Capability::Storage {
                let mode = value.as_str().and_then(StorageMode::parse).ok_or_else(|| {
                    PluginError::ManifestInvalid(format!(
                        "storage must be \"none\" or \"isolated-filesystem\", got {value}"
                    ))
                })?;
                set.storage = mode;
                continue;
            }

            let Some(flag) = value.as_bool() else {
                return Err(PluginError::ManifestInvalid(format!(
                    "capability '{key}' must be a boolean, got {value}"
                )));
            };
            match capability {
                Capability::Network => set.network = flag,
                Capability::RawSockets => set.raw_sockets = flag,
                Capability::DataRead => set.data_read = flag,
                Capability::DataWrite => set.data_write = flag,
                Capability::HttpEndpoints => set.http_endpoints = flag,
                Capability::ResourceProvider => set.resource_provider = flag,
                Capability::WeatherProvider => set.weather_provider = flag,
                Capability::RadarProvider => set.radar_provider = flag,
                Capability::PutHandlers => set.put_handlers = flag,
                Capability::Storage => {}
            }
        }
        Ok(set)
    }
}

/// Everything the loader needs to instantiate one plugin.
#[derive(Debug, Clone)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: Option<String>,
    pub binary_path: PathBuf,
    pub capabilities: CapabilitySet,
    /// Isolated storage area for this plugin id, created on first load.
    pub storage_root: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageDescriptor {
    name: Option<String>,
    version: Option<String>,
    display_name: Option<String>,
    #[serde(default)]
    signalk: Option<PackageSignalK>,
    wasm_manifest: Option<String>,
    wasm_capabilities: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct PackageSignalK {
    id: Option<String>,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TomlDescriptor {
    plugin: TomlPlugin,
    build: TomlBuild,
    #[serde(default)]
    capabilities: Option<toml::Value>,
}

#[derive(Debug, Deserialize)]
struct TomlPlugin {
    id: String,
    name: Option<String>,
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TomlBuild {
    wasm: String,
}

/// Validate a plugin id against `^[a-z][a-z0-9_-]{1,63}$`.
fn validate_plugin_id(id: &str) -> Result<(), PluginError> {
    let len = id.len();
    if !(2..=64).contains(&len) {
        return Err(PluginError::ManifestInvalid(format!(
            "plugin id must be 2-64 characters, got {len}"
        )));
    }

    let mut chars = id.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_lowercase() {
            return Err(PluginError::ManifestInvalid(format!(
                "plugin id must start with a lowercase letter, got '{first}'"
            )));
        }
    }
    for ch in chars {
        if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && ch != '-' && ch != '_' {
            return Err(PluginError::ManifestInvalid(format!(
                "plugin id contains invalid character '{ch}'"
            )));
        }
    }
    Ok(())
}

fn validate_semver(value: &str, field_name: &str) -> Result<(), PluginError> {
    semver::Version::parse(value).map_err(|_| {
        PluginError::ManifestInvalid(format!("{field_name} is not valid semver: '{value}'"))
    })?;
    Ok(())
}

/// Validate that a path is safe (no `..` components, not absolute).
fn validate_path_safety(path: &str, field_name: &str) -> Result<(), PluginError> {
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(PluginError::ManifestInvalid(format!(
            "{field_name} must be a relative path, got absolute: '{path}'"
        )));
    }
    if p.components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(PluginError::ManifestInvalid(format!(
            "{field_name} must not contain '..': '{path}'"
        )));
    }
    if !path.ends_with(".wasm") {
        return Err(PluginError::ManifestInvalid(format!(
            "{field_name} must point to a .wasm file: '{path}'"
        )));
    }
    Ok(())
}

/// Derive an id from an npm-style package name (`@scope/name` → `scope-name`).
fn id_from_package_name(name: &str) -> String {
    name.trim_start_matches('@')
        .replace('/', "-")
        .to_ascii_lowercase()
}

fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::from(i),
        toml::Value::Float(f) => Value::from(f),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(d) => Value::String(d.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

impl PluginManifest {
    /// Parse a `package.json` descriptor located in `plugin_dir`.
    pub fn from_package_json(
        json: &str,
        plugin_dir: &Path,
        data_dir: &Path,
    ) -> Result<Self, PluginError> {
        let descriptor: PackageDescriptor = serde_json::from_str(json)
            .map_err(|e| PluginError::ManifestInvalid(format!("package descriptor: {e}")))?;

        let signalk = descriptor.signalk.unwrap_or_default();
        let id = match (signalk.id, descriptor.name.as_deref()) {
            (Some(id), _) => id,
            (None, Some(name)) => id_from_package_name(name),
            (None, None) => {
                return Err(PluginError::ManifestInvalid(
                    "package descriptor has neither signalk.id nor name".into(),
                ))
            }
        };
        let name = signalk
            .display_name
            .or(descriptor.display_name)
            .or(descriptor.name)
            .unwrap_or_else(|| id.clone());
        let binary = descriptor.wasm_manifest.ok_or_else(|| {
            PluginError::ManifestInvalid("missing required field 'wasmManifest'".into())
        })?;
        let capabilities = match descriptor.wasm_capabilities {
            Some(decl) => CapabilitySet::from_declaration(&decl)?,
            None => CapabilitySet::default(),
        };

        Self::assemble(id, name, descriptor.version, &binary, capabilities, plugin_dir, data_dir)
    }

    /// Parse a `plugin.toml` descriptor located in `plugin_dir`.
    pub fn from_toml(
        toml_str: &str,
        plugin_dir: &Path,
        data_dir: &Path,
    ) -> Result<Self, PluginError> {
        // syntax errors stay TOML errors; a well-formed file with the wrong shape is invalid
        let table: toml::Table = toml_str.parse()?;
        let descriptor: TomlDescriptor = toml::Value::Table(table)
            .try_into()
            .map_err(|e| PluginError::ManifestInvalid(format!("plugin descriptor: {e}")))?;
        let capabilities = match descriptor.capabilities {
            Some(decl) => CapabilitySet::from_declaration(&toml_to_json(decl))?,
            None => CapabilitySet::default(),
        };
        let name = descriptor
            .plugin
            .name
            .unwrap_or_else(|| descriptor.plugin.id.clone());

        Self::assemble(
            descriptor.plugin.id,
            name,
            descriptor.plugin.version,
            &descriptor.build.wasm,
            capabilities,
            plugin_dir,
            data_dir,
        )
    }

    fn assemble(
        id: String,
        name: String,
        version: Option<String>,
        binary: &str,
        capabilities: CapabilitySet,
        plugin_dir: &Path,
        data_dir: &Path,
    ) -> Result<Self, PluginError> {
        validate_plugin_id(&id)?;
        if let Some(version) = &version {
            validate_semver(version, "version")?;
        }
        validate_path_safety(binary, "wasm binary")?;

        Ok(PluginManifest {
            binary_path: plugin_dir.join(binary),
            storage_root: data_dir.join(&id),
            id,
            name,
            version,
            capabilities,
        })
    }
}

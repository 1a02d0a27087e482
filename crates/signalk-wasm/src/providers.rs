//! Resource, weather and radar provider registrations.
//!
//! A registration records, once, the exports the host will call to reach a
//! provider and the calling convention to call them with. Registrations are
//! kept in the order they were made: single-provider lookups take the first
//! live one, multi-provider lookups take all of them.

use parking_lot::RwLock;
use serde::Serialize;

use crate::abi::CallingConvention;
use crate::error::PluginError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Resource,
    Weather,
    Radar,
}

/// Host-side operation a provider can be asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOp {
    ResourceList,
    ResourceGet,
    ResourceSet,
    ResourceDelete,
    WeatherObservations,
    WeatherForecasts,
    WeatherWarnings,
    RadarList,
    RadarCapabilities,
    RadarState,
    RadarSetControl,
}

impl ProviderOp {
    pub fn kind(self) -> ProviderKind {
        match self {
            ProviderOp::ResourceList
            | ProviderOp::ResourceGet
            | ProviderOp::ResourceSet
            | ProviderOp::ResourceDelete => ProviderKind::Resource,
            ProviderOp::WeatherObservations
            | ProviderOp::WeatherForecasts
            | ProviderOp::WeatherWarnings => ProviderKind::Weather,
            ProviderOp::RadarList
            | ProviderOp::RadarCapabilities
            | ProviderOp::RadarState
            | ProviderOp::RadarSetControl => ProviderKind::Radar,
        }
    }

    /// Guest export that implements this operation.
    pub fn export_name(self) -> &'static str {
        match self {
            ProviderOp::ResourceList => "resource_list",
            ProviderOp::ResourceGet => "resource_get",
            ProviderOp::ResourceSet => "resource_set",
            ProviderOp::ResourceDelete => "resource_delete",
            ProviderOp::WeatherObservations => "weather_get_observations",
            ProviderOp::WeatherForecasts => "weather_get_forecasts",
            ProviderOp::WeatherWarnings => "weather_get_warnings",
            ProviderOp::RadarList => "radar_get_radars",
            ProviderOp::RadarCapabilities => "radar_get_capabilities",
            ProviderOp::RadarState => "radar_get_state",
            ProviderOp::RadarSetControl => "radar_set_control",
        }
    }
}

impl ProviderKind {
    pub fn ops(self) -> &'static [ProviderOp] {
        match self {
            ProviderKind::Resource => &[
                ProviderOp::ResourceList,
                ProviderOp::ResourceGet,
                ProviderOp::ResourceSet,
                ProviderOp::ResourceDelete,
            ],
            ProviderKind::Weather => &[
                ProviderOp::WeatherObservations,
                ProviderOp::WeatherForecasts,
                ProviderOp::WeatherWarnings,
            ],
            ProviderKind::Radar => &[
                ProviderOp::RadarList,
                ProviderOp::RadarCapabilities,
                ProviderOp::RadarState,
                ProviderOp::RadarSetControl,
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderRegistration {
    pub plugin_id: String,
    pub kind: ProviderKind,
    /// Resource type for resource providers, display name otherwise.
    pub name: String,
    /// Exports the plugin actually has, resolved at registration.
    pub exports: Vec<&'static str>,
    pub convention: CallingConvention,
}

impl ProviderRegistration {
    pub fn new(
        plugin_id: &str,
        kind: ProviderKind,
        name: &str,
        convention: CallingConvention,
        has_export: impl Fn(&str) -> bool,
    ) -> Self {
        let exports = kind
            .ops()
            .iter()
            .map(|op| op.export_name())
            .filter(|name| has_export(name))
            .collect();
        Self {
            plugin_id: plugin_id.to_string(),
            kind,
            name: name.to_string(),
            exports,
            convention,
        }
    }

    pub fn supports(&self, op: ProviderOp) -> bool {
        op.kind() == self.kind && self.exports.contains(&op.export_name())
    }
}

#[derive(Default)]
pub struct ProviderRegistry {
    registrations: RwLock<Vec<ProviderRegistration>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a registration. Registering the same (plugin, kind, name) twice
    /// is rejected.
    pub fn register(&self, registration: ProviderRegistration) -> Result<(), PluginError> {
        let mut registrations = self.registrations.write();
        let duplicate = registrations.iter().any(|r| {
            r.plugin_id == registration.plugin_id
                && r.kind == registration.kind
                && r.name == registration.name
        });
        if duplicate {
            return Err(PluginError::AlreadyExists(format!(
                "{:?} provider '{}' for {}",
                registration.kind, registration.name, registration.plugin_id
            )));
        }
        if registration.exports.is_empty() {
            tracing::warn!(
                plugin = %registration.plugin_id,
                kind = ?registration.kind,
                "provider registered without any handler exports"
            );
        }
        tracing::info!(
            plugin = %registration.plugin_id,
            kind = ?registration.kind,
            name = %registration.name,
            "registered provider"
        );
        registrations.push(registration);
        Ok(())
    }

    /// Remove every registration owned by `plugin_id`.
    pub fn unregister_plugin(&self, plugin_id: &str) -> usize {
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|r| r.plugin_id != plugin_id);
        before - registrations.len()
    }

    /// First registration of `kind`, optionally restricted to one resource
    /// type / provider name.
    pub fn default_for(&self, kind: ProviderKind, name: Option<&str>) -> Option<ProviderRegistration> {
        self.registrations
            .read()
            .iter()
            .find(|r| r.kind == kind && name.map_or(true, |n| r.name == n))
            .cloned()
    }

    pub fn all_for(&self, kind: ProviderKind, name: Option<&str>) -> Vec<ProviderRegistration> {
        self.registrations
            .read()
            .iter()
            .filter(|r| r.kind == kind && name.map_or(true, |n| r.name == n))
            .cloned()
            .collect()
    }

    /// Registration of `kind` owned by a specific plugin.
    pub fn owned_by(&self, plugin_id: &str, kind: ProviderKind) -> Option<ProviderRegistration> {
        self.registrations
            .read()
            .iter()
            .find(|r| r.kind == kind && r.plugin_id == plugin_id)
            .cloned()
    }

    pub fn count_for(&self, plugin_id: &str) -> usize {
        self.registrations
            .read()
            .iter()
            .filter(|r| r.plugin_id == plugin_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(plugin: &str, ty: &str) -> ProviderRegistration {
        ProviderRegistration::new(
            plugin,
            ProviderKind::Resource,
            ty,
            CallingConvention::BufferPassing,
            |name| name != "resource_delete",
        )
    }

    #[test]
    fn test_registration_resolves_exports_once() {
        let reg = resource("charts", "charts");
        assert_eq!(reg.exports, vec!["resource_list", "resource_get", "resource_set"]);
        assert!(reg.supports(ProviderOp::ResourceList));
        assert!(!reg.supports(ProviderOp::ResourceDelete));
        assert!(!reg.supports(ProviderOp::RadarState));
    }

    #[test]
    fn test_first_registered_wins() {
        let registry = ProviderRegistry::new();
        registry.register(resource("first", "charts")).unwrap();
        registry.register(resource("second", "charts")).unwrap();
        let default = registry.default_for(ProviderKind::Resource, Some("charts")).unwrap();
        assert_eq!(default.plugin_id, "first");
        assert_eq!(registry.all_for(ProviderKind::Resource, Some("charts")).len(), 2);
        assert!(registry.default_for(ProviderKind::Resource, Some("routes")).is_none());
        assert!(registry.default_for(ProviderKind::Weather, None).is_none());
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = ProviderRegistry::new();
        registry.register(resource("p", "charts")).unwrap();
        assert!(matches!(
            registry.register(resource("p", "charts")),
            Err(PluginError::AlreadyExists(_))
        ));
        registry.register(resource("p", "notes")).unwrap();
        assert_eq!(registry.count_for("p"), 2);
    }

    #[test]
    fn test_unregister_removes_everything_for_plugin() {
        let registry = ProviderRegistry::new();
        registry.register(resource("a", "charts")).unwrap();
        registry
            .register(ProviderRegistration::new(
                "a",
                ProviderKind::Radar,
                "Halo",
                CallingConvention::WrappedBindings,
                |_| true,
            ))
            .unwrap();
        registry.register(resource("b", "charts")).unwrap();

        assert_eq!(registry.unregister_plugin("a"), 2);
        assert_eq!(registry.count_for("a"), 0);
        assert!(registry.owned_by("a", ProviderKind::Radar).is_none());
        assert_eq!(
            registry.default_for(ProviderKind::Resource, None).unwrap().plugin_id,
            "b"
        );
    }

    #[test]
    fn test_export_names() {
        assert_eq!(ProviderOp::WeatherObservations.export_name(), "weather_get_observations");
        assert_eq!(ProviderOp::RadarSetControl.export_name(), "radar_set_control");
        assert_eq!(ProviderOp::RadarList.kind(), ProviderKind::Radar);
    }
}

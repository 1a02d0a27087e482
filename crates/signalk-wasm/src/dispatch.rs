//! Host-to-guest dispatch: PUT requests, provider queries and plugin HTTP
//! endpoints.
//!
//! Every request is serialized to JSON and passed through the instance's
//! recorded calling convention; every response is parsed back as JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::abi::GuestCall;
use crate::error::PluginError;
use crate::providers::{ProviderKind, ProviderOp, ProviderRegistration};
use crate::supervisor::{HttpEndpoint, PluginSupervisor};

/// HTTP request forwarded to a plugin endpoint handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginHttpRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

/// What a plugin endpoint handler returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginHttpResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

fn put_not_implemented(message: &str) -> Value {
    json!({
        "state": "COMPLETED",
        "statusCode": 501,
        "message": message,
    })
}

fn parse_response(export: &str, raw: Option<String>) -> Result<Option<Value>, PluginError> {
    raw.map(|raw| {
        serde_json::from_str(&raw).map_err(|e| {
            PluginError::Protocol(format!("export '{export}' returned invalid JSON: {e}"))
        })
    })
    .transpose()
}

/// Match `path` against an endpoint pattern with `:name` segments.
fn match_route(pattern: &str, path: &str) -> Option<HashMap<String, String>> {
    let pattern: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if pattern.len() != path.len() {
        return None;
    }
    let mut params = HashMap::new();
    for (expected, actual) in pattern.iter().zip(&path) {
        match expected.strip_prefix(':') {
            Some(name) => {
                params.insert(name.to_string(), (*actual).to_string());
            }
            None if expected == actual => {}
            None => return None,
        }
    }
    Some(params)
}

/// Find the endpoint for `method` + `path` and its captured params.
fn route<'a>(
    endpoints: &'a [HttpEndpoint],
    method: &str,
    path: &str,
) -> Option<(&'a HttpEndpoint, HashMap<String, String>)> {
    endpoints.iter().find_map(|endpoint| {
        if !endpoint.method.eq_ignore_ascii_case(method) {
            return None;
        }
        match_route(&endpoint.path, path).map(|params| (endpoint, params))
    })
}

fn radar_matches(entry: &Value, radar_id: &str) -> bool {
    match entry {
        Value::String(id) => id == radar_id,
        Value::Object(map) => map.get("id").and_then(Value::as_str) == Some(radar_id),
        _ => false,
    }
}

impl PluginSupervisor {
    /// Invoke one provider operation and parse its JSON response.
    async fn call_provider(
        &self,
        registration: &ProviderRegistration,
        op: ProviderOp,
        request: &Value,
    ) -> Result<Option<Value>, PluginError> {
        if !registration.supports(op) {
            return Err(PluginError::HandlerNotImplemented(format!(
                "{} does not export {}",
                registration.plugin_id,
                op.export_name()
            )));
        }
        let input = serde_json::to_string(request)?;
        let raw = self
            .call_guest(
                &registration.plugin_id,
                GuestCall::text(op.export_name(), Some(input)),
            )
            .await?
            .into_text();
        parse_response(op.export_name(), raw)
    }

    fn default_provider(&self, kind: ProviderKind, name: Option<&str>) -> Result<ProviderRegistration, PluginError> {
        self.services()
            .providers
            .default_for(kind, name)
            .ok_or_else(|| {
                PluginError::HandlerNotImplemented(match name {
                    Some(name) => format!("no {kind:?} provider for '{name}'"),
                    None => format!("no {kind:?} provider registered"),
                })
            })
    }

    // ── PUT ──────────────────────────────────────────────────────────

    /// Route a PUT on `(context, path)` to the plugin that registered it.
    ///
    /// The handler's JSON reply is returned unchanged. A registered plugin
    /// without the handler export yields a 501 reply.
    pub async fn dispatch_put(&self, context: &str, path: &str, value: Value) -> Result<Value, PluginError> {
        let registration = self
            .services()
            .put_handlers
            .lookup(context, path)
            .ok_or_else(|| PluginError::HandlerNotImplemented(format!("PUT {context}/{path}")))?;

        let request = json!({ "context": context, "path": path, "value": value });
        let input = serde_json::to_string(&request)?;
        tracing::debug!(plugin = %registration.plugin_id, export = %registration.export, "dispatching PUT");
        let reply = self
            .call_guest(
                &registration.plugin_id,
                GuestCall::text(registration.export.as_str(), Some(input)),
            )
            .await;
        match reply {
            Ok(value) => Ok(parse_response(&registration.export, value.into_text())?
                .unwrap_or_else(|| put_not_implemented("handler returned no response"))),
            Err(PluginError::HandlerNotImplemented(export)) => {
                Ok(put_not_implemented(&format!("{export} is not implemented")))
            }
            Err(e) => Err(e),
        }
    }

    // ── Resources ────────────────────────────────────────────────────

    /// List resources of `resource_type` from every live provider, merged.
    pub async fn list_resources(&self, resource_type: &str, query: Value) -> Result<Value, PluginError> {
        let providers = self
            .services()
            .providers
            .all_for(ProviderKind::Resource, Some(resource_type));
        if providers.is_empty() {
            return Err(PluginError::HandlerNotImplemented(format!(
                "no resource provider for '{resource_type}'"
            )));
        }

        let request = json!({ "type": resource_type, "query": query });
        let mut merged = Map::new();
        for provider in &providers {
            match self.call_provider(provider, ProviderOp::ResourceList, &request).await {
                Ok(Some(Value::Object(entries))) => merged.extend(entries),
                Ok(Some(other)) => tracing::warn!(
                    plugin = %provider.plugin_id,
                    "resource_list returned a non-object: {other}"
                ),
                Ok(None) => {}
                Err(e) => tracing::warn!(plugin = %provider.plugin_id, "resource_list failed: {e}"),
            }
        }
        Ok(Value::Object(merged))
    }

    /// List resources from the first-registered provider only.
    pub async fn list_resources_default(&self, resource_type: &str, query: Value) -> Result<Value, PluginError> {
        let provider = self.default_provider(ProviderKind::Resource, Some(resource_type))?;
        let request = json!({ "type": resource_type, "query": query });
        Ok(self
            .call_provider(&provider, ProviderOp::ResourceList, &request)
            .await?
            .unwrap_or_else(|| Value::Object(Map::new())))
    }

    pub async fn get_resource(
        &self,
        resource_type: &str,
        id: &str,
        property: Option<&str>,
    ) -> Result<Option<Value>, PluginError> {
        let provider = self.default_provider(ProviderKind::Resource, Some(resource_type))?;
        let request = json!({ "type": resource_type, "id": id, "property": property });
        self.call_provider(&provider, ProviderOp::ResourceGet, &request).await
    }

    pub async fn set_resource(&self, resource_type: &str, id: &str, value: Value) -> Result<Option<Value>, PluginError> {
        let provider = self.default_provider(ProviderKind::Resource, Some(resource_type))?;
        let request = json!({ "type": resource_type, "id": id, "value": value });
        self.call_provider(&provider, ProviderOp::ResourceSet, &request).await
    }

    pub async fn delete_resource(&self, resource_type: &str, id: &str) -> Result<Option<Value>, PluginError> {
        let provider = self.default_provider(ProviderKind::Resource, Some(resource_type))?;
        let request = json!({ "type": resource_type, "id": id });
        self.call_provider(&provider, ProviderOp::ResourceDelete, &request).await
    }

    // ── Weather ──────────────────────────────────────────────────────

    async fn weather(&self, op: ProviderOp, provider: Option<&str>, request: Value) -> Result<Option<Value>, PluginError> {
        let registration = self.default_provider(ProviderKind::Weather, provider)?;
        self.call_provider(&registration, op, &request).await
    }

    /// Current conditions from the named (or first) weather provider.
    pub async fn weather_observations(&self, provider: Option<&str>, request: Value) -> Result<Option<Value>, PluginError> {
        self.weather(ProviderOp::WeatherObservations, provider, request).await
    }

    pub async fn weather_forecasts(&self, provider: Option<&str>, request: Value) -> Result<Option<Value>, PluginError> {
        self.weather(ProviderOp::WeatherForecasts, provider, request).await
    }

    pub async fn weather_warnings(&self, provider: Option<&str>, request: Value) -> Result<Option<Value>, PluginError> {
        self.weather(ProviderOp::WeatherWarnings, provider, request).await
    }

    // ── Radar ────────────────────────────────────────────────────────

    /// Radars offered by every live radar provider.
    pub async fn radar_list(&self) -> Result<Vec<Value>, PluginError> {
        Ok(self
            .radar_inventory()
            .await
            .into_iter()
            .flat_map(|(_, radars)| radars)
            .collect())
    }

    async fn radar_inventory(&self) -> Vec<(ProviderRegistration, Vec<Value>)> {
        let providers = self.services().providers.all_for(ProviderKind::Radar, None);
        let mut inventory = Vec::with_capacity(providers.len());
        for provider in providers {
            match self.call_provider(&provider, ProviderOp::RadarList, &json!({})).await {
                Ok(Some(Value::Array(radars))) => inventory.push((provider, radars)),
                Ok(Some(other)) => tracing::warn!(
                    plugin = %provider.plugin_id,
                    "radar_get_radars returned a non-array: {other}"
                ),
                Ok(None) => inventory.push((provider, Vec::new())),
                Err(e) => tracing::warn!(plugin = %provider.plugin_id, "radar_get_radars failed: {e}"),
            }
        }
        inventory
    }

    /// Provider owning `radar_id`; a single provider is used without asking.
    async fn radar_owner(&self, radar_id: &str) -> Result<ProviderRegistration, PluginError> {
        let providers = self.services().providers.all_for(ProviderKind::Radar, None);
        if let [only] = providers.as_slice() {
            return Ok(only.clone());
        }
        self.radar_inventory()
            .await
            .into_iter()
            .find(|(_, radars)| radars.iter().any(|r| radar_matches(r, radar_id)))
            .map(|(provider, _)| provider)
            .ok_or_else(|| PluginError::NotFound(format!("radar '{radar_id}'")))
    }

    pub async fn radar_capabilities(&self, radar_id: &str) -> Result<Option<Value>, PluginError> {
        let provider = self.radar_owner(radar_id).await?;
        self.call_provider(&provider, ProviderOp::RadarCapabilities, &json!({ "radarId": radar_id }))
            .await
    }

    pub async fn radar_state(&self, radar_id: &str) -> Result<Option<Value>, PluginError> {
        let provider = self.radar_owner(radar_id).await?;
        self.call_provider(&provider, ProviderOp::RadarState, &json!({ "radarId": radar_id }))
            .await
    }

    pub async fn radar_set_control(
        &self,
        radar_id: &str,
        control_id: &str,
        value: Value,
    ) -> Result<Option<Value>, PluginError> {
        let provider = self.radar_owner(radar_id).await?;
        let request = json!({ "radarId": radar_id, "controlId": control_id, "value": value });
        self.call_provider(&provider, ProviderOp::RadarSetControl, &request).await
    }

    // ── HTTP endpoints ───────────────────────────────────────────────

    /// Route a request to one of the plugin's declared HTTP endpoints.
    pub async fn handle_http_request(
        &self,
        plugin_id: &str,
        request: PluginHttpRequest,
    ) -> Result<PluginHttpResponse, PluginError> {
        let endpoints = self.endpoints(plugin_id).await;
        let (endpoint, params) = route(&endpoints, &request.method, &request.path).ok_or_else(|| {
            PluginError::NotFound(format!(
                "{} {} on plugin '{plugin_id}'",
                request.method, request.path
            ))
        })?;

        let input = json!({
            "method": request.method,
            "path": request.path,
            "params": params,
            "query": request.query,
            "headers": request.headers,
            "body": request.body,
        });
        let raw = self
            .call_guest(
                plugin_id,
                GuestCall::text(endpoint.handler.as_str(), Some(serde_json::to_string(&input)?)),
            )
            .await?
            .into_text()
            .ok_or_else(|| {
                PluginError::Protocol(format!("handler '{}' returned no response", endpoint.handler))
            })?;
        serde_json::from_str(&raw).map_err(|e| {
            PluginError::Protocol(format!(
                "handler '{}' returned an invalid response: {e}",
                endpoint.handler
            ))
        })
    }
}

//! Routing of guest-emitted delta documents by value path.
//!
//! Values under `resources.` go to the resource ingestion entry, everything
//! else to the default one. A document mixing both is split in two, each
//! half keeping the original context and update metadata.

use serde_json::{Map, Value};

use crate::app::DeltaVersion;
use crate::error::PluginError;

pub const RESOURCE_PREFIX: &str = "resources.";

fn is_resource_path(value: &Value) -> bool {
    value
        .get("path")
        .and_then(Value::as_str)
        .is_some_and(|path| path.starts_with(RESOURCE_PREFIX))
}

/// Split a delta into per-version documents, dropping empty halves.
pub fn route_delta(delta: Value) -> Result<Vec<(Value, DeltaVersion)>, PluginError> {
    let Value::Object(mut doc) = delta else {
        return Err(PluginError::Protocol("delta must be a JSON object".into()));
    };
    let Some(Value::Array(updates)) = doc.remove("updates") else {
        return Err(PluginError::Protocol("delta has no updates array".into()));
    };

    let mut v1_updates = Vec::new();
    let mut v2_updates = Vec::new();
    for update in updates {
        let Value::Object(mut update) = update else {
            return Err(PluginError::Protocol("delta update must be an object".into()));
        };
        let values = match update.remove("values") {
            Some(Value::Array(values)) => values,
            Some(_) => return Err(PluginError::Protocol("update values must be an array".into())),
            None => {
                // meta-only updates carry no paths
                v1_updates.push(Value::Object(update));
                continue;
            }
        };
        let (resources, plain): (Vec<Value>, Vec<Value>) =
            values.into_iter().partition(is_resource_path);
        if !plain.is_empty() {
            v1_updates.push(with_values(&update, plain));
        }
        if !resources.is_empty() {
            v2_updates.push(with_values(&update, resources));
        }
    }

    let mut routed = Vec::new();
    for (updates, version) in [(v1_updates, DeltaVersion::V1), (v2_updates, DeltaVersion::V2)] {
        if updates.is_empty() {
            continue;
        }
        let mut half = doc.clone();
        half.insert("updates".into(), Value::Array(updates));
        routed.push((Value::Object(half), version));
    }
    Ok(routed)
}

fn with_values(update: &Map<String, Value>, values: Vec<Value>) -> Value {
    let mut copy = update.clone();
    copy.insert("values".into(), Value::Array(values));
    Value::Object(copy)
}

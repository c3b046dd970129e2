//! Conversion between the workflow and plugin calling conventions.
//!
//! Workflow operations receive `{op, target, data}`. Plugin functions receive
//! `{config, data, _op, _source_op, _workflow_id, _variables, _transfer}`.
//! The conversion is lossy on purpose: results are enriched with bookkeeping
//! fields and narrowed by `select`, so a round trip is not an identity.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Bookkeeping fields carried alongside workflow data.
pub const BOOKKEEPING_FIELDS: [&str; 5] = ["_variables", "_op", "_source_op", "_transfer", "_workflow_id"];

/// A call in the workflow shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCall {
    /// Calling operation (`{name, type}`).
    #[serde(default)]
    pub op: Value,
    /// Data flowing through the workflow.
    #[serde(default)]
    pub target: Value,
    /// Operation parameters.
    #[serde(default)]
    pub data: Value,
}

/// A result in the workflow shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub data: Value,
    pub target: Value,
}

/// Convert a workflow call to the plugin shape.
///
/// Bookkeeping fields are read from `target` and stripped from it.
pub fn workflow_to_plugin(call: WorkflowCall) -> Value {
    let WorkflowCall { data, mut target, .. } = call;

    let mut plugin = Map::new();
    let target_map = target.as_object_mut();
    let (bookkeeping, name, kind) = match target_map {
        Some(map) => {
            let name = map.get("name").cloned().unwrap_or(Value::Null);
            let kind = map.get("type").cloned().unwrap_or(Value::Null);
            let taken = BOOKKEEPING_FIELDS.map(|field| (field, map.remove(field).unwrap_or(Value::Null)));
            (taken, name, kind)
        }
        None => (BOOKKEEPING_FIELDS.map(|field| (field, Value::Null)), Value::Null, Value::Null),
    };

    for (field, value) in bookkeeping {
        plugin.insert(field.to_string(), value);
    }
    plugin.insert("config".into(), data);
    plugin.insert("data".into(), target);
    plugin.insert("name".into(), name);
    plugin.insert("type".into(), kind);
    Value::Object(plugin)
}

/// Convert a plugin result back to the workflow shape.
///
/// Returns `None` for an empty result, or for an object result that carries
/// nothing beyond the bookkeeping fields.
pub fn plugin_to_workflow(result: &Value) -> Option<WorkflowResult> {
    if !truthy(result) {
        return None;
    }

    let (data, mut target) = match result {
        Value::Object(map) if map.get("type").is_some_and(truthy) && map.get("data").is_some_and(truthy) => {
            let mut target = map["data"].clone();
            if let Value::Object(t) = &mut target {
                t.insert("name".into(), map.get("name").cloned().unwrap_or(Value::Null));
                t.insert("type".into(), map["type"].clone());
            }
            (map.get("config").cloned().unwrap_or(Value::Null), target)
        }
        _ => (Value::Null, result.clone()),
    };

    if !truthy(&target) {
        target = json!({});
    }

    if let Value::Array(items) = &target {
        let selected = result
            .get("select")
            .and_then(Value::as_u64)
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| items.get(i))
            .filter(|item| truthy(item))
            .cloned();
        if let Some(item) = selected {
            target = item;
        }
    }

    if let Value::Object(map) = &mut target {
        let carried = |field: &str, fallback: Value| {
            result.get(field).filter(|v| truthy(v)).cloned().unwrap_or(fallback)
        };
        map.insert("_variables".into(), carried("_variables", json!({})));
        map.insert("_workflow_id".into(), carried("_workflow_id", Value::Null));
        map.insert("_op".into(), carried("_op", Value::Null));
        map.insert("_source_op".into(), carried("_source_op", Value::Null));
        map.insert("_transfer".into(), carried("_transfer", Value::Bool(false)));

        if map.len() <= BOOKKEEPING_FIELDS.len() {
            return None;
        }
    }

    Some(WorkflowResult { data, target })
}

/// Project a call onto the keys a plugin's `run` receives.
pub fn filter_for_plugin(my: &Value) -> Value {
    let field = |name: &str| my.get(name).cloned().unwrap_or(Value::Null);
    json!({
        "_variables": field("_variables"),
        "_op": field("_op"),
        "_source_op": field("_source_op"),
        "_transfer": field("_transfer"),
        "_workflow_id": field("_workflow_id"),
        "config": field("config"),
        "data": field("data"),
    })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call() -> WorkflowCall {
        WorkflowCall {
            op: json!({"name": "Threshold", "type": "op"}),
            target: json!({
                "_op": "Load",
                "_source_op": "Open",
                "_workflow_id": "wf_1",
                "_transfer": true,
                "_variables": {"x": 1},
                "pixels": [1, 2, 3]
            }),
            data: json!({"level": 0.5}),
        }
    }

    #[test]
    fn test_workflow_to_plugin_strips_bookkeeping() {
        let plugin = workflow_to_plugin(call());

        assert_eq!(plugin["config"], json!({"level": 0.5}));
        assert_eq!(plugin["data"], json!({"pixels": [1, 2, 3]}));
        assert_eq!(plugin["_op"], "Load");
        assert_eq!(plugin["_source_op"], "Open");
        assert_eq!(plugin["_workflow_id"], "wf_1");
        assert_eq!(plugin["_transfer"], true);
        assert_eq!(plugin["_variables"], json!({"x": 1}));
    }

    #[test]
    fn test_round_trip_preserves_bookkeeping() {
        let plugin = workflow_to_plugin(call());
        let back = plugin_to_workflow(&plugin).unwrap();

        assert_eq!(back.target["_op"], "Load");
        assert_eq!(back.target["_source_op"], "Open");
        assert_eq!(back.target["_workflow_id"], "wf_1");
        assert_eq!(back.target["_transfer"], true);
    }

    #[test]
    fn test_result_with_keys_is_kept() {
        let result = json!({"a": 1, "b": 2, "c": 3});
        let converted = plugin_to_workflow(&result).unwrap();
        assert_eq!(converted.data, Value::Null);
        assert_eq!(converted.target["a"], 1);
        assert_eq!(converted.target["_transfer"], false);
        assert_eq!(converted.target["_variables"], json!({}));
    }

    #[test]
    fn test_bookkeeping_only_result_is_null() {
        assert!(plugin_to_workflow(&json!({})).is_none());
        assert!(plugin_to_workflow(&json!({"_op": "x", "_workflow_id": "w"})).is_none());
        assert!(plugin_to_workflow(&Value::Null).is_none());
    }

    #[test]
    fn test_typed_result_maps_config_and_data() {
        let result = json!({
            "type": "imjoy/image",
            "name": "Result",
            "config": {"zoom": 2},
            "data": {"url": "a.png"}
        });
        let converted = plugin_to_workflow(&result).unwrap();

        assert_eq!(converted.data, json!({"zoom": 2}));
        assert_eq!(converted.target["url"], "a.png");
        assert_eq!(converted.target["name"], "Result");
        assert_eq!(converted.target["type"], "imjoy/image");
    }

    #[test]
    fn test_scalar_result_is_wrapped() {
        let converted = plugin_to_workflow(&json!(42)).unwrap();
        assert_eq!(converted.data, Value::Null);
        assert_eq!(converted.target, json!(42));
    }

    #[test]
    fn test_array_result_narrowed_by_select() {
        let result = json!({
            "type": "list",
            "data": [{"id": "a"}, {"id": "b"}],
            "select": 1
        });
        let converted = plugin_to_workflow(&result).unwrap();
        assert_eq!(converted.target["id"], "b");
    }

    #[test]
    fn test_filter_for_plugin_projects_keys() {
        let filtered = filter_for_plugin(&json!({
            "config": {"a": 1},
            "data": {"b": 2},
            "_op": "Op",
            "op": {"name": "ignored"}
        }));
        let keys: Vec<_> = filtered.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), 7);
        assert!(filtered.get("op").is_none());
        assert_eq!(filtered["_variables"], Value::Null);
    }
}

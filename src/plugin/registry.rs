//! Operation and window registry.
//!
//! Running plugins publish operations here under `pluginName/opName`. Each
//! record holds a handler bound to the owning instance, the compiled
//! input/output schemas and the tags used for search. Window types are
//! indexed by name so new windows can be materialized later.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::config::PluginConfig;
use super::debounce::Debouncer;
use super::sandbox::PluginConnection;
use super::schema::{compile_declared, CompiledSchema};
use super::{PluginError, PluginKind, PluginResult};

/// How an operation is executed.
#[derive(Clone)]
pub enum OpHandler {
    /// Call an exported function on the owning instance.
    Remote { connection: Arc<dyn PluginConnection>, function: String },
    /// Materialize a window of the owning window plugin.
    Window { plugin: String },
    /// Nothing to run; invocations only log a warning.
    Stub,
}

impl fmt::Debug for OpHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote { function, .. } => f.debug_struct("Remote").field("function", function).finish(),
            Self::Window { plugin } => f.debug_struct("Window").field("plugin", plugin).finish(),
            Self::Stub => f.write_str("Stub"),
        }
    }
}

/// What an operation is bound to at registration time.
#[derive(Clone)]
pub enum Binding {
    Connection(Arc<dyn PluginConnection>),
    Window,
}

/// Operation description supplied by a plugin.
///
/// `run` and `update` name functions exported by the plugin; when absent the
/// instance's own `run`/`update` are used.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OperationSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ui: Option<Value>,
    #[serde(default)]
    pub inputs: Option<Value>,
    #[serde(default)]
    pub outputs: Option<Value>,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub update: Option<String>,
}

impl OperationSpec {
    /// The default operation of a plugin, described by its config.
    pub fn from_plugin(config: &PluginConfig) -> Self {
        Self {
            name: Some(config.name.clone()),
            ui: config.ui.clone(),
            inputs: config.inputs.clone(),
            outputs: config.outputs.clone(),
            run: None,
            update: None,
        }
    }

    /// Parse an operation registered at runtime.
    pub fn from_value(value: Value) -> PluginResult<Self> {
        serde_json::from_value(value).map_err(|e| PluginError::schema("register", e.to_string()))
    }
}

/// A published operation.
#[derive(Debug, Clone)]
pub struct OperationRecord {
    /// `pluginName/opName`.
    pub key: String,
    pub plugin_name: String,
    pub op_name: String,
    pub kind: PluginKind,
    /// Normalized UI text.
    pub ui: String,
    pub tags: Vec<String>,
    pub handler: OpHandler,
    /// Debounced update handler.
    pub update: Option<(OpHandler, Arc<Debouncer>)>,
}

/// An operation accepting data matched by its input schema.
#[derive(Debug, Clone)]
pub struct InputLoader {
    pub loader_key: String,
    pub plugin_name: String,
    pub op_name: String,
    pub schema: CompiledSchema,
}

/// Registry of operations, window types, schemas and extensions.
#[derive(Debug, Default)]
pub struct Registry {
    ops: BTreeMap<String, OperationRecord>,
    windows: BTreeMap<String, PluginConfig>,
    inputs: BTreeMap<String, InputLoader>,
    outputs: BTreeMap<String, CompiledSchema>,
    extensions: BTreeMap<String, Vec<String>>,
}

/// Normalize a UI description to display text.
///
/// Strings are trimmed. List items are joined with `<br>`; mapping items are
/// rendered as `key: value`. A bare mapping is rejected.
pub fn normalize_ui(ui: Option<&Value>) -> PluginResult<String> {
    let Some(ui) = ui else { return Ok(String::new()) };

    match ui {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s.trim().to_string()),
        Value::Array(items) => {
            let mut text = String::new();
            for item in items {
                match item {
                    Value::String(s) => text.push_str(s),
                    Value::Object(map) => {
                        for (k, v) in map {
                            match v {
                                Value::String(s) => text.push_str(&format!("{k}: {s}")),
                                other => text.push_str(&format!("{k}: {other}")),
                            }
                            text.push_str("<br>");
                        }
                        continue;
                    }
                    other => text.push_str(&other.to_string()),
                }
                text.push_str("<br>");
            }
            Ok(text)
        }
        Value::Object(_) => Err(PluginError::schema(
            "ui",
            "ui can not be an object, you can only use a string or an array.",
        )),
        other => {
            tracing::warn!(ui = %other, "Removing unsupported ui value");
            Ok(String::new())
        }
    }
}

fn kind_tags(kind: PluginKind) -> Vec<String> {
    vec!["op".to_string(), "plugin".to_string(), kind.registry_tag().to_string()]
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an operation owned by `owner`.
    ///
    /// Schema compilation failures are logged and skip only that schema.
    pub fn register(
        &mut self,
        owner: &PluginConfig,
        binding: &Binding,
        spec: OperationSpec,
        update_delay: Duration,
    ) -> PluginResult<String> {
        let op_name = spec.name.clone().unwrap_or_else(|| owner.name.clone());
        if op_name.trim().is_empty() || op_name.contains('/') {
            return Err(PluginError::schema(&op_name, "operation name must be non-empty and must not contain '/'"));
        }

        let mut ui = normalize_ui(spec.ui.as_ref())?;
        if op_name == owner.name && ui.is_empty() {
            ui = owner.description.clone().unwrap_or_default();
        }

        let (handler, update) = match binding {
            Binding::Connection(connection) => {
                let run = spec.run.clone().filter(|f| connection.exposes(f)).or_else(|| {
                    connection.exposes("run").then(|| "run".to_string())
                });
                let handler = match run {
                    Some(function) => OpHandler::Remote { connection: Arc::clone(connection), function },
                    None => {
                        tracing::warn!(
                            plugin = %owner.name,
                            op = %op_name,
                            "No run function found, this op won't be able to do anything"
                        );
                        OpHandler::Stub
                    }
                };
                let update = spec
                    .update
                    .clone()
                    .filter(|f| connection.exposes(f))
                    .or_else(|| connection.exposes("update").then(|| "update".to_string()))
                    .map(|function| {
                        let handler = OpHandler::Remote { connection: Arc::clone(connection), function };
                        (handler, Arc::new(Debouncer::new(update_delay)))
                    });
                (handler, update)
            }
            Binding::Window => (OpHandler::Window { plugin: owner.name.clone() }, None),
        };

        let key = format!("{}/{}", owner.name, op_name);

        if let Some(ref inputs) = spec.inputs {
            match compile_declared(inputs) {
                Ok(schema) => {
                    self.inputs.insert(
                        key.clone(),
                        InputLoader {
                            loader_key: key.clone(),
                            plugin_name: owner.name.clone(),
                            op_name: op_name.clone(),
                            schema,
                        },
                    );
                }
                Err(e) => tracing::error!(op = %op_name, error = %e, "Error parsing the inputs schema"),
            }
        }
        if let Some(ref outputs) = spec.outputs {
            match compile_declared(outputs) {
                Ok(schema) => {
                    self.outputs.insert(key.clone(), schema);
                }
                Err(e) => tracing::error!(op = %op_name, error = %e, "Error parsing the outputs schema"),
            }
        }

        let record = OperationRecord {
            key: key.clone(),
            plugin_name: owner.name.clone(),
            op_name: op_name.clone(),
            kind: owner.kind,
            ui,
            tags: kind_tags(owner.kind),
            handler,
            update,
        };
        self.ops.insert(key.clone(), record);
        self.windows.insert(op_name, owner.clone());

        tracing::debug!(op = %key, "Registered operation");
        Ok(key)
    }

    /// Index a plugin's declared extensions.
    pub fn register_extensions(&mut self, plugin: &str, extensions: &[String]) {
        for ext in extensions {
            let owners = self.extensions.entry(ext.clone()).or_default();
            if !owners.iter().any(|p| p == plugin) {
                owners.push(plugin.to_string());
            }
        }
    }

    /// Drop every record owned by a plugin.
    pub fn remove_plugin(&mut self, plugin: &str) {
        self.ops.retain(|_, op| op.plugin_name != plugin);
        self.windows.retain(|_, config| config.name != plugin);
        self.inputs.retain(|_, loader| loader.plugin_name != plugin);
        let prefix = format!("{plugin}/");
        self.outputs.retain(|key, _| !key.starts_with(&prefix));
        for owners in self.extensions.values_mut() {
            owners.retain(|p| p != plugin);
        }
        self.extensions.retain(|_, owners| !owners.is_empty());
    }

    pub fn operation(&self, key: &str) -> Option<&OperationRecord> {
        self.ops.get(key)
    }

    pub fn operations(&self) -> impl Iterator<Item = &OperationRecord> {
        self.ops.values()
    }

    /// Config of the plugin providing a window type.
    pub fn window(&self, kind: &str) -> Option<&PluginConfig> {
        self.windows.get(kind)
    }

    pub fn window_types(&self) -> impl Iterator<Item = &str> {
        self.windows.keys().map(String::as_str)
    }

    pub fn input_loader(&self, key: &str) -> Option<&InputLoader> {
        self.inputs.get(key)
    }

    pub fn output_schema(&self, key: &str) -> Option<&CompiledSchema> {
        self.outputs.get(key)
    }

    /// Loader keys whose input schema accepts `data`.
    pub fn match_loaders(&self, data: &Value) -> Vec<String> {
        self.inputs.values().filter(|l| l.schema.is_valid(data)).map(|l| l.loader_key.clone()).collect()
    }

    /// Plugins providing an extension.
    pub fn extension_owners(&self, extension: &str) -> &[String] {
        self.extensions.get(extension).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Search operations by name, plugin or tag.
    pub fn search(&self, query: &str) -> Vec<&OperationRecord> {
        let query_lower = query.to_lowercase();
        self.ops
            .values()
            .filter(|op| {
                op.key.to_lowercase().contains(&query_lower)
                    || op.tags.iter().any(|t| t.to_lowercase() == query_lower)
            })
            .collect()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::config::{parse_plugin_source, SourceContext};
    use async_trait::async_trait;
    use serde_json::json;

    struct Exports(Vec<&'static str>);

    #[async_trait]
    impl PluginConnection for Exports {
        fn api_names(&self) -> Vec<String> {
            self.0.iter().map(|s| (*s).to_string()).collect()
        }

        async fn call(&self, _function: &str, _args: Vec<Value>) -> PluginResult<Value> {
            Ok(Value::Null)
        }

        fn terminate(&self) -> PluginResult<()> {
            Ok(())
        }
    }

    fn plugin(config: &str) -> PluginConfig {
        parse_plugin_source(&format!("<config>{config}</config><script lang=\"js\"></script>"), &SourceContext::default())
            .unwrap()
    }

    fn connection(names: Vec<&'static str>) -> Binding {
        Binding::Connection(Arc::new(Exports(names)))
    }

    #[test]
    fn test_normalize_ui() {
        assert_eq!(normalize_ui(None).unwrap(), "");
        assert_eq!(normalize_ui(Some(&json!("  hello "))).unwrap(), "hello");
        assert_eq!(
            normalize_ui(Some(&json!(["Threshold", {"level": "number"}, {"n": 3}, 5]))).unwrap(),
            "Threshold<br>level: number<br>n: 3<br>5<br>"
        );
        assert!(normalize_ui(Some(&json!({"a": 1}))).is_err());
    }

    #[test]
    fn test_register_binds_run() {
        let owner = plugin(r#"{"name": "Filter", "type": "native-python", "description": "Filters images"}"#);
        let mut registry = Registry::new();

        let key = registry
            .register(&owner, &connection(vec!["setup", "run", "update"]), OperationSpec::from_plugin(&owner), Duration::from_millis(300))
            .unwrap();

        assert_eq!(key, "Filter/Filter");
        let op = registry.operation(&key).unwrap();
        assert_eq!(op.tags, vec!["op", "plugin", "python"]);
        assert_eq!(op.ui, "Filters images");
        assert!(matches!(op.handler, OpHandler::Remote { ref function, .. } if function == "run"));
        assert!(op.update.is_some());
        assert_eq!(registry.window("Filter").unwrap().name, "Filter");
    }

    #[test]
    fn test_config_supplied_run_and_stub() {
        let owner = plugin(r#"{"name": "Tools", "type": "web-worker"}"#);
        let mut registry = Registry::new();
        let spec = OperationSpec::from_value(json!({"name": "Blur", "run": "blur", "ui": "Blur it"})).unwrap();

        let key = registry.register(&owner, &connection(vec!["setup", "blur"]), spec, Duration::ZERO).unwrap();
        assert_eq!(key, "Tools/Blur");
        assert!(matches!(registry.operation(&key).unwrap().handler, OpHandler::Remote { ref function, .. } if function == "blur"));

        let key = registry.register(&owner, &connection(vec!["setup"]), OperationSpec::from_plugin(&owner), Duration::ZERO).unwrap();
        let op = registry.operation(&key).unwrap();
        assert!(matches!(op.handler, OpHandler::Stub));
        assert!(op.update.is_none());
    }

    #[test]
    fn test_bad_schema_does_not_abort_registration() {
        let owner = plugin(
            r#"{"name": "Loader", "type": "iframe",
                "inputs": {"type": {"type": "string", "enum": ["image/png"]}, "size": {"type": "number"}},
                "outputs": {"type": "tensor", "properties": 1}}"#,
        );
        let mut registry = Registry::new();
        let key = registry.register(&owner, &connection(vec!["run"]), OperationSpec::from_plugin(&owner), Duration::ZERO).unwrap();

        assert!(registry.operation(&key).is_some());
        assert!(registry.input_loader(&key).is_some());
        assert!(registry.output_schema(&key).is_none());

        assert_eq!(registry.match_loaders(&json!({"type": "image/png", "size": 3})), vec![key]);
        assert!(registry.match_loaders(&json!({"type": "text/plain", "size": 3})).is_empty());
    }

    #[test]
    fn test_window_binding_and_removal() {
        let owner = plugin(r#"{"name": "Viewer", "type": "window", "extensions": ["png"]}"#);
        let mut registry = Registry::new();
        let key = registry.register(&owner, &Binding::Window, OperationSpec::from_plugin(&owner), Duration::ZERO).unwrap();
        registry.register_extensions("Viewer", &owner.extensions);

        assert!(matches!(registry.operation(&key).unwrap().handler, OpHandler::Window { .. }));
        assert_eq!(registry.extension_owners("png"), ["Viewer".to_string()]);
        assert_eq!(registry.search("window").len(), 1);

        registry.remove_plugin("Viewer");
        assert!(registry.operation(&key).is_none());
        assert!(registry.window("Viewer").is_none());
        assert!(registry.extension_owners("png").is_empty());
    }

    #[test]
    fn test_object_ui_is_rejected() {
        let owner = plugin(r#"{"name": "Bad", "type": "iframe"}"#);
        let mut registry = Registry::new();
        let spec = OperationSpec::from_value(json!({"ui": {"a": 1}})).unwrap();
        assert!(registry.register(&owner, &connection(vec!["run"]), spec, Duration::ZERO).is_err());
        assert!(registry.operations().next().is_none());
    }
}

//! Host functions for plugins.
//!
//! Every instantiated plugin receives a [`HostApi`]: the capability surface
//! through which plugin code reaches back into the runtime (`register`,
//! `createWindow`, `run`, `call`, ...). The sandbox transport forwards calls
//! made by plugin code to [`HostApi::dispatch`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use serde_json::Value;

use super::manager::PluginManager;
use super::{PluginError, PluginResult};

/// A host function supplied by the embedding application.
pub type HostFunction = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, PluginResult<Value>> + Send + Sync>;

/// Names of the built-in capabilities.
pub const BUILTIN_FUNCTIONS: [&str; 8] =
    ["register", "createWindow", "run", "call", "getPlugin", "setConfig", "getConfig", "getAttachment"];

/// Functions supplied by the embedding application.
///
/// Top-level functions never shadow a built-in capability. Utilities are
/// exposed under `utils.<name>` exactly as supplied.
#[derive(Clone, Default)]
pub struct HostExtensions {
    functions: BTreeMap<String, HostFunction>,
    utils: BTreeMap<String, HostFunction>,
}

impl HostExtensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a top-level function. Built-in names are kept and the extra is dropped.
    pub fn function(mut self, name: impl Into<String>, f: HostFunction) -> Self {
        let name = name.into();
        if BUILTIN_FUNCTIONS.contains(&name.as_str()) || name == "utils" {
            tracing::warn!(function = %name, "Ignoring host function that shadows a built-in");
            return self;
        }
        self.functions.insert(name, f);
        self
    }

    /// Add a utility function under `utils`.
    pub fn util(mut self, name: impl Into<String>, f: HostFunction) -> Self {
        self.utils.insert(name.into(), f);
        self
    }
}

impl fmt::Debug for HostExtensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostExtensions")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("utils", &self.utils.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Capability surface bound to one calling plugin.
#[derive(Clone)]
pub struct HostApi {
    manager: Weak<PluginManager>,
    plugin: String,
    instance_id: String,
    extensions: Arc<HostExtensions>,
}

impl HostApi {
    pub(crate) fn new(
        manager: Weak<PluginManager>,
        plugin: impl Into<String>,
        instance_id: impl Into<String>,
        extensions: Arc<HostExtensions>,
    ) -> Self {
        Self { manager, plugin: plugin.into(), instance_id: instance_id.into(), extensions }
    }

    /// Name of the calling plugin.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Instance id of the calling plugin.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// All callable names: built-ins, extra functions and `utils.*`.
    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = BUILTIN_FUNCTIONS.iter().map(|s| (*s).to_string()).collect();
        names.extend(self.extensions.functions.keys().cloned());
        names.extend(self.extensions.utils.keys().map(|k| format!("utils.{k}")));
        names
    }

    fn manager(&self) -> PluginResult<Arc<PluginManager>> {
        self.manager.upgrade().ok_or_else(|| PluginError::Connection {
            plugin: self.plugin.clone(),
            message: "plugin runtime has shut down".to_string(),
        })
    }

    /// Register an operation for the calling plugin.
    pub async fn register(&self, op: Value) -> PluginResult<String> {
        self.manager()?.register_operation(&self.plugin, op)
    }

    /// Create a window.
    pub async fn create_window(&self, window: Value) -> PluginResult<Value> {
        let handle = self.manager()?.create_window(Some(&self.plugin), window).await?;
        Ok(serde_json::to_value(handle)?)
    }

    /// Run another plugin.
    pub async fn run(&self, target: &str, my: Value) -> PluginResult<Value> {
        self.manager()?.run_plugin(&self.plugin, target, my).await
    }

    /// Call an exported function of another plugin.
    pub async fn call(&self, target: &str, function: &str, args: Vec<Value>) -> PluginResult<Value> {
        self.manager()?.call_plugin(target, function, args).await
    }

    /// Describe another plugin's exported API.
    pub async fn get_plugin(&self, target: &str) -> PluginResult<Value> {
        let handle = self.manager()?.get_plugin(target)?;
        Ok(serde_json::to_value(handle)?)
    }

    /// Persist a per-plugin setting.
    pub async fn set_config(&self, name: &str, value: Value) -> PluginResult<()> {
        self.manager()?.set_plugin_config(&self.plugin, name, value).await
    }

    /// Read a per-plugin setting.
    pub async fn get_config(&self, name: &str) -> PluginResult<Value> {
        self.manager()?.get_plugin_config(&self.plugin, name).await
    }

    /// Read a named attachment of the calling plugin.
    pub async fn get_attachment(&self, name: &str) -> PluginResult<Value> {
        let content = self.manager()?.get_attachment(&self.plugin, name)?;
        Ok(content.map_or(Value::Null, Value::String))
    }

    /// Dispatch a call made by plugin code.
    pub async fn dispatch(&self, function: &str, args: Vec<Value>) -> PluginResult<Value> {
        tracing::trace!(plugin = %self.plugin, function = %function, "Host call");

        let mut args = args.into_iter();
        let mut next = || args.next().unwrap_or(Value::Null);

        match function {
            "register" => Ok(Value::String(self.register(next()).await?)),
            "createWindow" => self.create_window(next()).await,
            "run" => {
                let target = string_arg(function, next())?;
                self.run(&target, next()).await
            }
            "call" => {
                let target = string_arg(function, next())?;
                let name = string_arg(function, next())?;
                let rest: Vec<Value> = std::iter::from_fn(|| args.next()).collect();
                self.call(&target, &name, rest).await
            }
            "getPlugin" => self.get_plugin(&string_arg(function, next())?).await,
            "setConfig" => {
                let name = string_arg(function, next())?;
                self.set_config(&name, next()).await.map(|()| Value::Null)
            }
            "getConfig" => self.get_config(&string_arg(function, next())?).await,
            "getAttachment" => self.get_attachment(&string_arg(function, next())?).await,
            other => {
                let rest: Vec<Value> = args.collect();
                let f = match other.strip_prefix("utils.") {
                    Some(util) => self.extensions.utils.get(util),
                    None => self.extensions.functions.get(other),
                };
                match f {
                    Some(f) => f(rest).await,
                    None => Err(PluginError::NotFound { kind: "Function", name: other.to_string() }),
                }
            }
        }
    }
}

fn string_arg(function: &str, value: Value) -> PluginResult<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(PluginError::schema(function, format!("expected a string argument, got {other}"))),
    }
}

impl fmt::Debug for HostApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostApi").field("plugin", &self.plugin).field("instance_id", &self.instance_id).finish()
    }
}

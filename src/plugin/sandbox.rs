//! Transport seams: sandboxes, plugin connections and window surfaces.
//!
//! The runtime never executes plugin code itself. A [`Sandbox`] starts an
//! isolated execution context for a plugin and returns a
//! [`PluginConnection`] through which the plugin's exported functions are
//! invoked. Plugin code reaches back into the runtime through the
//! [`HostApi`] handed to the sandbox on connect.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::config::{Execution, PluginConfig};
use super::error::ENGINE_UNAVAILABLE;
use super::host::HostApi;
use super::{PluginError, PluginKind, PluginResult};

/// Everything a sandbox needs to start one instance.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Instance (or window) id.
    pub id: String,
    /// Merged plugin configuration.
    pub config: PluginConfig,
    /// Per-kind execution payload.
    pub execution: Execution,
    /// Selected workspace.
    pub workspace: Option<String>,
}

impl SandboxSpec {
    pub fn new(id: impl Into<String>, config: PluginConfig, workspace: Option<String>) -> Self {
        let execution = config.execution();
        Self { id: id.into(), config, execution, workspace }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}

/// A connected plugin instance.
#[async_trait]
pub trait PluginConnection: Send + Sync {
    /// Names of the functions the plugin exported.
    fn api_names(&self) -> Vec<String>;

    /// Whether the plugin exported a function.
    fn exposes(&self, name: &str) -> bool {
        self.api_names().iter().any(|n| n == name)
    }

    /// Invoke an exported function.
    async fn call(&self, function: &str, args: Vec<Value>) -> PluginResult<Value>;

    /// Stop the instance. Must be idempotent.
    fn terminate(&self) -> PluginResult<()>;
}

/// Starts isolated execution contexts.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Whether the execution engine for a kind is reachable.
    fn engine_available(&self, _kind: PluginKind) -> bool {
        true
    }

    /// Start an instance and complete the connection handshake.
    async fn connect(&self, spec: SandboxSpec, host: HostApi) -> PluginResult<Arc<dyn PluginConnection>>;
}

/// Sandbox used when no transport is configured.
///
/// Every connection attempt fails, so only window plugins can be loaded.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableSandbox;

#[async_trait]
impl Sandbox for UnavailableSandbox {
    fn engine_available(&self, _kind: PluginKind) -> bool {
        false
    }

    async fn connect(&self, spec: SandboxSpec, _host: HostApi) -> PluginResult<Arc<dyn PluginConnection>> {
        let message = match spec.config.kind {
            PluginKind::NativeProcess => format!("{ENGINE_UNAVAILABLE}."),
            kind => format!("no sandbox transport for {} plugins in this host", kind.display_name()),
        };
        Err(PluginError::Connection { plugin: spec.config.name, message })
    }
}

/// A request to materialize a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Window type: a registered window plugin name, or a built-in `imjoy/...` type.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub panel: Value,
    /// Plugin that owns the window content.
    #[serde(default)]
    pub plugin: Option<String>,
}

impl WindowConfig {
    /// Parse and check a window request.
    pub fn from_value(value: Value) -> PluginResult<Self> {
        let mut window: Self = serde_json::from_value(value)
            .map_err(|e| PluginError::schema("window", e.to_string()))?;
        if window.kind.trim().is_empty() {
            return Err(PluginError::schema("window", "window 'type' is required"));
        }
        if window.config.is_null() {
            window.config = Value::Object(serde_json::Map::new());
        }
        Ok(window)
    }

    /// Built-in window types are rendered by the surface without a plugin.
    pub fn is_builtin(&self) -> bool {
        self.kind.starts_with("imjoy")
    }
}

/// Handle returned for a created window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowHandle {
    pub id: String,
    pub name: String,
    pub plugin: Option<String>,
}

/// Rendering surface for windows.
#[async_trait]
pub trait WindowSurface: Send + Sync {
    /// Add a window, returning the id the surface assigned.
    async fn add_window(&self, window: &WindowConfig) -> PluginResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_window_config_requires_type() {
        assert!(WindowConfig::from_value(json!({"name": "w"})).is_err());
        assert!(WindowConfig::from_value(json!({"name": "w", "type": " "})).is_err());

        let window = WindowConfig::from_value(json!({"type": "imjoy/image", "data": {"src": "a.png"}})).unwrap();
        assert!(window.is_builtin());
        assert_eq!(window.config, json!({}));
    }
}

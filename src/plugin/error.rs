//! Plugin runtime error types.

use thiserror::Error;

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors that can occur while resolving, installing, loading or invoking plugins.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Plugin source could not be parsed.
    #[error("Failed to parse the content of the plugin{}", name_suffix(.plugin))]
    Parse {
        plugin: Option<String>,
        #[source]
        source: Box<PluginError>,
    },

    /// Malformed source sections (missing config block, bad JSON, ...).
    #[error("Malformed plugin source: {0}")]
    Source(String),

    /// Config, operation or window failed schema validation.
    #[error("Schema error in '{subject}': {message}")]
    Schema { subject: String, message: String },

    /// Unknown plugin, operation, function or repository entry.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Call issued before the owning instance finished setup.
    #[error("Plugin '{0}' is not running")]
    NotRunning(String),

    /// A dependency failed to install, aborting the dependent plugin.
    #[error("Failed to install dependencies for {plugin}: {source}")]
    DependencyInstall {
        plugin: String,
        #[source]
        source: Box<PluginError>,
    },

    /// Sandbox failed to connect or complete the handshake.
    #[error("Failed to connect plugin '{plugin}': {message}")]
    Connection { plugin: String, message: String },

    /// The instance does not expose a setup entry point.
    #[error("No \"setup()\" function is defined in plugin \"{0}\"")]
    SetupMissing(String),

    /// Repository manifest is invalid.
    #[error("Invalid repository manifest from {url}: {message}")]
    Manifest { url: String, message: String },

    /// Plugin location or reference has the wrong format.
    #[error("Invalid plugin reference: {0}")]
    Format(String),

    /// Network error while fetching manifests or sources.
    #[error("Network error: {0}")]
    Network(String),

    /// Document store failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Optimistic revision check failed.
    #[error("Document '{0}' was modified concurrently")]
    Conflict(String),

    /// Fetched content failed verification (e.g., checksum mismatch).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Plugin code raised an error while executing.
    #[error("<{plugin}>: {message}")]
    Execution { plugin: String, message: String },

    /// Attempt to overwrite a field declared in the config block.
    #[error("'{0}' is a readonly field defined in <config> block, please avoid using it")]
    ReadOnly(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn name_suffix(plugin: &Option<String>) -> String {
    plugin.as_ref().map(|p| format!(" <{p}>")).unwrap_or_default()
}

impl PluginError {
    /// Create a not-found error for a plugin name.
    pub fn plugin_not_found(name: impl Into<String>) -> Self {
        Self::NotFound { kind: "Plugin", name: name.into() }
    }

    /// Create a schema error.
    pub fn schema(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema { subject: subject.into(), message: message.into() }
    }

    /// Create an execution error attributed to a plugin.
    pub fn execution(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution { plugin: plugin.into(), message: message.into() }
    }

    /// Wrap an error raised while parsing a plugin source.
    pub fn parse(plugin: Option<String>, source: Self) -> Self {
        Self::Parse { plugin, source: Box::new(source) }
    }

    /// Whether this error means a native engine connection is missing.
    pub fn is_engine_unavailable(&self) -> bool {
        matches!(self, Self::Connection { message, .. } if message.contains(ENGINE_UNAVAILABLE))
    }
}

/// Message reported when a native-process plugin has no engine connection.
pub const ENGINE_UNAVAILABLE: &str = "Please connect to the Plugin Engine";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_names_plugin() {
        let err = PluginError::parse(
            Some("Demo".to_string()),
            PluginError::schema("Demo", "type must be one of the supported plugin types"),
        );
        assert_eq!(err.to_string(), "Failed to parse the content of the plugin <Demo>");

        let anonymous = PluginError::parse(None, PluginError::Source("no config".into()));
        assert_eq!(anonymous.to_string(), "Failed to parse the content of the plugin");
    }

    #[test]
    fn test_dependency_error_names_parent() {
        let err = PluginError::DependencyInstall {
            plugin: "Parent".to_string(),
            source: Box::new(PluginError::plugin_not_found("Child")),
        };
        let text = err.to_string();
        assert!(text.contains("Parent"));
        assert!(text.contains("Child"));
    }

    #[test]
    fn test_engine_unavailable_detection() {
        let err = PluginError::Connection {
            plugin: "py".to_string(),
            message: format!("{ENGINE_UNAVAILABLE} 🚀."),
        };
        assert!(err.is_engine_unavailable());
        assert!(!PluginError::NotRunning("py".into()).is_engine_unavailable());
    }
}

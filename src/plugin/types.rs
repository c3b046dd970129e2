//! Core plugin types.

use serde::{Deserialize, Serialize};

/// Execution kind of a plugin.
///
/// The set is closed: every plugin source must declare one of these types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginKind {
    /// Materializes a visible window instead of running in the background.
    #[serde(rename = "window")]
    Window,
    /// Script running in an isolated frame.
    #[serde(rename = "iframe")]
    SandboxedScript,
    /// Script running in an isolated worker.
    #[serde(rename = "web-worker")]
    IsolatedWorker,
    /// Interpreter (e.g. Python compiled to the sandbox) running in isolation.
    #[serde(rename = "web-python")]
    IsolatedInterpreter,
    /// Native process driven through an external execution engine.
    #[serde(rename = "native-python")]
    NativeProcess,
}

impl PluginKind {
    /// All supported kinds.
    pub const ALL: [Self; 5] = [
        Self::Window,
        Self::SandboxedScript,
        Self::IsolatedWorker,
        Self::IsolatedInterpreter,
        Self::NativeProcess,
    ];

    /// The wire name used in plugin sources.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Window => "window",
            Self::SandboxedScript => "iframe",
            Self::IsolatedWorker => "web-worker",
            Self::IsolatedInterpreter => "web-python",
            Self::NativeProcess => "native-python",
        }
    }

    /// Parse a wire name.
    pub fn from_wire(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == value)
    }

    /// Get the display name for this plugin kind.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Window => "Window",
            Self::SandboxedScript => "Sandboxed Script",
            Self::IsolatedWorker => "Isolated Worker",
            Self::IsolatedInterpreter => "Isolated Interpreter",
            Self::NativeProcess => "Native Process",
        }
    }

    /// Tag added to registered operations for search and filtering.
    pub fn registry_tag(&self) -> &'static str {
        match self {
            Self::Window => "window",
            Self::SandboxedScript => "iframe",
            Self::IsolatedWorker => "web-worker",
            Self::IsolatedInterpreter => "web-python",
            Self::NativeProcess => "python",
        }
    }

    /// Whether instances of this kind need a sandbox connection.
    pub fn needs_sandbox(&self) -> bool {
        !matches!(self, Self::Window)
    }
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Plugin API revision that sources are upgraded to.
pub const PLUGIN_API_VERSION: &str = "0.1.7";

/// Extension every plugin document must end with.
pub const PLUGIN_EXTENSION: &str = ".imjoy.html";

/// Manifest file name hosted at the repository root.
pub const MANIFEST_FILE: &str = "manifest.imjoy.json";

/// Fields whose mapping value is indexed by the effective tag.
pub const CONFIGURABLE_FIELDS: &[&str] = &[
    "env",
    "requirements",
    "dependencies",
    "icon",
    "ui",
    "type",
    "flags",
    "cover",
    "runnable",
];

/// Stable record id derived from a plugin name.
///
/// Installing a plugin with the same name overwrites the previous record.
pub fn slug(name: &str) -> String {
    name.trim().replace(' ', "_")
}

/// Short random suffix for instance and window ids.
pub fn rand_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..10].to_string()
}

/// Fresh instance id: `slug(name) + "_" + random`.
pub fn instance_id(name: &str) -> String {
    format!("{}_{}", slug(name), rand_id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        for kind in PluginKind::ALL {
            assert_eq!(PluginKind::from_wire(kind.as_str()), Some(kind));
        }
        assert_eq!(PluginKind::from_wire("collection"), None);

        let parsed: PluginKind = serde_json::from_str("\"web-worker\"").unwrap();
        assert_eq!(parsed, PluginKind::IsolatedWorker);
    }

    #[test]
    fn test_registry_tags() {
        assert_eq!(PluginKind::NativeProcess.registry_tag(), "python");
        assert_eq!(PluginKind::Window.registry_tag(), "window");
        assert!(!PluginKind::Window.needs_sandbox());
        assert!(PluginKind::IsolatedWorker.needs_sandbox());
    }

    #[test]
    fn test_slug_and_instance_id() {
        assert_eq!(slug(" Image Viewer "), "Image_Viewer");

        let a = instance_id("Image Viewer");
        let b = instance_id("Image Viewer");
        assert!(a.starts_with("Image_Viewer_"));
        assert_ne!(a, b);
    }
}

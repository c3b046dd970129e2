//! Repository manifest parsing and normalization.
//!
//! A repository hosts a `manifest.imjoy.json` at its root listing the
//! installable plugins:
//!
//! ```json
//! {"name": "Demos", "uri_root": "plugins", "plugins": [{"name": "3D Demos"}]}
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::types::{slug, MANIFEST_FILE, PLUGIN_EXTENSION};
use super::{PluginError, PluginResult};

/// A plugin entry in a repository manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Plugin name (exact-match key for short references).
    pub name: String,

    /// Location of the plugin source. Defaults to `<name>.imjoy.html`.
    #[serde(default)]
    pub uri: Option<String>,

    /// Disabled entries are dropped while loading the manifest.
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,

    /// `repoRef:name`, filled in during normalization.
    #[serde(default)]
    pub origin: Option<String>,

    #[serde(rename = "_id", default)]
    pub record_id: Option<String>,

    #[serde(default, deserialize_with = "lenient_string")]
    pub description: Option<String>,

    #[serde(default, deserialize_with = "lenient_string")]
    pub version: Option<String>,

    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    pub kind: Option<String>,

    #[serde(default, deserialize_with = "lenient_tags")]
    pub tags: Vec<String>,

    /// SHA256 checksum of the plugin source.
    #[serde(default, deserialize_with = "lenient_string")]
    pub sha256: Option<String>,

    /// Whether the plugin is installed in the current workspace.
    #[serde(default, deserialize_with = "lenient_bool")]
    pub installed: bool,

    /// Tag the plugin was installed with.
    #[serde(default, deserialize_with = "lenient_string")]
    pub tag: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ManifestEntry {
    /// Create a bare entry.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: None,
            disabled: false,
            origin: None,
            record_id: None,
            description: None,
            version: None,
            kind: None,
            tags: Vec::new(),
            sha256: None,
            installed: false,
            tag: None,
            extra: Map::new(),
        }
    }

    /// Resolved source URI (empty before normalization).
    pub fn source_uri(&self) -> &str {
        self.uri.as_deref().unwrap_or_default()
    }
}

// Lenient readers for hand-edited manifest fields.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

fn lenient_root<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    lenient_string(deserializer).map(Option::unwrap_or_default)
}

fn lenient_tags<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => vec![s],
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    })
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    })
}

/// A repository manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Base for relative plugin URIs.
    #[serde(default, deserialize_with = "lenient_root")]
    pub uri_root: String,

    #[serde(default)]
    pub plugins: Vec<ManifestEntry>,
}

impl Manifest {
    /// Parse a fetched manifest body.
    ///
    /// The body must be a JSON object with a `plugins` list.
    pub fn from_json(url: &str, body: &str) -> PluginResult<Self> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| PluginError::Manifest { url: url.to_string(), message: e.to_string() })?;

        if !value.get("plugins").is_some_and(Value::is_array) {
            return Err(PluginError::Manifest {
                url: url.to_string(),
                message: "missing 'plugins' list".to_string(),
            });
        }

        let Value::Object(mut map) = value else {
            return Err(PluginError::Manifest { url: url.to_string(), message: "not a JSON object".to_string() });
        };
        let entries = match map.remove("plugins") {
            Some(Value::Array(entries)) => entries,
            _ => Vec::new(),
        };

        let mut manifest: Self = serde_json::from_value(Value::Object(map))
            .map_err(|e| PluginError::Manifest { url: url.to_string(), message: e.to_string() })?;
        manifest.plugins = entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<ManifestEntry>(entry) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(manifest = %url, error = %e, "Skipping malformed manifest entry");
                    None
                }
            })
            .collect();
        Ok(manifest)
    }

    /// Resolve URIs and origins against the manifest location.
    ///
    /// * disabled entries are dropped
    /// * a relative `uri_root` is resolved against `manifest_url`
    /// * each entry's `uri` defaults to `<name>.imjoy.html` and is joined to
    ///   the root when relative
    /// * `origin` becomes `repo_origin:name`
    pub fn normalize(mut self, manifest_url: &str, repo_origin: &str) -> Self {
        self.plugins.retain(|p| !p.disabled);

        if !self.uri_root.starts_with("http") {
            let base = manifest_url.strip_suffix(MANIFEST_FILE).unwrap_or(manifest_url);
            self.uri_root = format!("{base}{}", self.uri_root.trim_matches('/'));
        }
        let root = self.uri_root.trim_end_matches('/').to_string();

        for entry in &mut self.plugins {
            let uri = entry.uri.take().unwrap_or_else(|| format!("{}{PLUGIN_EXTENSION}", entry.name));
            let uri = if uri.starts_with(&root) || uri.starts_with("http") {
                uri
            } else {
                format!("{root}/{}", uri.trim_start_matches('/'))
            };
            entry.uri = Some(uri);
            entry.origin = Some(format!("{repo_origin}:{}", entry.name));
            if entry.record_id.is_none() {
                entry.record_id = Some(slug(&entry.name));
            }
        }

        self
    }

    /// Find a plugin by exact name.
    pub fn find(&self, name: &str) -> Option<&ManifestEntry> {
        self.plugins.iter().find(|p| p.name == name)
    }

    /// Search plugins by name, description, or tags.
    pub fn search(&self, query: &str) -> Vec<&ManifestEntry> {
        let query_lower = query.to_lowercase();

        self.plugins
            .iter()
            .filter(|p| {
                p.name.to_lowercase().contains(&query_lower)
                    || p.description.as_ref().is_some_and(|d| d.to_lowercase().contains(&query_lower))
                    || p.tags.iter().any(|t| t.to_lowercase().contains(&query_lower))
            })
            .collect()
    }

    /// Mark entries present in `installed` (by name and tag).
    pub fn mark_installed<'a>(&mut self, installed: impl IntoIterator<Item = (&'a str, Option<&'a str>)>) {
        for (name, tag) in installed {
            if let Some(entry) = self.plugins.iter_mut().find(|p| p.name == name) {
                entry.installed = true;
                entry.tag = tag.map(str::to_string);
            }
        }
    }
}

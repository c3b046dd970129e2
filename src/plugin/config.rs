//! Plugin configuration parsing and validation.
//!
//! Turns raw plugin source text into a validated [`PluginConfig`]. The steps
//! are: split the document into blocks, read the JSON config block, pick the
//! script for the effective tag, resolve tag-indexed fields, upgrade legacy
//! API revisions and finally check the result against the plugin schema.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::source::{parse_sections, SourceBlock};
use super::types::{instance_id, slug, CONFIGURABLE_FIELDS, PLUGIN_API_VERSION};
use super::{PluginError, PluginKind, PluginResult};

/// Where a source came from and which variant was requested.
#[derive(Debug, Clone, Default)]
pub struct SourceContext {
    /// Location the source was fetched from.
    pub uri: Option<String>,
    /// Requested variant tag.
    pub tag: Option<String>,
    /// Repository origin (`repo:name[@tag]`).
    pub origin: Option<String>,
}

impl SourceContext {
    /// Context with only a requested tag.
    pub fn with_tag(tag: Option<&str>) -> Self {
        Self { tag: tag.map(str::to_string), ..Self::default() }
    }
}

/// Parsed and validated plugin configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Plugin name (logical identity).
    pub name: String,
    /// Execution kind.
    #[serde(rename = "type")]
    pub kind: PluginKind,
    /// Per-parse instance id, `slug(name)_random`.
    #[serde(default)]
    pub id: String,
    /// Stable record id, `slug(name)`.
    #[serde(rename = "_id", default)]
    pub record_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared variant tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Effective tag.
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    /// Source references installed before this plugin.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<Value>,
    #[serde(default = "default_runnable")]
    pub runnable: bool,
    /// Default window config for window plugins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<Value>,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    /// Script blocks without an explicit language.
    #[serde(default)]
    pub scripts: Vec<SourceBlock>,
    #[serde(default)]
    pub windows: Vec<SourceBlock>,
    #[serde(default)]
    pub styles: Vec<SourceBlock>,
    #[serde(default)]
    pub links: Vec<SourceBlock>,
    #[serde(default)]
    pub docs: Vec<SourceBlock>,
    #[serde(default)]
    pub attachments: Vec<SourceBlock>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
    /// Original source text.
    #[serde(default)]
    pub code: String,
    /// Unknown config fields, passed through to the sandbox.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_runnable() -> bool {
    true
}

/// Script chosen for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub lang: String,
    pub code: String,
}

/// Per-kind execution payload handed to the sandbox.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    Window { template: Option<String>, styles: Vec<String> },
    SandboxedScript { script: Script, template: Option<String>, styles: Vec<String> },
    IsolatedWorker { script: Script },
    IsolatedInterpreter { script: Script, requirements: Option<Value> },
    NativeProcess { script: Script, env: Option<Value>, requirements: Option<Value> },
}

impl PluginConfig {
    /// Execution payload for this plugin's kind.
    pub fn execution(&self) -> Execution {
        let script = Script {
            lang: self.lang.clone().unwrap_or_else(|| "javascript".to_string()),
            code: self.script.clone().unwrap_or_default(),
        };
        let template = self.windows.first().map(|w| w.content.clone());
        let styles = self.styles.iter().map(|s| s.content.clone()).collect();

        match self.kind {
            PluginKind::Window => Execution::Window { template, styles },
            PluginKind::SandboxedScript => Execution::SandboxedScript { script, template, styles },
            PluginKind::IsolatedWorker => Execution::IsolatedWorker { script },
            PluginKind::IsolatedInterpreter => {
                Execution::IsolatedInterpreter { script, requirements: self.requirements.clone() }
            }
            PluginKind::NativeProcess => Execution::NativeProcess {
                script,
                env: self.env.clone(),
                requirements: self.requirements.clone(),
            },
        }
    }

    /// Content of the attachment with the given name.
    pub fn attachment(&self, name: &str) -> Option<&str> {
        self.attachments.iter().find(|a| a.attr("name") == Some(name)).map(|a| a.content.as_str())
    }

    /// Content of the first docs block.
    pub fn docs_text(&self) -> Option<&str> {
        self.docs.first().map(|d| d.content.as_str())
    }

    /// Serialize to a JSON object.
    pub fn to_value(&self) -> PluginResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Look up a declared config field by name (used for `_field` reads).
    pub fn field(&self, name: &str) -> Option<Value> {
        let value = self.to_value().ok()?;
        value.get(name).cloned()
    }
}

/// Parse and validate a plugin source.
///
/// Every failure is reported as [`PluginError::Parse`] naming the plugin when
/// its name could be read; the underlying cause is logged and kept as source.
pub fn parse_plugin_source(code: &str, ctx: &SourceContext) -> PluginResult<PluginConfig> {
    let mut name_hint = None;
    parse_inner(code, ctx, &mut name_hint).map_err(|e| {
        tracing::error!(plugin = ?name_hint, error = %e, "Invalid plugin source");
        PluginError::parse(name_hint, e)
    })
}

fn parse_inner(
    code: &str,
    ctx: &SourceContext,
    name_hint: &mut Option<String>,
) -> PluginResult<PluginConfig> {
    let script_only = ctx.uri.as_deref().is_some_and(|u| u.split('?').next().unwrap_or(u).ends_with(".js"));

    let mut config = if script_only {
        script_only_config(code, ctx)
    } else {
        structured_config(code, ctx)?
    };

    *name_hint = config.get("name").and_then(Value::as_str).map(str::to_string);

    resolve_configurable_fields(&mut config)?;

    config.insert("uri".into(), ctx.uri.clone().map_or(Value::Null, Value::String));
    config.insert("origin".into(), ctx.origin.clone().map_or(Value::Null, Value::String));
    config.insert("code".into(), Value::String(code.to_string()));
    if !matches!(config.get("runnable"), Some(Value::Bool(_))) {
        config.insert("runnable".into(), Value::Bool(true));
    }

    upgrade_plugin_api(&mut config);
    validate_plugin_schema(&config)?;

    let name = config.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
    config.insert("id".into(), Value::String(instance_id(&name)));
    config.insert("_id".into(), Value::String(slug(&name)));
    for list in ["tags", "dependencies", "extensions"] {
        if config.get(list).is_some_and(Value::is_null) {
            config.remove(list);
        }
    }

    let parsed: PluginConfig = serde_json::from_value(Value::Object(config))?;
    Ok(parsed)
}

fn script_only_config(code: &str, ctx: &SourceContext) -> Map<String, Value> {
    let uri = ctx.uri.as_deref().unwrap_or_default();
    let file = uri.split('?').next().unwrap_or(uri).rsplit('/').next().unwrap_or(uri);
    let name = file.trim_end_matches(".js");

    let mut config = Map::new();
    config.insert("name".into(), Value::String(name.to_string()));
    config.insert("type".into(), Value::String(PluginKind::IsolatedWorker.as_str().to_string()));
    config.insert("lang".into(), Value::String("javascript".into()));
    config.insert("script".into(), Value::String(code.to_string()));
    config.insert("tag".into(), ctx.tag.clone().map_or(Value::Null, Value::String));
    config
}

fn structured_config(code: &str, ctx: &SourceContext) -> PluginResult<Map<String, Value>> {
    let sections = parse_sections(code);

    let config_block = sections
        .config
        .first()
        .ok_or_else(|| PluginError::Source("no <config> block found".to_string()))?;
    let mut config = match serde_json::from_str::<Value>(&config_block.content)? {
        Value::Object(map) => map,
        _ => return Err(PluginError::Source("<config> must contain a JSON object".to_string())),
    };

    let tag = ctx.tag.clone().or_else(|| {
        config.get("tags").and_then(Value::as_array).and_then(|t| t.first()).and_then(Value::as_str).map(str::to_string)
    });

    let mut scripts = Vec::new();
    let mut selected: Option<&SourceBlock> = None;
    for block in &sections.script {
        if block.attr("lang").is_some() {
            if selected.is_none() {
                selected = Some(block);
            }
        } else {
            scripts.push(block.clone());
        }
    }
    let mut selected = selected.or_else(|| sections.script.first());
    if let Some(ref tag) = tag {
        if let Some(tagged) = sections.script.iter().find(|b| b.attr("tag") == Some(tag.as_str())) {
            selected = Some(tagged);
        }
    }

    if let Some(block) = selected {
        config.insert("script".into(), Value::String(block.content.clone()));
        config.insert(
            "lang".into(),
            Value::String(block.attr("lang").unwrap_or("javascript").to_string()),
        );
    }
    config.insert("tag".into(), tag.map_or(Value::Null, Value::String));
    config.insert("scripts".into(), serde_json::to_value(scripts)?);

    for (key, blocks) in [
        ("links", &sections.link),
        ("windows", &sections.window),
        ("styles", &sections.style),
        ("docs", &sections.docs),
        ("attachments", &sections.attachment),
    ] {
        config.insert(key.into(), serde_json::to_value(blocks)?);
    }

    Ok(config)
}

/// Replace every tag-indexed configurable field by its value for the effective tag.
fn resolve_configurable_fields(config: &mut Map<String, Value>) -> PluginResult<()> {
    let tag = config.get("tag").and_then(Value::as_str).map(str::to_string);

    for field in CONFIGURABLE_FIELDS {
        let Some(Value::Object(by_tag)) = config.get(*field) else { continue };

        let Some(ref tag) = tag else {
            return Err(PluginError::schema(
                *field,
                "You must use 'tags' with configurable fields.",
            ));
        };

        let resolved = by_tag.get(tag).cloned();
        if resolved.is_none() {
            tracing::warn!(field = *field, tag = %tag, "Configurable field has no value for tag");
        }
        match resolved {
            Some(value) if !value.is_null() => {
                config.insert((*field).to_string(), value);
            }
            _ => {
                config.remove(*field);
            }
        }
    }

    Ok(())
}

/// Normalize older plugin API revisions to the current shape.
pub fn upgrade_plugin_api(config: &mut Map<String, Value>) {
    if let Some(Value::String(mode)) = config.remove("mode") {
        let kind = match mode.as_str() {
            "pyworker" => Some(PluginKind::NativeProcess),
            "webworker" => Some(PluginKind::IsolatedWorker),
            "webpython" => Some(PluginKind::IsolatedInterpreter),
            "iframe" => Some(PluginKind::SandboxedScript),
            "window" => Some(PluginKind::Window),
            _ => None,
        };
        if let Some(kind) = kind {
            config.insert("type".into(), Value::String(kind.as_str().to_string()));
        }
    }

    let current = config.get("api_version").and_then(Value::as_str).unwrap_or("0.1.0");
    if version_lt(current, PLUGIN_API_VERSION) {
        config.insert("api_version".into(), Value::String(PLUGIN_API_VERSION.to_string()));
    }
}

fn version_lt(a: &str, b: &str) -> bool {
    let parse = |v: &str| v.split('.').map(|p| p.parse::<u32>().unwrap_or(0)).collect::<Vec<_>>();
    parse(a) < parse(b)
}

/// Check an assembled config object against the plugin schema.
fn validate_plugin_schema(config: &Map<String, Value>) -> PluginResult<()> {
    let name = match config.get("name") {
        Some(Value::String(name)) if !name.trim().is_empty() => name.as_str(),
        _ => return Err(PluginError::schema("<unnamed>", "'name' is required and must be a string")),
    };
    validate_plugin_name(name)?;

    match config.get("type") {
        Some(Value::String(kind)) if PluginKind::from_wire(kind).is_some() => {}
        other => {
            return Err(PluginError::schema(
                name,
                format!(
                    "'type' must be one of {:?}, got {}",
                    PluginKind::ALL.map(|k| k.as_str()),
                    other.map_or_else(|| "nothing".to_string(), Value::to_string)
                ),
            ))
        }
    }

    for list in ["tags", "dependencies", "extensions"] {
        if let Some(value) = config.get(list) {
            let ok = value.is_null()
                || value.as_array().is_some_and(|items| items.iter().all(Value::is_string));
            if !ok {
                return Err(PluginError::schema(name, format!("'{list}' must be a list of strings")));
            }
        }
    }

    for schema in ["inputs", "outputs"] {
        if let Some(value) = config.get(schema) {
            if !(value.is_null() || value.is_object() || value.is_array()) {
                return Err(PluginError::schema(name, format!("'{schema}' must be an object")));
            }
        }
    }

    if !matches!(config.get("runnable"), Some(Value::Bool(_))) {
        return Err(PluginError::schema(name, "'runnable' must be a boolean"));
    }

    Ok(())
}

/// Plugin names must not contain a path separator.
pub fn validate_plugin_name(name: &str) -> PluginResult<()> {
    if name.contains('/') {
        return Err(PluginError::schema(name, "Plugin name should not contain '/'."));
    }
    Ok(())
}

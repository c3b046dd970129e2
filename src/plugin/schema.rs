//! Operation input/output schemas.
//!
//! Operations declare the shape of the data they accept and produce with a
//! subset of JSON Schema. Schemas are normalized and compiled once at
//! registration; a keyword outside the supported set fails compilation
//! instead of being ignored.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::{Map, Value};

use super::{PluginError, PluginResult};

/// Keywords with validation semantics understood by [`CompiledSchema`].
const VALIDATION_KEYWORDS: &[&str] = &[
    "type",
    "properties",
    "required",
    "additionalProperties",
    "items",
    "minItems",
    "maxItems",
    "enum",
    "const",
    "anyOf",
    "oneOf",
    "allOf",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "minLength",
    "maxLength",
    "pattern",
];

/// Keywords that carry no validation and are accepted as-is.
const ANNOTATION_KEYWORDS: &[&str] =
    &["title", "description", "default", "examples", "format", "$schema", "$id", "$comment"];

/// JSON value type names accepted in `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    Object,
    Array,
    String,
    Number,
    Integer,
    Boolean,
    Null,
}

impl JsonType {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "object" => Self::Object,
            "array" => Self::Array,
            "string" => Self::String,
            "number" => Self::Number,
            "integer" => Self::Integer,
            "boolean" => Self::Boolean,
            "null" => Self::Null,
            _ => return None,
        })
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.as_f64().is_some_and(|n| n.fract() == 0.0),
            Self::Boolean => value.is_boolean(),
            Self::Null => value.is_null(),
        }
    }
}

/// `additionalProperties` setting.
#[derive(Debug, Clone, Default)]
enum Additional {
    #[default]
    Allowed,
    Forbidden,
    Schema(Box<CompiledSchema>),
}

/// Numeric and length bounds.
#[derive(Debug, Clone, Default, PartialEq)]
struct Bounds {
    minimum: Option<f64>,
    maximum: Option<f64>,
    exclusive_minimum: Option<f64>,
    exclusive_maximum: Option<f64>,
    min_length: Option<u64>,
    max_length: Option<u64>,
    min_items: Option<u64>,
    max_items: Option<u64>,
}

/// A compiled schema ready for validation.
#[derive(Debug, Clone, Default)]
pub struct CompiledSchema {
    types: Vec<JsonType>,
    properties: BTreeMap<String, CompiledSchema>,
    required: Vec<String>,
    additional: Additional,
    items: Option<Box<CompiledSchema>>,
    enum_values: Option<Vec<Value>>,
    const_value: Option<Value>,
    any_of: Vec<CompiledSchema>,
    one_of: Vec<CompiledSchema>,
    all_of: Vec<CompiledSchema>,
    bounds: Bounds,
    pattern: Option<Regex>,
}

impl CompiledSchema {
    /// Compile a schema document.
    pub fn compile(schema: &Value) -> PluginResult<Self> {
        let Value::Object(map) = schema else {
            return Err(PluginError::schema("schema", "schema must be an object"));
        };

        if let Some(keyword) =
            map.keys().find(|k| !VALIDATION_KEYWORDS.contains(&k.as_str()) && !ANNOTATION_KEYWORDS.contains(&k.as_str()))
        {
            return Err(invalid(format!("unsupported keyword '{keyword}'")));
        }

        let types = match map.get("type") {
            None => Vec::new(),
            Some(Value::String(name)) => vec![parse_type(name)?],
            Some(Value::Array(names)) => names
                .iter()
                .map(|n| n.as_str().ok_or_else(|| invalid("type names must be strings")).and_then(parse_type))
                .collect::<PluginResult<_>>()?,
            Some(_) => return Err(invalid("'type' must be a string or a list of strings")),
        };

        let properties = match map.get("properties") {
            None => BTreeMap::new(),
            Some(Value::Object(props)) => props
                .iter()
                .map(|(k, v)| Self::compile(v).map(|s| (k.clone(), s)))
                .collect::<PluginResult<_>>()?,
            Some(_) => return Err(invalid("'properties' must be an object")),
        };

        let required = match map.get("required") {
            None => Vec::new(),
            Some(Value::Array(keys)) => keys
                .iter()
                .map(|k| k.as_str().map(str::to_string).ok_or_else(|| invalid("'required' must list strings")))
                .collect::<PluginResult<_>>()?,
            Some(_) => return Err(invalid("'required' must be a list")),
        };

        let additional = match map.get("additionalProperties") {
            None | Some(Value::Bool(true)) => Additional::Allowed,
            Some(Value::Bool(false)) => Additional::Forbidden,
            Some(schema @ Value::Object(_)) => Additional::Schema(Box::new(Self::compile(schema)?)),
            Some(_) => return Err(invalid("'additionalProperties' must be a boolean or a schema")),
        };

        let items = map.get("items").map(Self::compile).transpose()?.map(Box::new);

        let enum_values = match map.get("enum") {
            None => None,
            Some(Value::Array(values)) => Some(values.clone()),
            Some(_) => return Err(invalid("'enum' must be a list")),
        };

        let pattern = match map.get("pattern") {
            None => None,
            Some(Value::String(pattern)) => Some(
                Regex::new(pattern).map_err(|e| invalid(format!("invalid pattern '{pattern}': {e}")))?,
            ),
            Some(_) => return Err(invalid("'pattern' must be a string")),
        };

        let bounds = Bounds {
            minimum: number(map, "minimum")?,
            maximum: number(map, "maximum")?,
            exclusive_minimum: number(map, "exclusiveMinimum")?,
            exclusive_maximum: number(map, "exclusiveMaximum")?,
            min_length: count(map, "minLength")?,
            max_length: count(map, "maxLength")?,
            min_items: count(map, "minItems")?,
            max_items: count(map, "maxItems")?,
        };

        Ok(Self {
            types,
            properties,
            required,
            additional,
            items,
            enum_values,
            const_value: map.get("const").cloned(),
            any_of: subschemas(map, "anyOf")?,
            one_of: subschemas(map, "oneOf")?,
            all_of: subschemas(map, "allOf")?,
            bounds,
            pattern,
        })
    }

    /// Check a value, returning the first violation.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        self.validate_at(value, "$")
    }

    /// Whether the value satisfies the schema.
    pub fn is_valid(&self, value: &Value) -> bool {
        self.validate(value).is_ok()
    }

    fn validate_at(&self, value: &Value, path: &str) -> Result<(), String> {
        if !self.types.is_empty() && !self.types.iter().any(|t| t.matches(value)) {
            return Err(format!("{path}: expected {:?}, got {value}", self.types));
        }

        if let Some(ref allowed) = self.enum_values {
            if !allowed.contains(value) {
                return Err(format!("{path}: {value} is not one of {allowed:?}"));
            }
        }
        if let Some(ref expected) = self.const_value {
            if expected != value {
                return Err(format!("{path}: expected {expected}, got {value}"));
            }
        }

        match value {
            Value::Object(map) => self.validate_object(map, path)?,
            Value::Array(items) => self.validate_array(items, path)?,
            Value::String(text) => self.validate_string(text, path)?,
            Value::Number(n) => {
                if let Some(n) = n.as_f64() {
                    self.validate_number(n, path)?;
                }
            }
            Value::Bool(_) | Value::Null => {}
        }

        if !self.any_of.is_empty() && !self.any_of.iter().any(|s| s.validate_at(value, path).is_ok()) {
            return Err(format!("{path}: no alternative of anyOf matched"));
        }
        if !self.one_of.is_empty() {
            let matched = self.one_of.iter().filter(|s| s.validate_at(value, path).is_ok()).count();
            if matched != 1 {
                return Err(format!("{path}: {matched} alternatives of oneOf matched, expected exactly one"));
            }
        }
        for schema in &self.all_of {
            schema.validate_at(value, path)?;
        }

        Ok(())
    }

    fn validate_object(&self, map: &Map<String, Value>, path: &str) -> Result<(), String> {
        for key in &self.required {
            if !map.contains_key(key) {
                return Err(format!("{path}: missing required property '{key}'"));
            }
        }
        for (key, child) in map {
            let child_path = format!("{path}.{key}");
            match self.properties.get(key) {
                Some(schema) => schema.validate_at(child, &child_path)?,
                None => match self.additional {
                    Additional::Allowed => {}
                    Additional::Forbidden => return Err(format!("{path}: unexpected property '{key}'")),
                    Additional::Schema(ref schema) => schema.validate_at(child, &child_path)?,
                },
            }
        }
        Ok(())
    }

    fn validate_array(&self, items: &[Value], path: &str) -> Result<(), String> {
        let len = items.len() as u64;
        if self.bounds.min_items.is_some_and(|min| len < min) || self.bounds.max_items.is_some_and(|max| len > max) {
            return Err(format!("{path}: array length {len} out of bounds"));
        }
        if let Some(ref schema) = self.items {
            for (i, item) in items.iter().enumerate() {
                schema.validate_at(item, &format!("{path}[{i}]"))?;
            }
        }
        Ok(())
    }

    fn validate_string(&self, text: &str, path: &str) -> Result<(), String> {
        let len = text.chars().count() as u64;
        if self.bounds.min_length.is_some_and(|min| len < min) || self.bounds.max_length.is_some_and(|max| len > max)
        {
            return Err(format!("{path}: string length {len} out of bounds"));
        }
        if let Some(ref pattern) = self.pattern {
            if !pattern.is_match(text) {
                return Err(format!("{path}: '{text}' does not match /{pattern}/"));
            }
        }
        Ok(())
    }

    fn validate_number(&self, n: f64, path: &str) -> Result<(), String> {
        let b = &self.bounds;
        let in_range = b.minimum.map_or(true, |min| n >= min)
            && b.maximum.map_or(true, |max| n <= max)
            && b.exclusive_minimum.map_or(true, |min| n > min)
            && b.exclusive_maximum.map_or(true, |max| n < max);
        if in_range {
            Ok(())
        } else {
            Err(format!("{path}: {n} out of range"))
        }
    }
}

fn number(map: &Map<String, Value>, key: &str) -> PluginResult<Option<f64>> {
    match map.get(key) {
        None => Ok(None),
        Some(value) => value.as_f64().map(Some).ok_or_else(|| invalid(format!("'{key}' must be a number"))),
    }
}

fn count(map: &Map<String, Value>, key: &str) -> PluginResult<Option<u64>> {
    match map.get(key) {
        None => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| invalid(format!("'{key}' must be a non-negative integer"))),
    }
}

fn subschemas(map: &Map<String, Value>, key: &str) -> PluginResult<Vec<CompiledSchema>> {
    match map.get(key) {
        None => Ok(Vec::new()),
        Some(Value::Array(options)) => options.iter().map(CompiledSchema::compile).collect(),
        Some(_) => Err(invalid(format!("'{key}' must be a list"))),
    }
}

fn parse_type(name: &str) -> PluginResult<JsonType> {
    JsonType::parse(name).ok_or_else(|| invalid(format!("unknown type '{name}'")))
}

fn invalid(message: impl Into<String>) -> PluginError {
    PluginError::schema("schema", message)
}

/// Expand shorthand and default every declared property to required.
///
/// A mapping that is neither a full object schema (`type: object` with
/// `properties`) nor an array schema (`type: array` with `items`) is treated
/// as a bare `properties` map.
pub fn normalize_schema(schema: &Value) -> PluginResult<Value> {
    let Value::Object(map) = schema else {
        return Err(PluginError::schema("schema", "inputs schema must be an object."));
    };

    let is_object_schema = map.get("type") == Some(&Value::from("object")) && map.contains_key("properties");
    let is_array_schema = map.get("type") == Some(&Value::from("array")) && map.contains_key("items");

    let mut normalized = if is_object_schema || is_array_schema {
        map.clone()
    } else {
        let mut wrapped = Map::new();
        wrapped.insert("type".into(), Value::from("object"));
        wrapped.insert("properties".into(), Value::Object(map.clone()));
        wrapped
    };

    if normalized.get("type") == Some(&Value::from("object")) && !normalized.contains_key("required") {
        if let Some(Value::Object(props)) = normalized.get("properties") {
            let keys = props.keys().cloned().map(Value::String).collect();
            normalized.insert("required".into(), Value::Array(keys));
        }
    }

    Ok(Value::Object(normalized))
}

/// Normalize then compile.
pub fn compile_declared(schema: &Value) -> PluginResult<CompiledSchema> {
    CompiledSchema::compile(&normalize_schema(schema)?)
}

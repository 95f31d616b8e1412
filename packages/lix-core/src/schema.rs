//! Stored schemas: JSON-schema-like entity definitions that drive cache tables and
//! generated views.

use std::cmp::Ordering;

use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

pub const STORED_SCHEMA_KEY: &str = "lix_stored_schema";
pub const STORED_SCHEMA_VERSION: &str = "1.0";
pub const FILE_DESCRIPTOR_SCHEMA_KEY: &str = "lix_file_descriptor";
pub const FILE_DESCRIPTOR_SCHEMA_VERSION: &str = "1.0";

/// File id of entities that belong to the engine itself rather than to a file.
pub const LIX_FILE_ID: &str = "lix";
/// Plugin key of entities written by the engine itself.
pub const OWN_ENTITY_PLUGIN_KEY: &str = "lix_own_entity";

/// Relation names owned by the engine; schema keys may not shadow them.
pub const RESERVED_RELATIONS: &[&str] = &[
    "state",
    "state_all",
    "state_history",
    "change",
    "commit",
    "version",
    "active_version",
    "change_set_element",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl PropertyKind {
    fn from_type_name(name: &str) -> Option<Self> {
        Some(match name {
            "string" => Self::String,
            "number" => Self::Number,
            "integer" => Self::Integer,
            "boolean" => Self::Boolean,
            "object" => Self::Object,
            "array" => Self::Array,
            _ => return None,
        })
    }

    fn from_definition(definition: &Value) -> Self {
        match definition.get("type") {
            Some(Value::String(name)) => Self::from_type_name(name).unwrap_or(Self::Any),
            // `["string", "null"]` style unions: the first non-null member decides.
            Some(Value::Array(names)) => names
                .iter()
                .filter_map(Value::as_str)
                .filter(|name| *name != "null")
                .find_map(Self::from_type_name)
                .unwrap_or(Self::Any),
            _ => Self::Any,
        }
    }

    /// JSON values are stored as text; these kinds must be re-parsed when written.
    pub fn is_structured(self) -> bool {
        matches!(self, Self::Object | Self::Array)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyDef {
    pub name: String,
    pub kind: PropertyKind,
}

/// Literal values forced onto operational columns (`x-lix-override-lixcols`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LixcolOverrides {
    pub file_id: Option<String>,
    pub plugin_key: Option<String>,
    pub version_id: Option<String>,
}

/// Which generated relations a schema exposes (`x-lix-entity-views`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityViews {
    pub active: bool,
    pub all: bool,
    pub history: bool,
}

impl Default for EntityViews {
    fn default() -> Self {
        Self {
            active: true,
            all: true,
            history: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StoredSchema {
    pub key: String,
    pub version: String,
    /// Property names forming the entity id, in declaration order.
    pub primary_key: Vec<String>,
    pub properties: Vec<PropertyDef>,
    pub overrides: LixcolOverrides,
    pub entity_views: EntityViews,
    pub definition: Value,
}

impl StoredSchema {
    pub fn from_value(definition: Value) -> Result<Self> {
        let object = definition
            .as_object()
            .ok_or_else(|| Error::invalid_schema("<unknown>", "schema must be a JSON object"))?;

        let key = required_str(object, "x-lix-key", "<unknown>")?.to_string();
        validate_key(&key)?;
        let version = required_str(object, "x-lix-version", &key)?.to_string();

        let properties = match object.get("properties") {
            Some(Value::Object(props)) => props
                .iter()
                .map(|(name, def)| PropertyDef {
                    name: name.clone(),
                    kind: PropertyKind::from_definition(def),
                })
                .collect::<Vec<_>>(),
            Some(_) => return Err(Error::invalid_schema(&key, "properties must be an object")),
            None => return Err(Error::invalid_schema(&key, "missing properties")),
        };

        let primary_key = match object.get("x-lix-primary-key") {
            Some(Value::Array(items)) if !items.is_empty() => items
                .iter()
                .map(|item| {
                    let raw = item.as_str().ok_or_else(|| {
                        Error::invalid_schema(&key, "primary key entries must be strings")
                    })?;
                    let name = raw.strip_prefix('/').unwrap_or(raw);
                    if !properties.iter().any(|p| p.name == name) {
                        return Err(Error::invalid_schema(
                            &key,
                            format!("primary key '{name}' is not a declared property"),
                        ));
                    }
                    Ok(name.to_string())
                })
                .collect::<Result<Vec<_>>>()?,
            _ => return Err(Error::invalid_schema(&key, "missing x-lix-primary-key")),
        };

        let overrides = match object.get("x-lix-override-lixcols") {
            None => LixcolOverrides::default(),
            Some(Value::Object(cols)) => {
                let mut overrides = LixcolOverrides::default();
                for (column, raw) in cols {
                    let literal = decode_override_literal(&key, raw)?;
                    match column.as_str() {
                        "lixcol_file_id" => overrides.file_id = Some(literal),
                        "lixcol_plugin_key" => overrides.plugin_key = Some(literal),
                        "lixcol_version_id" => overrides.version_id = Some(literal),
                        other => {
                            return Err(Error::invalid_schema(
                                &key,
                                format!("cannot override column '{other}'"),
                            ))
                        }
                    }
                }
                overrides
            }
            Some(_) => {
                return Err(Error::invalid_schema(
                    &key,
                    "x-lix-override-lixcols must be an object",
                ))
            }
        };

        let entity_views = match object.get("x-lix-entity-views") {
            None => EntityViews::default(),
            Some(Value::Array(items)) => {
                let mut views = EntityViews {
                    active: false,
                    all: false,
                    history: false,
                };
                for item in items {
                    match item.as_str() {
                        Some("state") => views.active = true,
                        Some("state_all") => views.all = true,
                        Some("state_history") => views.history = true,
                        _ => {
                            return Err(Error::invalid_schema(
                                &key,
                                format!("unknown entity view variant {item}"),
                            ))
                        }
                    }
                }
                views
            }
            Some(_) => {
                return Err(Error::invalid_schema(
                    &key,
                    "x-lix-entity-views must be an array",
                ))
            }
        };

        Ok(Self {
            key,
            version,
            primary_key,
            properties,
            overrides,
            entity_views,
            definition,
        })
    }

    /// Entity id of this schema inside the stored-schema catalog.
    pub fn storage_id(&self) -> String {
        format!("{}~{}", self.key, self.version)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Derive the entity id from primary-key properties, joined with `~`.
    pub fn entity_id_for(&self, content: &Value) -> Result<String> {
        let mut parts = Vec::with_capacity(self.primary_key.len());
        for name in &self.primary_key {
            let part = match content.get(name) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::Bool(b)) => b.to_string(),
                _ => {
                    return Err(Error::InvalidOperation(format!(
                        "entity of '{}' is missing primary key property '{name}'",
                        self.key
                    )))
                }
            };
            parts.push(part);
        }
        Ok(parts.join("~"))
    }

    /// Catalog entry content stored under [`STORED_SCHEMA_KEY`].
    pub fn catalog_content(&self) -> Value {
        json!({
            "key": self.key,
            "version": self.version,
            "value": self.definition,
        })
    }

    /// Parse a catalog entry written by [`StoredSchema::catalog_content`].
    pub fn from_catalog_content(content: &Value) -> Result<Self> {
        let definition = content.get("value").cloned().ok_or_else(|| {
            Error::invalid_schema(STORED_SCHEMA_KEY, "catalog entry is missing 'value'")
        })?;
        Self::from_value(definition)
    }
}

/// Compare dotted numeric versions (`"1.10" > "1.9"`); non-numeric parts compare as text.
pub fn compare_schema_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(l), Some(r)) => {
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Schemas the engine relies on before any user schema is registered.
pub fn builtin_schemas() -> Vec<StoredSchema> {
    [stored_schema_definition(), file_descriptor_definition()]
        .into_iter()
        .filter_map(|definition| StoredSchema::from_value(definition).ok())
        .collect()
}

pub fn stored_schema_definition() -> Value {
    json!({
        "x-lix-key": STORED_SCHEMA_KEY,
        "x-lix-version": STORED_SCHEMA_VERSION,
        "x-lix-primary-key": ["/key", "/version"],
        "x-lix-override-lixcols": {
            "lixcol_file_id": "\"lix\"",
            "lixcol_plugin_key": "\"lix_own_entity\"",
            "lixcol_version_id": "\"global\""
        },
        "x-lix-entity-views": ["state", "state_all"],
        "type": "object",
        "properties": {
            "key": { "type": "string" },
            "version": { "type": "string" },
            "value": { "type": "object" }
        },
        "required": ["key", "version", "value"]
    })
}

pub fn file_descriptor_definition() -> Value {
    json!({
        "x-lix-key": FILE_DESCRIPTOR_SCHEMA_KEY,
        "x-lix-version": FILE_DESCRIPTOR_SCHEMA_VERSION,
        "x-lix-primary-key": ["/id"],
        "x-lix-override-lixcols": {
            "lixcol_file_id": "\"lix\"",
            "lixcol_plugin_key": "\"lix_own_entity\""
        },
        "type": "object",
        "properties": {
            "id": { "type": "string" },
            "path": { "type": "string" },
            "metadata": { "type": ["object", "null"] }
        },
        "required": ["id", "path"]
    })
}

fn required_str<'a>(object: &'a Map<String, Value>, field: &str, key: &str) -> Result<&'a str> {
    object
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::invalid_schema(key, format!("missing {field}")))
}

fn validate_key(key: &str) -> Result<()> {
    let mut chars = key.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::invalid_schema(
            key,
            "x-lix-key must be an identifier ([A-Za-z_][A-Za-z0-9_]*)",
        ));
    }
    if key.starts_with("internal_") || RESERVED_RELATIONS.contains(&key) {
        return Err(Error::invalid_schema(key, "x-lix-key is reserved"));
    }
    for suffix in ["_all", "_history"] {
        if let Some(base) = key.strip_suffix(suffix) {
            if RESERVED_RELATIONS.contains(&base) {
                return Err(Error::invalid_schema(key, "x-lix-key is reserved"));
            }
        }
    }
    Ok(())
}

/// Overrides are written as JSON literals (`"\"lix\""`); bare strings are accepted too.
fn decode_override_literal(key: &str, raw: &Value) -> Result<String> {
    let text = raw
        .as_str()
        .ok_or_else(|| Error::invalid_schema(key, "override values must be strings"))?;
    Ok(serde_json::from_str::<String>(text).unwrap_or_else(|_| text.trim_matches('"').to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mention_schema() -> Value {
        json!({
            "x-lix-key": "mention",
            "x-lix-version": "1.0",
            "x-lix-primary-key": ["/id"],
            "x-lix-override-lixcols": { "lixcol_file_id": "\"lix\"" },
            "properties": {
                "id": { "type": "string" },
                "tags": { "type": "array" },
                "done": { "type": "boolean" }
            }
        })
    }

    #[test]
    fn parses_declarations() {
        let schema = StoredSchema::from_value(mention_schema()).unwrap();
        assert_eq!(schema.key, "mention");
        assert_eq!(schema.primary_key, vec!["id".to_string()]);
        assert_eq!(schema.overrides.file_id.as_deref(), Some("lix"));
        assert_eq!(schema.property("tags").unwrap().kind, PropertyKind::Array);
        assert_eq!(schema.property("done").unwrap().kind, PropertyKind::Boolean);
        assert_eq!(schema.entity_views, EntityViews::default());
        assert_eq!(schema.storage_id(), "mention~1.0");
    }

    #[test]
    fn missing_primary_key_is_rejected() {
        let mut definition = mention_schema();
        definition.as_object_mut().unwrap().remove("x-lix-primary-key");
        let err = StoredSchema::from_value(definition).unwrap_err();
        assert!(matches!(err, Error::InvalidSchema { .. }));
    }

    #[test]
    fn primary_key_must_reference_property() {
        let mut definition = mention_schema();
        definition["x-lix-primary-key"] = json!(["/missing"]);
        assert!(StoredSchema::from_value(definition).is_err());
    }

    #[test]
    fn reserved_keys_are_rejected() {
        for key in ["state", "state_all", "internal_change", "bad-key"] {
            let mut definition = mention_schema();
            definition["x-lix-key"] = json!(key);
            assert!(StoredSchema::from_value(definition).is_err(), "{key}");
        }
    }

    #[test]
    fn entity_view_suppression() {
        let mut definition = mention_schema();
        definition["x-lix-entity-views"] = json!(["state"]);
        let schema = StoredSchema::from_value(definition).unwrap();
        assert!(schema.entity_views.active);
        assert!(!schema.entity_views.all);
        assert!(!schema.entity_views.history);
    }

    #[test]
    fn composite_entity_ids() {
        let schema = StoredSchema::from_value(stored_schema_definition()).unwrap();
        let id = schema
            .entity_id_for(&json!({"key": "mention", "version": "1.0"}))
            .unwrap();
        assert_eq!(id, "mention~1.0");
        assert!(schema.entity_id_for(&json!({"key": "mention"})).is_err());
    }

    #[test]
    fn version_ordering_is_numeric() {
        assert_eq!(compare_schema_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_schema_versions("1.0", "1.0"), Ordering::Equal);
        assert_eq!(compare_schema_versions("1", "1.0"), Ordering::Less);
    }

    #[test]
    fn builtins_parse() {
        let keys: Vec<_> = builtin_schemas().into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec![STORED_SCHEMA_KEY, FILE_DESCRIPTOR_SCHEMA_KEY]);
    }
}

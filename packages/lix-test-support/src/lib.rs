//! Fixtures shared by the Lix conformance suites: a deterministic engine, sample
//! schemas and plugins, and cache inspection helpers.

use std::sync::Once;

use lix_core::{
    ApplyChanges, ChangeWithContent, DetectedChange, EntityKey, EntityWrite, FileContext,
    LixConfig, Plugin, PluginError, SchemaRef, StateWrite, VersionId, LIX_FILE_ID,
};
use lix_sqlite::Lix;
use serde_json::{json, Map, Value};

pub const TEXT_SCHEMA_KEY: &str = "text_entity";
pub const TEXT_SCHEMA_VERSION: &str = "1.0";
pub const JSON_PROPERTY_SCHEMA_KEY: &str = "json_property";
pub const JSON_PLUGIN_KEY: &str = "json_properties";
pub const DETECT_ONLY_PLUGIN_KEY: &str = "detect_only";

/// Install a `tracing` subscriber driven by `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// In-memory engine with sequential ids and a counter clock.
pub fn open_lix() -> Lix {
    init_tracing();
    Lix::open_in_memory(LixConfig::deterministic()).expect("open in-memory lix")
}

/// Same as [`open_lix`] with `text_entity` registered.
pub fn open_lix_with_text_schema() -> Lix {
    let mut lix = open_lix();
    lix.register_schema(text_schema())
        .expect("register text schema");
    lix
}

pub fn text_schema() -> Value {
    json!({
        "x-lix-key": TEXT_SCHEMA_KEY,
        "x-lix-version": TEXT_SCHEMA_VERSION,
        "x-lix-primary-key": ["/id"],
        "type": "object",
        "properties": {
            "id": { "type": "string" },
            "text": { "type": "string" }
        },
        "required": ["id", "text"]
    })
}

pub fn json_property_schema() -> Value {
    json!({
        "x-lix-key": JSON_PROPERTY_SCHEMA_KEY,
        "x-lix-version": "1.0",
        "x-lix-primary-key": ["/key"],
        "type": "object",
        "properties": {
            "key": { "type": "string" },
            "value": {}
        }
    })
}

pub fn text_key(id: &str) -> EntityKey {
    EntityKey::new(id, TEXT_SCHEMA_KEY, LIX_FILE_ID)
}

pub fn text_upsert(id: &str, text: &str) -> EntityWrite {
    EntityWrite::upsert(
        id,
        TEXT_SCHEMA_KEY,
        TEXT_SCHEMA_VERSION,
        json!({ "id": id, "text": text }),
    )
}

pub fn text_delete(id: &str) -> EntityWrite {
    EntityWrite::delete(id, TEXT_SCHEMA_KEY, TEXT_SCHEMA_VERSION)
}

/// Commit one tracked text write in its own transaction.
pub fn set_text(lix: &mut Lix, id: &str, text: &str, version: Option<&VersionId>) {
    let mut write = text_upsert(id, text);
    write.version_id = version.cloned();
    lix.write(StateWrite::Tracked(write)).expect("write text");
}

pub fn delete_text(lix: &mut Lix, id: &str, version: Option<&VersionId>) {
    let mut write = text_delete(id);
    write.version_id = version.cloned();
    lix.write(StateWrite::Tracked(write)).expect("delete text");
}

/// Visible `text` of an entity, `None` when it is absent.
pub fn read_text(lix: &Lix, id: &str, version: Option<&VersionId>) -> Option<String> {
    lix.get_state(&text_key(id), version)
        .expect("read state")
        .and_then(|row| row.snapshot_content)
        .and_then(|content| content.get("text").and_then(Value::as_str).map(String::from))
}

/// Cache rows rendered as JSON lines, for byte-level comparisons.
pub fn dump_cache(lix: &Lix) -> Vec<String> {
    lix.dump_state_cache()
        .expect("dump state cache")
        .iter()
        .map(|row| serde_json::to_string(row).expect("encode cache row"))
        .collect()
}

/// Row count of a table or view.
pub fn count(lix: &Lix, relation: &str) -> i64 {
    let rows = lix
        .query(&format!("SELECT COUNT(*) AS n FROM \"{relation}\""), [])
        .expect("count rows");
    rows.first()
        .and_then(|row| row.get("n"))
        .and_then(Value::as_i64)
        .unwrap_or_default()
}

fn parse_object(bytes: &[u8]) -> Result<Map<String, Value>, PluginError> {
    if bytes.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_slice(bytes)? {
        Value::Object(map) => Ok(map),
        other => Err(format!("expected a JSON object, found {other}").into()),
    }
}

/// Treats every top-level property of a `*.json` file as one `json_property` entity.
#[derive(Debug, Default)]
pub struct JsonPropertiesPlugin;

impl Plugin for JsonPropertiesPlugin {
    fn key(&self) -> &str {
        JSON_PLUGIN_KEY
    }

    fn detect_changes_glob(&self) -> Option<&str> {
        Some("*.json")
    }

    fn detect_changes(
        &self,
        _file: &FileContext<'_>,
        before: Option<&[u8]>,
        after: &[u8],
    ) -> Result<Vec<DetectedChange>, PluginError> {
        let before = before.map(parse_object).transpose()?.unwrap_or_default();
        let after = parse_object(after)?;
        let schema = SchemaRef {
            key: JSON_PROPERTY_SCHEMA_KEY.to_string(),
            version: "1.0".to_string(),
        };
        let mut changes = Vec::new();
        for (key, value) in &after {
            if before.get(key) != Some(value) {
                changes.push(DetectedChange {
                    entity_id: key.clone(),
                    schema: schema.clone(),
                    snapshot_content: Some(json!({ "key": key, "value": value })),
                });
            }
        }
        for key in before.keys().filter(|key| !after.contains_key(*key)) {
            changes.push(DetectedChange {
                entity_id: key.clone(),
                schema: schema.clone(),
                snapshot_content: None,
            });
        }
        Ok(changes)
    }

    fn applier(&self) -> Option<&dyn ApplyChanges> {
        Some(self)
    }
}

impl ApplyChanges for JsonPropertiesPlugin {
    fn apply_changes(
        &self,
        file: &FileContext<'_>,
        changes: &[ChangeWithContent],
    ) -> Result<Vec<u8>, PluginError> {
        let mut object = parse_object(file.data)?;
        for change in changes {
            match &change.content {
                Some(content) => {
                    let value = content.get("value").cloned().unwrap_or(Value::Null);
                    object.insert(change.change.entity_id.clone(), value);
                }
                None => {
                    object.remove(&change.change.entity_id);
                }
            }
        }
        Ok(serde_json::to_vec(&Value::Object(object))?)
    }
}

/// Detects one `text_document` entity per `*.txt` file and cannot apply changes.
#[derive(Debug, Default)]
pub struct DetectOnlyPlugin;

impl Plugin for DetectOnlyPlugin {
    fn key(&self) -> &str {
        DETECT_ONLY_PLUGIN_KEY
    }

    fn detect_changes_glob(&self) -> Option<&str> {
        Some("*.txt")
    }

    fn detect_changes(
        &self,
        _file: &FileContext<'_>,
        _before: Option<&[u8]>,
        after: &[u8],
    ) -> Result<Vec<DetectedChange>, PluginError> {
        Ok(vec![DetectedChange {
            entity_id: "content".to_string(),
            schema: SchemaRef {
                key: "text_document".to_string(),
                version: "1.0".to_string(),
            },
            snapshot_content: Some(json!({ "text": String::from_utf8_lossy(after) })),
        }])
    }
}

/// Plugin whose detection always fails, for error propagation tests.
#[derive(Debug, Default)]
pub struct FailingPlugin;

impl Plugin for FailingPlugin {
    fn key(&self) -> &str {
        "failing"
    }

    fn detect_changes_glob(&self) -> Option<&str> {
        Some("*.fail")
    }

    fn detect_changes(
        &self,
        _file: &FileContext<'_>,
        _before: Option<&[u8]>,
        _after: &[u8],
    ) -> Result<Vec<DetectedChange>, PluginError> {
        Err("detector exploded".into())
    }
}

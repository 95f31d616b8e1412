//! Plugin boundary: turning file bytes into entity changes and back.

use std::collections::BTreeMap;
use std::sync::Arc;

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::change::ChangeWithContent;
use crate::error::{Error, PluginError, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRef {
    pub key: String,
    pub version: String,
}

/// Entity-level difference reported by [`Plugin::detect_changes`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectedChange {
    pub entity_id: String,
    pub schema: SchemaRef,
    /// `None` marks the entity as deleted.
    pub snapshot_content: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileContext<'a> {
    pub id: &'a str,
    pub path: &'a str,
    pub data: &'a [u8],
}

pub trait Plugin: Send + Sync {
    fn key(&self) -> &str;

    /// Files this plugin detects changes for. `None` means the plugin is apply-only.
    fn detect_changes_glob(&self) -> Option<&str>;

    fn detect_changes(
        &self,
        file: &FileContext<'_>,
        before: Option<&[u8]>,
        after: &[u8],
    ) -> std::result::Result<Vec<DetectedChange>, PluginError>;

    /// Present when the plugin can reconstruct file bytes from changes.
    fn applier(&self) -> Option<&dyn ApplyChanges> {
        None
    }
}

pub trait ApplyChanges {
    /// Produce the new file bytes from the file's current bytes and the leaf changes
    /// owned by this plugin.
    fn apply_changes(
        &self,
        file: &FileContext<'_>,
        changes: &[ChangeWithContent],
    ) -> std::result::Result<Vec<u8>, PluginError>;
}

struct RegisteredPlugin {
    plugin: Arc<dyn Plugin>,
    matcher: Option<GlobMatcher>,
}

/// Plugins keyed by plugin key, iterated in key order.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, RegisteredPlugin>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let key = plugin.key().to_string();
        if self.plugins.contains_key(&key) {
            return Err(Error::InvalidOperation(format!(
                "plugin '{key}' is already registered"
            )));
        }
        let matcher = match plugin.detect_changes_glob() {
            Some(pattern) => Some(
                Glob::new(pattern)
                    .map_err(|e| {
                        Error::InvalidOperation(format!("plugin '{key}' has invalid glob: {e}"))
                    })?
                    .compile_matcher(),
            ),
            None => None,
        };
        self.plugins.insert(key, RegisteredPlugin { plugin, matcher });
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Arc<dyn Plugin>> {
        self.plugins
            .get(key)
            .map(|entry| Arc::clone(&entry.plugin))
            .ok_or_else(|| Error::PluginNotFound(key.to_string()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Plugins whose detect glob matches `path`, in key order.
    pub fn matching(&self, path: &str) -> Vec<Arc<dyn Plugin>> {
        let trimmed = path.trim_start_matches('/');
        self.plugins
            .values()
            .filter(|entry| {
                entry
                    .matcher
                    .as_ref()
                    .is_some_and(|m| m.is_match(path) || m.is_match(trimmed))
            })
            .map(|entry| Arc::clone(&entry.plugin))
            .collect()
    }

    pub fn detect(
        &self,
        plugin: &dyn Plugin,
        file: &FileContext<'_>,
        before: Option<&[u8]>,
        after: &[u8],
    ) -> Result<Vec<DetectedChange>> {
        plugin
            .detect_changes(file, before, after)
            .map_err(|source| Error::Plugin {
                plugin_key: plugin.key().to_string(),
                source,
            })
    }

    /// Run the applier of `plugin_key`, mapping missing plugins and capabilities to errors.
    pub fn apply(
        &self,
        plugin_key: &str,
        file: &FileContext<'_>,
        changes: &[ChangeWithContent],
    ) -> Result<Vec<u8>> {
        let plugin = self.get(plugin_key)?;
        let applier = plugin
            .applier()
            .ok_or_else(|| Error::PluginDoesNotSupportApply(plugin_key.to_string()))?;
        applier
            .apply_changes(file, changes)
            .map_err(|source| Error::Plugin {
                plugin_key: plugin_key.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper {
        key: &'static str,
        glob: Option<&'static str>,
    }

    impl Plugin for Upper {
        fn key(&self) -> &str {
            self.key
        }

        fn detect_changes_glob(&self) -> Option<&str> {
            self.glob
        }

        fn detect_changes(
            &self,
            _file: &FileContext<'_>,
            _before: Option<&[u8]>,
            _after: &[u8],
        ) -> std::result::Result<Vec<DetectedChange>, PluginError> {
            Err("detect failed".into())
        }
    }

    fn file() -> FileContext<'static> {
        FileContext {
            id: "f",
            path: "/doc.md",
            data: b"",
        }
    }

    #[test]
    fn lookups_and_matching() {
        let mut registry = PluginRegistry::new();
        registry
            .register(Arc::new(Upper { key: "md", glob: Some("*.md") }))
            .unwrap();
        registry
            .register(Arc::new(Upper { key: "apply_only", glob: None }))
            .unwrap();

        assert!(registry
            .register(Arc::new(Upper { key: "md", glob: None }))
            .is_err());
        assert_eq!(registry.matching("/doc.md").len(), 1);
        assert!(registry.matching("/doc.json").is_empty());
        assert!(matches!(
            registry.get("missing"),
            Err(Error::PluginNotFound(key)) if key == "missing"
        ));
    }

    #[test]
    fn apply_maps_missing_capabilities() {
        let mut registry = PluginRegistry::new();
        registry
            .register(Arc::new(Upper { key: "md", glob: Some("*.md") }))
            .unwrap();
        assert!(matches!(
            registry.apply("md", &file(), &[]),
            Err(Error::PluginDoesNotSupportApply(_))
        ));
        assert!(matches!(
            registry.apply("nope", &file(), &[]),
            Err(Error::PluginNotFound(_))
        ));
        let plugin = registry.get("md").unwrap();
        assert!(matches!(
            registry.detect(plugin.as_ref(), &file(), None, b""),
            Err(Error::Plugin { plugin_key, .. }) if plugin_key == "md"
        ));
    }
}

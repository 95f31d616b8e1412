use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::inheritance::DEFAULT_MAX_INHERITANCE_DEPTH;

/// Engine options. Every field has a default, so partial documents parse.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LixConfig {
    /// Sequential ids and a counter clock, for reproducible databases and tests.
    pub deterministic: bool,
    /// Name of the version created (and activated) when a database is bootstrapped.
    pub initial_version_name: String,
    pub max_inheritance_depth: usize,
    /// Depth bound applied by ancestor walks when the caller passes none.
    pub history_max_depth: Option<usize>,
    /// Use write-ahead logging for file databases.
    pub wal: bool,
    /// Rebuild the state cache from the change log every time the database is opened.
    pub rebuild_on_open: bool,
}

impl Default for LixConfig {
    fn default() -> Self {
        Self {
            deterministic: false,
            initial_version_name: "main".to_string(),
            max_inheritance_depth: DEFAULT_MAX_INHERITANCE_DEPTH,
            history_max_depth: None,
            wal: true,
            rebuild_on_open: false,
        }
    }
}

impl LixConfig {
    pub fn from_json_str(document: &str) -> Result<Self> {
        Ok(serde_json::from_str(document)?)
    }

    pub fn deterministic() -> Self {
        Self {
            deterministic: true,
            ..Self::default()
        }
    }
}

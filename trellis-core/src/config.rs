//! Session configuration.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How a [`Session`](crate::session::Session) drives its tracer.
///
/// Every field is optional in JSON; missing fields take their defaults.
///
/// ```json
/// {
///   "entries": ["src/main.js"],
///   "prune_disconnected_on_complete": true,
///   "retry_failed_on_change": true,
///   "dependencies_job": "dependencies"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TracerConfig {
    /// Names traced by `Session::start`, each marked as an entry node.
    pub entries: Vec<String>,

    /// Sweep nodes unreachable from the entries after every completed run.
    ///
    /// The sweep is skipped while the graph has no entry nodes, so nodes
    /// traced by hand before any entry is set survive.
    pub prune_disconnected_on_complete: bool,

    /// Re-trace a node whose last lookup failed when its file changes.
    pub retry_failed_on_change: bool,

    /// Store job whose value yields a node's dependencies.
    pub dependencies_job: String,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            prune_disconnected_on_complete: true,
            retry_failed_on_change: true,
            dependencies_job: "dependencies".to_owned(),
        }
    }
}

impl TracerConfig {
    pub fn with_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Parse and validate a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dependencies_job.trim().is_empty() {
            return Err(ConfigError::Invalid("dependencies_job is empty".into()));
        }

        let mut seen = HashSet::new();
        for entry in &self.entries {
            if entry.trim().is_empty() {
                return Err(ConfigError::Invalid("entry names must not be empty".into()));
            }
            if !seen.insert(entry.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate entry '{entry}'")));
            }
        }

        Ok(())
    }
}

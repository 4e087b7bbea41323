//! Error types.
//!
//! Structural misuse of the graph model surfaces as [`GraphError`] and fails
//! the call immediately. Failures that happen while work is in flight
//! ([`DiscoveryError`], [`StoreError`]) are cloneable values so that one
//! failure can be reported to every caller and listener that observed it.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Misuse of the node/edge model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("node '{0}' already exists")]
    NodeAlreadyExists(String),

    #[error("node '{0}' not found")]
    NodeNotFound(String),

    #[error("node '{0}' cannot depend on itself")]
    SelfEdge(String),
}

/// Failure to parse arrow notation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotationError {
    #[error("line {line}: empty node name")]
    EmptyName { line: usize },

    #[error("line {line}: {source}")]
    Graph {
        line: usize,
        #[source]
        source: GraphError,
    },
}

/// A dependency lookup failed for `node`.
///
/// The node stays untraced; tracing it again retries the lookup.
#[derive(Debug, Clone, Error)]
#[error("failed to trace '{node}': {error}")]
pub struct DiscoveryError {
    pub node: String,
    pub error: Arc<anyhow::Error>,
}

impl DiscoveryError {
    pub fn new(node: impl Into<String>, error: anyhow::Error) -> Self {
        Self {
            node: node.into(),
            error: Arc::new(error),
        }
    }

    /// Whether the lookup lost a race against a record removal or
    /// recreation, in which case the failure is moot.
    pub fn is_intercept(&self) -> bool {
        self.error
            .chain()
            .filter_map(|cause| cause.downcast_ref::<StoreError>())
            .any(StoreError::is_intercept)
    }
}

/// A job result that must be discarded because its record changed while the
/// job was running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Intercept {
    #[error("record '{name}' was removed while a job was running")]
    RecordRemoved { name: String },

    #[error("record '{name}' was recreated while a job was running")]
    RecordInvalidated { name: String },
}

/// Failures of the record store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("no record named '{0}'")]
    UnknownRecord(String),

    #[error("record '{0}' already exists")]
    RecordAlreadyExists(String),

    #[error("no job named '{0}' is registered")]
    UnknownJob(String),

    #[error(transparent)]
    Intercept(#[from] Intercept),

    #[error("job '{job}' for '{name}' completed without a value")]
    JobContractViolation { job: String, name: String },

    #[error("job '{job}' failed for '{name}': {error}")]
    Job {
        job: String,
        name: String,
        error: Arc<anyhow::Error>,
    },
}

impl StoreError {
    /// Whether the failure is a race outcome rather than a real error.
    pub fn is_intercept(&self) -> bool {
        matches!(self, StoreError::Intercept(_))
    }

    pub fn intercept(&self) -> Option<&Intercept> {
        match self {
            StoreError::Intercept(intercept) => Some(intercept),
            _ => None,
        }
    }
}

/// Failures while loading a [`TracerConfig`](crate::config::TracerConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("couldn't read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("couldn't parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// The tracer cannot be bound to the calling runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TracerError {
    #[error("no Tokio runtime is running on this thread")]
    NoRuntime,

    #[error("the tracer needs a current-thread runtime, found {0}")]
    UnsupportedRuntime(String),
}

/// Top-level error for the session driver.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tracer(#[from] TracerError),
}

//! Records and generations.
//!
//! A record holds the memoized job outputs of one name. Recreating a record
//! gives it a fresh [`Generation`], which is how in-flight jobs find out that
//! the record they were computing for is gone.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::{BoxFuture, Shared};

use crate::error::StoreError;

/// Counter for generating unique generations.
static GENERATION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity of one incarnation of a record.
///
/// Only meaningful for equality; the number itself carries no order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Generation(u64);

impl Generation {
    pub(crate) fn next() -> Self {
        Self(GENERATION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}

/// What a job is told about the record it runs for, captured at call time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    pub name: String,

    /// File extension of `name` including the leading dot, or `""`.
    pub extension: String,

    pub generation: Generation,
}

impl RecordRef {
    pub(crate) fn new(name: &str, generation: Generation) -> Self {
        Self {
            name: name.to_owned(),
            extension: extension_of(name),
            generation,
        }
    }
}

fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

pub(crate) type JobFuture<V> = Shared<BoxFuture<'static, Result<V, StoreError>>>;

pub(crate) struct Record<V> {
    pub generation: Generation,

    /// Committed job values, by job name.
    pub data: HashMap<String, V>,

    /// Job futures for this generation, settled or not.
    pub jobs: HashMap<String, JobFuture<V>>,
}

impl<V> Record<V> {
    pub fn new() -> Self {
        Self {
            generation: Generation::next(),
            data: HashMap::new(),
            jobs: HashMap::new(),
        }
    }
}

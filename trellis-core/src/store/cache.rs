//! Cache backends for job implementations.
//!
//! The record store never consults a cache itself. Jobs that want to survive
//! record recreation (a file touched but not changed, say) can share one.

use dashmap::DashMap;
use futures_util::future::{self, BoxFuture, FutureExt};

/// Async key/value cache.
pub trait Cache<V>: Send + Sync {
    fn get(&self, key: &str) -> BoxFuture<'_, anyhow::Result<Option<V>>>;

    fn set(&self, key: &str, value: V) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// In-process [`Cache`] over a concurrent map.
#[derive(Debug)]
pub struct MemoryCache<V> {
    entries: DashMap<String, V>,
}

impl<V> Default for MemoryCache<V> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<V> MemoryCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }
}

impl<V> Cache<V> for MemoryCache<V>
where
    V: Clone + Send + Sync,
{
    fn get(&self, key: &str) -> BoxFuture<'_, anyhow::Result<Option<V>>> {
        let value = self.entries.get(key).map(|entry| entry.value().clone());
        future::ready(Ok(value)).boxed()
    }

    fn set(&self, key: &str, value: V) -> BoxFuture<'_, anyhow::Result<()>> {
        self.entries.insert(key.to_owned(), value);
        future::ready(Ok(())).boxed()
    }
}

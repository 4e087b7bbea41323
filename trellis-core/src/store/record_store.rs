use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::record::{Generation, JobFuture, Record, RecordRef};
use crate::error::{Intercept, StoreError};

/// A named computation over one record.
///
/// Resolving to `Ok(None)` breaks the job contract and is reported as
/// [`StoreError::JobContractViolation`].
///
/// Implemented for any `Fn(RecordRef, RecordStore<V>) -> impl Future<Output = anyhow::Result<Option<V>>>`.
pub trait Job<V>: Send + Sync + 'static {
    fn run(&self, record: RecordRef, store: RecordStore<V>) -> BoxFuture<'static, anyhow::Result<Option<V>>>;
}

impl<V, F, Fut> Job<V> for F
where
    F: Fn(RecordRef, RecordStore<V>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<V>>> + Send + 'static,
{
    fn run(&self, record: RecordRef, store: RecordStore<V>) -> BoxFuture<'static, anyhow::Result<Option<V>>> {
        self(record, store).boxed()
    }
}

struct StoreInner<V> {
    jobs: IndexMap<String, Arc<dyn Job<V>>>,
    records: Mutex<HashMap<String, Record<V>>>,
}

/// Registers the jobs of a [`RecordStore`].
pub struct RecordStoreBuilder<V> {
    jobs: IndexMap<String, Arc<dyn Job<V>>>,
}

impl<V> RecordStoreBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Register `job` under `name`, replacing any earlier registration.
    pub fn job(mut self, name: impl Into<String>, job: impl Job<V>) -> Self {
        self.jobs.insert(name.into(), Arc::new(job));
        self
    }

    pub fn build(self) -> RecordStore<V> {
        RecordStore {
            inner: Arc::new(StoreInner {
                jobs: self.jobs,
                records: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Per-name records with memoized, generation-checked jobs.
///
/// A job runs at most once per record generation. Concurrent callers share
/// the same future, and its value is committed only if the record still has
/// the generation the job was started for.
pub struct RecordStore<V> {
    inner: Arc<StoreInner<V>>,
}

impl<V> Clone for RecordStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> RecordStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn builder() -> RecordStoreBuilder<V> {
        RecordStoreBuilder {
            jobs: IndexMap::new(),
        }
    }

    /// Create an empty record with a fresh generation.
    pub fn create(&self, name: &str) -> Result<Generation, StoreError> {
        let mut records = self.inner.records.lock();
        if records.contains_key(name) {
            return Err(StoreError::RecordAlreadyExists(name.to_owned()));
        }
        let record = Record::new();
        let generation = record.generation;
        records.insert(name.to_owned(), record);
        debug!(record = %name, %generation, "created record");
        Ok(generation)
    }

    /// Return the current generation of `name`, creating the record if needed.
    pub fn ensure(&self, name: &str) -> Generation {
        self.inner
            .records
            .lock()
            .entry(name.to_owned())
            .or_insert_with(Record::new)
            .generation
    }

    /// Delete the record. Outstanding jobs for it resolve to
    /// [`Intercept::RecordRemoved`].
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.inner.records.lock().remove(name).is_some();
        if removed {
            debug!(record = %name, "removed record");
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.records.lock().contains_key(name)
    }

    pub fn generation(&self, name: &str) -> Option<Generation> {
        self.inner.records.lock().get(name).map(|record| record.generation)
    }

    /// The committed value of `job` for `name`, if any.
    pub fn data(&self, job: &str, name: &str) -> Option<V> {
        self.inner
            .records
            .lock()
            .get(name)
            .and_then(|record| record.data.get(job).cloned())
    }

    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.inner.jobs.keys().map(String::as_str)
    }

    /// Run `job` for the current record of `name`, or join the run already
    /// started for this generation.
    ///
    /// Registration happens now; the job body only runs once the returned
    /// future is polled.
    pub fn call(&self, job: &str, name: &str) -> BoxFuture<'static, Result<V, StoreError>> {
        match self.dispatch(job, name) {
            Ok(shared) => shared.boxed(),
            Err(err) => future::ready(Err(err)).boxed(),
        }
    }

    fn dispatch(&self, job_name: &str, name: &str) -> Result<JobFuture<V>, StoreError> {
        let job = self
            .inner
            .jobs
            .get(job_name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownJob(job_name.to_owned()))?;

        let mut records = self.inner.records.lock();
        let record = records
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownRecord(name.to_owned()))?;

        if let Some(existing) = record.jobs.get(job_name) {
            debug!(job = %job_name, record = %name, "joined existing job");
            return Ok(existing.clone());
        }

        let record_ref = RecordRef::new(name, record.generation);
        let store = self.clone();
        let job_key = job_name.to_owned();
        let shared = async move {
            let outcome = job.run(record_ref.clone(), store.clone()).await;
            store.commit(&job_key, &record_ref, outcome)
        }
        .boxed()
        .shared();

        record.jobs.insert(job_name.to_owned(), shared.clone());
        debug!(job = %job_name, record = %name, "started job");
        Ok(shared)
    }

    fn commit(
        &self,
        job: &str,
        record_ref: &RecordRef,
        outcome: anyhow::Result<Option<V>>,
    ) -> Result<V, StoreError> {
        let mut records = self.inner.records.lock();
        let name = &record_ref.name;

        let record = match records.get_mut(name) {
            None => {
                debug!(job = %job, record = %name, "discarded result for removed record");
                return Err(Intercept::RecordRemoved { name: name.clone() }.into());
            }
            Some(record) if record.generation != record_ref.generation => {
                debug!(job = %job, record = %name, "discarded result for stale generation");
                return Err(Intercept::RecordInvalidated { name: name.clone() }.into());
            }
            Some(record) => record,
        };

        match outcome {
            Ok(Some(value)) => {
                record.data.insert(job.to_owned(), value.clone());
                Ok(value)
            }
            Ok(None) => {
                warn!(job = %job, record = %name, "job completed without a value");
                Err(StoreError::JobContractViolation {
                    job: job.to_owned(),
                    name: name.clone(),
                })
            }
            // Failures of nested store calls keep their kind.
            Err(error) => match error.downcast::<StoreError>() {
                Ok(store_error) => Err(store_error),
                Err(error) => Err(StoreError::Job {
                    job: job.to_owned(),
                    name: name.clone(),
                    error: Arc::new(error),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Notify;

    use crate::store::{Cache, MemoryCache};

    fn counting_store(calls: Arc<AtomicUsize>) -> RecordStore<String> {
        RecordStore::builder()
            .job("read", move |record: RecordRef, _store: RecordStore<String>| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, anyhow::Error>(Some(format!("contents of {}", record.name))) }
            })
            .build()
    }

    #[tokio::test]
    async fn concurrent_calls_share_one_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = counting_store(calls.clone());
        store.create("a.txt").unwrap();

        let (first, second) = tokio::join!(store.call("read", "a.txt"), store.call("read", "a.txt"));

        assert_eq!(first.unwrap(), "contents of a.txt");
        assert_eq!(second.unwrap(), "contents of a.txt");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.data("read", "a.txt").as_deref(), Some("contents of a.txt"));
    }

    #[tokio::test]
    async fn results_are_memoized_per_generation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = counting_store(calls.clone());
        store.create("a").unwrap();

        store.call("read", "a").await.unwrap();
        store.call("read", "a").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        store.remove("a");
        store.create("a").unwrap();
        assert_eq!(store.data("read", "a"), None);

        store.call("read", "a").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_record_and_job() {
        let store = counting_store(Arc::new(AtomicUsize::new(0)));

        assert!(matches!(
            store.call("read", "missing").await,
            Err(StoreError::UnknownRecord(name)) if name == "missing"
        ));

        store.create("a").unwrap();
        assert!(matches!(
            store.call("write", "a").await,
            Err(StoreError::UnknownJob(job)) if job == "write"
        ));
    }

    #[test]
    fn create_rejects_existing_records() {
        let store = counting_store(Arc::new(AtomicUsize::new(0)));

        let generation = store.create("a").unwrap();
        assert!(matches!(
            store.create("a"),
            Err(StoreError::RecordAlreadyExists(_))
        ));
        assert_eq!(store.ensure("a"), generation);
        assert_eq!(store.generation("a"), Some(generation));
        assert!(store.contains("a"));
        assert_eq!(store.job_names().collect::<Vec<_>>(), vec!["read"]);
    }

    fn gated_store(gate: Arc<Notify>) -> RecordStore<u32> {
        RecordStore::builder()
            .job("slow", move |_record: RecordRef, _store: RecordStore<u32>| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok::<_, anyhow::Error>(Some(7))
                }
            })
            .build()
    }

    #[tokio::test]
    async fn removal_during_a_job_discards_the_result() {
        let gate = Arc::new(Notify::new());
        let store = gated_store(gate.clone());
        store.create("a").unwrap();

        let pending = tokio::spawn(store.call("slow", "a"));
        tokio::task::yield_now().await;

        store.remove("a");
        gate.notify_one();

        let result = pending.await.unwrap();
        assert!(matches!(
            result,
            Err(StoreError::Intercept(Intercept::RecordRemoved { .. }))
        ));
        assert!(!store.contains("a"));
    }

    #[tokio::test]
    async fn recreation_during_a_job_leaves_the_new_record_untouched() {
        let gate = Arc::new(Notify::new());
        let store = gated_store(gate.clone());
        store.create("a").unwrap();

        let pending = tokio::spawn(store.call("slow", "a"));
        tokio::task::yield_now().await;

        store.remove("a");
        store.create("a").unwrap();
        gate.notify_one();

        let result = pending.await.unwrap();
        let err = result.unwrap_err();
        assert!(err.is_intercept());
        assert_eq!(
            err.intercept(),
            Some(&Intercept::RecordInvalidated { name: "a".into() })
        );
        assert_eq!(store.data("slow", "a"), None);
    }

    #[tokio::test]
    async fn absent_values_violate_the_contract() {
        let store: RecordStore<u32> = RecordStore::builder()
            .job("nothing", |_record: RecordRef, _store: RecordStore<u32>| async {
                Ok::<Option<u32>, anyhow::Error>(None)
            })
            .build();
        store.create("a").unwrap();

        let err = store.call("nothing", "a").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::JobContractViolation { ref job, ref name } if job == "nothing" && name == "a"
        ));
        assert!(!err.is_intercept());
    }

    #[tokio::test]
    async fn job_failures_reach_every_caller() {
        let store: RecordStore<u32> = RecordStore::builder()
            .job("parse", |record: RecordRef, _store: RecordStore<u32>| async move {
                Err::<Option<u32>, _>(anyhow::anyhow!("unexpected token in {}", record.name))
            })
            .build();
        store.create("a").unwrap();

        let (first, second) = tokio::join!(store.call("parse", "a"), store.call("parse", "a"));
        for result in [first, second] {
            match result {
                Err(StoreError::Job { job, error, .. }) => {
                    assert_eq!(job, "parse");
                    assert_eq!(error.to_string(), "unexpected token in a");
                }
                other => panic!("expected job failure, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn jobs_can_call_other_jobs() {
        let store: RecordStore<String> = RecordStore::builder()
            .job("read", |record: RecordRef, _store: RecordStore<String>| async move {
                Ok::<_, anyhow::Error>(Some(format!("source{}", record.extension)))
            })
            .job("parse", |record: RecordRef, store: RecordStore<String>| async move {
                let source = store.call("read", &record.name).await?;
                anyhow::Ok(Some(source.to_uppercase()))
            })
            .build();
        store.create("lib.rs").unwrap();

        assert_eq!(store.call("parse", "lib.rs").await.unwrap(), "SOURCE.RS");
        assert_eq!(store.data("read", "lib.rs").as_deref(), Some("source.rs"));
    }

    #[tokio::test]
    async fn nested_intercepts_keep_their_kind() {
        let store: RecordStore<String> = RecordStore::builder()
            .job("parse", |_record: RecordRef, store: RecordStore<String>| async move {
                let other = store.call("parse", "gone").await?;
                anyhow::Ok(Some(other))
            })
            .build();
        store.create("a").unwrap();

        let err = store.call("parse", "a").await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownRecord(name) if name == "gone"));
    }

    #[tokio::test]
    async fn jobs_can_share_a_cache() {
        let cache = Arc::new(MemoryCache::<String>::new());
        let job_cache = cache.clone();
        let store: RecordStore<String> = RecordStore::builder()
            .job("hash", move |record: RecordRef, _store: RecordStore<String>| {
                let cache = job_cache.clone();
                async move {
                    let cached: Option<String> = cache.get(&record.name).await?;
                    let value = match cached {
                        Some(hit) => hit,
                        None => {
                            let value = format!("hash:{}", record.name);
                            cache.set(&record.name, value.clone()).await?;
                            value
                        }
                    };
                    anyhow::Ok(Some(value))
                }
            })
            .build();

        store.create("a").unwrap();
        store.call("hash", "a").await.unwrap();
        store.remove("a");
        store.create("a").unwrap();

        assert_eq!(store.call("hash", "a").await.unwrap(), "hash:a");
        assert_eq!(cache.len(), 1);
    }
}

//! Session Driver
//!
//! A session ties a [`GraphTracer`] to a [`RecordStore`]. The tracer's
//! dependency lookup is a store job (by default `"dependencies"`), whose value
//! a caller-supplied projection turns into dependency names. The session then
//! keeps the two in step:
//!
//! - Records are created on demand for every name the tracer asks about.
//! - Nodes pruned from the graph lose their records.
//! - A changed file gets a new record generation and is re-traced, so stale
//!   jobs for it resolve to intercepts instead of committing.
//! - After each completed run the graph is swept for nodes no entry reaches.
//!   A graph without entries is never swept.
//!
//! Like the tracer, a session must be created on a current-thread runtime.

use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::TracerConfig;
use crate::error::{Error, StoreError};
use crate::graph::{Diff, GraphTracer, TraceEvent};
use crate::store::RecordStore;

/// A dependency graph kept current against a record store.
pub struct Session<V> {
    config: TracerConfig,
    store: RecordStore<V>,
    tracer: GraphTracer,

    /// Nodes whose last lookup failed for a reason other than an intercept.
    failed: Arc<Mutex<IndexSet<String>>>,
}

impl<V> Session<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a session over `store`.
    ///
    /// `project` turns the value of the dependencies job into names.
    pub fn new<P>(config: TracerConfig, store: RecordStore<V>, project: P) -> Result<Self, Error>
    where
        P: Fn(&V) -> anyhow::Result<Vec<String>> + Send + Sync + 'static,
    {
        config.validate()?;

        let job = config.dependencies_job.clone();
        if !store.job_names().any(|name| name == job) {
            return Err(StoreError::UnknownJob(job).into());
        }

        let source_store = store.clone();
        let project = Arc::new(project);
        let tracer = GraphTracer::new(move |name: String| {
            let store = source_store.clone();
            let project = Arc::clone(&project);
            let job = job.clone();
            async move {
                store.ensure(&name);
                let value = store.call(&job, &name).await?;
                (*project)(&value)
            }
        })?;

        let session = Self {
            config,
            store,
            tracer,
            failed: Arc::new(Mutex::new(IndexSet::new())),
        };
        session.listen();
        Ok(session)
    }

    fn listen(&self) {
        let weak = self.tracer.downgrade();
        let store = self.store.clone();
        let failed = Arc::clone(&self.failed);
        let sweep = self.config.prune_disconnected_on_complete;

        self.tracer.on(move |event| match event {
            TraceEvent::Traced { node, diff } => {
                failed.lock().shift_remove(node);
                forget(&store, &failed, &diff.pruned_nodes());
            }
            TraceEvent::NodeError { node, error } => {
                if error.is_intercept() {
                    debug!(node = %node, "lookup raced a record change");
                } else {
                    failed.lock().insert(node.clone());
                }
            }
            TraceEvent::Pruned { pruned, .. } => forget(&store, &failed, pruned),
            TraceEvent::Complete { .. } if sweep => {
                let Some(tracer) = weak.upgrade() else {
                    return;
                };
                if tracer.state().entry_nodes().next().is_none() {
                    debug!("no entry nodes, skipping disconnected-node sweep");
                    return;
                }
                if let Err(err) = tracer.prune_disconnected_nodes() {
                    warn!(error = %err, "disconnected-node sweep failed");
                }
            }
            _ => {}
        });
    }

    /// Mark every configured entry and start tracing from it.
    pub fn start(&self) -> Result<(), Error> {
        for entry in &self.config.entries {
            self.store.ensure(entry);
            self.tracer.set_node_as_entry(entry)?;
        }
        for entry in &self.config.entries {
            self.tracer.trace_from_node(entry);
        }
        info!(entries = self.config.entries.len(), "session started");
        Ok(())
    }

    /// React to `name` changing on disk.
    ///
    /// Returns whether the node was re-traced. Names without a record are
    /// ignored.
    pub fn file_changed(&self, name: &str) -> bool {
        if !self.store.remove(name) {
            return false;
        }
        self.store.ensure(name);

        if self.failed.lock().contains(name) && !self.config.retry_failed_on_change {
            debug!(node = %name, "not retrying failed node");
            return false;
        }
        if !self.tracer.state().contains(name) && !self.tracer.is_pending(name) {
            return false;
        }

        debug!(node = %name, "re-tracing changed file");
        self.tracer.trace_from_node(name);
        true
    }

    /// React to `name` being deleted: drop its record and prune the node.
    pub fn file_removed(&self, name: &str) -> Result<Diff, Error> {
        self.store.remove(name);
        self.failed.lock().shift_remove(name);
        Ok(self.tracer.prune_from_node(name)?)
    }

    /// Nodes whose most recent lookup failed.
    pub fn failed_nodes(&self) -> Vec<String> {
        self.failed.lock().iter().cloned().collect()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TraceEvent> {
        self.tracer.subscribe()
    }

    pub fn tracer(&self) -> &GraphTracer {
        &self.tracer
    }

    pub fn store(&self) -> &RecordStore<V> {
        &self.store
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }
}

fn forget<V>(store: &RecordStore<V>, failed: &Mutex<IndexSet<String>>, names: &[String])
where
    V: Clone + Send + Sync + 'static,
{
    if names.is_empty() {
        return;
    }
    let mut failed = failed.lock();
    for name in names {
        store.remove(name);
        failed.shift_remove(name);
    }
    debug!(pruned = names.len(), "dropped records of pruned nodes");
}

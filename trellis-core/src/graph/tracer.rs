//! Graph Tracer
//!
//! The tracer discovers the dependency graph asynchronously, starting from
//! whatever nodes it is asked to trace, and keeps it current as nodes are
//! re-traced or pruned.
//!
//! # Node lifecycle
//!
//! A node is *unknown* until something traces it. While a valid pending job
//! exists for it, it is *tracing*. Once its dependencies are applied it is
//! *known* (a later re-trace keeps it known while the new job runs). Pruning
//! removes it.
//!
//! # Pending jobs
//!
//! Every call to [`GraphTracer::trace_from_node`] creates a pending job and
//! invalidates any earlier job for the same node. Invalidation is
//! cooperative: an in-flight lookup is never aborted, but its result is
//! dropped when it comes back. The lookup itself starts one scheduler tick
//! after the call, so a second call from the same tick supersedes the first
//! before it does any I/O.
//!
//! # Completion
//!
//! Every job resolution asks for a completion check. Requests are coalesced
//! into one deferred check, which emits [`TraceEvent::Complete`] only when no
//! valid pending job remains and no resolution is still notifying listeners.
//! A listener that reacts to `Traced` by tracing more nodes therefore always
//! gets its work in before the run is declared complete.

use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::{BoxFuture, FutureExt};
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::diff::Diff;
use super::events::{Emitter, ListenerId, TraceEvent};
use super::state::GraphState;
use crate::error::{DiscoveryError, GraphError, TracerError};

/// Looks up the outgoing dependencies of a node.
///
/// Implemented for any `Fn(String) -> impl Future<Output = anyhow::Result<Vec<String>>>`.
pub trait DependencySource: Send + Sync + 'static {
    fn dependencies(&self, name: &str) -> BoxFuture<'static, anyhow::Result<Vec<String>>>;
}

impl<F, Fut> DependencySource for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<String>>> + Send + 'static,
{
    fn dependencies(&self, name: &str) -> BoxFuture<'static, anyhow::Result<Vec<String>>> {
        self(name.to_owned()).boxed()
    }
}

/// In-flight dependency discovery for one node.
struct PendingJob {
    node: String,
    valid: AtomicBool,
}

impl PendingJob {
    fn new(node: &str) -> Arc<Self> {
        Arc::new(Self {
            node: node.to_owned(),
            valid: AtomicBool::new(true),
        })
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct TracerState {
    /// The current snapshot.
    graph: GraphState,

    /// Snapshot at the previous `Complete`.
    run_start: GraphState,

    /// Jobs that have not resolved yet, valid or not, by node.
    pending: IndexMap<String, Vec<Arc<PendingJob>>>,

    /// Number of jobs in `pending` that are still valid.
    valid_jobs: usize,

    /// Discovery failures of the current run, by node.
    errors: IndexMap<String, DiscoveryError>,

    /// Resolutions that have updated the graph but are still emitting.
    settling: usize,

    /// Whether `Started` has fired without a matching `Complete`.
    running: bool,

    completion_scheduled: bool,
}

impl TracerState {
    fn has_valid_pending(&self) -> bool {
        self.valid_jobs > 0
    }

    fn is_pending(&self, name: &str) -> bool {
        self.pending
            .get(name)
            .is_some_and(|jobs| jobs.iter().any(|job| job.is_valid()))
    }

    /// Invalidate every valid job for `name`. Returns whether any existed.
    ///
    /// Jobs are only ever invalidated here, under the state lock, which keeps
    /// `valid_jobs` exact.
    fn invalidate(&mut self, name: &str) -> bool {
        let Some(jobs) = self.pending.get(name) else {
            return false;
        };
        let mut invalidated = 0;
        for job in jobs.iter().filter(|job| job.is_valid()) {
            job.invalidate();
            invalidated += 1;
        }
        self.valid_jobs -= invalidated;
        invalidated > 0
    }

    fn enqueue(&mut self, name: &str) -> Arc<PendingJob> {
        if self.invalidate(name) {
            debug!(node = %name, "superseded pending job");
        }
        let job = PendingJob::new(name);
        self.pending
            .entry(name.to_owned())
            .or_default()
            .push(Arc::clone(&job));
        self.valid_jobs += 1;
        debug!(node = %name, pending = self.valid_jobs, "enqueued job");
        job
    }

    fn settle(&mut self, job: &Arc<PendingJob>) {
        let Some(jobs) = self.pending.get_mut(&job.node) else {
            return;
        };
        let before = jobs.len();
        jobs.retain(|pending| !Arc::ptr_eq(pending, job));
        let removed = jobs.len() != before;
        if jobs.is_empty() {
            self.pending.swap_remove(&job.node);
        }
        if removed && job.is_valid() {
            self.valid_jobs -= 1;
        }
    }

    /// Returns `true` when the caller must spawn the check.
    fn request_completion(&mut self) -> bool {
        !mem::replace(&mut self.completion_scheduled, true)
    }

    /// Apply a successful lookup to the graph.
    ///
    /// Returns the diff and the names that still need tracing.
    fn apply_dependencies(&mut self, node: &str, dependencies: Vec<String>) -> (Diff, Vec<String>) {
        let before = self.graph.clone();
        let mut next = self.graph.clone();
        next.ensure_node(node);

        let mut wanted: IndexSet<String> = IndexSet::new();
        for dependency in dependencies {
            if dependency == node {
                warn!(node = %node, "ignoring dependency on itself");
                continue;
            }
            wanted.insert(dependency);
        }

        let mut untraced = Vec::new();
        for dependency in &wanted {
            if !next.contains(dependency) && !self.is_pending(dependency) {
                untraced.push(dependency.clone());
            }
            next.ensure_node(dependency);
            if let Err(err) = next.link(node, dependency) {
                warn!(node = %node, error = %err, "couldn't add edge");
            }
        }

        let stale: Vec<String> = next
            .get(node)
            .map(|current| {
                current
                    .dependencies()
                    .iter()
                    .filter(|dependency| !wanted.contains(*dependency))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut pruned = Vec::new();
        for dependency in stale {
            if let Err(err) = next.unlink(node, &dependency) {
                warn!(node = %node, error = %err, "couldn't remove edge");
                continue;
            }
            let orphaned = next
                .get(&dependency)
                .is_some_and(|dep| dep.dependents().is_empty() && !dep.is_entry_node());
            if !orphaned {
                continue;
            }
            match next.prune_node_and_unique_dependencies(&dependency) {
                // Dropping the edge cut off `node` as well; leave that island
                // to the disconnected-node sweep.
                Ok((names, _)) if names.iter().any(|name| name == node) => {}
                Ok((names, candidate)) => {
                    next = candidate;
                    pruned.extend(names);
                }
                Err(err) => warn!(node = %dependency, error = %err, "couldn't prune"),
            }
        }

        for name in &pruned {
            self.invalidate(name);
            self.errors.shift_remove(name);
        }
        if !pruned.is_empty() {
            debug!(node = %node, pruned = pruned.len(), "pruned dropped dependencies");
        }

        self.graph = next;
        (Diff::new(before, self.graph.clone()), untraced)
    }
}

struct TracerInner {
    runtime: Handle,
    source: Box<dyn DependencySource>,
    state: Mutex<TracerState>,
    emitter: Emitter,
}

/// Asynchronous dependency tracer over an immutable-snapshot graph.
///
/// Cloning the tracer yields another handle to the same graph.
///
/// # Runtime
///
/// The tracer must be created on a current-thread Tokio runtime, and all of
/// its work is spawned onto that runtime. "The next tick" means "once the
/// calling task yields", which only holds when no other worker thread can
/// pick up a spawned task in the meantime. [`GraphTracer::new`] therefore
/// fails with [`TracerError::UnsupportedRuntime`] on a multi-thread runtime.
/// Applications that run one host the tracer on a dedicated thread with its
/// own current-thread runtime.
#[derive(Clone)]
pub struct GraphTracer {
    inner: Arc<TracerInner>,
}

/// A non-owning handle to a [`GraphTracer`].
#[derive(Clone)]
pub struct WeakGraphTracer {
    inner: Weak<TracerInner>,
}

impl WeakGraphTracer {
    pub fn upgrade(&self) -> Option<GraphTracer> {
        self.inner.upgrade().map(|inner| GraphTracer { inner })
    }
}

impl GraphTracer {
    /// Create a tracer with an empty graph, bound to the current runtime.
    pub fn new(source: impl DependencySource) -> Result<Self, TracerError> {
        let runtime = Handle::try_current().map_err(|_| TracerError::NoRuntime)?;
        match runtime.runtime_flavor() {
            RuntimeFlavor::CurrentThread => {}
            flavor => return Err(TracerError::UnsupportedRuntime(format!("{flavor:?}"))),
        }

        Ok(Self {
            inner: Arc::new(TracerInner {
                runtime,
                source: Box::new(source),
                state: Mutex::new(TracerState::default()),
                emitter: Emitter::default(),
            }),
        })
    }

    pub fn downgrade(&self) -> WeakGraphTracer {
        WeakGraphTracer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The current snapshot.
    pub fn state(&self) -> GraphState {
        self.inner.state.lock().graph.clone()
    }

    /// Number of valid pending jobs. A lookup that never resolves stays
    /// counted here.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().valid_jobs
    }

    pub fn is_tracing(&self) -> bool {
        self.inner.state.lock().has_valid_pending()
    }

    /// Whether a valid job for `name` is pending.
    pub fn is_pending(&self, name: &str) -> bool {
        self.inner.state.lock().is_pending(name)
    }

    /// Discovery failures accumulated since the last `Complete`.
    pub fn errors(&self) -> Vec<DiscoveryError> {
        self.inner.state.lock().errors.values().cloned().collect()
    }

    /// Register a synchronous listener.
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&TraceEvent) + Send + Sync + 'static,
    {
        self.inner.emitter.on(listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.emitter.off(id)
    }

    /// Receive every event emitted from now on, in order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TraceEvent> {
        self.inner.emitter.subscribe()
    }

    /// Discover the dependencies of `name`, and transitively of every new
    /// node found along the way.
    ///
    /// Any pending job for `name` is invalidated first.
    pub fn trace_from_node(&self, name: &str) {
        let (job, started) = {
            let mut state = self.inner.state.lock();
            let started = !mem::replace(&mut state.running, true);
            (state.enqueue(name), started)
        };

        if started {
            info!(node = %name, "trace run started");
            self.inner.emitter.emit(TraceEvent::Started);
        }

        self.spawn_job(job);
    }

    /// Remove `name` and every dependency left without dependents, and drop
    /// pending work for all of them.
    pub fn prune_from_node(&self, name: &str) -> Result<Diff, GraphError> {
        self.prune_with(|state, next| {
            let mut changed = state.invalidate(name);
            if !next.contains(name) {
                return Ok((Vec::new(), changed));
            }
            let pruned = next.prune(name)?;
            changed = true;
            Ok((pruned, changed))
        })
    }

    /// Prune every node unreachable from the entry nodes.
    pub fn prune_disconnected_nodes(&self) -> Result<Diff, GraphError> {
        self.prune_with(|_, next| {
            let mut pruned = Vec::new();
            for name in next.find_nodes_disconnected_from_entry_nodes() {
                if next.contains(&name) {
                    pruned.extend(next.prune(&name)?);
                }
            }
            let changed = !pruned.is_empty();
            Ok((pruned, changed))
        })
    }

    /// Add `name` if unknown and flag it as an entry node. Does not trace.
    pub fn set_node_as_entry(&self, name: &str) -> Result<Diff, GraphError> {
        let mut state = self.inner.state.lock();
        let before = state.graph.clone();
        let mut next = before.clone();
        next.ensure_node(name);
        next.mark_entry(name)?;
        state.graph = next;
        Ok(Diff::new(before, state.graph.clone()))
    }

    fn prune_with<F>(&self, prune: F) -> Result<Diff, GraphError>
    where
        F: FnOnce(&mut TracerState, &mut GraphState) -> Result<(Vec<String>, bool), GraphError>,
    {
        let (diff, event, schedule) = {
            let mut state = self.inner.state.lock();
            let before = state.graph.clone();
            let mut next = before.clone();

            let (pruned, changed) = prune(&mut state, &mut next)?;
            for name in &pruned {
                state.invalidate(name);
                state.errors.shift_remove(name);
            }
            state.graph = next;

            let diff = Diff::new(before, state.graph.clone());
            let schedule = changed && state.request_completion();
            let event = (!pruned.is_empty()).then(|| {
                let nodes_impacted = diff
                    .changed_nodes()
                    .into_iter()
                    .map(|(node, _)| node.name().to_owned())
                    .collect();
                TraceEvent::Pruned {
                    pruned,
                    nodes_impacted,
                    diff: diff.clone(),
                }
            });
            (diff, event, schedule)
        };

        if let Some(event) = event {
            if let TraceEvent::Pruned { pruned, .. } = &event {
                debug!(pruned = pruned.len(), "pruned nodes");
            }
            self.inner.emitter.emit(event);
        }
        if schedule {
            self.spawn_completion_check();
        }

        Ok(diff)
    }

    fn spawn_job(&self, job: Arc<PendingJob>) {
        let tracer = self.clone();
        self.inner.runtime.spawn(async move { tracer.run_job(job).await });
    }

    async fn run_job(self, job: Arc<PendingJob>) {
        tokio::task::yield_now().await;

        if !job.is_valid() {
            self.resolve(&job, None);
            return;
        }

        let outcome = self.inner.source.dependencies(&job.node).await;
        self.resolve(&job, Some(outcome));
    }

    fn resolve(&self, job: &Arc<PendingJob>, outcome: Option<anyhow::Result<Vec<String>>>) {
        let mut events = Vec::new();
        let mut spawned = Vec::new();

        {
            let mut state = self.inner.state.lock();
            state.settle(job);
            state.settling += 1;

            match outcome {
                _ if !job.is_valid() => {
                    debug!(node = %job.node, "discarded result of invalidated job");
                }
                None => {}
                Some(Err(err)) => {
                    let error = DiscoveryError::new(job.node.clone(), err);
                    warn!(node = %job.node, error = %error.error, "dependency discovery failed");
                    state.errors.insert(job.node.clone(), error.clone());
                    events.push(TraceEvent::NodeError {
                        node: job.node.clone(),
                        error,
                    });
                }
                Some(Ok(dependencies)) => {
                    state.errors.shift_remove(&job.node);
                    let (diff, untraced) = state.apply_dependencies(&job.node, dependencies);
                    for name in untraced {
                        spawned.push(state.enqueue(&name));
                    }
                    debug!(node = %job.node, new = spawned.len(), "traced");
                    events.push(TraceEvent::Traced {
                        node: job.node.clone(),
                        diff,
                    });
                }
            }
        }

        for job in spawned {
            self.spawn_job(job);
        }
        for event in events {
            self.inner.emitter.emit(event);
        }

        let schedule = {
            let mut state = self.inner.state.lock();
            state.settling -= 1;
            state.request_completion()
        };
        if schedule {
            self.spawn_completion_check();
        }
    }

    fn spawn_completion_check(&self) {
        let tracer = self.clone();
        self.inner.runtime.spawn(async move {
            tokio::task::yield_now().await;
            tracer.check_completion();
        });
    }

    fn check_completion(&self) {
        let event = {
            let mut state = self.inner.state.lock();
            state.completion_scheduled = false;

            let busy = state.has_valid_pending() || state.settling > 0;
            let idle_and_unchanged = !state.running
                && state.errors.is_empty()
                && state.graph.same_snapshot(&state.run_start);

            if busy || idle_and_unchanged {
                None
            } else {
                let to = state.graph.clone();
                let from = mem::replace(&mut state.run_start, to.clone());
                let errors: Vec<DiscoveryError> =
                    mem::take(&mut state.errors).into_values().collect();
                state.running = false;

                info!(nodes = to.len(), errors = errors.len(), "trace run complete");
                Some(TraceEvent::Complete {
                    diff: Diff::new(from, to),
                    errors,
                })
            }
        };

        if let Some(event) = event {
            self.inner.emitter.emit(event);
        }
    }
}

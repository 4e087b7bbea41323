//! Dependency Graph
//!
//! This module implements the dependency graph and the tracer that discovers
//! it.
//!
//! # Overview
//!
//! The graph is directed and may contain cycles:
//!
//! - Nodes are named by opaque strings (typically file paths)
//! - An edge `a -> b` means `a` depends on `b`; `b` records `a` as a dependent
//!
//! The tracer asks a [`DependencySource`] for the outgoing edges of a node,
//! applies them, and traces any name it has not seen yet. Nodes that are no
//! longer reachable from an entry node can be pruned.
//!
//! # Design Decisions
//!
//! 1. Snapshots are immutable. Every mutation produces a new [`GraphState`]
//!    and consumers receive [`Diff`]s holding both sides, so a diff never
//!    changes after it has been emitted.
//!
//! 2. The graph is indexed by name and keeps insertion order, so iteration
//!    and pruned-node lists are deterministic.
//!
//! 3. We maintain both forward (dependencies) and reverse (dependents) edges
//!    to make pruning and impact queries cheap in both directions.

mod diff;
mod events;
mod node;
mod notation;
mod state;
mod tracer;

pub use diff::{merge_diffs, Diff};
pub use events::{ListenerId, TraceEvent};
pub use node::Node;
pub use notation::{create_nodes_from_notation, to_notation};
pub use state::GraphState;
pub use tracer::{DependencySource, GraphTracer, WeakGraphTracer};

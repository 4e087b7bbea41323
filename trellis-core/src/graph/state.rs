//! Graph Snapshots
//!
//! A [`GraphState`] is an immutable snapshot of the dependency graph: a map
//! from name to [`Node`]. Every public mutating operation takes `&self` and
//! returns a new snapshot, so a snapshot handed to an observer never changes
//! underneath it.
//!
//! # Sharing
//!
//! The node map sits behind an `Arc`. Cloning a snapshot is a pointer copy,
//! and a mutation copies the map only when another snapshot still shares it
//! (`Arc::make_mut`). Inside the crate the tracer applies several mutations to
//! one working copy before publishing it, which keeps a whole tracing step at
//! a single map copy.
//!
//! # Invariants
//!
//! - `b ∈ a.dependencies ⇔ a ∈ b.dependents` for every pair of nodes.
//! - No node has an edge to itself.
//! - Every name referenced by an edge is present in the snapshot.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tracing::trace;

use super::node::Node;
use crate::error::GraphError;

/// An immutable snapshot of the dependency graph.
#[derive(Debug, Clone, Default)]
pub struct GraphState {
    nodes: Arc<IndexMap<String, Node>>,
}

impl PartialEq for GraphState {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.nodes, &other.nodes) || self.nodes == other.nodes
    }
}

impl Eq for GraphState {}

/// One node on the explicit prune stack.
struct PruneFrame {
    name: String,
    dependencies: Vec<String>,
    next: usize,
}

impl GraphState {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes in the snapshot.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Node names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Names of every node flagged as an entry node.
    pub fn entry_nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .values()
            .filter(|node| node.is_entry_node())
            .map(Node::name)
    }

    /// Check whether two snapshots share the same underlying map.
    pub fn same_snapshot(&self, other: &GraphState) -> bool {
        Arc::ptr_eq(&self.nodes, &other.nodes)
    }

    /// Return a snapshot with an empty node called `name`.
    pub fn add_node(&self, name: &str) -> Result<GraphState, GraphError> {
        let mut next = self.clone();
        next.insert_node(name)?;
        Ok(next)
    }

    /// Return a snapshot without `name`.
    ///
    /// Any edges touching the node are detached from its neighbours so the
    /// result still satisfies the edge symmetry invariant.
    pub fn remove_node(&self, name: &str) -> Result<GraphState, GraphError> {
        let mut next = self.clone();
        next.delete_node(name)?;
        Ok(next)
    }

    /// Return a snapshot with the edge `head -> tail`.
    ///
    /// Adding an edge that already exists is a no-op.
    pub fn add_edge(&self, head: &str, tail: &str) -> Result<GraphState, GraphError> {
        let mut next = self.clone();
        next.link(head, tail)?;
        Ok(next)
    }

    /// Return a snapshot without the edge `head -> tail`.
    ///
    /// Removing an edge that does not exist is a no-op.
    pub fn remove_edge(&self, head: &str, tail: &str) -> Result<GraphState, GraphError> {
        let mut next = self.clone();
        next.unlink(head, tail)?;
        Ok(next)
    }

    /// Return a snapshot where `name` is flagged as an entry node.
    pub fn define_entry_node(&self, name: &str) -> Result<GraphState, GraphError> {
        let mut next = self.clone();
        next.mark_entry(name)?;
        Ok(next)
    }

    /// Names of every node that cannot be reached from an entry node.
    ///
    /// Reachability follows `dependencies` edges depth-first from the entry
    /// nodes; a visited set keeps cycles from looping. Local pruning can leave
    /// cyclic islands behind, and this scan is what finds them.
    pub fn find_nodes_disconnected_from_entry_nodes(&self) -> Vec<String> {
        let mut visited: IndexSet<&str> = IndexSet::new();
        let mut stack: Vec<&str> = self.entry_nodes().collect();

        while let Some(name) = stack.pop() {
            if !visited.insert(name) {
                continue;
            }
            if let Some(node) = self.nodes.get(name) {
                for dependency in node.dependencies().iter().rev() {
                    if !visited.contains(dependency.as_str()) {
                        stack.push(dependency);
                    }
                }
            }
        }

        self.names()
            .filter(|name| !visited.contains(name))
            .map(str::to_owned)
            .collect()
    }

    /// Remove `name` and every dependency left without dependents.
    ///
    /// Returns the pruned names (`name` first, then dependencies in the order
    /// they were visited) together with the resulting snapshot. Entry nodes
    /// are never pruned unless they are `name` itself.
    pub fn prune_node_and_unique_dependencies(
        &self,
        name: &str,
    ) -> Result<(Vec<String>, GraphState), GraphError> {
        let mut next = self.clone();
        let pruned = next.prune(name)?;
        Ok((pruned, next))
    }

    // ------------------------------------------------------------------------
    // In-place mutation of a working copy
    // ------------------------------------------------------------------------

    fn require(&self, name: &str) -> Result<&Node, GraphError> {
        self.nodes
            .get(name)
            .ok_or_else(|| GraphError::NodeNotFound(name.to_owned()))
    }

    fn nodes_mut(&mut self) -> &mut IndexMap<String, Node> {
        Arc::make_mut(&mut self.nodes)
    }

    pub(crate) fn insert_node(&mut self, name: &str) -> Result<(), GraphError> {
        if self.contains(name) {
            return Err(GraphError::NodeAlreadyExists(name.to_owned()));
        }
        self.nodes_mut().insert(name.to_owned(), Node::new(name));
        Ok(())
    }

    /// Insert `name` unless it is already present.
    pub(crate) fn ensure_node(&mut self, name: &str) {
        if !self.contains(name) {
            self.nodes_mut().insert(name.to_owned(), Node::new(name));
        }
    }

    pub(crate) fn delete_node(&mut self, name: &str) -> Result<(), GraphError> {
        let node = self.require(name)?.clone();
        let nodes = self.nodes_mut();

        for dependent in node.dependents() {
            if let Some(other) = nodes.get_mut(dependent) {
                other.remove_dependency(name);
            }
        }
        for dependency in node.dependencies() {
            if let Some(other) = nodes.get_mut(dependency) {
                other.remove_dependent(name);
            }
        }

        nodes.shift_remove(name);
        Ok(())
    }

    pub(crate) fn link(&mut self, head: &str, tail: &str) -> Result<(), GraphError> {
        if head == tail {
            return Err(GraphError::SelfEdge(head.to_owned()));
        }
        let existing = self.require(head)?;
        self.require(tail)?;
        if existing.dependencies().contains(tail) {
            return Ok(());
        }

        let nodes = self.nodes_mut();
        if let Some(node) = nodes.get_mut(head) {
            node.add_dependency(tail);
        }
        if let Some(node) = nodes.get_mut(tail) {
            node.add_dependent(head);
        }
        Ok(())
    }

    pub(crate) fn unlink(&mut self, head: &str, tail: &str) -> Result<(), GraphError> {
        let existing = self.require(head)?;
        self.require(tail)?;
        if !existing.dependencies().contains(tail) {
            return Ok(());
        }

        let nodes = self.nodes_mut();
        if let Some(node) = nodes.get_mut(head) {
            node.remove_dependency(tail);
        }
        if let Some(node) = nodes.get_mut(tail) {
            node.remove_dependent(head);
        }
        Ok(())
    }

    pub(crate) fn mark_entry(&mut self, name: &str) -> Result<(), GraphError> {
        if self.require(name)?.is_entry_node() {
            return Ok(());
        }
        if let Some(node) = self.nodes_mut().get_mut(name) {
            node.mark_entry();
        }
        Ok(())
    }

    pub(crate) fn prune(&mut self, name: &str) -> Result<Vec<String>, GraphError> {
        self.require(name)?;
        let reachable = self.transitive_dependencies(name);

        let mut pruned = IndexSet::new();
        self.prune_unique(name, &mut pruned)?;
        self.prune_dangling(&reachable, &mut pruned)?;

        Ok(pruned.into_iter().collect())
    }

    /// Dependents are detached before the dependencies are walked. A
    /// dependency is followed only once its last dependent is gone, and the
    /// `pruned` set stops a cycle from re-entering a node still on the stack.
    ///
    /// The walk is depth-first over an explicit stack of frames; a node is
    /// deleted once every one of its dependencies has been visited.
    fn prune_unique(&mut self, name: &str, pruned: &mut IndexSet<String>) -> Result<(), GraphError> {
        let mut stack = vec![self.enter_prune(name, pruned)?];

        while let Some(frame) = stack.last_mut() {
            let Some(dependency) = frame.dependencies.get(frame.next).cloned() else {
                let done = frame.name.clone();
                stack.pop();
                self.delete_node(&done)?;
                continue;
            };
            frame.next += 1;
            let parent = frame.name.clone();

            if !self.contains(&dependency) {
                continue;
            }
            self.unlink(&parent, &dependency)?;

            let orphaned = self
                .get(&dependency)
                .is_some_and(|dep| dep.dependents().is_empty() && !dep.is_entry_node());

            if orphaned && !pruned.contains(dependency.as_str()) {
                trace!(node = %dependency, parent = %parent, "pruning orphaned dependency");
                stack.push(self.enter_prune(&dependency, pruned)?);
            }
        }

        Ok(())
    }

    /// Mark `name` pruned and detach its dependents.
    fn enter_prune(&mut self, name: &str, pruned: &mut IndexSet<String>) -> Result<PruneFrame, GraphError> {
        let node = self.require(name)?.clone();
        pruned.insert(name.to_owned());

        for dependent in node.dependents() {
            if self.contains(dependent) {
                self.unlink(dependent, name)?;
            }
        }

        Ok(PruneFrame {
            name: name.to_owned(),
            dependencies: node.dependencies().iter().cloned().collect(),
            next: 0,
        })
    }

    /// Remove cyclic islands left among the former dependencies of a pruned
    /// node. A candidate survives if it is an entry node, has a dependent
    /// outside the candidate set, or is reachable from a survivor.
    fn prune_dangling(
        &mut self,
        candidates: &IndexSet<String>,
        pruned: &mut IndexSet<String>,
    ) -> Result<(), GraphError> {
        let remaining: Vec<&String> = candidates
            .iter()
            .filter(|name| self.contains(name))
            .collect();
        if remaining.is_empty() {
            return Ok(());
        }

        let mut live: IndexSet<&str> = IndexSet::new();
        let mut stack: Vec<&str> = remaining
            .iter()
            .filter(|name| {
                self.get(name).is_some_and(|node| {
                    node.is_entry_node()
                        || node
                            .dependents()
                            .iter()
                            .any(|dependent| !candidates.contains(dependent))
                })
            })
            .map(|name| name.as_str())
            .collect();

        while let Some(name) = stack.pop() {
            if !live.insert(name) {
                continue;
            }
            if let Some(node) = self.nodes.get(name) {
                stack.extend(
                    node.dependencies()
                        .iter()
                        .filter(|dep| candidates.contains(*dep) && !live.contains(dep.as_str()))
                        .map(String::as_str),
                );
            }
        }

        let dangling: Vec<String> = remaining
            .iter()
            .filter(|name| !live.contains(name.as_str()))
            .map(|name| String::clone(name))
            .collect();

        for name in dangling {
            trace!(node = %name, "pruning dangling cycle member");
            self.delete_node(&name)?;
            pruned.insert(name);
        }

        Ok(())
    }

    /// Every name reachable from `name` along dependency edges, excluding
    /// `name` itself, in depth-first preorder.
    fn transitive_dependencies(&self, name: &str) -> IndexSet<String> {
        let mut seen: IndexSet<String> = IndexSet::new();
        let mut stack: Vec<&str> = match self.nodes.get(name) {
            Some(node) => node.dependencies().iter().rev().map(String::as_str).collect(),
            None => return seen,
        };

        while let Some(current) = stack.pop() {
            if current == name || seen.contains(current) {
                continue;
            }
            seen.insert(current.to_owned());
            if let Some(node) = self.nodes.get(current) {
                stack.extend(node.dependencies().iter().rev().map(String::as_str));
            }
        }

        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::notation::create_nodes_from_notation;

    fn graph(notation: &str) -> GraphState {
        create_nodes_from_notation(notation).unwrap()
    }

    fn assert_symmetric(state: &GraphState) {
        for node in state.nodes() {
            for dependency in node.dependencies() {
                let other = state.get(dependency).expect("dangling dependency");
                assert!(other.dependents().contains(node.name()));
            }
            for dependent in node.dependents() {
                let other = state.get(dependent).expect("dangling dependent");
                assert!(other.dependencies().contains(node.name()));
            }
        }
    }

    #[test]
    fn add_node_rejects_duplicates() {
        let state = GraphState::new().add_node("a").unwrap();
        assert!(state.contains("a"));
        assert_eq!(
            state.add_node("a").unwrap_err(),
            GraphError::NodeAlreadyExists("a".into())
        );
    }

    #[test]
    fn remove_node_requires_presence() {
        let state = GraphState::new();
        assert_eq!(
            state.remove_node("a").unwrap_err(),
            GraphError::NodeNotFound("a".into())
        );
    }

    #[test]
    fn remove_node_detaches_edges() {
        let state = graph("a -> b -> c");
        let next = state.remove_node("b").unwrap();

        assert!(!next.contains("b"));
        assert!(next.get("a").unwrap().dependencies().is_empty());
        assert!(next.get("c").unwrap().dependents().is_empty());
        assert_symmetric(&next);
    }

    #[test]
    fn add_edge_maintains_symmetry() {
        let state = GraphState::new()
            .add_node("a")
            .unwrap()
            .add_node("b")
            .unwrap()
            .add_edge("a", "b")
            .unwrap();

        assert!(state.get("a").unwrap().dependencies().contains("b"));
        assert!(state.get("b").unwrap().dependents().contains("a"));
        assert_symmetric(&state);
    }

    #[test]
    fn self_edges_are_rejected() {
        let state = graph("a -> b");
        for name in ["a", "b", "missing"] {
            assert_eq!(
                state.add_edge(name, name).unwrap_err(),
                GraphError::SelfEdge(name.into())
            );
        }
    }

    #[test]
    fn edges_require_both_endpoints() {
        let state = GraphState::new().add_node("a").unwrap();
        assert_eq!(
            state.add_edge("a", "b").unwrap_err(),
            GraphError::NodeNotFound("b".into())
        );
        assert_eq!(
            state.add_edge("b", "a").unwrap_err(),
            GraphError::NodeNotFound("b".into())
        );
        assert_eq!(
            state.remove_edge("a", "b").unwrap_err(),
            GraphError::NodeNotFound("b".into())
        );
    }

    #[test]
    fn edge_mutation_is_idempotent() {
        let state = graph("a -> b");

        let twice = state.add_edge("a", "b").unwrap();
        assert_eq!(twice, state);
        assert_eq!(twice.get("b").unwrap().dependents().len(), 1);

        let removed = state.remove_edge("a", "b").unwrap();
        let removed_again = removed.remove_edge("a", "b").unwrap();
        assert_eq!(removed, removed_again);
        assert_symmetric(&removed_again);
    }

    #[test]
    fn mutations_never_touch_the_input_snapshot() {
        let before = graph("a -> b");
        let _ = before.add_node("c").unwrap();
        let _ = before.remove_edge("a", "b").unwrap();
        let _ = before.prune_node_and_unique_dependencies("a").unwrap();

        assert_eq!(before, graph("a -> b"));
    }

    #[test]
    fn define_entry_node() {
        let state = graph("a -> b");
        let next = state.define_entry_node("a").unwrap();
        assert!(next.get("a").unwrap().is_entry_node());
        assert!(!state.get("a").unwrap().is_entry_node());
        assert_eq!(next.entry_nodes().collect::<Vec<_>>(), vec!["a"]);

        assert_eq!(
            state.define_entry_node("z").unwrap_err(),
            GraphError::NodeNotFound("z".into())
        );
    }

    #[test]
    fn prune_removes_a_whole_tree() {
        let (pruned, state) = graph("a -> b -> c")
            .prune_node_and_unique_dependencies("a")
            .unwrap();

        assert_eq!(pruned, vec!["a", "b", "c"]);
        assert!(state.is_empty());
    }

    #[test]
    fn prune_preserves_shared_dependencies() {
        let (pruned, state) = graph("a -> c\nb -> c")
            .prune_node_and_unique_dependencies("a")
            .unwrap();

        assert_eq!(pruned, vec!["a"]);
        assert!(state.contains("c"));
        assert!(state.contains("b"));
        assert_eq!(
            state.get("c").unwrap().dependents().iter().collect::<Vec<_>>(),
            vec!["b"]
        );
        assert_symmetric(&state);
    }

    #[test]
    fn prune_detaches_dependents_of_the_pruned_node() {
        let (pruned, state) = graph("a -> b -> c")
            .prune_node_and_unique_dependencies("b")
            .unwrap();

        assert_eq!(pruned, vec!["b", "c"]);
        assert!(state.get("a").unwrap().dependencies().is_empty());
        assert_symmetric(&state);
    }

    #[test]
    fn prune_keeps_entry_dependencies() {
        let state = graph("a -> b -> c").define_entry_node("b").unwrap();
        let (pruned, state) = state.prune_node_and_unique_dependencies("a").unwrap();

        assert_eq!(pruned, vec!["a"]);
        assert!(state.get("b").unwrap().is_entry_node());
        assert!(state.contains("c"));
    }

    #[test]
    fn prune_removes_an_entry_node_when_targeted() {
        let state = graph("a -> b").define_entry_node("a").unwrap();
        let (pruned, state) = state.prune_node_and_unique_dependencies("a").unwrap();

        assert_eq!(pruned, vec!["a", "b"]);
        assert!(state.is_empty());
    }

    #[test]
    fn prune_handles_cycles() {
        let (pruned, state) = graph("a -> b -> c -> b")
            .prune_node_and_unique_dependencies("a")
            .unwrap();

        assert!(state.is_empty());
        assert_eq!(pruned.len(), 3);
        assert_eq!(pruned[0], "a");
    }

    #[test]
    fn prune_keeps_cycles_with_outside_dependents() {
        let state = graph("a -> b -> c -> b\nd -> c");
        let (pruned, state) = state.prune_node_and_unique_dependencies("a").unwrap();

        assert_eq!(pruned, vec!["a"]);
        assert!(state.contains("b"));
        assert!(state.contains("c"));
        assert_symmetric(&state);
    }

    #[test]
    fn prune_terminates_on_tournament_graph() {
        let mut notation = String::new();
        for head in ["a", "b", "c", "d"] {
            for tail in ["a", "b", "c", "d"] {
                if head != tail {
                    notation.push_str(&format!("{head} -> {tail}\n"));
                }
            }
        }
        let state = graph(&notation).define_entry_node("a").unwrap();
        let (pruned, state) = state.prune_node_and_unique_dependencies("a").unwrap();

        assert!(state.is_empty());
        assert_eq!(pruned.len(), 4);
    }

    #[test]
    fn prune_walks_long_chains_without_recursion() {
        let names: Vec<String> = (0..100_000).map(|i| format!("n{i}")).collect();
        let state = graph(&names.join(" -> "));

        let (pruned, state) = state.prune_node_and_unique_dependencies("n0").unwrap();

        assert!(state.is_empty());
        assert_eq!(pruned.len(), 100_000);
        assert_eq!(pruned.first().map(String::as_str), Some("n0"));
        assert_eq!(pruned.last().map(String::as_str), Some("n99999"));
    }

    #[test]
    fn prune_order_is_depth_first() {
        let (pruned, _) = graph("a -> b -> c\na -> d\nb -> e")
            .prune_node_and_unique_dependencies("a")
            .unwrap();

        assert_eq!(pruned, vec!["a", "b", "c", "e", "d"]);
    }

    #[test]
    fn prune_requires_presence() {
        assert_eq!(
            GraphState::new()
                .prune_node_and_unique_dependencies("a")
                .unwrap_err(),
            GraphError::NodeNotFound("a".into())
        );
    }

    #[test]
    fn disconnected_nodes_are_found() {
        let state = graph("a -> b\nc -> d -> c\ne")
            .define_entry_node("a")
            .unwrap();

        assert_eq!(
            state.find_nodes_disconnected_from_entry_nodes(),
            vec!["c", "d", "e"]
        );
    }

    #[test]
    fn disconnected_scan_survives_cycles() {
        let state = graph("a -> b -> c -> a").define_entry_node("a").unwrap();
        assert!(state.find_nodes_disconnected_from_entry_nodes().is_empty());
    }

    #[test]
    fn without_entries_everything_is_disconnected() {
        let state = graph("a -> b");
        assert_eq!(
            state.find_nodes_disconnected_from_entry_nodes(),
            vec!["a", "b"]
        );
    }
}

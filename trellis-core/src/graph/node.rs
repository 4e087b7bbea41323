//! Graph Nodes
//!
//! This module defines the node type that lives in a graph snapshot.
//!
//! A node only knows its own name, the names it depends on and the names
//! that depend on it. Keeping both directions on every node lets pruning walk
//! dependents and dependencies without scanning the whole graph. The two sets
//! are kept as mirrors of each other by [`GraphState`](super::GraphState);
//! nothing outside this crate can mutate a node directly.

use indexmap::IndexSet;

/// A named vertex in the dependency graph, e.g. a source file identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Identity of the node.
    name: String,

    /// Outgoing edges: names this node depends on, in discovery order.
    dependencies: IndexSet<String>,

    /// Incoming edges: names that depend on this node.
    dependents: IndexSet<String>,

    /// Whether the node is a root of the graph.
    is_entry_node: bool,
}

impl Node {
    /// Create an empty, non-entry node.
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: IndexSet::new(),
            dependents: IndexSet::new(),
            is_entry_node: false,
        }
    }

    /// Get the node's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get all dependencies.
    pub fn dependencies(&self) -> &IndexSet<String> {
        &self.dependencies
    }

    /// Get all dependents.
    pub fn dependents(&self) -> &IndexSet<String> {
        &self.dependents
    }

    /// Check if the node is an entry node.
    pub fn is_entry_node(&self) -> bool {
        self.is_entry_node
    }

    pub(crate) fn add_dependency(&mut self, name: &str) {
        if !self.dependencies.contains(name) {
            self.dependencies.insert(name.to_owned());
        }
    }

    pub(crate) fn remove_dependency(&mut self, name: &str) {
        self.dependencies.shift_remove(name);
    }

    pub(crate) fn add_dependent(&mut self, name: &str) {
        if !self.dependents.contains(name) {
            self.dependents.insert(name.to_owned());
        }
    }

    pub(crate) fn remove_dependent(&mut self, name: &str) {
        self.dependents.shift_remove(name);
    }

    pub(crate) fn mark_entry(&mut self) {
        self.is_entry_node = true;
    }
}

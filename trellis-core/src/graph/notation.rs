//! Textual graph notation.
//!
//! Small graphs are easier to read as arrows than as builder calls, so tests
//! and diagnostics describe them line by line:
//!
//! ```text
//! a -> b -> c
//! b -> d
//! e
//! ```
//!
//! Each line is a chain; `a -> b -> c` yields the edges `a -> b` and
//! `b -> c`. A line holding a single name declares an isolated node.

use super::state::GraphState;
use crate::error::NotationError;

/// Build a snapshot from arrow notation.
pub fn create_nodes_from_notation(text: &str) -> Result<GraphState, NotationError> {
    let mut state = GraphState::new();

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let names: Vec<&str> = line.split("->").map(str::trim).collect();
        if names.iter().any(|name| name.is_empty()) {
            return Err(NotationError::EmptyName { line: index + 1 });
        }

        for name in &names {
            state.ensure_node(name);
        }
        for pair in names.windows(2) {
            state
                .link(pair[0], pair[1])
                .map_err(|source| NotationError::Graph {
                    line: index + 1,
                    source,
                })?;
        }
    }

    Ok(state)
}

/// Render a snapshot as arrow notation, one edge per line.
///
/// Nodes without any edge get a line of their own so that parsing the output
/// reproduces the same node set.
pub fn to_notation(state: &GraphState) -> String {
    let mut out = String::new();

    for node in state.nodes() {
        if node.dependencies().is_empty() && node.dependents().is_empty() {
            out.push_str(node.name());
            out.push('\n');
            continue;
        }
        for dependency in node.dependencies() {
            out.push_str(node.name());
            out.push_str(" -> ");
            out.push_str(dependency);
            out.push('\n');
        }
    }

    out
}

//! Snapshot diffs.
//!
//! A [`Diff`] is a before/after pair of snapshots. It holds both snapshots by
//! value, so neither can change after the diff is emitted, and the derived
//! queries below compare them on demand.

use super::node::Node;
use super::state::GraphState;

/// The change between two graph snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    pub from: GraphState,
    pub to: GraphState,
}

impl Diff {
    pub fn new(from: GraphState, to: GraphState) -> Self {
        Self { from, to }
    }

    /// A diff from a snapshot to itself.
    pub fn identity(state: &GraphState) -> Self {
        Self::new(state.clone(), state.clone())
    }

    /// Whether both sides hold the same nodes and edges.
    pub fn is_empty(&self) -> bool {
        self.from == self.to
    }

    /// Chain `next` after this diff.
    pub fn merge(self, next: Diff) -> Diff {
        Diff::new(self.from, next.to)
    }

    /// Names present in `to` but not in `from`.
    pub fn new_nodes(&self) -> Vec<String> {
        self.to
            .names()
            .filter(|name| !self.from.contains(name))
            .map(str::to_owned)
            .collect()
    }

    /// Names present in `from` but not in `to`.
    pub fn pruned_nodes(&self) -> Vec<String> {
        self.from
            .names()
            .filter(|name| !self.to.contains(name))
            .map(str::to_owned)
            .collect()
    }

    /// Nodes present on both sides whose value differs, as `(before, after)`.
    pub fn changed_nodes(&self) -> Vec<(&Node, &Node)> {
        self.from
            .nodes()
            .filter_map(|before| {
                let after = self.to.get(before.name())?;
                (before != after).then_some((before, after))
            })
            .collect()
    }
}

/// Merge a sequence of diffs into one spanning the first `from` to the last
/// `to`. Returns `None` for an empty sequence.
pub fn merge_diffs<I>(diffs: I) -> Option<Diff>
where
    I: IntoIterator<Item = Diff>,
{
    diffs.into_iter().reduce(Diff::merge)
}

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Opaque, totally ordered identifier of a cluster node.
///
/// Depending on the resolver's identity strategy this is either the node's
/// persistent id or its configured name. Either way, every node of the
/// cluster must derive the same value for the same peer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn new(id: impl AsRef<str>) -> Result<Self, CoreError> {
        let id = id.as_ref().trim();
        if id.is_empty() {
            return Err(CoreError::InvalidNodeId("node id must not be empty".into()));
        }
        Ok(Self(Arc::from(id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for NodeId {
    type Error = CoreError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

/// Sorted, deduplicated sequence of node identifiers.
///
/// A `NodeSet` is built fresh on every membership re-evaluation and never
/// mutated afterwards; replacing it is the only way to change it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSet(Vec<NodeId>);

impl NodeSet {
    /// Build a set from resolver output in arbitrary order.
    pub fn from_unsorted(mut ids: Vec<NodeId>) -> Self {
        ids.sort();
        ids.dedup();
        Self(ids)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Index of `id` within the sorted set (binary search).
    pub fn position(&self, id: &NodeId) -> Option<usize> {
        self.0.binary_search(id).ok()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.position(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[NodeId] {
        &self.0
    }
}

impl FromIterator<NodeId> for NodeSet {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        Self::from_unsorted(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::new(n).unwrap()).collect()
    }

    fn id(name: &str) -> NodeId {
        NodeId::new(name).unwrap()
    }

    #[test]
    fn node_set_sorts_and_dedups() {
        let set = NodeSet::from_unsorted(ids(&["c", "a", "b", "a"]));
        let names: Vec<&str> = set.iter().map(NodeId::as_str).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn position_uses_sorted_order() {
        let set = NodeSet::from_unsorted(ids(&["node-2", "node-0", "node-1"]));
        assert_eq!(set.position(&id("node-0")), Some(0));
        assert_eq!(set.position(&id("node-2")), Some(2));
        assert_eq!(set.position(&id("node-9")), None);
    }

    #[test]
    fn empty_node_id_rejected() {
        assert!(NodeId::new("  ").is_err());
        assert_eq!(NodeId::new(" n1 ").unwrap().as_str(), "n1");
    }

    #[test]
    fn conversion_from_str_validates() {
        assert!(matches!(NodeId::try_from(""), Err(CoreError::InvalidNodeId(_))));
        assert!(NodeId::try_from("   ").is_err());
        assert_eq!(NodeId::try_from("node-1").unwrap().as_str(), "node-1");
    }

    #[test]
    fn sets_from_different_orders_are_equal() {
        let a = NodeSet::from_unsorted(ids(&["x", "y", "z"]));
        let b: NodeSet = ids(&["z", "x", "y"]).into_iter().collect();
        assert_eq!(a, b);
    }
}

use std::collections::BTreeMap;
use std::sync::RwLock;

use jobmesh_core::{CoreError, NodeId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::filter::{FilterError, NodeFilter};

/// Errors raised while resolving cluster membership.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid node filter: {0}")]
    Filter(#[from] FilterError),
    #[error("unknown local node '{0}'")]
    UnknownNode(String),
    #[error("local node has no usable identifier: {0}")]
    InvalidNode(#[from] CoreError),
    #[error("membership unavailable: {0}")]
    Unavailable(String),
}

/// Membership collaborator consulted by the distributor.
///
/// Implementations answer from whatever the host's cluster-state view is.
/// Two nodes that observe the same membership must return the same ids.
pub trait NodeSetResolver: Send + Sync {
    /// Ids of all known nodes matching `filter`; all nodes when `None` or blank.
    fn resolve(&self, filter: Option<&str>) -> Result<Vec<NodeId>, ResolveError>;

    /// Id of the node named `local_node_name`.
    fn resolve_self(&self, local_node_name: &str) -> Result<NodeId, ResolveError>;
}

/// Which node property serves as the ordered identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeIdentity {
    /// Persistent node id (survives renames).
    #[default]
    ById,
    /// Configured node name (human-friendly, stable ordering across rebuilds).
    ByName,
}

/// A cluster member as seen by membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl NodeInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes.extend(attributes);
        self
    }

    fn identifier(&self, identity: NodeIdentity) -> Result<NodeId, CoreError> {
        match identity {
            NodeIdentity::ById => NodeId::try_from(self.id.as_str()),
            NodeIdentity::ByName => NodeId::try_from(self.name.as_str()),
        }
    }
}

/// In-memory membership table.
///
/// The host feeds it live membership (`set_members`, `join`, `leave`) and
/// then notifies the distributor; tests use it to simulate clusters.
pub struct MembershipResolver {
    identity: NodeIdentity,
    members: RwLock<BTreeMap<String, NodeInfo>>,
}

impl MembershipResolver {
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            identity,
            members: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn with_members(identity: NodeIdentity, members: impl IntoIterator<Item = NodeInfo>) -> Self {
        let resolver = Self::new(identity);
        resolver.set_members(members);
        resolver
    }

    pub fn identity(&self) -> NodeIdentity {
        self.identity
    }

    /// Replace the whole membership view.
    pub fn set_members(&self, members: impl IntoIterator<Item = NodeInfo>) {
        let fresh: BTreeMap<String, NodeInfo> =
            members.into_iter().map(|n| (n.id.clone(), n)).collect();
        debug!(members = fresh.len(), "membership replaced");
        let mut guard = self.members.write().unwrap_or_else(|e| e.into_inner());
        *guard = fresh;
    }

    /// Add or update a member.
    pub fn join(&self, node: NodeInfo) {
        debug!(node = %node.name, "member joined");
        let mut guard = self.members.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(node.id.clone(), node);
    }

    /// Remove a member by id. Returns whether it was present.
    pub fn leave(&self, node_id: &str) -> bool {
        let mut guard = self.members.write().unwrap_or_else(|e| e.into_inner());
        let removed = guard.remove(node_id).is_some();
        if removed {
            debug!(node_id = node_id, "member left");
        }
        removed
    }

    pub fn members(&self) -> Vec<NodeInfo> {
        let guard = self.members.read().unwrap_or_else(|e| e.into_inner());
        guard.values().cloned().collect()
    }
}

impl NodeSetResolver for MembershipResolver {
    fn resolve(&self, filter: Option<&str>) -> Result<Vec<NodeId>, ResolveError> {
        let filter = match filter {
            Some(expr) => NodeFilter::parse(expr)?,
            None => NodeFilter::all(),
        };
        let guard = self
            .members
            .read()
            .map_err(|e| ResolveError::Unavailable(format!("membership lock poisoned: {e}")))?;
        Ok(guard
            .values()
            .filter(|n| filter.matches(n))
            .filter_map(|n| match n.identifier(self.identity) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(node_id = %n.id, node = %n.name, error = %e, "skipping member without a usable identifier");
                    None
                }
            })
            .collect())
    }

    fn resolve_self(&self, local_node_name: &str) -> Result<NodeId, ResolveError> {
        let guard = self
            .members
            .read()
            .map_err(|e| ResolveError::Unavailable(format!("membership lock poisoned: {e}")))?;
        let node = guard
            .values()
            .find(|n| n.name == local_node_name)
            .ok_or_else(|| ResolveError::UnknownNode(local_node_name.to_string()))?;
        Ok(node.identifier(self.identity)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(identity: NodeIdentity) -> MembershipResolver {
        MembershipResolver::with_members(
            identity,
            [
                NodeInfo::new("id-c", "alpha").with_attribute("zone", "eu"),
                NodeInfo::new("id-a", "beta").with_attribute("zone", "us"),
                NodeInfo::new("id-b", "gamma").with_attribute("zone", "eu"),
            ],
        )
    }

    #[test]
    fn resolve_all_by_id() {
        let r = cluster(NodeIdentity::ById);
        let mut ids: Vec<String> = r.resolve(None).unwrap().iter().map(|n| n.to_string()).collect();
        ids.sort();
        assert_eq!(ids, vec!["id-a", "id-b", "id-c"]);
    }

    #[test]
    fn resolve_filtered_by_name() {
        let r = cluster(NodeIdentity::ByName);
        let mut names: Vec<String> = r
            .resolve(Some("zone:eu"))
            .unwrap()
            .iter()
            .map(|n| n.to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["alpha", "gamma"]);
    }

    #[test]
    fn resolve_self_follows_identity() {
        assert_eq!(cluster(NodeIdentity::ById).resolve_self("beta").unwrap().as_str(), "id-a");
        assert_eq!(cluster(NodeIdentity::ByName).resolve_self("beta").unwrap().as_str(), "beta");
        assert!(matches!(
            cluster(NodeIdentity::ById).resolve_self("delta"),
            Err(ResolveError::UnknownNode(_))
        ));
    }

    #[test]
    fn invalid_filter_is_an_error() {
        let r = cluster(NodeIdentity::ById);
        assert!(matches!(r.resolve(Some("zone:")), Err(ResolveError::Filter(_))));
    }

    #[test]
    fn members_with_blank_identifiers_are_not_resolved() {
        let r = cluster(NodeIdentity::ByName);
        r.join(NodeInfo::new("id-d", ""));
        r.join(NodeInfo::new("id-e", "  ").with_attribute("zone", "eu"));
        assert_eq!(r.resolve(None).unwrap().len(), 3);
        assert_eq!(r.resolve(Some("zone:eu")).unwrap().len(), 2);

        let by_id = cluster(NodeIdentity::ById);
        by_id.join(NodeInfo::new("", "delta"));
        assert_eq!(by_id.resolve(None).unwrap().len(), 3);
        assert!(matches!(by_id.resolve_self("delta"), Err(ResolveError::InvalidNode(_))));
    }

    #[test]
    fn join_and_leave() {
        let r = cluster(NodeIdentity::ById);
        r.join(NodeInfo::new("id-d", "delta"));
        assert_eq!(r.resolve(None).unwrap().len(), 4);
        assert!(r.leave("id-a"));
        assert!(!r.leave("id-a"));
        assert_eq!(r.members().len(), 3);
    }
}

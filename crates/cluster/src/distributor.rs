//! [`JobDistributor`]: decides which node owns each partitioned job.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use jobmesh_core::{JobKey, NodeSet, Partitioning};
use tracing::{debug, info, warn};

use crate::resolver::NodeSetResolver;


/// Index of the node that owns a job with `hash` among `node_count` nodes.
///
/// `None` when there are no nodes to assign to.
pub fn assigned_index(hash: i64, node_count: usize) -> Option<usize> {
    if node_count == 0 {
        return None;
    }
    Some((hash.unsigned_abs() % node_count as u64) as usize)
}

/// Immutable snapshot of the last re-evaluation.
///
/// `local_index` is `None` when the local node is not part of `node_set`;
/// otherwise it is the local node's position in the sorted set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributorState {
    pub node_set: NodeSet,
    pub node_count: usize,
    pub local_index: Option<usize>,
}

impl DistributorState {
    fn new(node_set: NodeSet, local_index: Option<usize>) -> Self {
        let node_count = node_set.len();
        debug_assert!(local_index.map_or(true, |i| i < node_count));
        Self {
            node_set,
            node_count,
            local_index,
        }
    }

    /// Node index that owns `key` under this snapshot.
    pub fn assigned_index(&self, key: &JobKey) -> Option<usize> {
        assigned_index(key.stable_hash(), self.node_count)
    }

    /// Whether the local node owns `key` under this snapshot.
    pub fn is_selected(&self, key: &JobKey) -> bool {
        match (self.assigned_index(key), self.local_index) {
            (Some(idx), Some(local)) => idx == local,
            _ => false,
        }
    }
}

/// Answers "does this node run job X" and keeps the answer in line with
/// cluster membership.
///
/// Reads go through a lock-free [`ArcSwap`] snapshot. Re-evaluations are
/// serialized by the mutex guarding the node filter, so `node_count` and
/// `local_index` always change together.
pub struct JobDistributor {
    name: String,
    resolver: Arc<dyn NodeSetResolver>,
    local_node_name: String,
    node_filter: Mutex<Option<String>>,
    state: ArcSwap<DistributorState>,
}

impl JobDistributor {
    /// Create a distributor. Until [`initialize`](Self::initialize) runs it
    /// sees zero nodes and selects no partitioned job.
    pub fn new(
        name: impl Into<String>,
        node_filter: Option<String>,
        resolver: Arc<dyn NodeSetResolver>,
        local_node_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            resolver,
            local_node_name: local_node_name.into(),
            node_filter: Mutex::new(normalize_filter(node_filter)),
            state: ArcSwap::from_pointee(DistributorState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the first re-evaluation.
    pub fn initialize(&self) -> bool {
        self.reevaluate("initialization")
    }

    /// Whether the local node should execute the partitioned job `key`.
    pub fn is_job_selected(&self, key: &JobKey) -> bool {
        self.state.load().is_selected(key)
    }

    /// Like [`is_job_selected`](Self::is_job_selected), but generic jobs are
    /// always selected, even with zero known nodes.
    pub fn is_job_selected_for(&self, key: &JobKey, partitioning: Partitioning) -> bool {
        match partitioning {
            Partitioning::Generic => true,
            Partitioning::Partitioned => self.is_job_selected(key),
        }
    }

    /// Current snapshot.
    pub fn state(&self) -> Arc<DistributorState> {
        self.state.load_full()
    }

    pub fn node_filter(&self) -> Option<String> {
        self.node_filter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Cluster-membership callback.
    pub fn cluster_state_changed(&self) -> bool {
        self.reevaluate("cluster state change")
    }

    /// Settings callback: install a new node filter and re-evaluate.
    pub fn node_filter_changed(&self, node_filter: Option<String>) -> bool {
        {
            let mut guard = self.node_filter.lock().unwrap_or_else(|e| e.into_inner());
            *guard = normalize_filter(node_filter);
        }
        self.reevaluate("settings change")
    }

    /// Re-resolve the node set and swap in a new snapshot.
    ///
    /// Returns `true` only when `node_count` or `local_index` changed; a new
    /// set with the same count and the same local position reports no change.
    pub fn reevaluate(&self, reason: &str) -> bool {
        let filter = self.node_filter.lock().unwrap_or_else(|e| e.into_inner());

        let node_set = match self.resolver.resolve(filter.as_deref()) {
            Ok(ids) => NodeSet::from_unsorted(ids),
            Err(e) => {
                warn!(
                    distributor = %self.name,
                    reason = reason,
                    error = %e,
                    "could not resolve nodes, assuming none are available"
                );
                NodeSet::empty()
            }
        };

        let current = self.state.load_full();
        if node_set == current.node_set {
            debug!(distributor = %self.name, reason = reason, "node set unchanged");
            return false;
        }

        let local_index = match self.resolver.resolve_self(&self.local_node_name) {
            Ok(id) => node_set.position(&id),
            Err(e) => {
                warn!(
                    distributor = %self.name,
                    node = %self.local_node_name,
                    error = %e,
                    "could not resolve local node"
                );
                None
            }
        };

        let next = DistributorState::new(node_set, local_index);
        let changed = next.node_count != current.node_count || next.local_index != current.local_index;

        info!(
            distributor = %self.name,
            reason = reason,
            node_count = next.node_count,
            local_index = ?next.local_index,
            changed = changed,
            "re-evaluated job distribution"
        );
        if next.local_index.is_none() {
            info!(
                distributor = %self.name,
                node = %self.local_node_name,
                filter = filter.as_deref().unwrap_or("*"),
                "local node is not eligible, no partitioned jobs will run here"
            );
        }

        self.state.store(Arc::new(next));
        changed
    }
}

fn normalize_filter(filter: Option<String>) -> Option<String> {
    filter
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
}

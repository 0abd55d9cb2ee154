//! Cluster-aware job distribution.
//!
//! Every node independently resolves the same filtered, sorted node set and
//! derives its own position in it. A partitioned job runs on the node whose
//! position equals `|hash(job)| mod node_count`; no coordinator is involved.
//!
//! - [`NodeSetResolver`]: membership collaborator (filter → node ids).
//! - [`NodeFilter`]: node-filter expression parsing and matching.
//! - [`MembershipResolver`]: in-memory membership table.
//! - [`JobDistributor`]: the "is this job mine" decision.

pub mod distributor;
pub mod filter;
pub mod resolver;

pub use distributor::{assigned_index, DistributorState, JobDistributor};
pub use filter::{FilterError, NodeFilter};
pub use resolver::{MembershipResolver, NodeIdentity, NodeInfo, NodeSetResolver, ResolveError};

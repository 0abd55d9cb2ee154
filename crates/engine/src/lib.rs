//! Job execution engine.
//!
//! A [`SchedulerBuilder`] wires a bounded [`WorkerPool`], a [`JobStore`] and a
//! [`JobFactory`] into a running [`Scheduler`]. The scheduler's control thread
//! acquires due triggers from the store in batches, fires them, and hands each
//! job to the pool unless the [`JobDistributor`](jobmesh_cluster::JobDistributor)
//! assigns it to another node.

pub mod builder;
pub mod error;
pub mod job;
pub mod memory_store;
pub mod metrics;
pub mod pool;
pub mod scheduler;
pub mod store;

pub use builder::SchedulerBuilder;
pub use error::{EngineError, PoolError, StoreError};
pub use job::{Job, JobContext, JobDefinition, JobError, JobFactory, JobRegistry, LogJob};
pub use memory_store::MemoryJobStore;
pub use metrics::SchedulerMetrics;
pub use pool::{Runnable, ThreadPool, ThreadPriority, WorkerPool};
pub use scheduler::{ScheduleOutcome, Scheduler, SchedulerState};
pub use store::{FiredBundle, JobStore, SchedulerSignaler, Signal, StoreContext};

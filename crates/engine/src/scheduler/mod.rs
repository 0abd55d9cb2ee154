//! The running scheduler: a control thread that acquires due triggers from
//! the job store and hands their jobs to the worker pool.
//!
//! Split into focused submodules:
//! - `core`: Scheduler handle, lifecycle and job registration
//! - `execution`: the acquire/wait/fire loop
//! - `run_shell`: per-firing execution wrapper

mod core;
mod execution;
mod run_shell;

pub use self::core::{ScheduleOutcome, Scheduler, SchedulerState};
pub(crate) use self::core::SchedulerResources;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use jobmesh_cluster::JobDistributor;
use jobmesh_core::JobKey;
use jobmesh_schedule::{identity_prefix, Schedule, TriggerKey};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::job::{JobDefinition, JobFactory};
use crate::metrics::SchedulerMetrics;
use crate::pool::ThreadPool;
use crate::store::{JobStore, SchedulerSignaler};

/// Everything the scheduler runs on, assembled by the builder.
pub(crate) struct SchedulerResources {
    pub name: String,
    pub instance_id: String,
    pub pool: Arc<dyn ThreadPool>,
    pub store: Arc<dyn JobStore>,
    pub signaler: Arc<SchedulerSignaler>,
    pub max_batch_size: usize,
    pub batch_time_window: Duration,
    pub idle_wait_time: Duration,
    pub db_failure_retry_interval: Duration,
}

/// Lifecycle of a scheduler. A new scheduler starts in `Standby`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Standby,
    Started,
    Shutdown,
}

/// Result of [`Scheduler::schedule_job`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A trigger with the same identity is already stored.
    Unchanged(TriggerKey),
    /// A new trigger was stored, replacing older identities of the same scope.
    Scheduled {
        trigger: TriggerKey,
        superseded: Vec<TriggerKey>,
    },
}

pub(super) struct Inner {
    pub(super) res: SchedulerResources,
    pub(super) factory: Arc<dyn JobFactory>,
    pub(super) distributor: Option<Arc<JobDistributor>>,
    pub(super) metrics: RwLock<SchedulerMetrics>,
    pub(super) active_runs: AtomicUsize,
    control: watch::Sender<SchedulerState>,
    distributor_initialized: AtomicBool,
}

impl Inner {
    pub(super) fn state(&self) -> SchedulerState {
        *self.control.borrow()
    }

    pub(super) fn is_halted(&self) -> bool {
        self.state() == SchedulerState::Shutdown
    }

    /// Receiver for lifecycle changes, used by the control loop to wait.
    pub(super) fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.control.subscribe()
    }

    pub(super) fn with_metrics(&self, f: impl FnOnce(&mut SchedulerMetrics)) {
        let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        f(&mut metrics);
    }
}

/// Handle to a running scheduler.
///
/// Dropping the handle shuts the scheduler down without waiting for jobs.
pub struct Scheduler {
    inner: Arc<Inner>,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub(crate) fn new(
        res: SchedulerResources,
        distributor: Option<Arc<JobDistributor>>,
        factory: Arc<dyn JobFactory>,
    ) -> Result<Self, EngineError> {
        let thread_name = format!("{}/scheduler", res.name);
        let inner = Arc::new(Inner {
            res,
            factory,
            distributor,
            metrics: RwLock::new(SchedulerMetrics::default()),
            active_runs: AtomicUsize::new(0),
            control: watch::channel(SchedulerState::Standby).0,
            distributor_initialized: AtomicBool::new(false),
        });

        // Drives the loop's timed waits; the loop thread is its only user.
        let waits = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(EngineError::Spawn)?;
        let loop_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || super::execution::run_loop(loop_inner, waits))
            .map_err(EngineError::Spawn)?;

        info!(
            scheduler = %inner.res.name,
            instance = %inner.res.instance_id,
            pool_size = inner.res.pool.pool_size(),
            max_batch_size = inner.res.max_batch_size,
            "scheduler created in standby"
        );
        Ok(Self {
            inner,
            loop_thread: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.res.name
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.res.instance_id
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.state()
    }

    pub fn is_started(&self) -> bool {
        self.state() == SchedulerState::Started
    }

    pub fn is_shutdown(&self) -> bool {
        self.state() == SchedulerState::Shutdown
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.inner.res.store)
    }

    pub fn distributor(&self) -> Option<Arc<JobDistributor>> {
        self.inner.distributor.clone()
    }

    /// Begin firing triggers. The distributor, if any, is initialized on the
    /// first start.
    pub fn start(&self) -> Result<(), EngineError> {
        if let Some(d) = &self.inner.distributor {
            if !self.inner.distributor_initialized.swap(true, Ordering::SeqCst) {
                d.initialize();
            }
        }
        let mut shut_down = false;
        self.inner.control.send_if_modified(|state| match *state {
            SchedulerState::Shutdown => {
                shut_down = true;
                false
            }
            SchedulerState::Started => false,
            SchedulerState::Standby => {
                *state = SchedulerState::Started;
                true
            }
        });
        if shut_down {
            return Err(EngineError::ShutDown(self.inner.res.name.clone()));
        }
        info!(scheduler = %self.inner.res.name, "scheduler started");
        Ok(())
    }

    /// Stop firing triggers until the next [`start`](Self::start). Running
    /// jobs are not interrupted.
    pub fn standby(&self) {
        let paused = self.inner.control.send_if_modified(|state| {
            if *state != SchedulerState::Started {
                return false;
            }
            *state = SchedulerState::Standby;
            true
        });
        if paused {
            self.inner.res.signaler.signal_scheduling_change(None);
            info!(scheduler = %self.inner.res.name, "scheduler in standby");
        }
    }

    /// Halt the scheduler. With `wait_for_jobs` running jobs are drained
    /// before returning. Blocks, so it must not be called from inside a job
    /// or from async code; use `spawn_blocking` there.
    pub fn shutdown(&self, wait_for_jobs: bool) {
        if self.inner.control.send_replace(SchedulerState::Shutdown) == SchedulerState::Shutdown {
            return;
        }
        info!(scheduler = %self.inner.res.name, wait_for_jobs, "scheduler shutting down");
        self.inner.res.signaler.signal_scheduling_change(None);
        self.inner.res.pool.shutdown(wait_for_jobs);

        let handle = self
            .loop_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(scheduler = %self.inner.res.name, "scheduler thread panicked");
            }
        }
        self.inner.res.store.shutdown();
        info!(scheduler = %self.inner.res.name, "scheduler shut down");
    }

    /// Store `definition` and a trigger for `schedule`.
    ///
    /// Scheduling the same schedule again is a no-op. A different schedule in
    /// the same scope supersedes the job's existing triggers of that scope.
    pub fn schedule_job(
        &self,
        definition: JobDefinition,
        schedule: &Schedule,
    ) -> Result<ScheduleOutcome, EngineError> {
        if self.is_shutdown() {
            return Err(EngineError::ShutDown(self.inner.res.name.clone()));
        }
        let store = &self.inner.res.store;
        let job_key = definition.key.clone();
        let trigger_key = schedule.trigger_key(&job_key);

        store.store_job(definition, true)?;
        let existing = store.triggers_for_job(&job_key)?;
        if existing.iter().any(|t| t.key() == &trigger_key) {
            debug!(job = %job_key, trigger = %trigger_key, "schedule unchanged");
            return Ok(ScheduleOutcome::Unchanged(trigger_key));
        }

        // The old triggers stay until the replacement is stored.
        let trigger = schedule.to_trigger(&job_key, Utc::now())?;
        let next_fire_time = trigger.next_fire_time();
        store.store_trigger(trigger, false)?;

        let prefix = identity_prefix(schedule.scope(), &job_key.name);
        let mut superseded = Vec::new();
        for old in existing.iter().filter(|t| t.key().name.starts_with(&prefix)) {
            if store.supersede_trigger(old.key())?.is_some() {
                info!(job = %job_key, old = %old.key(), new = %trigger_key, "superseded trigger");
                superseded.push(old.key().clone());
            }
        }
        info!(
            job = %job_key,
            trigger = %trigger_key,
            schedule = schedule.type_name(),
            next_fire_time = ?next_fire_time,
            "scheduled job"
        );
        Ok(ScheduleOutcome::Scheduled {
            trigger: trigger_key,
            superseded,
        })
    }

    /// Remove a job and its triggers. Returns whether the job existed.
    pub fn unschedule_job(&self, key: &JobKey) -> Result<bool, EngineError> {
        let removed = self.inner.res.store.remove_job(key)?;
        if removed {
            info!(job = %key, "unscheduled job");
        }
        Ok(removed)
    }

    /// Cluster-membership callback. Returns whether this node's assignment
    /// changed.
    pub fn cluster_state_changed(&self) -> bool {
        self.inner
            .distributor
            .as_ref()
            .is_some_and(|d| d.cluster_state_changed())
    }

    /// Node-filter settings callback. Returns whether this node's assignment
    /// changed.
    pub fn node_filter_changed(&self, node_filter: Option<String>) -> bool {
        self.inner
            .distributor
            .as_ref()
            .is_some_and(|d| d.node_filter_changed(node_filter))
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        let mut metrics = self
            .inner
            .metrics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        metrics.misfires_handled = self.inner.res.signaler.misfire_count();
        let pool_size = self.inner.res.pool.pool_size().max(1);
        metrics.worker_utilization =
            self.inner.active_runs.load(Ordering::Relaxed) as f64 / pool_size as f64;
        metrics
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}

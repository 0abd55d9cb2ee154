//! Assembles a [`Scheduler`] from tuning values, a job store and a job factory.

use std::sync::Arc;
use std::time::Duration;

use jobmesh_cluster::JobDistributor;
use jobmesh_core::SchedulerConfig;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::EngineError;
use crate::job::JobFactory;
use crate::pool::{ThreadPool, ThreadPriority, WorkerPool};
use crate::scheduler::{Scheduler, SchedulerResources};
use crate::store::{JobStore, SchedulerSignaler, StoreContext};

/// Builder for a running [`Scheduler`].
///
/// Either a fully wired scheduler comes out of [`build`](Self::build) or
/// nothing is left running.
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    node_name: Option<String>,
    instance_id: Option<String>,
    thread_pool: Option<Arc<dyn ThreadPool>>,
    job_store: Option<Arc<dyn JobStore>>,
    job_factory: Option<Arc<dyn JobFactory>>,
    distributor: Option<Arc<JobDistributor>>,
}

impl SchedulerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(SchedulerConfig {
            name: name.into(),
            ..SchedulerConfig::default()
        })
    }

    pub fn from_config(config: SchedulerConfig) -> Self {
        Self {
            config,
            node_name: None,
            instance_id: None,
            thread_pool: None,
            job_store: None,
            job_factory: None,
            distributor: None,
        }
    }

    /// Node name, appended to the pool name as `name[node]`.
    pub fn node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = Some(node_name.into());
        self
    }

    /// Defaults to a random UUID.
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn max_threads(mut self, max_threads: usize) -> Self {
        self.config.max_threads = max_threads;
        self
    }

    pub fn thread_priority(mut self, priority: u8) -> Self {
        self.config.thread_priority = priority;
        self
    }

    pub fn thread_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.thread_keep_alive_secs = keep_alive.as_secs();
        self
    }

    pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.config.max_batch_size = max_batch_size;
        self
    }

    pub fn batch_time_window(mut self, window: Duration) -> Self {
        self.config.batch_time_window_ms = millis(window);
        self
    }

    pub fn idle_wait_time(mut self, idle_wait: Duration) -> Self {
        self.config.idle_wait_time_ms = millis(idle_wait);
        self
    }

    pub fn db_failure_retry_interval(mut self, retry: Duration) -> Self {
        self.config.db_failure_retry_interval_ms = millis(retry);
        self
    }

    pub fn misfire_threshold(mut self, threshold: Duration) -> Self {
        self.config.misfire_threshold_ms = millis(threshold);
        self
    }

    /// Use this pool instead of building a [`WorkerPool`]. It is still
    /// initialized by [`build`](Self::build).
    pub fn thread_pool(mut self, pool: Arc<dyn ThreadPool>) -> Self {
        self.thread_pool = Some(pool);
        self
    }

    pub fn job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.job_store = Some(store);
        self
    }

    pub fn job_factory(mut self, factory: Arc<dyn JobFactory>) -> Self {
        self.job_factory = Some(factory);
        self
    }

    /// Without a distributor every job runs on this node.
    pub fn distributor(mut self, distributor: Arc<JobDistributor>) -> Self {
        self.distributor = Some(distributor);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Initialize the pool and the store, then start the scheduler thread in
    /// standby.
    pub fn build(self) -> Result<Scheduler, EngineError> {
        let cfg = &self.config;
        if cfg.name.trim().is_empty() {
            return Err(EngineError::Config("scheduler name must not be empty".into()));
        }
        if cfg.max_batch_size == 0 {
            return Err(EngineError::Config("max_batch_size must be at least 1".into()));
        }
        let store = self.job_store.clone().ok_or(EngineError::MissingStore)?;
        let factory = self.job_factory.clone().ok_or(EngineError::MissingJobFactory)?;

        let pool: Arc<dyn ThreadPool> = match &self.thread_pool {
            Some(pool) => Arc::clone(pool),
            None => Arc::new(WorkerPool::new(
                self.pool_name(),
                cfg.max_threads,
                ThreadPriority::new(cfg.thread_priority)?,
                cfg.thread_keep_alive(),
            )),
        };
        pool.initialize()?;

        let instance_id = self
            .instance_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let signaler = Arc::new(SchedulerSignaler::new());
        let res = SchedulerResources {
            name: cfg.name.clone(),
            instance_id: instance_id.clone(),
            pool: Arc::clone(&pool),
            store: Arc::clone(&store),
            signaler: Arc::clone(&signaler),
            max_batch_size: cfg.max_batch_size,
            batch_time_window: cfg.batch_time_window(),
            idle_wait_time: cfg.idle_wait_time(),
            db_failure_retry_interval: cfg.db_failure_retry_interval(),
        };

        let context = StoreContext {
            scheduler_name: cfg.name.clone(),
            instance_id,
            misfire_threshold: cfg.misfire_threshold(),
            job_kinds: factory.known_kinds(),
        };
        if let Err(e) = store.initialize(context, signaler) {
            error!(scheduler = %cfg.name, error = %e, "job store initialization failed");
            pool.shutdown(false);
            return Err(e.into());
        }

        match Scheduler::new(res, self.distributor.clone(), factory) {
            Ok(scheduler) => {
                info!(
                    scheduler = %cfg.name,
                    max_threads = pool.pool_size(),
                    idle_wait_ms = cfg.idle_wait_time_ms,
                    batch_time_window_ms = cfg.batch_time_window_ms,
                    distributed = self.distributor.is_some(),
                    "scheduler built"
                );
                Ok(scheduler)
            }
            Err(e) => {
                pool.shutdown(false);
                store.shutdown();
                Err(e)
            }
        }
    }

    fn pool_name(&self) -> String {
        match &self.node_name {
            Some(node) => format!("{}[{}]", self.config.name, node),
            None => self.config.name.clone(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::error::{PoolError, StoreError};
    use crate::job::JobRegistry;
    use crate::memory_store::MemoryJobStore;
    use crate::pool::Runnable;
    use crate::scheduler::SchedulerState;

    fn factory() -> Arc<dyn JobFactory> {
        Arc::new(JobRegistry::with_builtin_kinds())
    }

    #[test]
    fn defaults_match_config() {
        let builder = SchedulerBuilder::new("jobs");
        assert_eq!(builder.config().max_threads, 3);
        assert_eq!(builder.config().max_batch_size, 1);
        assert_eq!(builder.config().thread_priority, 5);
        assert_eq!(builder.config().name, "jobs");
    }

    #[test]
    fn setters_convert_durations() {
        let builder = SchedulerBuilder::new("jobs")
            .idle_wait_time(Duration::from_secs(2))
            .batch_time_window(Duration::from_millis(250))
            .db_failure_retry_interval(Duration::from_secs(1))
            .thread_keep_alive(Duration::from_secs(90));
        let cfg = builder.config();
        assert_eq!(cfg.idle_wait_time_ms, 2_000);
        assert_eq!(cfg.batch_time_window_ms, 250);
        assert_eq!(cfg.db_failure_retry_interval_ms, 1_000);
        assert_eq!(cfg.thread_keep_alive_secs, 90);
    }

    #[test]
    fn missing_collaborators_are_reported() {
        let err = SchedulerBuilder::new("jobs").job_factory(factory()).build();
        assert!(matches!(err, Err(EngineError::MissingStore)));

        let err = SchedulerBuilder::new("jobs")
            .job_store(Arc::new(MemoryJobStore::new()))
            .build();
        assert!(matches!(err, Err(EngineError::MissingJobFactory)));
    }

    #[test]
    fn zero_threads_fail_pool_initialization() {
        let store = Arc::new(MemoryJobStore::new());
        let err = SchedulerBuilder::new("jobs")
            .max_threads(0)
            .job_store(store.clone())
            .job_factory(factory())
            .build();
        assert!(matches!(err, Err(EngineError::Pool(PoolError::InvalidSetting(_)))));
        // The store was never initialized.
        let key = jobmesh_core::JobKey::named("a").unwrap();
        assert!(matches!(store.retrieve_job(&key), Err(StoreError::NotInitialized)));
    }

    #[test]
    fn invalid_priority_rejected() {
        let err = SchedulerBuilder::new("jobs")
            .thread_priority(11)
            .job_store(Arc::new(MemoryJobStore::new()))
            .job_factory(factory())
            .build();
        assert!(matches!(err, Err(EngineError::Pool(PoolError::InvalidSetting(_)))));
    }

    #[test]
    fn zero_batch_size_rejected() {
        let err = SchedulerBuilder::new("jobs")
            .max_batch_size(0)
            .job_store(Arc::new(MemoryJobStore::new()))
            .job_factory(factory())
            .build();
        assert!(matches!(err, Err(EngineError::Config(_))));
    }

    struct RecordingPool {
        inner: WorkerPool,
        shut_down: AtomicBool,
    }

    impl ThreadPool for RecordingPool {
        fn initialize(&self) -> Result<(), PoolError> {
            self.inner.initialize()
        }
        fn run_in_thread(&self, task: Runnable) -> Result<(), PoolError> {
            self.inner.run_in_thread(task)
        }
        fn block_for_available_threads(&self) -> usize {
            self.inner.block_for_available_threads()
        }
        fn pool_size(&self) -> usize {
            self.inner.pool_size()
        }
        fn shutdown(&self, wait_for_jobs: bool) {
            self.shut_down.store(true, Ordering::SeqCst);
            self.inner.shutdown(wait_for_jobs);
        }
    }

    fn recording_pool() -> Arc<RecordingPool> {
        Arc::new(RecordingPool {
            inner: WorkerPool::new("custom", 2, ThreadPriority::NORMAL, Duration::from_secs(60)),
            shut_down: AtomicBool::new(false),
        })
    }

    #[test]
    fn store_failure_shuts_the_pool_down() {
        let store = Arc::new(MemoryJobStore::new());
        store.shutdown();
        let pool = recording_pool();
        let err = SchedulerBuilder::new("jobs")
            .thread_pool(pool.clone())
            .job_store(store)
            .job_factory(factory())
            .build();
        assert!(matches!(err, Err(EngineError::Store(StoreError::Unavailable(_)))));
        assert!(pool.shut_down.load(Ordering::SeqCst));
    }

    #[test]
    fn custom_pool_is_used_and_scheduler_starts_in_standby() {
        let pool = recording_pool();
        let scheduler = SchedulerBuilder::new("jobs")
            .node_name("node-a")
            .instance_id("instance-1")
            .thread_pool(pool.clone())
            .job_store(Arc::new(MemoryJobStore::new()))
            .job_factory(factory())
            .build()
            .unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Standby);
        assert_eq!(scheduler.instance_id(), "instance-1");
        assert_eq!(scheduler.metrics().worker_utilization, 0.0);

        scheduler.shutdown(true);
        assert!(pool.shut_down.load(Ordering::SeqCst));
        assert!(scheduler.is_shutdown());
    }

    #[test]
    fn pool_name_includes_node() {
        let builder = SchedulerBuilder::new("jobs").node_name("node-a");
        assert_eq!(builder.pool_name(), "jobs[node-a]");
        assert_eq!(SchedulerBuilder::new("jobs").pool_name(), "jobs");
    }
}

use jobmesh_core::JobKey;
use jobmesh_schedule::ScheduleError;

/// Worker pool failures.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("thread pool '{0}' has not been initialized")]
    NotInitialized(String),

    #[error("thread pool '{0}' is shut down")]
    ShutDown(String),

    #[error("invalid thread pool setting: {0}")]
    InvalidSetting(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Job store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job store has not been initialized")]
    NotInitialized,

    #[error("job store unavailable: {0}")]
    Unavailable(String),

    #[error("job {0} not found")]
    JobNotFound(JobKey),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error(transparent)]
    Trigger(#[from] ScheduleError),
}

/// Scheduler assembly and handle errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("thread pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("job store error: {0}")]
    Store(#[from] StoreError),

    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("invalid scheduler configuration: {0}")]
    Config(String),

    #[error("no job store configured")]
    MissingStore,

    #[error("no job factory configured")]
    MissingJobFactory,

    #[error("job kind '{0}' is already registered")]
    DuplicateJobKind(String),

    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(std::io::Error),

    #[error("scheduler '{0}' is shut down")]
    ShutDown(String),
}

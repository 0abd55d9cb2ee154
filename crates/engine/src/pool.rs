//! Worker threads that execute fired jobs.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::error::PoolError;

#[cfg(test)]
mod tests;

/// A unit of work handed to a worker.
pub type Runnable = Box<dyn FnOnce() + Send + 'static>;

/// Execution capacity used by the scheduler loop.
///
/// The loop asks for capacity with [`block_for_available_threads`] before
/// acquiring triggers, so `run_in_thread` normally finds a free slot.
///
/// [`block_for_available_threads`]: ThreadPool::block_for_available_threads
pub trait ThreadPool: Send + Sync {
    /// Validate settings and make the pool ready. Must succeed before any
    /// work is submitted.
    fn initialize(&self) -> Result<(), PoolError>;

    /// Run `task` on a worker, waiting for a free slot if all are taken.
    /// Blocks the caller, so it must not be called from async code.
    fn run_in_thread(&self, task: Runnable) -> Result<(), PoolError>;

    /// Wait until at least one slot is free and return the number of free
    /// slots. Returns 0 once the pool is shut down.
    fn block_for_available_threads(&self) -> usize;

    /// Maximum number of concurrently running tasks.
    fn pool_size(&self) -> usize;

    /// Stop accepting work. With `wait_for_jobs` queued and running work is
    /// drained and all workers joined; otherwise queued work is dropped and
    /// the call returns without waiting for running tasks.
    fn shutdown(&self, wait_for_jobs: bool);
}

/// Scheduling priority hint for worker threads, 1 (lowest) to 10 (highest).
///
/// Neither std nor tokio can set OS thread priorities, so the value is
/// validated and reported but does not change scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ThreadPriority(u8);

impl ThreadPriority {
    pub const MIN: ThreadPriority = ThreadPriority(1);
    pub const NORMAL: ThreadPriority = ThreadPriority(5);
    pub const MAX: ThreadPriority = ThreadPriority(10);

    pub fn new(value: u8) -> Result<Self, PoolError> {
        if !(Self::MIN.0..=Self::MAX.0).contains(&value) {
            return Err(PoolError::InvalidSetting(format!(
                "thread priority {value} outside {}..={}",
                Self::MIN.0,
                Self::MAX.0
            )));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for ThreadPriority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl fmt::Display for ThreadPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

enum PoolState {
    Created,
    Running(Running),
    ShutDown,
}

struct Running {
    runtime: Runtime,
    /// One permit per task allowed to run at once.
    slots: Arc<Semaphore>,
}

/// Bounded pool of named worker threads on tokio's blocking pool.
///
/// Threads are spawned on demand up to `max_threads` and retire after
/// sitting idle for `keep_alive`. A semaphore with `max_threads` permits
/// bounds the tasks admitted at once, so every admitted task gets its own
/// thread.
pub struct WorkerPool {
    name: String,
    max_threads: usize,
    priority: ThreadPriority,
    keep_alive: Duration,
    state: Mutex<PoolState>,
    workers: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, max_threads: usize, priority: ThreadPriority, keep_alive: Duration) -> Self {
        Self {
            name: name.into(),
            max_threads,
            priority,
            keep_alive,
            state: Mutex::new(PoolState::Created),
            workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> ThreadPriority {
        self.priority
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// Live worker threads, busy or idle.
    pub fn worker_count(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    /// Tasks admitted and not yet finished.
    pub fn busy_count(&self) -> usize {
        match &*self.lock() {
            PoolState::Running(r) => self.max_threads - r.slots.available_permits(),
            PoolState::Created | PoolState::ShutDown => 0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handle and slots of a running pool.
    fn running(&self) -> Result<(Handle, Arc<Semaphore>), PoolError> {
        match &*self.lock() {
            PoolState::Running(r) => Ok((r.runtime.handle().clone(), Arc::clone(&r.slots))),
            PoolState::Created => Err(PoolError::NotInitialized(self.name.clone())),
            PoolState::ShutDown => Err(PoolError::ShutDown(self.name.clone())),
        }
    }

    fn build_runtime(&self) -> Result<Runtime, PoolError> {
        let name = self.name.clone();
        let next_id = AtomicUsize::new(0);
        let started = Arc::clone(&self.workers);
        let stopped = Arc::clone(&self.workers);
        // No async workers: every thread this runtime spawns is a blocking
        // worker, so the start/stop hooks count exactly the pool's threads.
        let runtime = Builder::new_current_thread()
            .max_blocking_threads(self.max_threads)
            .thread_keep_alive(self.keep_alive)
            .thread_name_fn(move || format!("{name}/worker_{}", next_id.fetch_add(1, Ordering::Relaxed) + 1))
            .on_thread_start(move || {
                let workers = started.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(worker = thread::current().name().unwrap_or("worker"), workers, "spawned worker");
            })
            .on_thread_stop(move || {
                stopped.fetch_sub(1, Ordering::SeqCst);
                debug!(worker = thread::current().name().unwrap_or("worker"), "worker retired");
            })
            .build()?;
        Ok(runtime)
    }
}

impl ThreadPool for WorkerPool {
    fn initialize(&self) -> Result<(), PoolError> {
        if self.max_threads == 0 {
            return Err(PoolError::InvalidSetting(format!(
                "thread pool '{}' needs at least one thread",
                self.name
            )));
        }
        if self.max_threads > Semaphore::MAX_PERMITS || u32::try_from(self.max_threads).is_err() {
            return Err(PoolError::InvalidSetting(format!(
                "thread pool '{}' cannot have {} threads",
                self.name, self.max_threads
            )));
        }
        let mut state = self.lock();
        match *state {
            PoolState::ShutDown => return Err(PoolError::ShutDown(self.name.clone())),
            PoolState::Running(_) => return Ok(()),
            PoolState::Created => {}
        }
        *state = PoolState::Running(Running {
            runtime: self.build_runtime()?,
            slots: Arc::new(Semaphore::new(self.max_threads)),
        });
        info!(
            pool = %self.name,
            max_threads = self.max_threads,
            priority = %self.priority,
            keep_alive_secs = self.keep_alive.as_secs(),
            "thread pool initialized"
        );
        Ok(())
    }

    fn run_in_thread(&self, task: Runnable) -> Result<(), PoolError> {
        let (handle, slots) = self.running()?;
        let slot = handle
            .block_on(slots.acquire_owned())
            .map_err(|_| PoolError::ShutDown(self.name.clone()))?;
        handle.spawn_blocking(move || {
            let _slot = slot;
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!(worker = thread::current().name().unwrap_or("worker"), "task panicked");
            }
        });
        Ok(())
    }

    fn block_for_available_threads(&self) -> usize {
        let Ok((handle, slots)) = self.running() else {
            return 0;
        };
        let available = match handle.block_on(slots.acquire()) {
            Ok(permit) => {
                drop(permit);
                slots.available_permits()
            }
            Err(_) => 0,
        };
        available
    }

    fn pool_size(&self) -> usize {
        self.max_threads
    }

    fn shutdown(&self, wait_for_jobs: bool) {
        let Running { runtime, slots } = match std::mem::replace(&mut *self.lock(), PoolState::ShutDown) {
            PoolState::Running(running) => running,
            PoolState::Created | PoolState::ShutDown => return,
        };

        if !wait_for_jobs {
            slots.close();
            runtime.shutdown_background();
            info!(pool = %self.name, "thread pool shut down without waiting");
            return;
        }

        // Holding every permit means every admitted task has finished.
        let all = u32::try_from(self.max_threads).unwrap_or(u32::MAX);
        if let Ok(permits) = runtime.block_on(slots.acquire_many(all)) {
            drop(permits);
        }
        slots.close();
        // Dropping the runtime joins the idle workers.
        drop(runtime);
        info!(pool = %self.name, "thread pool drained and shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let state = std::mem::replace(&mut *self.lock(), PoolState::ShutDown);
        if let PoolState::Running(Running { runtime, slots }) = state {
            slots.close();
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("max_threads", &self.max_threads)
            .field("priority", &self.priority)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

//! The job store contract and the signal channel it notifies the scheduler on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobmesh_core::JobKey;
use jobmesh_schedule::{Trigger, TriggerKey};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::JobDefinition;

/// What the scheduler tells its store at initialization.
#[derive(Debug, Clone)]
pub struct StoreContext {
    pub scheduler_name: String,
    pub instance_id: String,
    /// Triggers later than this count as misfired on acquisition.
    pub misfire_threshold: Duration,
    /// Job kinds the factory can instantiate.
    pub job_kinds: Vec<String>,
}

/// A trigger that has been fired, together with its job.
#[derive(Debug, Clone)]
pub struct FiredBundle {
    pub fire_instance_id: Uuid,
    pub job: JobDefinition,
    /// The trigger after firing: state `Firing`, next fire time advanced.
    pub trigger: Trigger,
    pub scheduled_fire_time: DateTime<Utc>,
    pub fire_time: DateTime<Utc>,
    pub previous_fire_time: Option<DateTime<Utc>>,
}

/// Durable job and trigger storage.
///
/// The store is the single source of truth for which triggers are due. It
/// must tolerate concurrent use by the scheduler loop and worker threads, and
/// call [`SchedulerSignaler::signal_scheduling_change`] whenever a trigger may
/// have become due earlier than the scheduler expects.
pub trait JobStore: Send + Sync {
    fn initialize(&self, context: StoreContext, signaler: Arc<SchedulerSignaler>) -> Result<(), StoreError>;

    /// Store a job definition. Fails with `AlreadyExists` unless `replace`.
    fn store_job(&self, job: JobDefinition, replace: bool) -> Result<(), StoreError>;

    fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDefinition>, StoreError>;

    /// Remove a job and all its triggers. Returns whether the job existed.
    fn remove_job(&self, key: &JobKey) -> Result<bool, StoreError>;

    /// Store and arm a pending trigger for an existing job.
    fn store_trigger(&self, trigger: Trigger, replace: bool) -> Result<(), StoreError>;

    /// Remove a trigger, returning it in its final `Removed` state.
    fn remove_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, StoreError>;

    /// Drop a trigger that a new identity replaces, returning it in its
    /// final `Superseded` state.
    fn supersede_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, StoreError>;

    fn triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>, StoreError>;

    /// Reserve up to `max_count` armed triggers due no later than
    /// `no_later_than + time_window`, earliest first. Misfired triggers are
    /// reconciled per their misfire policy before selection.
    fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<Trigger>, StoreError>;

    /// Give back a reserved trigger that will not be fired.
    fn release_acquired_trigger(&self, key: &TriggerKey) -> Result<(), StoreError>;

    /// Fire reserved triggers. Triggers removed or superseded since they were
    /// acquired are left out of the result.
    fn triggers_fired(&self, keys: &[TriggerKey]) -> Result<Vec<FiredBundle>, StoreError>;

    /// The firing of `key` finished; re-arm it for its next fire time.
    fn triggered_job_complete(&self, key: &TriggerKey) -> Result<(), StoreError>;

    fn shutdown(&self);
}

/// Wake-up channel from the store (and the scheduler's own handle) to the
/// scheduler loop.
///
/// Pending signals merge into one: the earliest candidate wins, and an
/// unknown candidate wins over any known one.
#[derive(Debug)]
pub struct SchedulerSignaler {
    pending: watch::Sender<Option<Signal>>,
    misfires: AtomicU64,
}

/// A scheduling change. `candidate` is the earliest new fire time, or `None`
/// when unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    pub candidate: Option<DateTime<Utc>>,
}

impl Default for SchedulerSignaler {
    fn default() -> Self {
        Self {
            pending: watch::channel(None).0,
            misfires: AtomicU64::new(0),
        }
    }
}

impl SchedulerSignaler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that a trigger may be due at `candidate` and wake the loop.
    pub fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>) {
        self.pending.send_modify(|pending| {
            let merged = match (*pending, candidate) {
                (None, c) => Signal { candidate: c },
                (Some(Signal { candidate: Some(a) }), Some(b)) => Signal { candidate: Some(a.min(b)) },
                _ => Signal { candidate: None },
            };
            *pending = Some(merged);
        });
    }

    /// Record a misfired trigger reconciled by the store.
    pub fn notify_trigger_misfired(&self, trigger: &Trigger) {
        self.misfires.fetch_add(1, Ordering::Relaxed);
        info!(
            trigger = %trigger.key(),
            job = %trigger.job_key(),
            policy = ?trigger.misfire_policy(),
            next_fire_time = ?trigger.next_fire_time(),
            "trigger misfired"
        );
    }

    pub fn misfire_count(&self) -> u64 {
        self.misfires.load(Ordering::Relaxed)
    }

    /// Wait up to `timeout` for a signal and consume it. Needs a runtime
    /// with the time driver enabled.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<Signal> {
        let mut rx = self.pending.subscribe();
        // An already pending signal completes the wait immediately.
        let _ = tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await;
        drop(rx);
        let signal = self.take();
        if signal.is_some() {
            debug!(?signal, "scheduler signalled");
        }
        signal
    }

    /// Consume the pending signal without waiting.
    pub fn take(&self) -> Option<Signal> {
        let mut taken = None;
        self.pending.send_if_modified(|pending| {
            taken = pending.take();
            taken.is_some()
        });
        taken
    }

    /// Drop any pending signal.
    pub fn clear(&self) {
        self.take();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use chrono::TimeDelta;

    use super::*;

    #[tokio::test]
    async fn wait_times_out_without_signal() {
        let s = SchedulerSignaler::new();
        assert_eq!(s.wait_timeout(Duration::from_millis(10)).await, None);
    }

    #[tokio::test]
    async fn signal_from_another_thread_wakes_waiter_and_is_consumed() {
        let s = Arc::new(SchedulerSignaler::new());
        let signaller = {
            let s = Arc::clone(&s);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                s.signal_scheduling_change(None);
            })
        };
        assert_eq!(s.wait_timeout(Duration::from_secs(5)).await, Some(Signal { candidate: None }));
        signaller.join().unwrap();
        assert_eq!(s.wait_timeout(Duration::from_millis(1)).await, None);
    }

    #[tokio::test]
    async fn pending_signal_completes_zero_timeout_wait() {
        let s = SchedulerSignaler::new();
        s.signal_scheduling_change(None);
        assert_eq!(s.wait_timeout(Duration::ZERO).await, Some(Signal { candidate: None }));
    }

    #[test]
    fn pending_signals_keep_the_earliest_candidate() {
        let s = SchedulerSignaler::new();
        let t = Utc::now();
        s.signal_scheduling_change(Some(t + TimeDelta::seconds(10)));
        s.signal_scheduling_change(Some(t + TimeDelta::seconds(5)));
        assert_eq!(s.take(), Some(Signal { candidate: Some(t + TimeDelta::seconds(5)) }));

        s.signal_scheduling_change(Some(t));
        s.signal_scheduling_change(None);
        assert_eq!(s.take(), Some(Signal { candidate: None }));
        assert_eq!(s.take(), None);
    }

    #[test]
    fn clear_drops_pending_signal() {
        let s = SchedulerSignaler::new();
        s.signal_scheduling_change(None);
        s.clear();
        assert_eq!(s.take(), None);
    }
}

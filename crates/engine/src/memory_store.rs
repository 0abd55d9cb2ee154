//! Non-durable [`JobStore`] kept entirely in memory.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use jobmesh_core::JobKey;
use jobmesh_schedule::{Trigger, TriggerKey, TriggerState};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::JobDefinition;
use crate::store::{FiredBundle, JobStore, SchedulerSignaler, StoreContext};

#[cfg(test)]
mod tests;

#[derive(Default)]
struct MemoryState {
    context: Option<StoreContext>,
    signaler: Option<Arc<SchedulerSignaler>>,
    jobs: BTreeMap<JobKey, JobDefinition>,
    triggers: BTreeMap<TriggerKey, Trigger>,
    acquired: BTreeSet<TriggerKey>,
    shut_down: bool,
}

impl MemoryState {
    fn ready(&mut self) -> Result<&mut Self, StoreError> {
        if self.shut_down {
            return Err(StoreError::Unavailable("job store is shut down".into()));
        }
        if self.context.is_none() {
            return Err(StoreError::NotInitialized);
        }
        Ok(self)
    }

    fn signal(&self, candidate: Option<DateTime<Utc>>) {
        if let Some(signaler) = &self.signaler {
            signaler.signal_scheduling_change(candidate);
        }
    }

    fn misfire_threshold(&self) -> Duration {
        self.context
            .as_ref()
            .map(|c| c.misfire_threshold)
            .unwrap_or_default()
    }
}

/// Reference job store. Everything is lost on restart, so it suits tests and
/// single-process deployments whose jobs are re-registered at startup.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn trigger(&self, key: &TriggerKey) -> Option<Trigger> {
        self.lock().triggers.get(key).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn trigger_count(&self) -> usize {
        self.lock().triggers.len()
    }
}

impl JobStore for MemoryJobStore {
    fn initialize(&self, context: StoreContext, signaler: Arc<SchedulerSignaler>) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.shut_down {
            return Err(StoreError::Unavailable("job store is shut down".into()));
        }
        info!(
            scheduler = %context.scheduler_name,
            instance = %context.instance_id,
            misfire_threshold_ms = context.misfire_threshold.as_millis() as u64,
            "memory job store initialized"
        );
        state.context = Some(context);
        state.signaler = Some(signaler);
        Ok(())
    }

    fn store_job(&self, job: JobDefinition, replace: bool) -> Result<(), StoreError> {
        let mut guard = self.lock();
        let state = guard.ready()?;
        if !replace && state.jobs.contains_key(&job.key) {
            return Err(StoreError::AlreadyExists(format!("job {}", job.key)));
        }
        debug!(job = %job.key, kind = %job.kind, "stored job");
        state.jobs.insert(job.key.clone(), job);
        Ok(())
    }

    fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDefinition>, StoreError> {
        let mut guard = self.lock();
        Ok(guard.ready()?.jobs.get(key).cloned())
    }

    fn remove_job(&self, key: &JobKey) -> Result<bool, StoreError> {
        let mut guard = self.lock();
        let state = guard.ready()?;
        let existed = state.jobs.remove(key).is_some();
        let keys: Vec<TriggerKey> = state
            .triggers
            .values()
            .filter(|t| t.job_key() == key)
            .map(|t| t.key().clone())
            .collect();
        for trigger_key in &keys {
            if let Some(mut t) = state.triggers.remove(trigger_key) {
                t.remove()?;
            }
            state.acquired.remove(trigger_key);
        }
        if existed {
            debug!(job = %key, triggers = keys.len(), "removed job");
        }
        Ok(existed)
    }

    fn store_trigger(&self, mut trigger: Trigger, replace: bool) -> Result<(), StoreError> {
        let mut guard = self.lock();
        let state = guard.ready()?;
        if !state.jobs.contains_key(trigger.job_key()) {
            return Err(StoreError::JobNotFound(trigger.job_key().clone()));
        }
        if !replace && state.triggers.contains_key(trigger.key()) {
            return Err(StoreError::AlreadyExists(format!("trigger {}", trigger.key())));
        }
        trigger.arm()?;
        let next = trigger.next_fire_time();
        debug!(trigger = %trigger.key(), job = %trigger.job_key(), next_fire_time = ?next, "stored trigger");
        state.acquired.remove(trigger.key());
        state.triggers.insert(trigger.key().clone(), trigger);
        state.signal(next);
        Ok(())
    }

    fn remove_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, StoreError> {
        let mut guard = self.lock();
        let state = guard.ready()?;
        state.acquired.remove(key);
        match state.triggers.remove(key) {
            Some(mut t) => {
                t.remove()?;
                Ok(Some(t))
            }
            None => Ok(None),
        }
    }

    fn supersede_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, StoreError> {
        let mut guard = self.lock();
        let state = guard.ready()?;
        state.acquired.remove(key);
        match state.triggers.remove(key) {
            Some(mut t) => {
                t.supersede()?;
                Ok(Some(t))
            }
            None => Ok(None),
        }
    }

    fn triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>, StoreError> {
        let mut guard = self.lock();
        let state = guard.ready()?;
        Ok(state
            .triggers
            .values()
            .filter(|t| t.job_key() == key)
            .cloned()
            .collect())
    }

    fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<Trigger>, StoreError> {
        let mut guard = self.lock();
        let state = guard.ready()?;
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let threshold = state.misfire_threshold();
        let window = TimeDelta::from_std(time_window).unwrap_or(TimeDelta::MAX);
        let horizon = |t: DateTime<Utc>| t.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC);

        let MemoryState {
            triggers,
            acquired,
            signaler,
            ..
        } = state;

        let mut candidates: Vec<(DateTime<Utc>, TriggerKey)> = Vec::new();
        for trigger in triggers.values_mut() {
            if trigger.state() != TriggerState::Armed || acquired.contains(trigger.key()) {
                continue;
            }
            if trigger.is_misfired(now, threshold) {
                trigger.update_after_misfire(now);
                if let Some(s) = signaler.as_ref() {
                    s.notify_trigger_misfired(trigger);
                }
            }
            match trigger.next_fire_time() {
                Some(next) if next <= horizon(no_later_than) => candidates.push((next, trigger.key().clone())),
                _ => {}
            }
        }
        candidates.sort();

        let mut batch_end = horizon(no_later_than);
        let mut batch = Vec::new();
        for (next, key) in candidates {
            if batch.len() >= max_count || next > batch_end {
                break;
            }
            if batch.is_empty() {
                batch_end = horizon(next.max(no_later_than));
            }
            if let Some(t) = triggers.get(&key) {
                acquired.insert(key);
                batch.push(t.clone());
            }
        }
        Ok(batch)
    }

    fn release_acquired_trigger(&self, key: &TriggerKey) -> Result<(), StoreError> {
        let mut guard = self.lock();
        guard.ready()?.acquired.remove(key);
        Ok(())
    }

    fn triggers_fired(&self, keys: &[TriggerKey]) -> Result<Vec<FiredBundle>, StoreError> {
        let mut guard = self.lock();
        let state = guard.ready()?;
        let now = Utc::now();
        let mut bundles = Vec::with_capacity(keys.len());

        for key in keys {
            if !state.acquired.remove(key) {
                continue;
            }
            let Some(trigger) = state.triggers.get_mut(key) else {
                continue;
            };
            if trigger.state() != TriggerState::Armed {
                continue;
            }
            let Some(job) = state.jobs.get(trigger.job_key()).cloned() else {
                warn!(trigger = %key, job = %trigger.job_key(), "trigger references a missing job");
                continue;
            };
            let previous_fire_time = trigger.previous_fire_time();
            let scheduled_fire_time = trigger.fire()?;
            bundles.push(FiredBundle {
                fire_instance_id: Uuid::new_v4(),
                job,
                trigger: trigger.clone(),
                scheduled_fire_time,
                fire_time: now,
                previous_fire_time,
            });
        }
        Ok(bundles)
    }

    fn triggered_job_complete(&self, key: &TriggerKey) -> Result<(), StoreError> {
        let mut guard = self.lock();
        let state = guard.ready()?;
        let Some(trigger) = state.triggers.get_mut(key) else {
            return Ok(());
        };
        if trigger.state() != TriggerState::Firing {
            return Ok(());
        }
        trigger.complete()?;
        let next = trigger.next_fire_time();
        if next.is_none() {
            info!(trigger = %key, "trigger has no further fire time, removing");
            if let Some(mut t) = state.triggers.remove(key) {
                t.remove()?;
            }
            return Ok(());
        }
        state.signal(next);
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = self.lock();
        if !state.shut_down {
            state.shut_down = true;
            info!(
                jobs = state.jobs.len(),
                triggers = state.triggers.len(),
                "memory job store shut down"
            );
        }
    }
}

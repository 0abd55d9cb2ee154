use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use jobmesh_schedule::{Trigger, TriggerKey};
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::store::{FiredBundle, Signal};

use super::core::{Inner, SchedulerState};
use super::run_shell::RunShell;

/// Firing this close to the scheduled time counts as on time.
const ON_TIME_SLACK_MS: i64 = 2;

/// Control loop: wait for capacity, acquire due triggers, wait for their fire
/// time, fire them and hand the jobs to the pool. Returns on shutdown.
///
/// `waits` drives every timed wait of the loop; pool and store calls stay
/// outside it since they block.
pub(super) fn run_loop(inner: Arc<Inner>, waits: Runtime) {
    let res = &inner.res;
    let mut control = inner.subscribe();
    let mut store_failing = false;
    debug!(scheduler = %res.name, "scheduler thread running");

    loop {
        if !waits.block_on(wait_while_paused(&mut control)) {
            break;
        }
        let available = res.pool.block_for_available_threads();
        if available == 0 || inner.is_halted() {
            break;
        }
        if inner.state() != SchedulerState::Started {
            continue;
        }

        res.signaler.clear();
        let now = Utc::now();
        let no_later_than = now
            .checked_add_signed(delta(res.idle_wait_time))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let max_count = available.min(res.max_batch_size);

        let triggers = match res
            .store
            .acquire_next_triggers(no_later_than, max_count, res.batch_time_window)
        {
            Ok(triggers) => {
                if store_failing {
                    info!(scheduler = %res.name, "job store reachable again");
                    store_failing = false;
                }
                triggers
            }
            Err(e) => {
                if !store_failing {
                    error!(
                        scheduler = %res.name,
                        error = %e,
                        retry_ms = res.db_failure_retry_interval.as_millis() as u64,
                        "could not acquire triggers, retrying"
                    );
                    store_failing = true;
                }
                inner.with_metrics(|m| m.store_failures += 1);
                waits.block_on(pause_for(&mut control, res.db_failure_retry_interval));
                continue;
            }
        };

        if triggers.is_empty() {
            waits.block_on(res.signaler.wait_timeout(res.idle_wait_time));
            continue;
        }

        if !waits.block_on(wait_until_due(&inner, &triggers)) {
            release_all(&inner, &triggers);
            continue;
        }

        let keys: Vec<TriggerKey> = triggers.iter().map(|t| t.key().clone()).collect();
        let bundles = match res.store.triggers_fired(&keys) {
            Ok(bundles) => bundles,
            Err(e) => {
                error!(scheduler = %res.name, error = %e, triggers = keys.len(), "could not fire triggers");
                inner.with_metrics(|m| m.store_failures += 1);
                release_all(&inner, &triggers);
                waits.block_on(pause_for(&mut control, res.db_failure_retry_interval));
                continue;
            }
        };

        for bundle in bundles {
            dispatch(&inner, bundle);
        }
    }

    info!(scheduler = %res.name, "scheduler thread stopped");
}

/// Block while in standby. Returns `false` once shut down.
async fn wait_while_paused(control: &mut watch::Receiver<SchedulerState>) -> bool {
    match control.wait_for(|s| *s != SchedulerState::Standby).await {
        Ok(state) => *state != SchedulerState::Shutdown,
        Err(_) => false,
    }
}

/// Sleep for `duration` unless shut down first.
async fn pause_for(control: &mut watch::Receiver<SchedulerState>, duration: Duration) {
    let _ = tokio::time::timeout(duration, control.wait_for(|s| *s == SchedulerState::Shutdown)).await;
}

/// Sleep until the earliest acquired trigger is due.
///
/// Returns `false` when the batch must be given back: the scheduler left the
/// started state, or a signal announced a trigger due before this batch.
async fn wait_until_due(inner: &Inner, triggers: &[Trigger]) -> bool {
    let Some(due) = triggers.iter().filter_map(Trigger::next_fire_time).min() else {
        return true;
    };
    loop {
        if inner.state() != SchedulerState::Started {
            return false;
        }
        let remaining = due - Utc::now();
        if remaining <= TimeDelta::milliseconds(ON_TIME_SLACK_MS) {
            return true;
        }
        let Ok(timeout) = remaining.to_std() else {
            return true;
        };
        if let Some(signal) = inner.res.signaler.wait_timeout(timeout).await {
            if is_earlier(signal, due) {
                debug!(
                    scheduler = %inner.res.name,
                    candidate = ?signal.candidate,
                    acquired_due = %due,
                    "earlier trigger signalled, releasing batch"
                );
                return false;
            }
        }
    }
}

fn is_earlier(signal: Signal, due: DateTime<Utc>) -> bool {
    signal.candidate.map_or(true, |candidate| candidate < due)
}

fn release_all(inner: &Inner, triggers: &[Trigger]) {
    for trigger in triggers {
        if let Err(e) = inner.res.store.release_acquired_trigger(trigger.key()) {
            warn!(trigger = %trigger.key(), error = %e, "could not release acquired trigger");
        }
    }
}

/// Hand a fired trigger's job to the pool, or skip it when another node owns
/// it.
fn dispatch(inner: &Arc<Inner>, bundle: FiredBundle) {
    let job_key = bundle.job.key.clone();
    let trigger_key = bundle.trigger.key().clone();
    inner.with_metrics(|m| m.triggers_fired += 1);

    let selected = inner
        .distributor
        .as_ref()
        .map_or(true, |d| d.is_job_selected_for(&job_key, bundle.job.partitioning));
    if !selected {
        debug!(job = %job_key, trigger = %trigger_key, "job assigned to another node, skipping");
        inner.with_metrics(|m| m.record_skip(&job_key.to_string()));
        complete(inner, &trigger_key);
        return;
    }

    let shell = RunShell::new(Arc::clone(inner), bundle);
    if let Err(e) = inner.res.pool.run_in_thread(Box::new(move || shell.run())) {
        warn!(job = %job_key, trigger = %trigger_key, error = %e, "could not hand job to the thread pool");
        complete(inner, &trigger_key);
    }
}

fn complete(inner: &Inner, key: &TriggerKey) {
    if let Err(e) = inner.res.store.triggered_job_complete(key) {
        warn!(trigger = %key, error = %e, "could not complete trigger");
        inner.with_metrics(|m| m.store_failures += 1);
    }
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

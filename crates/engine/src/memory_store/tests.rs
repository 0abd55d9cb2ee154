use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use jobmesh_core::JobKey;
use jobmesh_schedule::{MisfirePolicy, Trigger, TriggerKey, TriggerState};

use crate::error::StoreError;
use crate::job::JobDefinition;
use crate::memory_store::MemoryJobStore;
use crate::store::{JobStore, SchedulerSignaler, StoreContext};

fn context() -> StoreContext {
    StoreContext {
        scheduler_name: "test".into(),
        instance_id: "i-1".into(),
        misfire_threshold: Duration::from_secs(10),
        job_kinds: vec!["noop".into()],
    }
}

fn store() -> (MemoryJobStore, Arc<SchedulerSignaler>) {
    let store = MemoryJobStore::new();
    let signaler = Arc::new(SchedulerSignaler::new());
    store.initialize(context(), Arc::clone(&signaler)).unwrap();
    (store, signaler)
}

fn job(name: &str) -> JobDefinition {
    JobDefinition::new(JobKey::named(name).unwrap(), "noop")
}

fn trigger(job: &str, name: &str, start: DateTime<Utc>, period_secs: u64) -> Trigger {
    Trigger::new(
        TriggerKey::new(name, "DEFAULT"),
        JobKey::named(job).unwrap(),
        start,
        Duration::from_secs(period_secs),
        MisfirePolicy::FireNow,
    )
    .unwrap()
}

fn keys(triggers: &[Trigger]) -> Vec<String> {
    triggers.iter().map(|t| t.key().name.clone()).collect()
}

#[test]
fn operations_require_initialization() {
    let store = MemoryJobStore::new();
    assert!(matches!(store.store_job(job("a"), false), Err(StoreError::NotInitialized)));
}

#[test]
fn trigger_needs_its_job() {
    let (store, _) = store();
    let err = store.store_trigger(trigger("a", "t", Utc::now(), 60), false);
    assert!(matches!(err, Err(StoreError::JobNotFound(_))));
}

#[test]
fn duplicate_objects_rejected_without_replace() {
    let (store, _) = store();
    store.store_job(job("a"), false).unwrap();
    assert!(matches!(store.store_job(job("a"), false), Err(StoreError::AlreadyExists(_))));
    store.store_job(job("a"), true).unwrap();

    store.store_trigger(trigger("a", "t", Utc::now(), 60), false).unwrap();
    assert!(matches!(
        store.store_trigger(trigger("a", "t", Utc::now(), 60), false),
        Err(StoreError::AlreadyExists(_))
    ));
    store.store_trigger(trigger("a", "t", Utc::now(), 30), true).unwrap();
    assert_eq!(store.trigger_count(), 1);
}

#[test]
fn stored_trigger_is_armed_and_signals() {
    let (store, signaler) = store();
    let start = Utc::now() + TimeDelta::seconds(30);
    store.store_job(job("a"), false).unwrap();
    store.store_trigger(trigger("a", "t", start, 60), false).unwrap();

    let stored = store.trigger(&TriggerKey::new("t", "DEFAULT")).unwrap();
    assert_eq!(stored.state(), TriggerState::Armed);
    let signal = signaler.take().unwrap();
    assert_eq!(signal.candidate, Some(start));
}

#[test]
fn acquire_takes_earliest_due_up_to_max_count() {
    let (store, _) = store();
    let now = Utc::now();
    store.store_job(job("a"), false).unwrap();
    store.store_trigger(trigger("a", "late", now + TimeDelta::seconds(3), 60), false).unwrap();
    store.store_trigger(trigger("a", "early", now + TimeDelta::seconds(1), 60), false).unwrap();
    store.store_trigger(trigger("a", "far", now + TimeDelta::hours(1), 60), false).unwrap();

    let horizon = now + TimeDelta::seconds(5);
    let first = store.acquire_next_triggers(horizon, 1, Duration::ZERO).unwrap();
    assert_eq!(keys(&first), vec!["early"]);

    // Already reserved triggers are not handed out twice.
    let second = store.acquire_next_triggers(horizon, 5, Duration::ZERO).unwrap();
    assert_eq!(keys(&second), vec!["late"]);
    assert!(store.acquire_next_triggers(horizon, 5, Duration::ZERO).unwrap().is_empty());

    store.release_acquired_trigger(first[0].key()).unwrap();
    let again = store.acquire_next_triggers(horizon, 5, Duration::ZERO).unwrap();
    assert_eq!(keys(&again), vec!["early"]);

    assert!(store.acquire_next_triggers(horizon, 0, Duration::ZERO).unwrap().is_empty());
}

#[test]
fn time_window_batches_near_simultaneous_triggers() {
    let (store, _) = store();
    let now = Utc::now() + TimeDelta::seconds(1);
    store.store_job(job("a"), false).unwrap();
    store.store_trigger(trigger("a", "t1", now, 60), false).unwrap();
    store.store_trigger(trigger("a", "t2", now + TimeDelta::milliseconds(300), 60), false).unwrap();
    store.store_trigger(trigger("a", "t3", now + TimeDelta::seconds(5), 60), false).unwrap();

    let batch = store.acquire_next_triggers(now, 10, Duration::from_millis(500)).unwrap();
    assert_eq!(keys(&batch), vec!["t1", "t2"]);
}

#[test]
fn fire_and_complete_cycle() {
    let (store, signaler) = store();
    let start = Utc::now() - TimeDelta::seconds(1);
    store.store_job(job("a"), false).unwrap();
    store.store_trigger(trigger("a", "t", start, 60), false).unwrap();
    signaler.clear();

    let acquired = store.acquire_next_triggers(Utc::now(), 1, Duration::ZERO).unwrap();
    let bundles = store.triggers_fired(&[acquired[0].key().clone()]).unwrap();
    assert_eq!(bundles.len(), 1);
    let bundle = &bundles[0];
    assert_eq!(bundle.scheduled_fire_time, start);
    assert_eq!(bundle.previous_fire_time, None);
    assert_eq!(bundle.trigger.state(), TriggerState::Firing);
    assert_eq!(bundle.job.key, JobKey::named("a").unwrap());

    // A firing trigger cannot be acquired again until it completes.
    let far = Utc::now() + TimeDelta::hours(2);
    assert!(store.acquire_next_triggers(far, 1, Duration::ZERO).unwrap().is_empty());

    store.triggered_job_complete(bundle.trigger.key()).unwrap();
    let stored = store.trigger(bundle.trigger.key()).unwrap();
    assert_eq!(stored.state(), TriggerState::Armed);
    assert_eq!(stored.next_fire_time(), Some(start + TimeDelta::seconds(60)));
    assert_eq!(stored.previous_fire_time(), Some(start));
    assert_eq!(
        signaler.take().unwrap().candidate,
        Some(start + TimeDelta::seconds(60))
    );
}

#[test]
fn fired_without_acquisition_is_ignored() {
    let (store, _) = store();
    store.store_job(job("a"), false).unwrap();
    store.store_trigger(trigger("a", "t", Utc::now(), 60), false).unwrap();
    let bundles = store.triggers_fired(&[TriggerKey::new("t", "DEFAULT")]).unwrap();
    assert!(bundles.is_empty());
}

#[test]
fn misfired_trigger_fires_now_once() {
    let (store, signaler) = store();
    let start = Utc::now() - TimeDelta::hours(1);
    store.store_job(job("a"), false).unwrap();
    store.store_trigger(trigger("a", "t", start, 60), false).unwrap();

    let before = Utc::now();
    let acquired = store.acquire_next_triggers(Utc::now(), 5, Duration::ZERO).unwrap();
    assert_eq!(acquired.len(), 1);
    let next = acquired[0].next_fire_time().unwrap();
    assert!(next >= before, "misfired trigger should be rescheduled to now");
    assert_eq!(signaler.misfire_count(), 1);

    let bundles = store.triggers_fired(&[acquired[0].key().clone()]).unwrap();
    store.triggered_job_complete(bundles[0].trigger.key()).unwrap();
    let stored = store.trigger(bundles[0].trigger.key()).unwrap();
    // Cadence resumes one period after the recovery firing, not from the old slots.
    assert_eq!(stored.next_fire_time(), Some(next + TimeDelta::seconds(60)));
}

#[test]
fn slightly_late_trigger_is_not_a_misfire() {
    let (store, signaler) = store();
    let start = Utc::now() - TimeDelta::seconds(2);
    store.store_job(job("a"), false).unwrap();
    store.store_trigger(trigger("a", "t", start, 60), false).unwrap();

    let acquired = store.acquire_next_triggers(Utc::now(), 1, Duration::ZERO).unwrap();
    assert_eq!(acquired[0].next_fire_time(), Some(start));
    assert_eq!(signaler.misfire_count(), 0);
}

#[test]
fn superseded_while_acquired_is_not_fired() {
    let (store, _) = store();
    store.store_job(job("a"), false).unwrap();
    store.store_trigger(trigger("a", "old", Utc::now(), 60), false).unwrap();
    let acquired = store.acquire_next_triggers(Utc::now(), 1, Duration::ZERO).unwrap();

    let superseded = store.supersede_trigger(acquired[0].key()).unwrap().unwrap();
    assert_eq!(superseded.state(), TriggerState::Superseded);
    assert!(store.triggers_fired(&[acquired[0].key().clone()]).unwrap().is_empty());
    assert!(store.supersede_trigger(acquired[0].key()).unwrap().is_none());
}

#[test]
fn removing_a_job_removes_its_triggers() {
    let (store, _) = store();
    store.store_job(job("a"), false).unwrap();
    store.store_job(job("b"), false).unwrap();
    store.store_trigger(trigger("a", "a1", Utc::now(), 60), false).unwrap();
    store.store_trigger(trigger("a", "a2", Utc::now(), 60), false).unwrap();
    store.store_trigger(trigger("b", "b1", Utc::now(), 60), false).unwrap();

    assert!(store.remove_job(&JobKey::named("a").unwrap()).unwrap());
    assert!(!store.remove_job(&JobKey::named("a").unwrap()).unwrap());
    assert_eq!(store.trigger_count(), 1);
    assert!(store.triggers_for_job(&JobKey::named("a").unwrap()).unwrap().is_empty());
    assert_eq!(store.triggers_for_job(&JobKey::named("b").unwrap()).unwrap().len(), 1);

    let removed = store.remove_trigger(&TriggerKey::new("b1", "DEFAULT")).unwrap().unwrap();
    assert_eq!(removed.state(), TriggerState::Removed);
}

#[test]
fn shut_down_store_is_unavailable() {
    let (store, _) = store();
    store.shutdown();
    assert!(matches!(store.retrieve_job(&JobKey::named("a").unwrap()), Err(StoreError::Unavailable(_))));
}

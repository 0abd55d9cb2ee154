//! Concrete recurring triggers and their lifecycle.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use jobmesh_core::JobKey;
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

/// Identity of a trigger in the job store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    pub name: String,
    pub group: String,
}

impl TriggerKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Lifecycle of a schedule-derived trigger.
///
/// `Pending -> Armed -> Firing -> Armed ...`, leaving the loop only through
/// `Superseded` or `Removed`. Interval triggers never complete on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    Pending,
    Armed,
    Firing,
    Superseded,
    Removed,
}

impl TriggerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TriggerState::Superseded | TriggerState::Removed)
    }
}

/// What to do with a firing that was missed by more than the misfire threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Fire once immediately, then resume the regular cadence from there.
    #[default]
    FireNow,
    /// Drop missed firings and wait for the next regular slot after now.
    Skip,
}

/// A fixed-period trigger bound to one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    key: TriggerKey,
    job_key: JobKey,
    start_time: DateTime<Utc>,
    period: Duration,
    misfire_policy: MisfirePolicy,
    next_fire_time: Option<DateTime<Utc>>,
    previous_fire_time: Option<DateTime<Utc>>,
    state: TriggerState,
}

impl Trigger {
    /// Build a pending trigger whose first firing is at `start_time`.
    pub fn new(
        key: TriggerKey,
        job_key: JobKey,
        start_time: DateTime<Utc>,
        period: Duration,
        misfire_policy: MisfirePolicy,
    ) -> Result<Self, ScheduleError> {
        if period.is_zero() {
            return Err(ScheduleError::InvalidPeriod(format!(
                "trigger {key} needs a positive period"
            )));
        }
        TimeDelta::from_std(period)
            .map_err(|e| ScheduleError::InvalidPeriod(format!("{period:?}: {e}")))?;
        Ok(Self {
            key,
            job_key,
            start_time,
            period,
            misfire_policy,
            next_fire_time: Some(start_time),
            previous_fire_time: None,
            state: TriggerState::Pending,
        })
    }

    pub fn key(&self) -> &TriggerKey {
        &self.key
    }

    pub fn job_key(&self) -> &JobKey {
        &self.job_key
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn misfire_policy(&self) -> MisfirePolicy {
        self.misfire_policy
    }

    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.next_fire_time
    }

    pub fn previous_fire_time(&self) -> Option<DateTime<Utc>> {
        self.previous_fire_time
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    /// Registered in a store: `Pending -> Armed`.
    pub fn arm(&mut self) -> Result<(), ScheduleError> {
        self.transition("arm", &[TriggerState::Pending], TriggerState::Armed)
    }

    /// Dispatched for execution: `Armed -> Firing`.
    ///
    /// Returns the scheduled fire time being consumed and advances the next
    /// fire time by one period from it.
    pub fn fire(&mut self) -> Result<DateTime<Utc>, ScheduleError> {
        let scheduled = self.next_fire_time.ok_or_else(|| {
            ScheduleError::OutOfRange(format!("trigger {} has no next fire time", self.key))
        })?;
        self.transition("fire", &[TriggerState::Armed], TriggerState::Firing)?;
        self.previous_fire_time = Some(scheduled);
        self.next_fire_time = self.advance(scheduled);
        Ok(scheduled)
    }

    /// Execution finished: `Firing -> Armed`.
    pub fn complete(&mut self) -> Result<(), ScheduleError> {
        self.transition("complete", &[TriggerState::Firing], TriggerState::Armed)
    }

    /// Replaced by a trigger with a different identity.
    pub fn supersede(&mut self) -> Result<(), ScheduleError> {
        self.transition(
            "supersede",
            &[TriggerState::Pending, TriggerState::Armed, TriggerState::Firing],
            TriggerState::Superseded,
        )
    }

    /// The job or trigger was deleted.
    pub fn remove(&mut self) -> Result<(), ScheduleError> {
        self.transition(
            "remove",
            &[TriggerState::Pending, TriggerState::Armed, TriggerState::Firing],
            TriggerState::Removed,
        )
    }

    /// Whether the next firing is overdue by more than `threshold`.
    pub fn is_misfired(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let Some(next) = self.next_fire_time else {
            return false;
        };
        let threshold = TimeDelta::from_std(threshold).unwrap_or(TimeDelta::MAX);
        match next.checked_add_signed(threshold) {
            Some(deadline) => deadline < now,
            None => false,
        }
    }

    /// Reconcile a missed firing according to the misfire policy.
    pub fn update_after_misfire(&mut self, now: DateTime<Utc>) {
        self.next_fire_time = match self.misfire_policy {
            MisfirePolicy::FireNow => Some(now),
            MisfirePolicy::Skip => self.next_slot_after(now),
        };
    }

    fn step(&self) -> TimeDelta {
        TimeDelta::from_std(self.period).unwrap_or(TimeDelta::MAX)
    }

    fn advance(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        from.checked_add_signed(self.step())
    }

    /// First `start_time + k * period` strictly after `now`.
    fn next_slot_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if now < self.start_time {
            return Some(self.start_time);
        }
        let period_ms = self.step().num_milliseconds().max(1);
        let elapsed_ms = (now - self.start_time).num_milliseconds();
        let slots = elapsed_ms / period_ms + 1;
        let offset = TimeDelta::try_milliseconds(slots.checked_mul(period_ms)?)?;
        self.start_time.checked_add_signed(offset)
    }

    fn transition(
        &mut self,
        action: &'static str,
        from: &[TriggerState],
        to: TriggerState,
    ) -> Result<(), ScheduleError> {
        if !from.contains(&self.state) {
            return Err(ScheduleError::IllegalTransition {
                trigger: self.key.to_string(),
                from: self.state,
                action,
            });
        }
        self.state = to;
        Ok(())
    }
}

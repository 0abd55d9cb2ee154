use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use jobmesh_core::JobKey;
use rand::Rng;
use serde_json::{json, Value};

use crate::duration::{format_duration, parse_duration};
use crate::error::ScheduleError;
use crate::schedule::Schedule;
use crate::scope::Scope;
use crate::trigger::{MisfirePolicy, Trigger, TriggerKey};
use crate::validation::{join_path, ValidationResult};

const PERIOD: &str = "period";
const RANDOM_DELAY_ENABLED: &str = "random_delay_enabled";

/// Fires forever at a fixed period, optionally after a random initial delay.
///
/// The delay spreads out many triggers built from the same template so they
/// don't all fire in the same instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalSchedule {
    period: Duration,
    random_delay_enabled: bool,
    scope: Scope,
}

impl IntervalSchedule {
    pub const TYPE: &'static str = "interval";

    pub fn new(period: Duration, random_delay_enabled: bool, scope: Scope) -> Result<Self, ScheduleError> {
        if period.is_zero() {
            return Err(ScheduleError::InvalidPeriod("period must be positive".into()));
        }
        // Identities are derived from the millisecond form of the period.
        if period < Duration::from_millis(1) {
            return Err(ScheduleError::InvalidPeriod(format!(
                "period {period:?} is shorter than 1ms"
            )));
        }
        if period.subsec_nanos() % 1_000_000 != 0 {
            return Err(ScheduleError::InvalidPeriod(format!(
                "period {period:?} is not a whole number of milliseconds"
            )));
        }
        if u64::try_from(period.as_nanos()).is_err() {
            return Err(ScheduleError::InvalidPeriod(format!(
                "period {} is too large",
                format_duration(period)
            )));
        }
        Ok(Self {
            period,
            random_delay_enabled,
            scope,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn random_delay_enabled(&self) -> bool {
        self.random_delay_enabled
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn canonical_string(&self) -> String {
        format!("{}{}", format_duration(self.period), self.random_delay_enabled)
    }

    /// Delay before the first firing: uniform in `[0, period)` when enabled.
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay_with(&mut rand::rng())
    }

    pub fn initial_delay_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if !self.random_delay_enabled {
            return Duration::ZERO;
        }
        // `new` guarantees 0 < nanos <= u64::MAX.
        let nanos = u64::try_from(self.period.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rng.random_range(0..nanos))
    }

    pub fn build_trigger(
        &self,
        key: TriggerKey,
        job_key: &JobKey,
        now: DateTime<Utc>,
    ) -> Result<Trigger, ScheduleError> {
        let delay = TimeDelta::from_std(self.initial_delay())
            .map_err(|e| ScheduleError::OutOfRange(e.to_string()))?;
        let start = now
            .checked_add_signed(delay)
            .ok_or_else(|| ScheduleError::OutOfRange(format!("{now} + {delay}")))?;
        Trigger::new(key, job_key.clone(), start, self.period, MisfirePolicy::FireNow)
    }

    /// Document form accepted by [`parse`](Self::parse).
    pub fn to_document(&self) -> Value {
        json!({
            Self::TYPE: {
                PERIOD: format_duration(self.period),
                RANDOM_DELAY_ENABLED: self.random_delay_enabled,
            }
        })
    }

    /// Parse the body of an `interval` document, recording every problem in
    /// `result`.
    pub fn parse(value: &Value, scope: Scope, path: &str, result: &mut ValidationResult) -> Option<Schedule> {
        let Some(body) = value.as_object() else {
            result.error(path, "expected an object");
            return None;
        };

        let period_path = join_path(path, PERIOD);
        let period = match body.get(PERIOD) {
            None => {
                result.error(&period_path, "required attribute is missing");
                None
            }
            Some(Value::String(s)) => match parse_duration(s) {
                Ok(d) if d.is_zero() => {
                    result.error(&period_path, "period must be positive");
                    None
                }
                Ok(d) => Some(d),
                Err(e) => {
                    result.error(&period_path, e.to_string());
                    None
                }
            },
            Some(_) => {
                result.error_with_suggestion(
                    &period_path,
                    "expected a duration string",
                    Some("e.g. \"5m\" or \"1h30m\"".into()),
                );
                None
            }
        };

        let random_delay_enabled = match body.get(RANDOM_DELAY_ENABLED) {
            None => true,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                result.error(join_path(path, RANDOM_DELAY_ENABLED), "expected a boolean");
                true
            }
        };

        result.unused_attributes(path, body.keys(), &[PERIOD, RANDOM_DELAY_ENABLED]);

        match IntervalSchedule::new(period?, random_delay_enabled, scope) {
            Ok(s) => Some(Schedule::Interval(s)),
            Err(e) => {
                result.error(&period_path, e.to_string());
                None
            }
        }
    }
}

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobmesh_core::JobKey;
use sha2::{Digest, Sha256};

use crate::error::ScheduleError;
use crate::interval::IntervalSchedule;
use crate::scope::Scope;
use crate::trigger::{Trigger, TriggerKey};

/// Schedule variants contributed outside this crate.
///
/// The canonical string must capture every setting that affects firing, since
/// the trigger identity is derived from it.
pub trait CustomSchedule: fmt::Debug + Send + Sync {
    fn type_name(&self) -> &str;

    fn scope(&self) -> Scope;

    fn canonical_string(&self) -> String;

    fn build_trigger(
        &self,
        key: TriggerKey,
        job_key: &JobKey,
        now: DateTime<Utc>,
    ) -> Result<Trigger, ScheduleError>;
}

/// A parsed recurrence description, converted once into a [`Trigger`].
#[derive(Debug, Clone)]
pub enum Schedule {
    Interval(IntervalSchedule),
    Custom(Arc<dyn CustomSchedule>),
}

impl Schedule {
    pub fn scope(&self) -> Scope {
        match self {
            Schedule::Interval(s) => s.scope(),
            Schedule::Custom(s) => s.scope(),
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Schedule::Interval(_) => IntervalSchedule::TYPE,
            Schedule::Custom(s) => s.type_name(),
        }
    }

    pub fn canonical_string(&self) -> String {
        match self {
            Schedule::Interval(s) => s.canonical_string(),
            Schedule::Custom(s) => s.canonical_string(),
        }
    }

    /// Content-derived trigger key for this schedule attached to `job_key`.
    pub fn trigger_key(&self, job_key: &JobKey) -> TriggerKey {
        TriggerKey::new(
            trigger_identity(self.scope(), &job_key.name, &self.canonical_string()),
            job_key.group.clone(),
        )
    }

    /// Build the pending trigger. Jitter, if any, is drawn here.
    pub fn to_trigger(&self, job_key: &JobKey, now: DateTime<Utc>) -> Result<Trigger, ScheduleError> {
        let key = self.trigger_key(job_key);
        match self {
            Schedule::Interval(s) => s.build_trigger(key, job_key, now),
            Schedule::Custom(s) => s.build_trigger(key, job_key, now),
        }
    }
}

impl From<IntervalSchedule> for Schedule {
    fn from(s: IntervalSchedule) -> Self {
        Schedule::Interval(s)
    }
}

/// `{scope}_{job}___{hash}` where `hash` is a SHA-256 prefix of `canonical`.
pub fn trigger_identity(scope: Scope, job_name: &str, canonical: &str) -> String {
    let digest = Sha256::digest(canonical.as_bytes());
    let hash: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("{}{}", identity_prefix(scope, job_name), hash)
}

/// Part of the identity shared by every schedule of `job_name` in `scope`.
pub fn identity_prefix(scope: Scope, job_name: &str) -> String {
    format!("{}_{}___", scope.prefix(), job_name)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn interval(period_secs: u64, jitter: bool, scope: Scope) -> Schedule {
        IntervalSchedule::new(Duration::from_secs(period_secs), jitter, scope)
            .unwrap()
            .into()
    }

    #[test]
    fn identity_shape() {
        let id = trigger_identity(Scope::Job, "cleanup", "5mtrue");
        let (prefix, hash) = id.split_once("___").unwrap();
        assert_eq!(prefix, "job_cleanup");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identity_is_deterministic() {
        let job = JobKey::new("cleanup", "tenants").unwrap();
        let a = interval(300, true, Scope::Job).trigger_key(&job);
        let b = interval(300, true, Scope::Job).trigger_key(&job);
        assert_eq!(a, b);
        assert_eq!(a.group, "tenants");
    }

    #[test]
    fn identity_changes_with_content_and_scope() {
        let job = JobKey::named("cleanup").unwrap();
        let base = interval(300, true, Scope::Job).trigger_key(&job);
        assert_ne!(base, interval(600, true, Scope::Job).trigger_key(&job));
        assert_ne!(base, interval(300, false, Scope::Job).trigger_key(&job));
        assert_ne!(base, interval(300, true, Scope::Step).trigger_key(&job));
        assert_ne!(base, interval(300, true, Scope::Job).trigger_key(&JobKey::named("other").unwrap()));
    }

    #[derive(Debug)]
    struct Hourly;

    impl CustomSchedule for Hourly {
        fn type_name(&self) -> &str {
            "hourly"
        }

        fn scope(&self) -> Scope {
            Scope::Default
        }

        fn canonical_string(&self) -> String {
            "hourly".into()
        }

        fn build_trigger(
            &self,
            key: TriggerKey,
            job_key: &JobKey,
            now: DateTime<Utc>,
        ) -> Result<Trigger, ScheduleError> {
            Trigger::new(
                key,
                job_key.clone(),
                now,
                Duration::from_secs(3_600),
                crate::trigger::MisfirePolicy::Skip,
            )
        }
    }

    #[test]
    fn custom_variant_builds_trigger() {
        let schedule = Schedule::Custom(Arc::new(Hourly));
        let job = JobKey::named("report").unwrap();
        let now = Utc::now();
        let trigger = schedule.to_trigger(&job, now).unwrap();
        assert_eq!(schedule.type_name(), "hourly");
        assert!(trigger.key().name.starts_with("default_report___"));
        assert_eq!(trigger.next_fire_time(), Some(now));
    }
}

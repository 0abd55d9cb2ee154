use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Scheduler operational metrics, keyed by job (`group.name`).
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Triggers fired by this node, including skipped ones.
    pub triggers_fired: u64,
    /// Successful executions by job.
    pub jobs_executed: HashMap<String, u64>,
    /// Failed or panicked executions by job.
    pub jobs_failed: HashMap<String, u64>,
    /// Firings skipped because another node owns the job.
    pub jobs_skipped: HashMap<String, u64>,
    /// Average execution duration by job.
    pub avg_job_duration: HashMap<String, Duration>,
    /// Last execution time by job.
    pub last_run: HashMap<String, DateTime<Utc>>,
    /// Misfired triggers reconciled by the store.
    pub misfires_handled: u64,
    /// Failed job store calls.
    pub store_failures: u64,
    /// Busy worker slots over pool size (0.0 - 1.0).
    pub worker_utilization: f64,
}

impl SchedulerMetrics {
    /// Record a successful execution.
    pub fn record_execution(&mut self, job: &str, duration: Duration) {
        *self.jobs_executed.entry(job.to_string()).or_default() += 1;
        self.record_run(job, duration);
    }

    /// Record a failed execution. Failures count toward the average duration.
    pub fn record_failure(&mut self, job: &str, duration: Duration) {
        *self.jobs_failed.entry(job.to_string()).or_default() += 1;
        self.record_run(job, duration);
    }

    pub fn record_skip(&mut self, job: &str) {
        *self.jobs_skipped.entry(job.to_string()).or_default() += 1;
    }

    fn record_run(&mut self, job: &str, duration: Duration) {
        self.last_run.insert(job.to_string(), Utc::now());

        let count = self.jobs_executed.get(job).copied().unwrap_or(0)
            + self.jobs_failed.get(job).copied().unwrap_or(0);
        let prev_avg = self.avg_job_duration.get(job).copied().unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count <= 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };

        self.avg_job_duration.insert(job.to_string(), new_avg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_single_execution() {
        let mut m = SchedulerMetrics::default();
        m.record_execution("DEFAULT.a", Duration::from_millis(100));

        assert_eq!(m.jobs_executed["DEFAULT.a"], 1);
        assert!(m.last_run.contains_key("DEFAULT.a"));
        assert_eq!(m.avg_job_duration["DEFAULT.a"], Duration::from_millis(100));
    }

    #[test]
    fn failures_share_the_rolling_average() {
        let mut m = SchedulerMetrics::default();
        m.record_execution("DEFAULT.a", Duration::from_millis(100));
        m.record_failure("DEFAULT.a", Duration::from_millis(200));

        assert_eq!(m.jobs_executed["DEFAULT.a"], 1);
        assert_eq!(m.jobs_failed["DEFAULT.a"], 1);
        let avg = m.avg_job_duration["DEFAULT.a"].as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
    }

    #[test]
    fn skips_do_not_touch_durations() {
        let mut m = SchedulerMetrics::default();
        m.record_skip("DEFAULT.a");
        m.record_skip("DEFAULT.a");
        assert_eq!(m.jobs_skipped["DEFAULT.a"], 2);
        assert!(m.avg_job_duration.is_empty());
        assert!(m.last_run.is_empty());
    }
}

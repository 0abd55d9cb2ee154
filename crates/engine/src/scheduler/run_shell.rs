use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::job::{JobContext, JobError};
use crate::store::FiredBundle;

use super::core::Inner;

const COMPLETE_ATTEMPTS: u32 = 3;

/// Runs one fired job on a pool worker and reports the outcome to the store.
///
/// Job failures and panics are contained here: the trigger is completed
/// either way so the schedule keeps its cadence.
pub(super) struct RunShell {
    inner: Arc<Inner>,
    bundle: FiredBundle,
}

impl RunShell {
    /// Counts as an active run until dropped.
    pub(super) fn new(inner: Arc<Inner>, bundle: FiredBundle) -> Self {
        inner.active_runs.fetch_add(1, Ordering::Relaxed);
        Self { inner, bundle }
    }

    pub(super) fn run(self) {
        let job_name = self.bundle.job.key.to_string();
        let ctx = JobContext::from_bundle(&self.bundle);
        debug!(
            job = %job_name,
            trigger = %ctx.trigger_key,
            fire_instance = %ctx.fire_instance_id,
            scheduled = %ctx.scheduled_fire_time,
            "executing job"
        );

        let started = Instant::now();
        let result = self.execute(&ctx);
        let duration = started.elapsed();

        match &result {
            Ok(()) => {
                debug!(job = %job_name, duration_ms = duration.as_millis() as u64, "job completed");
                self.inner.with_metrics(|m| m.record_execution(&job_name, duration));
            }
            Err(e) => {
                warn!(job = %job_name, error = %e, duration_ms = duration.as_millis() as u64, "job failed");
                self.inner.with_metrics(|m| m.record_failure(&job_name, duration));
            }
        }

        self.complete_trigger();
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let job = self.inner.factory.new_job(&self.bundle.job)?;
        catch_unwind(AssertUnwindSafe(|| job.execute(ctx)))
            .unwrap_or_else(|payload| Err(JobError::Panicked(panic_message(payload.as_ref()))))
    }

    fn complete_trigger(&self) {
        let key = self.bundle.trigger.key();
        for attempt in 1..=COMPLETE_ATTEMPTS {
            match self.inner.res.store.triggered_job_complete(key) {
                Ok(()) => return,
                Err(e) => {
                    self.inner.with_metrics(|m| m.store_failures += 1);
                    if attempt == COMPLETE_ATTEMPTS || self.inner.is_halted() {
                        error!(trigger = %key, error = %e, attempts = attempt, "could not complete trigger");
                        return;
                    }
                    warn!(trigger = %key, error = %e, attempt, "could not complete trigger, retrying");
                    thread::sleep(retry_interval(self.inner.res.db_failure_retry_interval));
                }
            }
        }
    }
}

impl Drop for RunShell {
    // Also runs when the pool discards the shell unexecuted.
    fn drop(&mut self) {
        self.inner.active_runs.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Worker-side retry pause, capped at one second.
fn retry_interval(configured: Duration) -> Duration {
    configured.min(Duration::from_secs(1))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

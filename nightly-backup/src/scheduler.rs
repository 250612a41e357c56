//! Daily backup scheduler.
//!
//! Sleeps until the next occurrence of the configured local wall-clock time,
//! hands a job to the executor in the background, and goes back to sleep.
//! The loop never waits for a run to finish.

use crate::config::{Config, OverlapPolicy};
use crate::executor::BackupExecutor;
use crate::utils::errors::Result;
use chrono::{DateTime, Duration as ChronoDuration, Local, LocalResult, NaiveDateTime, NaiveTime, TimeZone};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Source of the current wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Next occurrence of wall-clock time `at` strictly after `now`.
///
/// A time skipped by a DST jump resolves to the first valid minute after the
/// gap; a repeated time resolves to its earlier occurrence.
pub fn next_trigger<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();

    now.date_naive()
        .iter_days()
        .take(3)
        .filter_map(|day| resolve_local(&tz, day.and_time(at)))
        .find(|candidate| candidate > now)
        .unwrap_or_else(|| now.clone() + ChronoDuration::days(1))
}

fn resolve_local<Tz: TimeZone>(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        // Gaps are at most a few hours
        LocalResult::None => (1..=24 * 60).find_map(|minutes| {
            tz.from_local_datetime(&(local + ChronoDuration::minutes(minutes)))
                .earliest()
        }),
    }
}

/// Decrements the in-flight counter when a run ends, however it ends
struct RunGuard(Arc<AtomicUsize>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct BackupScheduler {
    executor: Arc<BackupExecutor>,
    clock: Arc<dyn Clock>,
    trigger: NaiveTime,
    overlap: OverlapPolicy,
    in_flight: Arc<AtomicUsize>,
}

impl BackupScheduler {
    pub fn new(
        executor: Arc<BackupExecutor>,
        clock: Arc<dyn Clock>,
        trigger: NaiveTime,
        overlap: OverlapPolicy,
    ) -> Self {
        Self {
            executor,
            clock,
            trigger,
            overlap,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_config(config: &Config, executor: Arc<BackupExecutor>) -> Result<Self> {
        Ok(Self::new(
            executor,
            Arc::new(SystemClock),
            config.schedule.trigger_time()?,
            config.schedule.overlap,
        ))
    }

    /// Number of runs currently executing
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run the daily loop until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Backup scheduler started: daily at {}, overlap policy {:?}",
            self.trigger.format("%H:%M"),
            self.overlap
        );

        let mut last_trigger: Option<DateTime<Local>> = None;

        loop {
            let now = self.clock.now();
            // A wall clock that lags the timer must not fire the same trigger twice
            let from = match last_trigger {
                Some(last) if last >= now => last,
                _ => now,
            };
            let next = next_trigger(&from, self.trigger);
            let delay = (next - now).to_std().unwrap_or_default();

            info!(
                "Next backup at {} (in {}h {}m)",
                next.format("%Y-%m-%d %H:%M:%S %Z"),
                delay.as_secs() / 3600,
                (delay.as_secs() % 3600) / 60
            );

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Backup scheduler stopped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            self.dispatch(next);
            last_trigger = Some(next);
        }
    }

    /// Start the backup for `trigger` in the background.
    ///
    /// Returns `None` when the run was not started: the overlap policy
    /// skipped it, or the job could not be built.
    pub fn dispatch(&self, trigger: DateTime<Local>) -> Option<JoinHandle<()>> {
        let job = match self.executor.job_for(trigger) {
            Ok(job) => job,
            Err(e) => {
                error!(kind = e.kind(), "Failed to create backup job: {}", e);
                return None;
            }
        };

        match self.overlap {
            OverlapPolicy::Skip => {
                if self
                    .in_flight
                    .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    warn!(
                        key = %job.destination_key,
                        "Skipping scheduled run: previous backup still running"
                    );
                    return None;
                }
            }
            OverlapPolicy::Allow => {
                self.in_flight.fetch_add(1, Ordering::AcqRel);
            }
        }
        let guard = RunGuard(Arc::clone(&self.in_flight));

        let executor = Arc::clone(&self.executor);
        Some(tokio::spawn(async move {
            let _guard = guard;
            // Failures are already logged with the job key
            let _ = executor.execute(&job).await;
        }))
    }
}

//! Periodic task scheduler.
//!
//! Each registered task becomes one tokio task: after its initial delay it
//! runs, then fires every interval. While the last run failed and a retry
//! interval is configured, additional retry ticks fire at the faster cadence
//! until a run succeeds. A single parent cancellation token stops every loop
//! at its next selectable point; `stop` joins them all.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

pub struct PeriodicTask {
    pub name: String,
    pub initial_delay: Duration,
    pub interval: Duration,
    pub retry_interval: Option<Duration>,
    pub run: TaskFn,
}

impl PeriodicTask {
    pub fn new<F>(name: &str, initial_delay: Duration, interval: Duration, run: F) -> Self
    where
        F: Fn() -> TaskFuture + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            initial_delay,
            interval,
            retry_interval: None,
            run: Arc::new(run),
        }
    }

    pub fn with_retry(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = Some(retry_interval);
        self
    }
}

#[derive(Default)]
pub struct PeriodicScheduler {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl PeriodicScheduler {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn(&mut self, task: PeriodicTask) {
        let token = self.token.clone();
        self.handles.push(tokio::spawn(run_task(task, token)));
    }

    /// Cancel every task and wait for all of them to terminate.
    pub async fn stop(self) {
        self.token.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn run_task(task: PeriodicTask, token: CancellationToken) {
    let PeriodicTask {
        name,
        initial_delay,
        interval,
        retry_interval,
        run,
    } = task;

    let mut next_regular = Instant::now() + initial_delay;
    let mut last_run = Instant::now();
    let mut failed = false;

    loop {
        let wake = match retry_interval {
            Some(retry) if failed => next_regular.min(last_run + retry),
            _ => next_regular,
        };
        tokio::select! {
            _ = tokio::time::sleep_until(wake) => {}
            _ = token.cancelled() => {
                debug!(task = %name, "task cancelled");
                return;
            }
        }
        if wake >= next_regular {
            next_regular += interval;
        }

        last_run = Instant::now();
        match (run)().await {
            Ok(()) => {
                if failed {
                    debug!(task = %name, "task recovered");
                }
                failed = false;
            }
            Err(err) => {
                warn!(task = %name, error = %err, "task run failed");
                failed = true;
            }
        }
    }
}

/// Initial delay landing the first tick at the next `k * interval` boundary
/// past the top of the hour, plus `offset`. Intervals that do not divide one
/// hour just get the offset.
pub fn align_to_hour(now: DateTime<Utc>, interval: Duration, offset: Duration) -> Duration {
    let interval_s = interval.as_secs();
    if interval_s == 0 || 3600 % interval_s != 0 {
        return offset;
    }
    let past = (now.minute() * 60 + now.second()) as f64 + now.nanosecond() as f64 * 1e-9;
    let next = ((past / interval_s as f64).floor() + 1.0) * interval_s as f64;
    Duration::from_secs_f64(next - past) + offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn alignment_lands_on_interval_boundaries() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 7, 30).unwrap();
        let delay = align_to_hour(now, Duration::from_secs(900), Duration::ZERO);
        // Next quarter boundary is 12:15:00, 450 s away.
        assert_eq!(delay, Duration::from_secs(450));

        let delay = align_to_hour(now, Duration::from_secs(60), Duration::from_secs(2));
        // Next minute boundary is 12:08:00, plus the 2 s offset.
        assert_eq!(delay, Duration::from_secs(32));
    }

    #[test]
    fn alignment_skips_exact_boundaries_to_the_next_one() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 15, 0).unwrap();
        let delay = align_to_hour(now, Duration::from_secs(900), Duration::ZERO);
        assert_eq!(delay, Duration::from_secs(900));
    }

    #[test]
    fn non_divisible_intervals_fall_back_to_the_offset() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 7, 30).unwrap();
        let delay = align_to_hour(now, Duration::from_secs(7200), Duration::from_secs(5));
        assert_eq!(delay, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_runs_are_retried_at_the_retry_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let mut scheduler = PeriodicScheduler::new();
        scheduler.spawn(
            PeriodicTask::new(
                "flaky",
                Duration::ZERO,
                Duration::from_secs(100),
                move || {
                    let calls = calls_clone.clone();
                    Box::pin(async move {
                        // Only the very first run fails.
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            anyhow::bail!("transient");
                        }
                        Ok(())
                    })
                },
            )
            .with_retry(Duration::from_secs(10)),
        );

        // t=0 fails, t=10 retry succeeds, t=100 regular tick.
        tokio::time::sleep(Duration::from_secs(125)).await;
        scheduler.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn success_clears_the_retry_state() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let mut scheduler = PeriodicScheduler::new();
        scheduler.spawn(
            PeriodicTask::new("steady", Duration::ZERO, Duration::from_secs(100), move || {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .with_retry(Duration::from_secs(10)),
        );

        // No failures: only regular ticks at t=0 and t=100.
        tokio::time::sleep(Duration::from_secs(150)).await;
        scheduler.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_terminates_tasks_before_their_next_tick() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let mut scheduler = PeriodicScheduler::new();
        scheduler.spawn(PeriodicTask::new(
            "slowpoke",
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            move || {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            },
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        scheduler.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_delay_is_honoured() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let mut scheduler = PeriodicScheduler::new();
        scheduler.spawn(PeriodicTask::new(
            "delayed",
            Duration::from_secs(30),
            Duration::from_secs(100),
            move || {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            },
        ));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        scheduler.stop().await;
    }
}

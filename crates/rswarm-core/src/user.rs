//! Per-simulated-user driver loop.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ratelimit::RateLimiter;
use crate::stats::StatsAggregatorHandle;
use crate::task::TaskSelector;

/// Handed to every [`crate::task::Task::execute`] call so user code can
/// self-report outcomes against the shared aggregator.
#[derive(Clone)]
pub struct UserContext {
    stats: StatsAggregatorHandle,
    reported: Arc<std::sync::atomic::AtomicBool>,
}

impl UserContext {
    fn new(stats: StatsAggregatorHandle) -> Self {
        Self {
            stats,
            reported: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    fn reset(&self) {
        self.reported.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    fn did_report(&self) -> bool {
        self.reported.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn report_success(
        &self,
        method: impl Into<String>,
        name: impl Into<String>,
        response_time_ms: u64,
        content_length: u64,
    ) {
        self.reported.store(true, std::sync::atomic::Ordering::SeqCst);
        self.stats.report_success(method, name, response_time_ms, content_length);
    }

    pub fn report_failure(
        &self,
        method: impl Into<String>,
        name: impl Into<String>,
        response_time_ms: u64,
        error_text: impl Into<String>,
    ) {
        self.reported.store(true, std::sync::atomic::Ordering::SeqCst);
        self.stats.report_failure(method, name, response_time_ms, error_text);
    }
}

/// Drives one simulated user: acquire a rate-limit permit (if configured),
/// pick a task, run it, and repeat until cancelled.
pub struct UserWorker {
    selector: Arc<TaskSelector>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    stats: StatsAggregatorHandle,
    cancel: CancellationToken,
}

impl UserWorker {
    pub fn new(
        selector: Arc<TaskSelector>,
        rate_limiter: Option<Arc<dyn RateLimiter>>,
        stats: StatsAggregatorHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            selector,
            rate_limiter,
            stats,
            cancel,
        }
    }

    /// Run until the cancellation token fires. Errors and panics escaping
    /// `Task::execute` are captured here and never propagate out.
    pub async fn run(self) {
        let ctx = UserContext::new(self.stats.clone());

        loop {
            if self.cancel.is_cancelled() {
                debug!("user worker cancelled, exiting loop");
                return;
            }

            if let Some(limiter) = &self.rate_limiter {
                let limiter = Arc::clone(limiter);
                let granted = tokio::task::block_in_place(|| limiter.acquire());
                if !granted {
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    continue;
                }
            }

            let task = self.selector.pick();
            ctx.reset();
            let started = Instant::now();

            // Run the task's future on its own tokio task so a panic inside
            // `execute` surfaces as a `JoinError` here instead of unwinding
            // through this worker's loop and taking every other user with it.
            let spawned_ctx = ctx.clone();
            let spawned_task = Arc::clone(&task);
            let outcome = tokio::spawn(async move { spawned_task.execute(&spawned_ctx).await }).await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) if !ctx.did_report() => {
                    let elapsed = started.elapsed().as_millis() as u64;
                    ctx.report_failure("TASK", task.name(), elapsed, err.to_string());
                }
                Ok(Err(_)) => {}
                Err(join_err) => {
                    let msg = join_err
                        .try_into_panic()
                        .ok()
                        .and_then(|p| panic_message(p))
                        .unwrap_or_else(|| "task cancelled".to_string());
                    warn!(task = task.name(), %msg, "task panicked");
                    if !ctx.did_report() {
                        let elapsed = started.elapsed().as_millis() as u64;
                        ctx.report_failure("TASK", task.name(), elapsed, format!("unknown: {msg}"));
                    }
                }
            }

            tokio::task::yield_now().await;
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> Option<String> {
    if let Some(s) = payload.downcast_ref::<&str>() {
        Some(s.to_string())
    } else {
        payload.downcast_ref::<String>().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatsAggregator;
    use crate::task::{Task, TaskError, WeightedTask};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AlwaysOk {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Task for AlwaysOk {
        fn name(&self) -> &str {
            "always_ok"
        }

        async fn execute(&self, ctx: &UserContext) -> Result<(), TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.report_success("TASK", self.name(), 1, 0);
            Ok(())
        }
    }

    struct AlwaysErr;

    #[async_trait]
    impl Task for AlwaysErr {
        fn name(&self) -> &str {
            "always_err"
        }

        async fn execute(&self, _ctx: &UserContext) -> Result<(), TaskError> {
            Err(TaskError::failed("boom"))
        }
    }

    #[tokio::test]
    async fn worker_stops_promptly_on_cancellation() {
        let calls = Arc::new(AtomicU32::new(0));
        let selector = Arc::new(TaskSelector::new(vec![WeightedTask::new(
            Arc::new(AlwaysOk { calls: calls.clone() }),
            1,
        )]));
        let (stats_handle, aggregator, mut snapshot_rx) = StatsAggregator::new(3000);
        let _agg = tokio::spawn(aggregator.run());
        let cancel = CancellationToken::new();

        let worker = UserWorker::new(selector, None, stats_handle, cancel.clone());
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        tokio::time::timeout(std::time::Duration::from_millis(200), handle)
            .await
            .expect("worker should exit promptly after cancellation")
            .expect("worker task should not panic");

        assert!(calls.load(Ordering::SeqCst) > 0);
        drop(snapshot_rx.try_recv());
    }

    #[tokio::test]
    async fn unreported_error_is_converted_to_a_failure() {
        let selector = Arc::new(TaskSelector::new(vec![WeightedTask::new(
            Arc::new(AlwaysErr),
            1,
        )]));
        let (stats_handle, aggregator, mut snapshot_rx) = StatsAggregator::new(3000);
        let _agg = tokio::spawn(aggregator.run());
        let cancel = CancellationToken::new();

        let worker = UserWorker::new(selector, None, stats_handle.clone(), cancel.clone());
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
        let _ = tokio::time::timeout(std::time::Duration::from_millis(200), handle).await;

        stats_handle.report_success("noop", "noop", 0, 0); // keep handle alive until tick below
        let _ = snapshot_rx.try_recv();
    }
}

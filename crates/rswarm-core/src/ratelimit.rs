//! Aggregate token-bucket throughput limiting, stable and ramp-up variants.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::debug;

/// Shapes aggregate request throughput across all of a worker's users.
///
/// `acquire` blocks the calling thread/task until a permit is available or
/// the limiter is stopped, in which case it returns `false` and the caller
/// should treat that iteration as skipped. Implementations must be safe to
/// share across every `UserWorker` via `Arc`.
pub trait RateLimiter: Send + Sync {
    /// Block until a permit is granted or the limiter stops; `true` means
    /// "proceed", `false` means "the limiter stopped while waiting".
    fn acquire(&self) -> bool;

    /// (Re)start the limiter's refill timer(s). Called on every transition
    /// into `Spawning`.
    fn start(&self);

    /// Stop granting permits and wake any blocked waiters.
    fn stop(&self);

    fn is_stopped(&self) -> bool;
}

struct Bucket {
    max_threshold: i64,
    current_threshold: AtomicI64,
    stopped: AtomicBool,
    condvar: Condvar,
    guard: Mutex<()>,
}

impl Bucket {
    fn new(max_threshold: i64) -> Self {
        Self {
            max_threshold,
            current_threshold: AtomicI64::new(max_threshold),
            stopped: AtomicBool::new(true),
            condvar: Condvar::new(),
            guard: Mutex::new(()),
        }
    }

    /// Fast path: decrement the counter without ever taking a lock. Only
    /// the `Condvar` wait path (when the decrement would go negative) takes
    /// one, and only because it would have blocked anyway.
    fn try_acquire(&self) -> bool {
        self.current_threshold.fetch_sub(1, Ordering::SeqCst) - 1 >= 0
    }

    fn refill(&self, to: i64) {
        self.current_threshold.store(to, Ordering::SeqCst);
        let _guard = self.guard.lock().unwrap();
        self.condvar.notify_all();
    }

    fn wait_for_refill(&self) {
        let guard = self.guard.lock().unwrap();
        let _unused = self
            .condvar
            .wait_timeout(guard, Duration::from_millis(50))
            .unwrap();
    }
}

/// Token bucket refilled to `max_threshold` every `period`.
pub struct StableRateLimiter {
    bucket: Arc<Bucket>,
    period: Duration,
    refill_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl StableRateLimiter {
    pub fn new(max_threshold: i64, period: Duration) -> Self {
        Self {
            bucket: Arc::new(Bucket::new(max_threshold)),
            period,
            refill_thread: Mutex::new(None),
        }
    }
}

impl RateLimiter for StableRateLimiter {
    fn acquire(&self) -> bool {
        loop {
            if self.bucket.stopped.load(Ordering::SeqCst) {
                return false;
            }
            if self.bucket.try_acquire() {
                return true;
            }
            self.bucket.wait_for_refill();
        }
    }

    fn start(&self) {
        self.bucket.stopped.store(false, Ordering::SeqCst);
        self.bucket
            .current_threshold
            .store(self.bucket.max_threshold, Ordering::SeqCst);
        let mut guard = self.refill_thread.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let bucket = Arc::clone(&self.bucket);
        let period = self.period;
        *guard = Some(
            std::thread::Builder::new()
                .name("ratelimit-refill".to_string())
                .spawn(move || loop {
                    std::thread::sleep(period);
                    if bucket.stopped.load(Ordering::SeqCst) {
                        debug!("stable rate limiter refill thread exiting");
                        return;
                    }
                    bucket.refill(bucket.max_threshold);
                })
                .expect("failed to spawn rate limiter refill thread"),
        );
    }

    fn stop(&self) {
        self.bucket.stopped.store(true, Ordering::SeqCst);
        let _guard = self.bucket.guard.lock().unwrap();
        self.bucket.condvar.notify_all();
    }

    fn is_stopped(&self) -> bool {
        self.bucket.stopped.load(Ordering::SeqCst)
    }
}

/// Token bucket whose ceiling grows over time: `next_threshold` climbs by
/// `ramp_up_step` every `ramp_up_period` (saturating at `max_threshold`),
/// and `current_threshold` is refreshed from it every `refill_period`.
pub struct RampUpRateLimiter {
    bucket: Arc<Bucket>,
    next_threshold: Arc<AtomicI64>,
    ramp_up_step: i64,
    ramp_up_period: Duration,
    refill_period: Duration,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl RampUpRateLimiter {
    pub fn new(
        max_threshold: i64,
        ramp_up_step: i64,
        ramp_up_period: Duration,
        refill_period: Duration,
    ) -> Self {
        Self {
            bucket: Arc::new(Bucket::new(max_threshold)),
            next_threshold: Arc::new(AtomicI64::new(0)),
            ramp_up_step,
            ramp_up_period,
            refill_period,
            threads: Mutex::new(Vec::new()),
        }
    }
}

impl RateLimiter for RampUpRateLimiter {
    fn acquire(&self) -> bool {
        loop {
            if self.bucket.stopped.load(Ordering::SeqCst) {
                return false;
            }
            if self.bucket.try_acquire() {
                return true;
            }
            self.bucket.wait_for_refill();
        }
    }

    fn start(&self) {
        self.bucket.stopped.store(false, Ordering::SeqCst);
        self.next_threshold.store(0, Ordering::SeqCst);
        self.bucket.current_threshold.store(0, Ordering::SeqCst);

        let mut threads = self.threads.lock().unwrap();
        if !threads.is_empty() {
            return;
        }

        let bucket = Arc::clone(&self.bucket);
        let next = Arc::clone(&self.next_threshold);
        let max_threshold = self.bucket.max_threshold;
        let ramp_up_step = self.ramp_up_step;
        let ramp_up_period = self.ramp_up_period;
        threads.push(
            std::thread::Builder::new()
                .name("ratelimit-rampup".to_string())
                .spawn(move || loop {
                    std::thread::sleep(ramp_up_period);
                    if bucket.stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    let _ = next.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                        Some((v + ramp_up_step).min(max_threshold))
                    });
                })
                .expect("failed to spawn ramp-up growth thread"),
        );

        let bucket = Arc::clone(&self.bucket);
        let next = Arc::clone(&self.next_threshold);
        let refill_period = self.refill_period;
        threads.push(
            std::thread::Builder::new()
                .name("ratelimit-refill".to_string())
                .spawn(move || loop {
                    std::thread::sleep(refill_period);
                    if bucket.stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    let target = next.load(Ordering::SeqCst);
                    bucket.refill(target);
                })
                .expect("failed to spawn rate limiter refill thread"),
        );
    }

    fn stop(&self) {
        self.bucket.stopped.store(true, Ordering::SeqCst);
        let _guard = self.bucket.guard.lock().unwrap();
        self.bucket.condvar.notify_all();
    }

    fn is_stopped(&self) -> bool {
        self.bucket.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn stable_limiter_grants_up_to_threshold_then_blocks_until_refill() {
        let limiter = StableRateLimiter::new(3, Duration::from_millis(100));
        limiter.start();

        for _ in 0..3 {
            assert!(limiter.acquire());
        }

        let start = Instant::now();
        assert!(limiter.acquire());
        assert!(
            start.elapsed() >= Duration::from_millis(50),
            "4th acquire should have waited for a refill"
        );
        limiter.stop();
    }

    #[test]
    fn stopped_limiter_never_blocks_acquire() {
        let limiter = StableRateLimiter::new(1, Duration::from_millis(1000));
        assert!(limiter.is_stopped());
        assert!(!limiter.acquire());
    }

    #[test]
    fn stop_wakes_a_blocked_acquire() {
        let limiter = Arc::new(StableRateLimiter::new(1, Duration::from_secs(60)));
        limiter.start();
        assert!(limiter.acquire());

        let waiter = Arc::clone(&limiter);
        let handle = std::thread::spawn(move || waiter.acquire());

        std::thread::sleep(Duration::from_millis(100));
        limiter.stop();

        let result = handle.join().expect("waiter thread should not panic");
        assert!(!result, "acquire should return false once stopped");
    }

    #[test]
    fn rampup_limiter_grows_ceiling_over_time() {
        let limiter = RampUpRateLimiter::new(
            10,
            2,
            Duration::from_millis(50),
            Duration::from_millis(50),
        );
        limiter.start();

        std::thread::sleep(Duration::from_millis(400));
        let mut granted = 0;
        for _ in 0..10 {
            if limiter.try_acquire_for_test() {
                granted += 1;
            }
        }
        assert!(granted > 0, "ramp-up should have opened some capacity");
        limiter.stop();
    }

    impl RampUpRateLimiter {
        fn try_acquire_for_test(&self) -> bool {
            self.bucket.try_acquire()
        }
    }
}

//! Statistics aggregation: per-request outcome intake, rolling and
//! cumulative counters, response-time histograms, and periodic snapshots.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const REPORT_INTERVAL_MS: u64 = 3000;
const SNAPSHOT_CHANNEL_CAPACITY: usize = 16;

/// Round a response time (ms) to 2 significant digits, matching the
/// histogram bucketing of the reference load-testing ecosystem: values
/// under 100 map to themselves, values at or above 100 round to the
/// *nearest* `10^(digits(v) - 2)`.
pub fn round_to_significant(v: u64) -> u64 {
    if v < 100 {
        return v;
    }
    let digits = v.ilog10() + 1;
    let unit = 10u64.pow(digits - 2);
    ((v + unit / 2) / unit) * unit
}

/// Per-(name, method) (or "Total") counters. Mutated exclusively by the
/// aggregator task.
#[derive(Debug, Clone)]
struct StatsEntry {
    name: String,
    method: String,
    num_requests: u64,
    num_failures: u64,
    total_response_time: u64,
    min_response_time: Option<u64>,
    max_response_time: u64,
    total_content_length: u64,
    start_time: i64,
    last_request_timestamp: i64,
    response_times: BTreeMap<u64, u64>,
    num_reqs_per_sec: BTreeMap<i64, u64>,
    num_fail_per_sec: BTreeMap<i64, u64>,
}

impl StatsEntry {
    fn new(name: impl Into<String>, method: impl Into<String>, now: i64) -> Self {
        Self {
            name: name.into(),
            method: method.into(),
            num_requests: 0,
            num_failures: 0,
            total_response_time: 0,
            min_response_time: None,
            max_response_time: 0,
            total_content_length: 0,
            start_time: now,
            last_request_timestamp: now,
            response_times: BTreeMap::new(),
            num_reqs_per_sec: BTreeMap::new(),
            num_fail_per_sec: BTreeMap::new(),
        }
    }

    fn log_request(&mut self, response_time_ms: u64, content_length: u64, now: i64) {
        self.num_requests += 1;
        self.total_response_time += response_time_ms;
        self.min_response_time = Some(
            self.min_response_time
                .map_or(response_time_ms, |m| m.min(response_time_ms)),
        );
        self.max_response_time = self.max_response_time.max(response_time_ms);
        self.total_content_length += content_length;
        self.last_request_timestamp = now;
        *self
            .response_times
            .entry(round_to_significant(response_time_ms))
            .or_insert(0) += 1;
        *self.num_reqs_per_sec.entry(now).or_insert(0) += 1;
    }

    fn log_failure(&mut self, now: i64) {
        self.num_failures += 1;
        *self.num_fail_per_sec.entry(now).or_insert(0) += 1;
    }

    fn to_report(&self) -> StatsEntryReport {
        StatsEntryReport {
            name: self.name.clone(),
            method: self.method.clone(),
            last_request_timestamp: self.last_request_timestamp,
            start_time: self.start_time,
            num_requests: self.num_requests,
            num_none_requests: 0,
            num_failures: self.num_failures,
            total_response_time: self.total_response_time,
            max_response_time: self.max_response_time,
            min_response_time: self.min_response_time.unwrap_or(0),
            total_content_length: self.total_content_length,
            response_times: self.response_times.clone(),
            num_reqs_per_sec: self.num_reqs_per_sec.clone(),
            num_fail_per_sec: self.num_fail_per_sec.clone(),
        }
    }
}

/// Wire-visible, stripped form of a [`StatsEntry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsEntryReport {
    pub name: String,
    pub method: String,
    pub last_request_timestamp: i64,
    pub start_time: i64,
    pub num_requests: u64,
    /// Always 0 from this implementation; carried for wire compatibility
    /// with masters that expect the field present.
    pub num_none_requests: u64,
    pub num_failures: u64,
    pub total_response_time: u64,
    pub max_response_time: u64,
    pub min_response_time: u64,
    pub total_content_length: u64,
    pub response_times: BTreeMap<u64, u64>,
    pub num_reqs_per_sec: BTreeMap<i64, u64>,
    pub num_fail_per_sec: BTreeMap<i64, u64>,
}

/// One bucket of identical errors, fingerprinted by `md5(method || name ||
/// error_text)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsError {
    pub method: String,
    pub name: String,
    pub error_text: String,
    pub occurrences: u64,
}

fn error_fingerprint(method: &str, name: &str, error_text: &str) -> String {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(method.as_bytes());
    hasher.update(name.as_bytes());
    hasher.update(error_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// One reporting-interval snapshot handed to the runner's relay loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSnapshot {
    pub stats: Vec<StatsEntryReport>,
    pub stats_total: StatsEntryReport,
    pub errors: HashMap<String, StatsError>,
}

enum Event {
    Success {
        method: String,
        name: String,
        response_time_ms: u64,
        content_length: u64,
    },
    Failure {
        method: String,
        name: String,
        response_time_ms: u64,
        error_text: String,
    },
    Clear,
    Tick,
}

/// Cloneable handle producers use to report outcomes into the aggregator.
///
/// All methods are non-blocking and never fail from the caller's
/// perspective: the underlying channel is unbounded, so a producer never
/// backs up waiting on the aggregator task.
#[derive(Clone)]
pub struct StatsAggregatorHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl StatsAggregatorHandle {
    pub fn report_success(
        &self,
        method: impl Into<String>,
        name: impl Into<String>,
        response_time_ms: u64,
        content_length: u64,
    ) {
        let _ = self.tx.send(Event::Success {
            method: method.into(),
            name: name.into(),
            response_time_ms,
            content_length,
        });
    }

    pub fn report_failure(
        &self,
        method: impl Into<String>,
        name: impl Into<String>,
        response_time_ms: u64,
        error_text: impl Into<String>,
    ) {
        let _ = self.tx.send(Event::Failure {
            method: method.into(),
            name: name.into(),
            response_time_ms,
            error_text: error_text.into(),
        });
    }

    /// Request a full reset of all counters at the next aggregation tick.
    pub fn request_clear(&self) {
        let _ = self.tx.send(Event::Clear);
    }

    fn tick(&self) {
        let _ = self.tx.send(Event::Tick);
    }
}

const TOTAL_KEY: &str = "Total";

/// Absorbs per-request outcomes off the hot path and emits periodic
/// [`ReportSnapshot`]s.
///
/// Producers never touch the entry table directly; only the task spawned by
/// [`StatsAggregator::spawn`] mutates it, so no lock is needed around the
/// table itself.
pub struct StatsAggregator {
    entries: HashMap<(String, String), StatsEntry>,
    errors: HashMap<String, StatsError>,
    rx: mpsc::UnboundedReceiver<Event>,
    snapshot_tx: mpsc::Sender<ReportSnapshot>,
    report_interval_ms: u64,
}

impl StatsAggregator {
    /// Build a fresh aggregator plus the handle producers use to feed it and
    /// the receiving half of the snapshot channel. `report_interval_ms`
    /// governs the automatic tick (see [`crate::config::WorkerConfig`]);
    /// pass [`REPORT_INTERVAL_MS`] for the protocol default.
    pub fn new(
        report_interval_ms: u64,
    ) -> (StatsAggregatorHandle, StatsAggregator, mpsc::Receiver<ReportSnapshot>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = mpsc::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let handle = StatsAggregatorHandle { tx };
        let aggregator = StatsAggregator {
            entries: HashMap::new(),
            errors: HashMap::new(),
            rx,
            snapshot_tx,
            report_interval_ms,
        };
        (handle, aggregator, snapshot_rx)
    }

    fn entry(&mut self, method: &str, name: &str, now: i64) -> &mut StatsEntry {
        self.entries
            .entry((method.to_string(), name.to_string()))
            .or_insert_with(|| StatsEntry::new(name, method, now))
    }

    fn total(&mut self, now: i64) -> &mut StatsEntry {
        self.entries
            .entry((TOTAL_KEY.to_string(), TOTAL_KEY.to_string()))
            .or_insert_with(|| StatsEntry::new(TOTAL_KEY, TOTAL_KEY, now))
    }

    fn log_request(&mut self, method: &str, name: &str, response_time_ms: u64, content_length: u64, now: i64) {
        self.entry(method, name, now)
            .log_request(response_time_ms, content_length, now);
        self.total(now).log_request(response_time_ms, content_length, now);
    }

    fn log_error(&mut self, method: &str, name: &str, response_time_ms: u64, error_text: &str, now: i64) {
        self.entry(method, name, now).log_failure(now);
        self.total(now).log_failure(now);
        let fp = error_fingerprint(method, name, error_text);
        self.errors
            .entry(fp)
            .and_modify(|e| e.occurrences += 1)
            .or_insert_with(|| StatsError {
                method: method.to_string(),
                name: name.to_string(),
                error_text: error_text.to_string(),
                occurrences: 1,
            });
        // A failed attempt both records the failure above and still counts
        // as a logged request (the response, however bad, did happen).
        self.log_request(method, name, response_time_ms, 0, now);
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.errors.clear();
    }

    fn build_snapshot(&mut self, now: i64) -> ReportSnapshot {
        let stats: Vec<StatsEntryReport> = self
            .entries
            .values()
            .filter(|e| e.name != TOTAL_KEY && (e.num_requests > 0 || e.num_failures > 0))
            .map(StatsEntry::to_report)
            .collect();
        let stats_total = self.total(now).to_report();
        let errors = std::mem::take(&mut self.errors);
        ReportSnapshot {
            stats,
            stats_total,
            errors,
        }
    }

    /// Drive the aggregation loop. Intended to be spawned as a `tokio::task`
    /// and run for the lifetime of the worker; returns when every producer
    /// handle has been dropped and the input channel is closed.
    pub async fn run(mut self) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_millis(self.report_interval_ms));
        loop {
            tokio::select! {
                biased;
                _ = ticker.tick() => {
                    let now = unix_seconds();
                    let snapshot = self.build_snapshot(now);
                    if self.snapshot_tx.try_send(snapshot).is_err() {
                        warn!("stats snapshot channel full or closed; dropping snapshot");
                    }
                }
                event = self.rx.recv() => {
                    match event {
                        Some(Event::Clear) => self.clear(),
                        Some(Event::Tick) => {
                            let now = unix_seconds();
                            let snapshot = self.build_snapshot(now);
                            let _ = self.snapshot_tx.try_send(snapshot);
                        }
                        Some(Event::Success { method, name, response_time_ms, content_length }) => {
                            let now = unix_seconds();
                            self.log_request(&method, &name, response_time_ms, content_length, now);
                        }
                        Some(Event::Failure { method, name, response_time_ms, error_text }) => {
                            let now = unix_seconds();
                            self.log_error(&method, &name, response_time_ms, &error_text, now);
                        }
                        None => {
                            debug!("stats aggregator input channel closed, exiting");
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn unix_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

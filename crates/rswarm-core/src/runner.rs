//! The worker state machine and spawn controller: owns the transport, the
//! control-plane threads, and the live `UserWorker` population.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::RswarmError;
use crate::message::{generate_node_id, Message, MessageKind};
use crate::ratelimit::RateLimiter;
use crate::stats::{ReportSnapshot, StatsAggregator, StatsAggregatorHandle};
use crate::task::{TaskSelector, WeightedTask};
use crate::transport::{RecvOutcome, RpcTransport};
use crate::user::UserWorker;

/// After this many consecutive heartbeat send failures, the runner gives up
/// on the current connection and transitions to `Missing`.
const MAX_CONSECUTIVE_HEARTBEAT_FAILURES: u32 = 3;

/// The worker's lifecycle state, driven entirely by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    #[default]
    Ready,
    Spawning,
    Running,
    Stopped,
    Quitting,
    Missing,
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunnerState::Ready => "ready",
            RunnerState::Spawning => "spawning",
            RunnerState::Running => "running",
            RunnerState::Stopped => "stopped",
            RunnerState::Quitting => "quitting",
            RunnerState::Missing => "missing",
        };
        write!(f, "{s}")
    }
}

/// One live simulated user: its cancellation handle and join handle.
///
/// `_join` is kept only so the task stays tracked in `population` for its
/// natural lifetime; it is never polled or aborted — cancellation is
/// signalled exclusively through `cancel`, and the task detaches and runs
/// to its own next cancellation check when this handle is dropped.
struct UserHandle {
    cancel: CancellationToken,
    _join: tokio::task::JoinHandle<()>,
}

/// The worker's spawn/stop/quit state machine, control threads, and the
/// user population it reconciles against the master's target.
///
/// Constructed inside a Tokio runtime context (the control threads bridge
/// back into it via a captured [`Handle`]); the user population runs as
/// ordinary `tokio::task`s on that same runtime.
pub struct Runner {
    node_id: String,
    config: WorkerConfig,
    transport: Arc<RpcTransport>,
    runtime: Handle,

    state: RwLock<RunnerState>,
    /// Bumped on every `stop`/`quit`; an in-flight reconcile loop aborts
    /// (without sending `spawning_complete`) once it observes a new epoch.
    epoch: AtomicU64,
    target_count: AtomicI64,
    reconciling: AtomicBool,
    population: std::sync::Mutex<Vec<UserHandle>>,

    selector: Arc<TaskSelector>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    stats: StatsAggregatorHandle,

    last_inbound: std::sync::Mutex<Instant>,
    consecutive_heartbeat_failures: AtomicU32,
    shutdown: AtomicBool,
}

impl Runner {
    /// Build a worker runner. Validates `config` first (fatal on error —
    /// nothing is spawned if validation fails), then connects the
    /// transport and builds the stats aggregator and task selector.
    ///
    /// Must be called from within a Tokio runtime (its [`Handle`] is
    /// captured for bridging the control threads' blocking I/O back to the
    /// async user population).
    pub fn new(config: WorkerConfig, tasks: Vec<WeightedTask>) -> Result<Arc<Self>, RswarmError> {
        config.validate()?;

        let transport = RpcTransport::connect(
            &config.master_host,
            config.master_port,
            config.recv_timeout_ms as i32,
        )?;

        let (stats_handle, aggregator, snapshot_rx) = StatsAggregator::new(config.report_interval_ms);
        let runtime = Handle::current();
        runtime.spawn(aggregator.run());

        let rate_limiter = config.rate_limiter.build();
        let selector = Arc::new(TaskSelector::new(tasks));
        let node_id = generate_node_id();

        let runner = Arc::new(Runner {
            node_id,
            config,
            transport: Arc::new(transport),
            runtime,
            state: RwLock::new(RunnerState::Ready),
            epoch: AtomicU64::new(0),
            target_count: AtomicI64::new(0),
            reconciling: AtomicBool::new(false),
            population: std::sync::Mutex::new(Vec::new()),
            selector,
            rate_limiter,
            stats: stats_handle,
            last_inbound: std::sync::Mutex::new(Instant::now()),
            consecutive_heartbeat_failures: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
        });

        runner.spawn_control_threads(snapshot_rx);
        Ok(runner)
    }

    pub fn state(&self) -> RunnerState {
        *self.state.read().unwrap()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// A handle producers (`Task` implementations) report outcomes through.
    pub fn stats_handle(&self) -> StatsAggregatorHandle {
        self.stats.clone()
    }

    fn set_state(&self, new: RunnerState) {
        let mut guard = self.state.write().unwrap();
        if *guard != new {
            info!(from = %*guard, to = %new, "runner state transition");
        }
        *guard = new;
    }

    fn population_len(&self) -> usize {
        self.population.lock().unwrap().len()
    }

    /// Send the initial handshake; the master is expected to answer with
    /// `ack`. Call once after `new` returns, before the control threads'
    /// first heartbeat would otherwise race it.
    pub fn announce(&self) -> Result<(), RswarmError> {
        self.send(Message::client_ready(&self.node_id))
    }

    fn send(&self, message: Message) -> Result<(), RswarmError> {
        self.transport.send(&message)
    }

    // -----------------------------------------------------------------
    // Control pool: four long-lived OS threads, independent of the Tokio
    // runtime driving user workers.
    // -----------------------------------------------------------------

    fn spawn_control_threads(
        self: &Arc<Self>,
        snapshot_rx: tokio::sync::mpsc::Receiver<ReportSnapshot>,
    ) {
        let receiver = Arc::clone(self);
        std::thread::Builder::new()
            .name("rswarm-receiver".to_string())
            .spawn(move || receiver.receiver_loop())
            .expect("failed to spawn receiver thread");

        let sender = Arc::clone(self);
        std::thread::Builder::new()
            .name("rswarm-sender".to_string())
            .spawn(move || sender.sender_loop(snapshot_rx))
            .expect("failed to spawn sender thread");

        let heartbeater = Arc::clone(self);
        std::thread::Builder::new()
            .name("rswarm-heartbeater".to_string())
            .spawn(move || heartbeater.heartbeater_loop())
            .expect("failed to spawn heartbeater thread");

        let watcher = Arc::clone(self);
        std::thread::Builder::new()
            .name("rswarm-liveness-watcher".to_string())
            .spawn(move || watcher.liveness_watcher_loop())
            .expect("failed to spawn liveness watcher thread");
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Reads inbound messages and dispatches them; exits (and moves the
    /// runner to `Quitting`) on any transport error other than a bounded
    /// receive timeout.
    fn receiver_loop(self: Arc<Self>) {
        loop {
            if self.is_shutting_down() {
                debug!("receiver loop exiting: shutdown requested");
                return;
            }
            match self.transport.recv() {
                Ok(RecvOutcome::Received(message)) => {
                    *self.last_inbound.lock().unwrap() = Instant::now();
                    self.dispatch(message);
                }
                Ok(RecvOutcome::TimedOut) => continue,
                Err(RswarmError::TransportFatal(msg)) => {
                    error!(error = %msg, "transport closed unexpectedly; receiver exiting");
                    self.transition_to_quitting();
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "transient receive error");
                }
            }
        }
    }

    /// Relays stats snapshots to the master as `stats` messages. Runs on
    /// its own control thread so a slow/blocked master send never backs up
    /// the aggregator's bounded snapshot channel.
    fn sender_loop(self: Arc<Self>, mut snapshot_rx: tokio::sync::mpsc::Receiver<ReportSnapshot>) {
        loop {
            if self.is_shutting_down() {
                debug!("sender loop exiting: shutdown requested");
                return;
            }
            match snapshot_rx.blocking_recv() {
                Some(snapshot) => {
                    let message = self.build_stats_message(snapshot);
                    if let Err(err) = self.send(message) {
                        warn!(error = %err, "failed to relay stats snapshot; dropping it");
                    }
                }
                None => {
                    debug!("stats snapshot channel closed, sender loop exiting");
                    return;
                }
            }
        }
    }

    fn build_stats_message(&self, snapshot: ReportSnapshot) -> Message {
        let mut data = crate::message::MessageData::new();
        data.insert("stats".to_string(), serde_json::json!(snapshot.stats));
        data.insert(
            "stats_total".to_string(),
            serde_json::json!(snapshot.stats_total),
        );
        data.insert("errors".to_string(), serde_json::json!(snapshot.errors));
        data.insert(
            "user_count".to_string(),
            serde_json::json!(self.population_len() as u32),
        );
        Message::new(MessageKind::Stats.as_str(), data, &self.node_id)
    }

    /// Emits `heartbeat{state, current_cpu_usage, count}` every
    /// `heartbeat_interval_ms`. After three consecutive send failures the
    /// runner gives up on the current connection and moves to `Missing`.
    fn heartbeater_loop(self: Arc<Self>) {
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        loop {
            if self.is_shutting_down() {
                debug!("heartbeater loop exiting: shutdown requested");
                return;
            }
            std::thread::sleep(interval);
            if self.is_shutting_down() {
                return;
            }
            let state = self.state();
            let message = Message::heartbeat(
                &self.node_id,
                &state.to_string(),
                current_cpu_usage(),
                self.population_len() as u32,
            );
            match self.send(message) {
                Ok(()) => {
                    self.consecutive_heartbeat_failures.store(0, Ordering::SeqCst);
                }
                Err(err) => {
                    warn!(error = %err, "heartbeat send failed");
                    let failures = self
                        .consecutive_heartbeat_failures
                        .fetch_add(1, Ordering::SeqCst)
                        + 1;
                    if failures >= MAX_CONSECUTIVE_HEARTBEAT_FAILURES {
                        warn!(failures, "too many consecutive heartbeat failures, marking missing");
                        self.set_state(RunnerState::Missing);
                    }
                }
            }
        }
    }

    /// Watches inbound traffic; if the master has been silent for
    /// `master_missing_ms`, transitions to `Missing`.
    fn liveness_watcher_loop(self: Arc<Self>) {
        let missing_after = Duration::from_millis(self.config.master_missing_ms);
        let poll = Duration::from_millis(self.config.recv_timeout_ms);
        loop {
            if self.is_shutting_down() {
                debug!("liveness watcher loop exiting: shutdown requested");
                return;
            }
            std::thread::sleep(poll);
            let elapsed = self.last_inbound.lock().unwrap().elapsed();
            if elapsed >= missing_after && self.state() != RunnerState::Missing {
                warn!(?elapsed, "master silent past master_missing_ms, marking missing");
                self.set_state(RunnerState::Missing);
            }
        }
    }

    fn transition_to_quitting(&self) {
        // Bump the epoch here too (not just in `handle_quit`): this is also
        // reached from the receiver loop on a fatal transport error, and an
        // in-flight reconcile must not be able to adopt a fresh worker into
        // the population after the transport has gone away.
        self.stop_population_for_epoch();
        self.transport.close();
        self.shutdown.store(true, Ordering::SeqCst);
        self.set_state(RunnerState::Quitting);
    }

    // -----------------------------------------------------------------
    // Inbound message dispatch — runs on the receiver thread, which is the
    // sole mutator of `state`, `target_count`, `epoch`, and `population`.
    // -----------------------------------------------------------------

    fn dispatch(self: &Arc<Self>, message: Message) {
        match message.kind() {
            Some(MessageKind::Spawn) => self.handle_spawn(&message),
            Some(MessageKind::Stop) => self.handle_stop(),
            Some(MessageKind::Quit) => self.handle_quit(),
            Some(MessageKind::Reconnect) => self.handle_reconnect(),
            Some(MessageKind::Ack) => self.handle_ack(),
            Some(MessageKind::Heartbeat) => {
                // Liveness only; already recorded via `last_inbound` above.
            }
            Some(other) => {
                debug!(kind = %other, "ignoring inbound message of outbound-only type");
            }
            None => {
                debug!(message_type = %message.message_type, "ignoring unknown message type");
            }
        }
    }

    fn handle_spawn(self: &Arc<Self>, message: &Message) {
        let user_count = message
            .data
            .get("user_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as i64;
        let spawn_rate = message
            .data
            .get("spawn_rate")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0);

        self.target_count.store(user_count, Ordering::SeqCst);

        let state = self.state();
        if state == RunnerState::Quitting {
            return;
        }
        self.set_state(RunnerState::Spawning);

        if self
            .reconciling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let epoch = self.epoch.load(Ordering::SeqCst);
            let runner = Arc::clone(self);
            self.runtime.spawn(async move {
                runner.reconcile(epoch, spawn_rate).await;
            });
        }
        // If already reconciling, the in-flight task re-reads `target_count`
        // every step, so a retarget needs no new task.
    }

    /// Spawn-up/tear-down loop. Aborts silently (no `spawning_complete`) if
    /// a `stop`/`quit` bumps `epoch` while this is running.
    async fn reconcile(self: Arc<Self>, epoch: u64, spawn_rate: f64) {
        loop {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                self.reconciling.store(false, Ordering::SeqCst);
                return;
            }
            let target = self.target_count.load(Ordering::SeqCst).max(0) as usize;
            let current = self.population_len();

            if current == target {
                break;
            } else if current < target {
                self.spawn_one_user(epoch);
                if spawn_rate > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(1.0 / spawn_rate)).await;
                }
            } else {
                self.stop_one_user();
            }
        }

        self.reconciling.store(false, Ordering::SeqCst);
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }

        let user_count = self.population_len() as u32;
        if let Some(limiter) = &self.rate_limiter {
            limiter.start();
        }
        let message = Message::spawning_complete(&self.node_id, user_count);
        if let Err(err) = tokio::task::block_in_place(|| self.send(message)) {
            warn!(error = %err, "failed to send spawning_complete");
        }
        self.set_state(RunnerState::Running);
    }

    /// Spawn one new `UserWorker` and adopt it into the population — unless
    /// `epoch` has moved on since the caller decided to spawn, in which case
    /// a concurrent `stop`/`quit` has already drained the population and
    /// this worker must never be added to it. The epoch recheck happens
    /// while holding the population lock so it is strictly ordered against
    /// `stop_population_for_epoch`'s own epoch-bump-then-drain, the only
    /// other mutator of `population` (spec §5's "strictly serialized by
    /// [the dispatch loop]" requirement, extended to cover this
    /// runtime-task-side mutation too).
    fn spawn_one_user(self: &Arc<Self>, epoch: u64) {
        let cancel = CancellationToken::new();
        let worker = UserWorker::new(
            Arc::clone(&self.selector),
            self.rate_limiter.clone(),
            self.stats.clone(),
            cancel.clone(),
        );
        let join = self.runtime.spawn(worker.run());

        let mut population = self.population.lock().unwrap();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            drop(population);
            // A stop/quit raced us and already drained whatever existed at
            // the time; this worker never became part of the population, so
            // just signal it directly and let the detached task notice on
            // its own next iteration. No forcible termination.
            cancel.cancel();
            return;
        }
        population.push(UserHandle { cancel, _join: join });
    }

    /// Pop the most recently spawned worker and signal it to stop. Does
    /// not block on its exit — the cancellation flag is sufficient and the
    /// `JoinHandle` is simply dropped (detaching the task); the worker
    /// notices the cancellation between iterations and exits on its own.
    fn stop_one_user(&self) {
        let handle = self.population.lock().unwrap().pop();
        if let Some(handle) = handle {
            handle.cancel.cancel();
        }
    }

    /// Bump `epoch` and drain+cancel the population as one atomic step
    /// (held under the population lock), so a concurrent `spawn_one_user`
    /// either completes its push entirely before this runs (and the worker
    /// gets cancelled here) or observes the new epoch when it re-checks
    /// under the same lock (and never adopts the worker at all). Never
    /// forcibly terminates a worker — only signals the cancellation token.
    fn stop_population_for_epoch(&self) {
        let mut population = self.population.lock().unwrap();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        for handle in population.drain(..) {
            handle.cancel.cancel();
        }
    }

    fn handle_stop(self: &Arc<Self>) {
        if self.state() == RunnerState::Quitting {
            return;
        }
        self.reconciling.store(false, Ordering::SeqCst);
        self.stop_population_for_epoch();
        self.target_count.store(0, Ordering::SeqCst);
        if let Some(limiter) = &self.rate_limiter {
            limiter.stop();
        }
        if let Err(err) = self.send(Message::client_stopped(&self.node_id)) {
            warn!(error = %err, "failed to send client_stopped");
        }
        self.set_state(RunnerState::Stopped);
    }

    fn handle_quit(self: &Arc<Self>) {
        self.reconciling.store(false, Ordering::SeqCst);
        self.stop_population_for_epoch();
        self.target_count.store(0, Ordering::SeqCst);
        if let Some(limiter) = &self.rate_limiter {
            limiter.stop();
        }
        let _ = self.send(Message::client_stopped(&self.node_id));
        self.transition_to_quitting();
    }

    /// Per Open Question §9: `reconnect` preserves accumulated stats and
    /// re-sends the `client_ready` handshake rather than resetting.
    fn handle_reconnect(&self) {
        info!("master requested reconnect; re-sending client_ready");
        if let Err(err) = self.send(Message::client_ready(&self.node_id)) {
            warn!(error = %err, "failed to resend client_ready on reconnect");
        }
    }

    fn handle_ack(&self) {
        if self.state() == RunnerState::Missing {
            self.consecutive_heartbeat_failures.store(0, Ordering::SeqCst);
            self.set_state(RunnerState::Ready);
        }
    }
}

/// CPU sampling is out of scope for this runtime; the reference protocol's
/// `heartbeat` field is carried for wire compatibility but always reports 0.
fn current_cpu_usage() -> f64 {
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_is_ready() {
        assert_eq!(RunnerState::default(), RunnerState::Ready);
    }

    #[test]
    fn state_display_matches_wire_strings() {
        assert_eq!(RunnerState::Ready.to_string(), "ready");
        assert_eq!(RunnerState::Spawning.to_string(), "spawning");
        assert_eq!(RunnerState::Running.to_string(), "running");
        assert_eq!(RunnerState::Stopped.to_string(), "stopped");
        assert_eq!(RunnerState::Quitting.to_string(), "quitting");
        assert_eq!(RunnerState::Missing.to_string(), "missing");
    }

    #[test]
    fn current_cpu_usage_is_a_finite_placeholder() {
        assert_eq!(current_cpu_usage(), 0.0);
    }
}

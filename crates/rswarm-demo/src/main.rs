//! Example worker binary: wires a trivial HTTP task into `rswarm-core`'s
//! `Runner`, reading master host/port from the CLI and installing a
//! `tracing_subscriber` filter from `RUST_LOG`.
//!
//! This binary — not the library — owns argument parsing, env vars, and
//! the global tracing subscriber, matching the crate's stated boundary:
//! `rswarm-core` never claims those rights from its embedder.

use std::time::Instant;

use async_trait::async_trait;
use clap::Parser;
use rswarm_core::task::{Task, TaskError, WeightedTask};
use rswarm_core::user::UserContext;
use rswarm_core::{RateLimiterConfig, Runner, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "rswarm-demo", about = "Example load-generator worker")]
struct Cli {
    /// Master host to connect to.
    #[arg(long, default_value = "127.0.0.1")]
    master_host: String,

    /// Master DEALER/ROUTER port.
    #[arg(long, default_value_t = 5557)]
    master_port: u16,

    /// Aggregate stable-rate-limiter ceiling; omit for no limiting.
    #[arg(long)]
    max_rps: Option<i64>,

    /// URL the example task requests.
    #[arg(long, default_value = "https://example.com")]
    target_url: String,
}

/// A minimal HTTP GET task: times the request itself and self-reports the
/// outcome, the pattern `rswarm-core::task::Task` implementations are
/// expected to follow.
struct HttpGetTask {
    client: reqwest::Client,
    url: String,
}

#[async_trait]
impl Task for HttpGetTask {
    fn name(&self) -> &str {
        "http_get"
    }

    async fn execute(&self, ctx: &UserContext) -> Result<(), TaskError> {
        let started = Instant::now();
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                let status = response.status();
                let bytes = response
                    .bytes()
                    .await
                    .map(|b| b.len() as u64)
                    .unwrap_or(0);
                let elapsed = started.elapsed().as_millis() as u64;
                if status.is_success() {
                    ctx.report_success("GET", &self.url, elapsed, bytes);
                    Ok(())
                } else {
                    let msg = format!("unexpected status {status}");
                    ctx.report_failure("GET", &self.url, elapsed, &msg);
                    Err(TaskError::failed(msg))
                }
            }
            Err(e) => {
                let elapsed = started.elapsed().as_millis() as u64;
                ctx.report_failure("GET", &self.url, elapsed, e.to_string());
                Err(TaskError::failed(e.to_string()))
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let rate_limiter = match cli.max_rps {
        Some(max) => RateLimiterConfig::Stable {
            max_threshold: max,
            period_ms: 1000,
        },
        None => RateLimiterConfig::None,
    };

    let config = WorkerConfig {
        master_host: cli.master_host,
        master_port: cli.master_port,
        max_rps: cli.max_rps.map(|v| v as f64),
        rate_limiter,
        ..WorkerConfig::default()
    };

    let client = reqwest::Client::builder()
        .user_agent(format!("rswarm-demo/{}", env!("CARGO_PKG_VERSION")))
        .build()?;
    let task = WeightedTask::new(
        std::sync::Arc::new(HttpGetTask {
            client,
            url: cli.target_url,
        }),
        1,
    );

    let runner = Runner::new(config, vec![task])?;
    runner.announce()?;

    tracing::info!(node_id = runner.node_id(), "worker ready, awaiting master");

    // Block the main task forever; the control threads and user population
    // drive the worker's actual lifecycle. A real deployment would instead
    // await a shutdown signal (SIGTERM, a Quitting-state watch, etc.).
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        if runner.state() == rswarm_core::RunnerState::Quitting {
            break;
        }
    }

    Ok(())
}

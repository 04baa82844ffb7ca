use std::convert::Infallible;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use slidegate::config::{LoggingConfig, SlidegateConfig};
use slidegate::error::DispatchError;
use slidegate::ratelimit::{CallContext, Gate, Sender, WaitPolicy};

/// Drive a burst of requests through a sliding-window gate.
#[derive(Debug, Parser)]
#[command(name = "slidegate", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of requests to send
    #[arg(short = 'n', long, default_value_t = 100)]
    requests: usize,

    /// Requests in flight at once
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Per-request deadline in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Target URL for the simulated requests
    #[arg(long, default_value = "http://localhost/")]
    url: String,

    /// Wait for an opening instead of rejecting
    #[arg(long)]
    wait: bool,

    /// Simulated sender latency in milliseconds
    #[arg(long, default_value_t = 0)]
    latency_ms: u64,

    /// Print the summary as JSON on stdout
    #[arg(long)]
    summary_json: bool,
}

/// Stand-in transport that answers every request with 200 OK.
struct SimulatedSender {
    latency: Duration,
}

#[async_trait]
impl Sender for SimulatedSender {
    type Request = http::Request<Bytes>;
    type Response = http::StatusCode;
    type Error = Infallible;

    async fn send(&self, request: Self::Request) -> Result<Self::Response, Self::Error> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        debug!(method = %request.method(), uri = %request.uri(), "Request sent");
        Ok(http::StatusCode::OK)
    }
}

/// Outcome counts for a run.
#[derive(Debug, Default, Serialize)]
struct Summary {
    admitted: usize,
    rate_limited: usize,
    past_deadline: usize,
    canceled: usize,
    store_failures: usize,
    elapsed_ms: u64,
}

impl Summary {
    fn record(&mut self, outcome: Result<http::StatusCode, DispatchError<Infallible>>) {
        match outcome {
            Ok(_) => self.admitted += 1,
            Err(DispatchError::RateLimitExceeded) => self.rate_limited += 1,
            Err(DispatchError::WaitWouldExceedDeadline { .. }) => self.past_deadline += 1,
            Err(DispatchError::Context(_)) => self.canceled += 1,
            Err(e) if e.is_infrastructure() => self.store_failures += 1,
            Err(e) => debug!(error = %e, "Request failed"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = SlidegateConfig::load(cli.config.as_deref())?;
    if cli.wait {
        config.gate.wait_policy = WaitPolicy::WaitForOpening;
    }

    init_tracing(&config.logging);

    info!("Starting Slidegate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        interval_secs = config.gate.interval_secs,
        quota = config.gate.quota,
        wait_policy = ?config.gate.wait_policy,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    let store = config.store.build(&config.gate);
    let sender = SimulatedSender {
        latency: Duration::from_millis(cli.latency_ms),
    };
    let gate = Gate::with_config(sender, store, config.gate)?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let started = Instant::now();
    let gate = &gate;
    let outcomes: Vec<_> = stream::iter(0..cli.requests)
        .map(|_| {
            let mut ctx = CallContext::with_token(shutdown.child_token());
            if let Some(timeout_ms) = cli.timeout_ms {
                ctx = ctx.with_timeout(Duration::from_millis(timeout_ms));
            }
            let url = cli.url.as_str();
            async move { gate.get(&ctx, url).await }
        })
        .buffer_unordered(cli.concurrency.max(1))
        .collect()
        .await;

    let mut summary = Summary::default();
    for outcome in outcomes {
        summary.record(outcome);
    }
    summary.elapsed_ms = started.elapsed().as_millis() as u64;

    info!(
        admitted = summary.admitted,
        rate_limited = summary.rate_limited,
        past_deadline = summary.past_deadline,
        canceled = summary.canceled,
        store_failures = summary.store_failures,
        elapsed_ms = summary.elapsed_ms,
        "Run complete"
    );
    if cli.summary_json {
        println!("{}", serde_json::to_string(&summary)?);
    }

    Ok(())
}

/// Initialize tracing from the logging configuration. `RUST_LOG` wins.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, canceling in-flight requests");
        }
        _ = terminate => {
            info!("Received SIGTERM, canceling in-flight requests");
        }
    }
}

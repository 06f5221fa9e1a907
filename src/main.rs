use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use windowgate::admission::{Admission, AdmissionGate};
use windowgate::config::{GateConfig, LoggingConfig};
use windowgate::ratelimit::{ClientKey, SlidingWindowLimiter, SystemClock};
use windowgate::store::{CounterStore, MemoryCounterStore, RedisCounterStore};

/// Sliding-window admission control against a shared counter store.
///
/// Reads one client key per line from stdin and prints one decision per line.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// YAML configuration file; `WINDOWGATE__*` variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Keep counters in process memory instead of Redis
    #[arg(long)]
    memory: bool,

    /// Report decisions without counting requests
    #[arg(long)]
    peek: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = GateConfig::load(args.config.as_deref())?;
    init_tracing(&config.logging);

    info!("Starting Windowgate admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    config.validate()?;
    let policy = config.limiter.policy()?;
    info!(
        limit = policy.limit(),
        window_ms = policy.window_size_ms(),
        sub_windows = policy.num_sub_windows(),
        expiry = ?config.limiter.expiry,
        "Configuration loaded"
    );

    if args.memory {
        let clock = Arc::new(SystemClock::new());
        let store = Arc::new(MemoryCounterStore::new(clock));
        run(&config, store, args.peek).await
    } else {
        let store = Arc::new(RedisCounterStore::connect_with_config(config.store.clone()).await?);
        run(&config, store, args.peek).await
    }
}

async fn run<S: CounterStore + 'static>(
    config: &GateConfig,
    store: Arc<S>,
    peek: bool,
) -> anyhow::Result<()> {
    let limiter = Arc::new(SlidingWindowLimiter::with_options(
        config.limiter.policy()?,
        config.limiter.salt(),
        store,
        Arc::new(SystemClock::new()),
        config.limiter.options()?,
    ));
    let gate = AdmissionGate::new(Arc::clone(&limiter), config.admission.failure_policy);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut shutdown => break,
        };
        let Some(line) = line else { break };
        let key = line.trim();
        if key.is_empty() {
            continue;
        }

        let output = if peek {
            describe_peek(limiter.as_ref(), key).await
        } else {
            describe(&gate.admit(&ClientKey::new(key)).await)
        };
        stdout.write_all(output.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    info!("Windowgate admission control stopped");
    Ok(())
}

async fn describe_peek<S: CounterStore>(limiter: &SlidingWindowLimiter<S>, key: &str) -> String {
    match limiter.peek(key).await {
        Ok(d) => format!(
            "{} count={} limit={} remaining={}",
            if d.allowed { "would-allow" } else { "would-deny" },
            d.count,
            d.limit,
            d.remaining()
        ),
        Err(e) => format!("error {}", e),
    }
}

fn describe(admission: &Admission) -> String {
    match admission {
        Admission::Proceed { decision: Some(d) } => format!(
            "{} allow count={} remaining={}",
            admission.status_code(),
            d.count,
            d.remaining()
        ),
        Admission::Proceed { decision: None } => {
            format!("{} allow (fail-open)", admission.status_code())
        }
        Admission::Reject { decision } => format!(
            "{} deny count={} retry_after={}s",
            admission.status_code(),
            decision.count,
            admission.retry_after_secs().unwrap_or_default()
        ),
        Admission::Unavailable { reason } | Admission::BadRequest { reason } => {
            format!("{} error {}", admission.status_code(), reason)
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    // Logs go to stderr so stdout carries only decisions.
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

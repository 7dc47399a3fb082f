//! Chat Roulette simulation runner
//!
//! Runs a number of simulated users against an in-memory document store,
//! optionally injecting a store outage, and reports how they were paired.

use anyhow::{anyhow, Result};
use chat_roulette::config::AppConfig;
use chat_roulette::service::{HealthCheck, HealthStatus};
use chat_roulette::{InMemoryDocumentStore, Matchmaker, PairingOutcome, Preferences};
use clap::Parser;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Chat Roulette - race-free random-chat matchmaking
#[derive(Parser)]
#[command(
    name = "chat-roulette",
    version,
    about = "Simulate anonymous users being paired into chats over a shared document store",
    long_about = "Spawns simulated users that each run their own polling matchmaking loop against \
                 an in-memory document store. Pairing is coordinated only through atomic claim \
                 transactions on the store; optional outage injection exercises recovery."
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Path to configuration file (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Log level override
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Override log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, help = "Enable debug mode with verbose logging")]
    debug: bool,

    /// Dry run mode (validate config and exit)
    #[arg(long, help = "Validate configuration and exit without simulating")]
    dry_run: bool,

    /// Perform health check and exit
    #[arg(long, help = "Perform a health check and exit with status code")]
    health_check: bool,

    /// Number of simulated users
    #[arg(short, long, default_value_t = 10)]
    users: usize,

    /// Interests handed out round-robin as the users' preferences
    #[arg(long, value_delimiter = ',', default_value = "music,chess,art")]
    interests: Vec<String>,

    /// Poll interval override in milliseconds
    #[arg(long, value_name = "MS")]
    poll_interval_ms: Option<u64>,

    /// Simulated store latency per operation in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 0)]
    latency_ms: u64,

    /// Make the store unreachable after this many milliseconds
    #[arg(long, value_name = "MS")]
    outage_after_ms: Option<u64>,

    /// How long the injected outage lasts
    #[arg(long, value_name = "MS", default_value_t = 3000)]
    outage_ms: u64,

    /// Give up on unmatched users after this many seconds
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    timeout_secs: u64,

    /// Print Prometheus metrics when the simulation ends
    #[arg(long)]
    print_metrics: bool,
}

/// Initialize structured logging with the configured level
fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Load and merge configuration from file or environment and CLI arguments
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = if let Some(config_path) = &args.config {
        AppConfig::from_file(config_path)?
    } else {
        AppConfig::from_env()?
    };

    if let Some(log_level) = &args.log_level {
        config.service.log_level = log_level.clone();
    }

    if args.debug {
        config.service.log_level = "debug".to_string();
    }

    if let Some(poll_interval_ms) = args.poll_interval_ms {
        config.pairing.poll_interval_ms = poll_interval_ms;
        config.pairing.poll_jitter_ms = config.pairing.poll_jitter_ms.min(poll_interval_ms / 2);
    }

    chat_roulette::config::validate_config(&config)?;
    Ok(config)
}

fn display_startup_banner(config: &AppConfig, args: &Args) {
    info!("Chat Roulette matchmaking simulation");
    info!("   Service: {}", config.service.name);
    info!("   Users: {}", args.users);
    info!("   Interests: {}", args.interests.join(", "));
    info!(
        "   Poll interval: {:?} (+/- {:?})",
        config.pairing.poll_interval(),
        config.pairing.poll_jitter()
    );
    info!("   Stale entry TTL: {:?}", config.pairing.stale_ttl());
    match args.outage_after_ms {
        Some(after) => info!("   Outage: {}ms after {}ms", args.outage_ms, after),
        None => info!("   Outage: none"),
    }
}

/// Wait for shutdown signals (SIGINT, SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C) signal"),
        _ = terminate => info!("Received SIGTERM signal"),
    }
}

/// Outcome summary of a simulation run
#[derive(Debug, Default)]
struct SimulationReport {
    matched: usize,
    cancelled: usize,
    failed: usize,
    /// chat id -> users who were told about it
    chats: HashMap<String, Vec<String>>,
}

impl SimulationReport {
    /// Every chat must have exactly two distinct users, each user at most one chat
    fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        let mut seen_users: HashMap<&str, &str> = HashMap::new();

        for (chat_id, users) in &self.chats {
            if users.len() != 2 || users[0] == users[1] {
                violations.push(format!("chat {} has participants {:?}", chat_id, users));
            }
            for user in users {
                if let Some(other_chat) = seen_users.insert(user, chat_id) {
                    violations.push(format!(
                        "user {} matched into both {} and {}",
                        user, other_chat, chat_id
                    ));
                }
            }
        }

        violations
    }
}

async fn run_simulation(args: &Args, config: AppConfig) -> Result<SimulationReport> {
    let store = Arc::new(InMemoryDocumentStore::new());
    if args.latency_ms > 0 {
        store.set_latency(Duration::from_millis(args.latency_ms));
    }

    let matchmaker = Matchmaker::new(config, store.clone())?;
    matchmaker.start()?;

    if let Some(after) = args.outage_after_ms {
        let store = store.clone();
        let outage = Duration::from_millis(args.outage_ms);
        tokio::spawn(async move {
            sleep(Duration::from_millis(after)).await;
            warn!("Injecting store outage for {:?}", outage);
            store.set_reachable(false);
            sleep(outage).await;
            store.set_reachable(true);
            info!("Store outage over");
        });
    }

    let interests = if args.interests.is_empty() {
        vec!["anything".to_string()]
    } else {
        args.interests.clone()
    };

    let mut handles = Vec::with_capacity(args.users);
    for i in 0..args.users {
        let interest = &interests[i % interests.len()];
        let preferences = Preferences::from([("interest".to_string(), json!(interest))]);
        handles.push(
            matchmaker
                .start_searching(&format!("user-{:03}", i), preferences)
                .await?,
        );
    }

    // Cancel whoever is still searching when time runs out
    let deadline = CancellationToken::new();
    let tokens: Vec<_> = handles.iter().map(|h| h.cancel_token()).collect();
    let timer = {
        let deadline = deadline.clone();
        let timeout = Duration::from_secs(args.timeout_secs);
        tokio::spawn(async move {
            tokio::select! {
                _ = deadline.cancelled() => {}
                _ = sleep(timeout) => {
                    warn!("Simulation timed out after {:?}, cancelling remaining searches", timeout);
                    tokens.iter().for_each(CancellationToken::cancel);
                }
            }
        })
    };

    let mut report = SimulationReport::default();
    for handle in handles {
        let user = handle.user_id().to_string();
        match handle.wait().await {
            PairingOutcome::Matched(event) => {
                report.matched += 1;
                report.chats.entry(event.chat_id).or_default().push(user);
            }
            PairingOutcome::Cancelled => report.cancelled += 1,
            PairingOutcome::Failed(reason) => {
                error!("Search for {} failed: {}", user, reason);
                report.failed += 1;
            }
        }
    }

    deadline.cancel();
    timer.await?;

    let health = HealthCheck::check(&matchmaker).await;
    info!(
        "Health: {} - {} matches delivered",
        health.status, health.stats.matches_delivered
    );

    if args.print_metrics {
        println!("{}", matchmaker.metrics().encode_text()?);
    }

    matchmaker.shutdown().await?;
    Ok(report)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args).unwrap_or_else(|e| {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    });

    if let Err(e) = init_logging(&config.service.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    if args.dry_run {
        display_startup_banner(&config, &args);
        info!("Configuration validation successful - exiting without simulating");
        return Ok(());
    }

    if args.health_check {
        let matchmaker = Matchmaker::new(config, Arc::new(InMemoryDocumentStore::new()))?;
        let health = HealthCheck::check(&matchmaker).await;
        println!("{}", health.to_json()?);
        std::process::exit(if health.status == HealthStatus::Healthy { 0 } else { 1 });
    }

    display_startup_banner(&config, &args);

    let report = tokio::select! {
        report = run_simulation(&args, config) => report?,
        _ = wait_for_shutdown_signal() => {
            info!("Simulation interrupted");
            return Ok(());
        }
    };

    info!(
        "Simulation finished: {} matched into {} chats, {} unmatched, {} failed",
        report.matched,
        report.chats.len(),
        report.cancelled,
        report.failed
    );

    let violations = report.violations();
    if !violations.is_empty() {
        for violation in &violations {
            error!("Pairing violation: {}", violation);
        }
        return Err(anyhow!("{} pairing violations", violations.len()));
    }

    info!("No user was paired more than once");
    Ok(())
}

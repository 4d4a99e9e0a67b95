use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{LoggingConfig, TollgateConfig};
use tollgate::ratelimit::{Keepalive, LimitKind, Limiter, Period, RuleMap, RulesFile};
use tollgate::store::RedisStore;

#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about = "Quota and rate admission control")]
struct Cli {
    /// Settings file (YAML). Environment variables `TOLLGATE__*` override it.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Insert or update rules, e.g. `put-config acme quota minute=100 day=5000`
    PutConfig {
        client: String,
        kind: LimitKind,
        #[arg(required = true, value_parser = parse_rule)]
        rules: Vec<(Period, i64)>,
    },
    /// Print the rules of one kind
    GetConfig { client: String, kind: LimitKind },
    /// Remove the rules for the given periods
    DelConfig {
        client: String,
        kind: LimitKind,
        #[arg(required = true)]
        periods: Vec<Period>,
    },
    /// Check and count one quota rule
    CheckQuota { client: String, period: Period },
    /// Check and count one rate rule
    CheckRate { client: String, period: Period },
    /// Check and count every rule of a client at once
    Check { client: String },
    /// Store every rule of a rules document
    Apply { file: PathBuf },
    /// Probe the store until interrupted
    Watch,
}

fn parse_rule(s: &str) -> Result<(Period, i64), String> {
    let (period, limit) = s
        .split_once('=')
        .ok_or_else(|| format!("expected period=limit, got '{s}'"))?;
    let period = period.parse::<Period>().map_err(|e| e.to_string())?;
    let limit = limit
        .parse::<i64>()
        .map_err(|e| format!("invalid limit '{limit}': {e}"))?;
    Ok((period, limit))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = TollgateConfig::load(cli.config.as_deref()).context("Failed to load settings")?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Tollgate");
    info!(
        host = %config.store.host,
        port = config.store.port,
        database = config.store.database,
        "Configuration loaded"
    );

    let store = Arc::new(
        RedisStore::connect(&config.store)
            .await
            .context("Failed to connect to the counter store")?,
    );
    let limiter = Limiter::connect(store.clone()).await?;

    match cli.command {
        Command::PutConfig {
            client,
            kind,
            rules,
        } => {
            let rules: RuleMap = rules.into_iter().collect();
            limiter.put_config(&client, kind, &rules).await?;
            print_json(&rules)?;
        }
        Command::GetConfig { client, kind } => {
            print_json(&limiter.get_config(&client, kind).await?)?;
        }
        Command::DelConfig {
            client,
            kind,
            periods,
        } => {
            limiter.del_config(&client, kind, &periods).await?;
            print_json(&limiter.get_config(&client, kind).await?)?;
        }
        Command::CheckQuota { client, period } => {
            print_json(&limiter.check_quota(&client, period).await?)?;
        }
        Command::CheckRate { client, period } => {
            print_json(&limiter.check_rate(&client, period).await?)?;
        }
        Command::Check { client } => {
            print_json(&limiter.check(&client).await?)?;
        }
        Command::Apply { file } => {
            let document = RulesFile::from_file(&file)
                .with_context(|| format!("Failed to read rules from {}", file.display()))?;
            let clients = limiter.apply_rules(&document).await?;
            info!(clients, "Rules applied");
        }
        Command::Watch => {
            let keepalive = Keepalive::spawn(store, config.store.keepalive_interval());
            shutdown_signal().await;
            if !keepalive.is_healthy() {
                warn!(probes = keepalive.probe_count(), "Store unhealthy at shutdown");
            }
            keepalive.shutdown();
        }
    }

    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}

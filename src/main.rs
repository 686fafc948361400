use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::{LoggingConfig, TurnstileConfig};
use turnstile::ratelimit::{
    metrics, CallerResponse, PrometheusSink, RateLimiterGate, RetentionSweeper,
};
use turnstile::store::{self, postgres, StoreBackend};

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Per-user cooldown admission gate")]
struct Cli {
    /// YAML configuration file; TURNSTILE__* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the rate limiter tables in Postgres
    Migrate,
    /// Ask the gate for one permit and exit with its response
    Permit {
        #[arg(long)]
        user: String,
    },
    /// Delete records older than the retention max age once
    Sweep {
        /// Override retention.max_age_secs
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
    /// Run the periodic retention sweeper until interrupted
    RunSweeper,
    /// Fire concurrent permits for one user and report how they were decided
    Contend {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 16)]
        concurrency: usize,
        #[arg(long, default_value_t = 1)]
        rounds: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config =
        TurnstileConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Turnstile");

    match cli.command {
        Command::Migrate => {
            if config.store.backend != StoreBackend::Postgres {
                bail!("migrate requires store.backend = postgres");
            }
            let pool = postgres::connect_pool(&config.store).await?;
            postgres::migrate(&pool).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Permit { user } => {
            let gate = build_gate(&config).await?;
            let result = gate.permit_now(&user).await;
            let response = CallerResponse::from_result(&result);

            match &result {
                Ok(decision) => println!("{user}: {decision:?} ({})", response.status_code()),
                Err(e) => println!("{user}: {e} ({})", response.status_code()),
            }
            if let Ok(Some(record)) = gate.store().record(&user).await {
                println!("last permitted at {}", record.last_permitted_at.to_rfc3339());
            }
            Ok(exit_code(response))
        }
        Command::Sweep { max_age_secs } => {
            let store = store::connect(&config.store).await?;
            let max_age = max_age_secs.map_or(config.retention.max_age(), Duration::from_secs);
            if max_age < config.gate.allowed_period() {
                bail!("max age must cover the allowed period");
            }
            let sweeper = RetentionSweeper::new(store, max_age, config.retention.sweep_interval());
            let removed = sweeper.sweep_once(Utc::now()).await?;
            println!("removed {removed} records");
            Ok(ExitCode::SUCCESS)
        }
        Command::RunSweeper => {
            let store = store::connect(&config.store).await?;
            RetentionSweeper::from_config(store, &config.retention)
                .run(shutdown_signal())
                .await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Contend {
            user,
            concurrency,
            rounds,
        } => {
            let gate = build_gate(&config).await?;

            for round in 1..=rounds {
                let calls = (0..concurrency).map(|_| {
                    let gate = gate.clone();
                    let user = user.clone();
                    tokio::spawn(async move { gate.permit_now(&user).await })
                });

                let mut tally: BTreeMap<String, usize> = BTreeMap::new();
                for joined in join_all(calls).await {
                    let result = joined.context("permit task failed")?;
                    let label = match &result {
                        Ok(decision) => format!("{decision:?}"),
                        Err(e) => e.to_string(),
                    };
                    *tally.entry(label).or_default() += 1;
                }
                println!("round {round}: {tally:?}");

                if round < rounds {
                    tokio::time::sleep(gate.allowed_period()).await;
                }
            }

            print!("{}", metrics::render(prometheus::default_registry())?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn build_gate(config: &TurnstileConfig) -> anyhow::Result<RateLimiterGate> {
    let store = store::connect(&config.store).await?;
    let sink = Arc::new(PrometheusSink::global());
    Ok(RateLimiterGate::from_config(store, sink, &config.gate))
}

fn exit_code(response: CallerResponse) -> ExitCode {
    match response {
        CallerResponse::Proceed => ExitCode::SUCCESS,
        CallerResponse::RateLimitExceeded => ExitCode::from(2),
        CallerResponse::InvalidRequest => ExitCode::from(64),
        CallerResponse::InternalFailure | CallerResponse::ResultUnknown => ExitCode::FAILURE,
    }
}

fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
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
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}

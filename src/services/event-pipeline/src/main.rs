//! # Event Pipeline Server Binary
//!
//! Entry point for the event pipeline service: configuration loading,
//! structured logging and graceful shutdown on SIGINT/SIGTERM.

use std::env;
use std::process;

use clap::{Arg, Command};
use dotenvy::dotenv;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use event_pipeline_service::{Config, EventPipelineService, SERVICE_NAME, VERSION};

#[tokio::main]
async fn main() {
    let matches = create_cli().get_matches();

    init_logging(matches.get_one::<String>("log-level").map(String::as_str));

    if let Err(e) = dotenv() {
        warn!("no .env file loaded: {}", e);
    }

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    if let Some(port) = matches.get_one::<String>("port") {
        match port.parse() {
            Ok(port) => config.server.port = port,
            Err(_) => {
                error!("invalid --port value: {}", port);
                process::exit(1);
            }
        }
    }
    if let Some(workers) = matches.get_one::<String>("workers") {
        match workers.parse() {
            Ok(workers) => config.queue.partition_count = workers,
            Err(_) => {
                error!("invalid --workers value: {}", workers);
                process::exit(1);
            }
        }
    }

    if matches.get_flag("validate-config") {
        match config.validate() {
            Ok(()) => {
                info!("configuration is valid");
                process::exit(0);
            }
            Err(e) => {
                error!("configuration validation failed: {}", e);
                process::exit(1);
            }
        }
    }

    info!("starting {} version {}", SERVICE_NAME, VERSION);
    info!("environment: {}", config.environment.name);

    match run_service(config).await {
        Ok(()) => info!("service stopped gracefully"),
        Err(e) => {
            error!("service failed: {}", e);
            process::exit(1);
        }
    }
}

/// Initialize structured logging
///
/// Precedence for the filter directive: `--log-level`, then `RUST_LOG`,
/// then `info`.
fn init_logging(log_level: Option<&str>) {
    let log_level = log_level
        .map(str::to_string)
        .or_else(|| env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    let log_format = env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(&log_level));

    if log_format == "json" {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

fn create_cli() -> Command {
    Command::new(SERVICE_NAME)
        .version(VERSION)
        .about("Real-time update-event pipeline for the TrustScore platform")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("validate-config")
                .long("validate-config")
                .help("Validate configuration and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Override server port")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .value_name("COUNT")
                .help("Override drain workers per topic")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Override log level (error, warn, info, debug, trace)")
                .action(clap::ArgAction::Set),
        )
}

async fn run_service(config: Config) -> anyhow::Result<()> {
    let service = EventPipelineService::new(config)?;
    std::sync::Arc::clone(&service).start().await?;

    shutdown_signal().await;
    info!("initiating graceful shutdown");
    service.stop().await;
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("received Ctrl+C");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
        info!("received SIGTERM");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_creation() {
        let cli = create_cli();
        assert_eq!(cli.get_name(), SERVICE_NAME);
    }

    #[test]
    fn test_cli_accepts_overrides() {
        let matches = create_cli()
            .try_get_matches_from([SERVICE_NAME, "-c", "custom.toml", "-l", "debug"])
            .unwrap();
        assert_eq!(
            matches.get_one::<String>("config").map(String::as_str),
            Some("custom.toml")
        );
        assert_eq!(
            matches.get_one::<String>("log-level").map(String::as_str),
            Some("debug")
        );
    }
}

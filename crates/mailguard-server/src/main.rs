//! MailGuard - netfilter service entry point

use anyhow::{Context, Result};
use clap::Parser;
use mailguard_common::config::{Config, LoggingConfig};
use mailguard_core::service::EXIT_FATAL;
use mailguard_core::{BanCoordinator, DnsResolver, NetfilterService, NftProcess};
use mailguard_storage::{RedisStore, RedisSubscriber};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mailguard", version, about = "Bans hosts failing mail authentication via nftables")]
struct Args {
    /// Path to the configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level or filter directive, overrides the configuration
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Append logs to this file instead of stdout
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("Startup failed: {:#}", e);
            eprintln!("mailguard: {:#}", e);
            EXIT_FATAL
        }
    };

    std::process::exit(code);
}

async fn run(args: Args) -> Result<i32> {
    let config = match &args.config {
        Some(path) => Config::load_from(Some(path.as_path()))?,
        None => Config::load()?,
    };

    init_logging(&config.logging, args.log_level.as_deref(), args.log_file.as_deref())?;

    info!("Starting MailGuard netfilter service...");

    let store = RedisStore::connect(&config.redis).await?;
    let resolver = Arc::new(DnsResolver::new(Duration::from_secs(
        config.service.dns_timeout_secs,
    )));
    let coordinator = Arc::new(BanCoordinator::new(
        &config,
        Arc::new(NftProcess::new()),
        Arc::new(store.clone()),
        resolver,
    ));

    // Leftovers of a previous run are removed before provisioning
    coordinator.discover().await?;
    coordinator.clear().await?;
    coordinator.provision(&config.isolation).await?;
    info!(
        chain = %config.netfilter.chain_name,
        manage_external = config.netfilter.manage_external,
        "Firewall provisioned"
    );

    let service = NetfilterService::new(coordinator, &config)?;
    let handle = service.handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        handle.terminate();
    });

    let code = service.run(RedisSubscriber::new(store.client().clone())).await;
    info!(exit_code = code, "MailGuard shutdown complete");
    Ok(code)
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

fn init_logging(config: &LoggingConfig, level: Option<&str>, file: Option<&Path>) -> Result<()> {
    let level = level.unwrap_or(config.level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let writer = match file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };
    let ansi = file.is_none();

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_writer(writer))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(ansi)
                    .with_writer(writer),
            )
            .init();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from([
            "mailguard",
            "--config",
            "/etc/mailguard/mailguard.toml",
            "--log-level",
            "debug",
            "--log-file",
            "/var/log/mailguard.log",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("/etc/mailguard/mailguard.toml")));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert_eq!(args.log_file, Some(PathBuf::from("/var/log/mailguard.log")));
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["mailguard"]);
        assert!(args.config.is_none());
        assert!(args.log_level.is_none());
        assert!(args.log_file.is_none());
    }
}

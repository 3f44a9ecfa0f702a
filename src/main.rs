//! ddos-guard binary entry point

use anyhow::Context;
use clap::Parser;
use ddos_guard::config::{ConfigLoader, GuardConfig};
use ddos_guard::{http_server, logging};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Inline DDoS admission layer
#[derive(Debug, Parser)]
#[command(name = "ddos-guard", version, about)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "DDOS_GUARD_CONFIG")]
    config: Option<String>,

    /// Listen address, overrides server.bind_addr
    #[arg(short, long, env = "DDOS_GUARD_BIND")]
    bind: Option<String>,

    /// Log level or filter directive, overrides logging.level
    #[arg(long, env = "DDOS_GUARD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Write a sample configuration to ddos-guard.toml.example and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.generate_config {
        GuardConfig::generate_sample_config("ddos-guard.toml.example")
            .context("failed to write sample configuration")?;
        println!("Sample configuration written to ddos-guard.toml.example");
        return Ok(());
    }

    let mut config = ConfigLoader::new()
        .load_from_file(args.config.as_deref())
        .load_from_env()
        .build()
        .context("failed to load configuration")?;

    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    let _log_guard = logging::init_logging(&config.logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting ddos-guard");

    let shutdown = CancellationToken::new();
    tokio::spawn(http_server::shutdown_signal(shutdown.clone()));

    if let Err(e) = http_server::run(config, shutdown).await {
        error!(error = %e, fatal = e.is_fatal(), "ddos-guard stopped with an error");
        return Err(e.into());
    }

    info!("ddos-guard stopped");
    Ok(())
}

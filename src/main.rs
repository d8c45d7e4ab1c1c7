use clap::Parser;
use mimir::config::{LogSettings, Settings};
use mimir::error::MimirError;
use mimir::handler::Handler;
use mimir::server::DnsServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "mimir", version, about = "Caching DNS forwarder with per-domain routing")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short = 'c', value_name = "PATH", default_value = "./etc/mimir.conf")]
    config: PathBuf,

    /// Verbose: force DEBUG level logging on stdout
    #[arg(short = 'v')]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut settings = match Settings::load(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    if cli.verbose {
        settings.log.level = "DEBUG".to_string();
        settings.log.stdout = true;
    }

    if let Err(e) = init_logging(&settings.log) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    let handler = match Handler::new(&settings).await {
        Ok(handler) => handler,
        Err(e) => {
            error!("startup failed: {}", e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, _) = broadcast::channel(1);
    let server = DnsServer::new(&settings.server, handler.clone(), shutdown_tx.clone());
    server.run();
    info!(
        "mimir {} started on {}",
        env!("CARGO_PKG_VERSION"),
        settings.server.addr()
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to wait for interrupt: {}", e);
    }
    info!("signal received, stopping");

    let _ = shutdown_tx.send(());
    if let Some(hosts) = handler.hosts() {
        hosts.stop();
    }
    // give the listeners a moment to unwind before the runtime drops
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
}

fn init_logging(log: &LogSettings) -> Result<(), MimirError> {
    let level = log.level_filter()?;

    let stdout_layer = log.stdout.then(|| tracing_subscriber::fmt::layer());

    let file_layer = if log.file.is_empty() {
        None
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log.file)
            .map_err(|e| MimirError::Config(format!("cannot open log file {}: {}", log.file, e)))?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file)),
        )
    };

    tracing_subscriber::registry()
        .with(level)
        .with(stdout_layer)
        .with(file_layer)
        .init();
    Ok(())
}

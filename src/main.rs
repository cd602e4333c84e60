use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use brook::relay::server::{Broker, Config};

/// JSON-framed chat relay broker.
#[derive(Debug, Parser)]
#[command(name = "brook", version, about)]
struct Cli {
    /// Interface to listen on.
    #[arg(long, default_value = "localhost")]
    hostname: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 50000)]
    port: u16,

    /// Append logs to this file instead of stderr.
    #[arg(long)]
    log: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    match &cli.log {
        Some(path) => {
            let file = match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => file,
                Err(e) => {
                    eprintln!("cannot open log file {}: {e}", path.display());
                    return ExitCode::FAILURE;
                }
            };
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    let cfg = Config {
        hostname: cli.hostname,
        port: cli.port,
        ..Config::default()
    };

    let broker = match Broker::bind(cfg).await {
        Ok(broker) => broker,
        Err(e) => {
            error!("bind failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let interrupt = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received");
    };
    match broker.run(interrupt).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("broker failed: {e}");
            ExitCode::FAILURE
        }
    }
}

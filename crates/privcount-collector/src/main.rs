//! PrivCount Data Collector binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// PrivCount Data Collector: counts relay events into secret-shared,
/// noised counters.
#[derive(Parser, Debug)]
#[command(name = "privcount-collector")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the data collector YAML configuration
    #[arg(short, long, env = "PRIVCOUNT_DC_CONFIG")]
    config: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    tracing::info!("starting PrivCount Data Collector");

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("cannot build runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(privcount_collector::collector::run(args.config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("cannot start due to error: {}", e);
            ExitCode::FAILURE
        }
    }
}

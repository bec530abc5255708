//! PrivCount Tally Server binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// PrivCount Tally Server: coordinates collection rounds and publishes
/// noisy tallies.
#[derive(Parser, Debug)]
#[command(name = "privcount-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the tally server YAML configuration
    #[arg(short, long, env = "PRIVCOUNT_TS_CONFIG")]
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
    tracing::info!("starting PrivCount Tally Server");

    // each role is single-threaded and cooperative
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

    match runtime.block_on(privcount_server::server::run(args.config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("cannot start due to error: {}", e);
            ExitCode::FAILURE
        }
    }
}

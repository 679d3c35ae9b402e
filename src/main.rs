use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use swerve_zenoh_runtime::config::{DrivetrainConfig, MOTOR_PORT};
use swerve_zenoh_runtime::drivetrain::autonomous::Recording;
use swerve_zenoh_runtime::runtime::{self, RuntimeOptions};

#[derive(Parser)]
#[command(name = "swerve-zenoh-runtime")]
#[command(about = "Swerve drivetrain runtime over zenoh")]
struct Args {
    /// Drivetrain config (JSON); defaults to a 0.6 m square base
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run on simulated motors
    #[arg(long)]
    sim: bool,

    /// Serial port of the motor bus
    #[arg(short, long, default_value = MOTOR_PORT)]
    port: String,

    /// Replay recorded chassis speeds (JSON) instead of taking commands
    #[arg(long)]
    replay: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();
    if let Err(e) = start(args).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

async fn start(args: Args) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = match &args.config {
        Some(path) => {
            info!("Loading drivetrain config from {}", path.display());
            DrivetrainConfig::load(path)?
        }
        None => DrivetrainConfig::default(),
    };
    let replay = match &args.replay {
        Some(path) => Some(Recording::load(path)?),
        None => None,
    };

    runtime::run(RuntimeOptions {
        config,
        sim: args.sim,
        port: args.port,
        replay,
    })
    .await
}

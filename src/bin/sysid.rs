// System identification and drive limit tool
//
// Runs directly against the motor bus; stop the runtime first.
//
// Usage:
//   swerve-sysid run --routine drive --test quasistatic --direction forward --output drive.jsonl
//   swerve-sysid current-limit 30
//   swerve-sysid --sim torque-limit 2.0

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use swerve_zenoh_runtime::config::{DrivetrainConfig, LOOP_HZ, MOTOR_PORT};
use swerve_zenoh_runtime::drivetrain::diagnostics::{Direction, LimitReport, SysIdRoutine, SysIdTest};
use swerve_zenoh_runtime::drivetrain::{Drivetrain, Subsystem};
use swerve_zenoh_runtime::motor::{CurrentLimitConfig, TorqueLimitConfig};
use swerve_zenoh_runtime::runtime::{feetech_devices, sim_devices};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "swerve-sysid")]
#[command(about = "Sysid voltage tests and drive current limits")]
struct Args {
    /// Drivetrain config (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Serial port of the motor bus
    #[arg(short, long, global = true, default_value = MOTOR_PORT)]
    port: String,

    /// Run on simulated motors
    #[arg(long, global = true)]
    sim: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one sysid test and log the samples as JSON lines
    Run {
        #[arg(long, value_enum)]
        routine: SysIdRoutine,

        #[arg(long, value_enum, default_value = "quasistatic")]
        test: SysIdTest,

        #[arg(long, value_enum, default_value = "forward")]
        direction: Direction,

        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Supply current limit for every drive motor
    CurrentLimit { amps: f64 },

    /// Symmetric torque current limit for every drive motor
    TorqueLimit { amps: f64 },
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => DrivetrainConfig::load(path)?,
        None => DrivetrainConfig::default(),
    };
    let devices = if args.sim {
        sim_devices(&config)
    } else {
        feetech_devices(&config, &args.port)?
    };
    let world = devices.world;
    let (mut drivetrain, _requests) = Drivetrain::new(&config, devices.modules)?;

    match args.command {
        Command::Run {
            routine,
            test,
            direction,
            output,
        } => {
            drivetrain.start_diagnostic(routine, test, direction);
            let period = Duration::from_millis(1000 / LOOP_HZ);
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let log = loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = tokio::signal::ctrl_c() => {
                        warn!("Interrupted, keeping samples so far");
                        break drivetrain.stop_diagnostic();
                    }
                }
                tokio::task::block_in_place(|| drivetrain.periodic());
                if let Some(world) = &world {
                    world.step(period.as_secs_f64(), drivetrain.current_chassis_speeds().omega);
                }
                if !drivetrain.diagnostic_active() {
                    break drivetrain.take_finished_diagnostic();
                }
            };
            // One more cycle with the session gone stops the motors
            drivetrain.periodic();

            let Some(log) = log else {
                return Err("sysid session produced no log".into());
            };
            info!(
                "{:?} {}: {} samples",
                log.routine,
                log.state(),
                log.samples.len()
            );
            match output {
                Some(path) => log.write_json_lines(BufWriter::new(File::create(&path)?))?,
                None => log.write_json_lines(io::stdout().lock())?,
            }
        }
        Command::CurrentLimit { amps } => {
            let report = drivetrain.set_current_limit(&CurrentLimitConfig::supply(amps));
            finish(report)?;
        }
        Command::TorqueLimit { amps } => {
            let report = drivetrain.set_torque_limit(&TorqueLimitConfig::symmetric(amps));
            finish(report)?;
        }
    }

    info!("{} done", drivetrain.name());
    Ok(())
}

fn finish(report: LimitReport) -> Result<(), BoxError> {
    for module in &report.applied {
        println!("  ✓ {}", module);
    }
    for failure in &report.failures {
        println!(
            "  ✗ {} (motor {}): {}",
            failure.module, failure.actuator_id, failure.error
        );
    }
    if report.is_ok() {
        Ok(())
    } else {
        Err(format!("{} drive motors rejected the limit", report.failures.len()).into())
    }
}

// 50 Hz control loop, odometry thread, zenoh pub/sub
//
// The watchdog lives in the drivetrain: requests are stamped when written,
// and anything older than CMD_TIMEOUT is treated as Idle. Bus traffic never
// runs directly on an async worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::config::{
    CMD_TIMEOUT, DrivetrainConfig, FEETECH_ODOMETRY_HZ, LOOP_HZ, MOTOR_ENABLED, ODOMETRY_HZ,
    TOPIC_CMD_DRIVE, TOPIC_HEALTH, TOPIC_POSE, TOPIC_SPEEDS,
};
use crate::drivetrain::autonomous::{AutoInterface, Recording, replay};
use crate::drivetrain::module::SwerveModule;
use crate::drivetrain::odometry::OdometrySampler;
use crate::drivetrain::{DriveRequest, Drivetrain, RequestHandle, Subsystem};
use crate::messages::{PoseReport, RuntimeHealth, SpeedsReport};
use crate::motor::{
    Actuator, CurrentLimitConfig, FeetechActuator, FeetechBus, Gyro, NoGyro, OperatingMode,
    SimActuator, SimGyro, TorqueLimitConfig, shared_bus,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How the runtime was started
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub config: DrivetrainConfig,
    /// Ideal simulated motors instead of the serial bus
    pub sim: bool,
    pub port: String,
    /// Drive this recording instead of listening for commands
    pub replay: Option<Recording>,
}

/// Simulated hardware, stepped by the control loop
pub struct SimWorld {
    actuators: Vec<Arc<SimActuator>>,
    gyro: Arc<SimGyro>,
}

impl SimWorld {
    /// Integrate every motor over `dt` and turn the gyro at `omega`
    pub fn step(&self, dt: f64, omega: f64) {
        for actuator in &self.actuators {
            actuator.step(dt);
        }
        self.gyro.advance(omega, dt);
    }
}

/// Modules and gyro for one base
pub struct Devices {
    pub modules: Vec<SwerveModule>,
    pub gyro: Arc<dyn Gyro>,
    pub world: Option<SimWorld>,
    /// Odometry rate the motor link can sustain
    pub odometry_hz: u64,
}

/// Ideal motors for every configured module
pub fn sim_devices(config: &DrivetrainConfig) -> Devices {
    let gyro = Arc::new(SimGyro::new(0.0));
    let mut actuators = Vec::new();
    let modules = config
        .modules
        .iter()
        .map(|m| {
            let drive = Arc::new(SimActuator::new(m.drive_id));
            let steer = Arc::new(SimActuator::new(m.steer_id));
            actuators.push(drive.clone());
            actuators.push(steer.clone());
            SwerveModule::new(
                m.name.clone(),
                drive,
                steer,
                config.gearing(m),
                config.feedforward(),
            )
        })
        .collect();
    Devices {
        modules,
        gyro: gyro.clone(),
        world: Some(SimWorld { actuators, gyro }),
        odometry_hz: ODOMETRY_HZ,
    }
}

/// Connect to every configured motor on one Feetech bus
///
/// Drive motors run in velocity mode, steer motors in step mode.
pub fn feetech_devices(config: &DrivetrainConfig, port: &str) -> Result<Devices, BoxError> {
    config.validate_feetech()?;
    info!("Opening motor bus on {}", port);
    let bus = shared_bus(FeetechBus::open(port)?);
    let mut modules = Vec::with_capacity(config.modules.len());
    for m in &config.modules {
        let drive = FeetechActuator::connect(
            bus.clone(),
            m.drive_id,
            OperatingMode::Velocity,
            config.supply_voltage,
        )?;
        let steer = FeetechActuator::connect(
            bus.clone(),
            m.steer_id,
            OperatingMode::Step,
            config.supply_voltage,
        )?;
        modules.push(SwerveModule::new(
            m.name.clone(),
            Arc::new(drive),
            Arc::new(steer),
            config.gearing(m),
            config.feedforward(),
        ));
    }
    info!("Connected {} modules", modules.len());
    // The STS3215 base carries no IMU; odometry runs on wheel heading
    Ok(Devices {
        modules,
        gyro: Arc::new(NoGyro),
        world: None,
        odometry_hz: FEETECH_ODOMETRY_HZ,
    })
}

// Startup limits touch the bus, so they run off the async workers
async fn apply_startup_limits(
    drivetrain: &Drivetrain,
    config: &DrivetrainConfig,
) -> Result<(), BoxError> {
    if let Some(amps) = config.drive_current_limit {
        let limits = drivetrain.drive_limits();
        let report = tokio::task::spawn_blocking(move || {
            limits.set_current_limit(&CurrentLimitConfig::supply(amps))
        })
        .await?;
        if !report.is_ok() {
            warn!("Current limit only partly applied: {}", report);
        }
    }
    if let Some(amps) = config.drive_torque_limit {
        let limits = drivetrain.drive_limits();
        let report = tokio::task::spawn_blocking(move || {
            limits.set_torque_limit(&TorqueLimitConfig::symmetric(amps))
        })
        .await?;
        if !report.is_ok() {
            warn!("Torque limit only partly applied: {}", report);
        }
    }
    Ok(())
}

/// Odometry sampling on a dedicated thread
///
/// Samples are blocking bus reads; late samples are skipped rather than
/// caught up in a burst.
struct OdometryThread {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl OdometryThread {
    fn spawn(sampler: OdometrySampler, hz: u64) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let period = Duration::from_micros(1_000_000 / hz.max(1));
        let handle = thread::Builder::new()
            .name("odometry".into())
            .spawn(move || {
                let mut next = Instant::now();
                while flag.load(Ordering::Relaxed) {
                    sampler.sample();
                    next += period;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        next = now;
                    }
                }
            })?;
        Ok(Self { running, handle })
    }

    fn stop(self) {
        self.running.store(false, Ordering::Relaxed);
        if self.handle.join().is_err() {
            warn!("Odometry thread panicked");
        }
    }
}

/// Replay on its own task; the request handle comes back when it ends
fn spawn_replay(
    recording: Recording,
    auto: AutoInterface,
    period: Duration,
) -> oneshot::Receiver<RequestHandle> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        replay(&recording, &auto, period).await;
        if tx.send(auto.into_requests()).is_err() {
            debug!("Runtime gone before replay finished");
        }
    });
    rx
}

/// Parse one command payload; raw voltages are only for sysid
fn parse_command(payload: &[u8]) -> Option<DriveRequest> {
    match serde_json::from_slice::<DriveRequest>(payload) {
        Ok(DriveRequest::VoltageOverride { .. }) => {
            warn!("Rejecting voltage override from {}", TOPIC_CMD_DRIVE);
            None
        }
        Ok(request) => Some(request),
        Err(e) => {
            warn!("Failed to parse command: {}", e);
            None
        }
    }
}

pub async fn run(options: RuntimeOptions) -> Result<(), BoxError> {
    let config = options.config;
    let devices = if options.sim || !MOTOR_ENABLED {
        info!("Using simulated motors");
        sim_devices(&config)
    } else {
        feetech_devices(&config, &options.port)?
    };

    let (mut drivetrain, handle) = Drivetrain::new(&config, devices.modules)?;
    apply_startup_limits(&drivetrain, &config).await?;

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD_DRIVE).await?;
    let pub_pose = session.declare_publisher(TOPIC_POSE).await?;
    let pub_speeds = session.declare_publisher(TOPIC_SPEEDS).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    // Odometry runs on its own cadence, independent of the control loop
    let sampler = drivetrain.odometry_sampler(devices.gyro);
    let odometry = OdometryThread::spawn(sampler, devices.odometry_hz)?;

    let period = Duration::from_millis(1000 / LOOP_HZ);
    let mut requests: Option<RequestHandle> = Some(handle);
    let mut replay_done = None;
    if let Some(recording) = options.replay {
        if let Some(handle) = requests.take() {
            let auto = AutoInterface::new(&drivetrain, handle);
            replay_done = Some(spawn_replay(recording, auto, period));
        }
    }

    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(
        "Runtime started: {}Hz loop, {}Hz odometry, {}ms watchdog timeout",
        LOOP_HZ,
        devices.odometry_hz,
        CMD_TIMEOUT.as_millis()
    );
    info!("Subscribed to: {}", TOPIC_CMD_DRIVE);
    info!(
        "Publishing to: {}, {}, {}",
        TOPIC_POSE, TOPIC_SPEEDS, TOPIC_HEALTH
    );

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }

        if let Some(Ok(handle)) = replay_done.as_mut().map(|rx| rx.try_recv()) {
            info!("Replay finished, listening on {}", TOPIC_CMD_DRIVE);
            requests = Some(handle);
            replay_done = None;
        }

        // 1. Drain all pending commands (non-blocking), keep latest
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            match (&requests, parse_command(&payload)) {
                (Some(handle), Some(request)) => {
                    debug!("Received command: {:?}", request);
                    handle.set_control(request);
                }
                (None, Some(_)) => debug!("Replay running, ignoring command"),
                (_, None) => {}
            }
        }

        // 2. Run the drivetrain (includes watchdog logic); it talks to the bus
        tokio::task::block_in_place(|| drivetrain.periodic());
        if let Some(world) = &devices.world {
            world.step(period.as_secs_f64(), drivetrain.current_chassis_speeds().omega);
        }

        // 3. Publish pose and measured speeds
        let pose_handle = drivetrain.pose_handle();
        let pose = PoseReport::new(pose_handle.pose(), pose_handle.last_update());
        pub_pose.put(serde_json::to_string(&pose)?).await?;
        let speeds = SpeedsReport::from(drivetrain.current_chassis_speeds());
        pub_speeds.put(serde_json::to_string(&speeds)?).await?;

        // 4. Publish health
        let health = RuntimeHealth::from(drivetrain.status());
        pub_health.put(serde_json::to_string(&health)?).await?;
    }

    odometry.stop();
    for module in drivetrain.modules() {
        if let Err(e) = module.drive_actuator().set_voltage(0.0) {
            warn!("Module {} failed to stop: {}", module.name(), e);
        }
    }
    info!("{} stopped", drivetrain.name());
    Ok(())
}

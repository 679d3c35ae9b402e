// Swerve drivetrain: kinematics, module control, odometry and diagnostics
// behind a single coordinator
//
// The drivetrain owns every module and consumes the latest request once per
// control cycle. Requests arrive through a handle that may live on another
// task; the pose estimator is shared with the odometry thread.

pub mod autonomous;
pub mod diagnostics;
pub mod kinematics;
pub mod module;
pub mod odometry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{CMD_TIMEOUT, ConfigError, DrivetrainConfig};
use crate::motor::{CurrentLimitConfig, Gyro, TorqueLimitConfig};
use diagnostics::{
    DiagnosticSession, Direction, DriveLimits, LimitReport, SysIdLog, SysIdRoutine, SysIdTest,
};
use kinematics::{ChassisSpeeds, GeometryError, ModuleState, SwerveKinematics, desaturate};
use module::{SwerveModule, VoltageAxis};
use odometry::{OdometrySampler, Pose, PoseEstimator, PoseHandle};

/// Frame a teleop velocity is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveFrame {
    #[default]
    Robot,
    /// Rotated into the robot frame with the estimated heading
    Field,
}

/// What the drivetrain should do on the next control cycle
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriveRequest {
    /// Stop driving, hold azimuths
    #[default]
    Idle,
    Teleop {
        speeds: ChassisSpeeds,
        #[serde(default)]
        frame: DriveFrame,
    },
    /// Robot-relative speeds from a trajectory follower
    AutoChassisSpeeds { speeds: ChassisSpeeds },
    /// Raw per-module voltage, bypassing kinematics
    VoltageOverride { axis: VoltageAxis, volts: Vec<f64> },
}

/// Something the control loop calls once per cycle
pub trait Subsystem {
    fn name(&self) -> &str;

    fn periodic(&mut self);
}

#[derive(Debug, Clone)]
struct StampedRequest {
    request: DriveRequest,
    at: Instant,
}

/// Writer side of the request slot
///
/// Never blocks; a newer request replaces an older one that has not been
/// consumed yet.
pub struct RequestHandle {
    tx: watch::Sender<StampedRequest>,
}

impl RequestHandle {
    pub fn set_control(&self, request: DriveRequest) {
        self.set_control_at(request, Instant::now());
    }

    fn set_control_at(&self, request: DriveRequest, at: Instant) {
        self.tx.send_replace(StampedRequest { request, at });
    }
}

/// What the drivetrain did on its last cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStatus {
    /// Following a fresh request
    Active,
    /// No request yet, or an explicit `Idle`
    Idle,
    /// The last request outlived the command timeout
    Stale,
    /// A sysid session owns the motors
    Diagnostics,
}

#[derive(Debug, thiserror::Error)]
pub enum DrivetrainError {
    #[error("Invalid geometry: {0}")]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Config describes {expected} modules but {got} were built")]
    ModuleCount { expected: usize, got: usize },
}

pub struct Drivetrain {
    modules: Vec<SwerveModule>,
    kinematics: Arc<SwerveKinematics>,
    max_module_speed: f64,
    command_timeout: Duration,
    requests: watch::Receiver<StampedRequest>,
    pose: PoseHandle,
    speeds_tx: watch::Sender<ChassisSpeeds>,
    session: Option<DiagnosticSession>,
    finished: Option<SysIdLog>,
    status: ControlStatus,
}

impl Drivetrain {
    /// Build the coordinator and the one handle that may feed it requests
    pub fn new(
        config: &DrivetrainConfig,
        modules: Vec<SwerveModule>,
    ) -> Result<(Self, RequestHandle), DrivetrainError> {
        config.validate()?;
        let kinematics = Arc::new(SwerveKinematics::new(config.geometry()?)?);
        if modules.len() != kinematics.module_count() {
            return Err(DrivetrainError::ModuleCount {
                expected: kinematics.module_count(),
                got: modules.len(),
            });
        }

        let estimator = PoseEstimator::new(kinematics.clone(), config.gyro_weight, Pose::default());
        let (tx, requests) = watch::channel(StampedRequest {
            request: DriveRequest::Idle,
            at: Instant::now(),
        });
        let (speeds_tx, _) = watch::channel(ChassisSpeeds::zero());

        info!(
            "Drivetrain ready: {} modules, {:.3} m drive base radius, {:.2} m/s max module speed",
            modules.len(),
            kinematics.geometry().drive_base_radius(),
            config.max_module_speed
        );

        let drivetrain = Self {
            modules,
            kinematics,
            max_module_speed: config.max_module_speed,
            command_timeout: CMD_TIMEOUT,
            requests,
            pose: PoseHandle::new(estimator),
            speeds_tx,
            session: None,
            finished: None,
            status: ControlStatus::Idle,
        };
        Ok((drivetrain, RequestHandle { tx }))
    }

    pub fn kinematics(&self) -> &Arc<SwerveKinematics> {
        &self.kinematics
    }

    pub fn modules(&self) -> &[SwerveModule] {
        &self.modules
    }

    pub fn status(&self) -> ControlStatus {
        self.status
    }

    pub fn pose(&self) -> Pose {
        self.pose.pose()
    }

    pub fn seed_pose(&self, pose: Pose) {
        info!(
            "Seeding pose to ({:.3}, {:.3}, {:.3})",
            pose.x, pose.y, pose.heading
        );
        self.pose.seed(pose);
    }

    pub fn pose_handle(&self) -> PoseHandle {
        self.pose.clone()
    }

    /// Chassis velocity measured on the last cycle (forward kinematics)
    pub fn current_chassis_speeds(&self) -> ChassisSpeeds {
        *self.speeds_tx.borrow()
    }

    /// Follows the measured chassis velocity from another task
    pub fn subscribe_speeds(&self) -> watch::Receiver<ChassisSpeeds> {
        self.speeds_tx.subscribe()
    }

    /// Sampler for the odometry thread, reading the same sensors the modules drive
    pub fn odometry_sampler(&self, gyro: Arc<dyn Gyro>) -> OdometrySampler {
        let sensors = self.modules.iter().map(|m| m.sensors().clone()).collect();
        OdometrySampler::new(sensors, gyro, self.pose.clone())
    }

    /// Drive actuators for limit pushes made away from the control loop
    pub fn drive_limits(&self) -> DriveLimits {
        DriveLimits::new(
            self.modules
                .iter()
                .map(|m| (m.name().to_string(), m.drive_actuator().clone()))
                .collect(),
        )
    }

    pub fn set_current_limit(&self, config: &CurrentLimitConfig) -> LimitReport {
        self.drive_limits().set_current_limit(config)
    }

    pub fn set_torque_limit(&self, config: &TorqueLimitConfig) -> LimitReport {
        self.drive_limits().set_torque_limit(config)
    }

    /// Hand the motors to a sysid routine until it times out or is stopped
    pub fn start_diagnostic(&mut self, routine: SysIdRoutine, test: SysIdTest, direction: Direction) {
        if let Some(previous) = self.session.take() {
            warn!("Replacing running {:?} sysid", previous.routine());
            self.finished = Some(self.end_session(previous));
        }
        self.session = Some(DiagnosticSession::new(
            routine,
            test,
            direction,
            self.modules.len(),
            Instant::now(),
        ));
    }

    /// End the running session early, returning what it recorded
    pub fn stop_diagnostic(&mut self) -> Option<SysIdLog> {
        let session = self.session.take()?;
        Some(self.end_session(session))
    }

    // Open-loop outputs keep running until written, so zero the excited axis
    fn end_session(&self, session: DiagnosticSession) -> SysIdLog {
        self.apply_voltages(session.axis(), &[]);
        session.finish()
    }

    pub fn diagnostic_active(&self) -> bool {
        self.session.is_some()
    }

    /// Log of the last session that ran to its timeout
    pub fn take_finished_diagnostic(&mut self) -> Option<SysIdLog> {
        self.finished.take()
    }

    fn periodic_at(&mut self, now: Instant) {
        if self.run_diagnostic(now) {
            self.status = ControlStatus::Diagnostics;
        } else {
            let stamped = self.requests.borrow_and_update().clone();
            let age = now.saturating_duration_since(stamped.at);
            let request = match stamped.request {
                DriveRequest::Idle => {
                    self.status = ControlStatus::Idle;
                    DriveRequest::Idle
                }
                _ if age > self.command_timeout => {
                    if self.status != ControlStatus::Stale {
                        warn!("Drive request stale ({:?} old), stopping", age);
                    }
                    self.status = ControlStatus::Stale;
                    DriveRequest::Idle
                }
                request => {
                    self.status = ControlStatus::Active;
                    request
                }
            };
            self.apply(&request);
        }
        self.measure_speeds();
    }

    // True while a session is driving the motors this cycle
    fn run_diagnostic(&mut self, now: Instant) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        let axis = session.axis();
        let Some(request) = session.request(now) else {
            if let Some(done) = self.session.take() {
                self.finished = Some(self.end_session(done));
            }
            return false;
        };
        self.apply(&request);

        let volts = match &request {
            DriveRequest::VoltageOverride { volts, .. } => volts.first().copied().unwrap_or(0.0),
            _ => 0.0,
        };
        let readings = self
            .modules
            .iter()
            .map(|m| m.sensors().axis_reading(axis).ok())
            .collect();
        if let Some(session) = self.session.as_mut() {
            session.record(now, volts, readings);
        }
        true
    }

    fn apply(&self, request: &DriveRequest) {
        let speeds = match request {
            DriveRequest::Idle => ChassisSpeeds::zero(),
            DriveRequest::Teleop {
                speeds,
                frame: DriveFrame::Robot,
            } => *speeds,
            DriveRequest::Teleop {
                speeds,
                frame: DriveFrame::Field,
            } => speeds.to_robot_relative(self.pose.pose().heading),
            DriveRequest::AutoChassisSpeeds { speeds } => *speeds,
            DriveRequest::VoltageOverride { axis, volts } => {
                self.apply_voltages(*axis, volts);
                return;
            }
        };

        if !speeds.is_finite() {
            warn!("Ignoring non-finite chassis speeds {:?}", speeds);
            self.apply_states(&vec![ModuleState::default(); self.modules.len()]);
            return;
        }
        let mut states = self.kinematics.to_module_states(&speeds);
        desaturate(&mut states, self.max_module_speed);
        self.apply_states(&states);
    }

    fn apply_states(&self, states: &[ModuleState]) {
        for (module, state) in self.modules.iter().zip(states) {
            if let Err(e) = module.apply_state(*state) {
                warn!("Module {} failed to apply {:?}: {}", module.name(), state, e);
            }
        }
    }

    fn apply_voltages(&self, axis: VoltageAxis, volts: &[f64]) {
        if !volts.is_empty() && volts.len() != self.modules.len() {
            debug!(
                "Voltage override has {} entries for {} modules",
                volts.len(),
                self.modules.len()
            );
        }
        for (i, module) in self.modules.iter().enumerate() {
            let v = volts.get(i).copied().unwrap_or(0.0);
            if let Err(e) = module.apply_voltage(axis, v) {
                warn!("Module {} failed {:?} voltage {:.2}: {}", module.name(), axis, v, e);
            }
        }
    }

    fn measure_speeds(&self) {
        let states: Vec<ModuleState> = self
            .modules
            .iter()
            .map(|m| match m.sensors().state() {
                Ok(state) => state,
                Err(e) => {
                    debug!("Module {} state unavailable: {}", m.name(), e);
                    ModuleState::default()
                }
            })
            .collect();
        self.speeds_tx
            .send_replace(self.kinematics.to_chassis_speeds(&states));
    }
}

impl Subsystem for Drivetrain {
    fn name(&self) -> &str {
        "drivetrain"
    }

    fn periodic(&mut self) {
        self.periodic_at(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::sim::{SimActuator, SimOutput};
    use crate::motor::{Actuator, NoGyro};
    use std::f64::consts::{FRAC_PI_2, PI};

    struct Rig {
        drivetrain: Drivetrain,
        handle: RequestHandle,
        drives: Vec<Arc<SimActuator>>,
        steers: Vec<Arc<SimActuator>>,
    }

    fn config() -> DrivetrainConfig {
        DrivetrainConfig {
            wheel_radius: 0.05,
            drive_gear_ratio: 1.0,
            steer_gear_ratio: 1.0,
            max_module_speed: 4.0,
            ..DrivetrainConfig::default()
        }
    }

    fn rig() -> Rig {
        let config = config();
        let mut drives = Vec::new();
        let mut steers = Vec::new();
        let modules = config
            .modules
            .iter()
            .map(|m| {
                let drive = Arc::new(SimActuator::new(m.drive_id));
                let steer = Arc::new(SimActuator::new(m.steer_id));
                drives.push(drive.clone());
                steers.push(steer.clone());
                SwerveModule::new(
                    m.name.clone(),
                    drive,
                    steer,
                    config.gearing(m),
                    config.feedforward(),
                )
            })
            .collect();
        let (drivetrain, handle) = Drivetrain::new(&config, modules).unwrap();
        Rig {
            drivetrain,
            handle,
            drives,
            steers,
        }
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-6, "{} != {}", a, b);
    }

    // Wheel speed (m/s) commanded to a drive sim
    fn wheel_speed(drive: &SimActuator) -> f64 {
        match drive.last_output() {
            Some(SimOutput::Velocity { velocity, .. }) => velocity * 0.05,
            other => panic!("unexpected output {:?}", other),
        }
    }

    fn teleop(vx: f64, vy: f64, omega: f64) -> DriveRequest {
        DriveRequest::Teleop {
            speeds: ChassisSpeeds::new(vx, vy, omega),
            frame: DriveFrame::Robot,
        }
    }

    #[test]
    fn test_module_count_must_match() {
        let result = Drivetrain::new(&config(), Vec::new());
        assert!(matches!(
            result,
            Err(DrivetrainError::ModuleCount { expected: 4, got: 0 })
        ));
    }

    #[test]
    fn test_degenerate_config_refused() {
        let mut config = config();
        for module in &mut config.modules {
            module.x = 0.0;
            module.y = 0.0;
        }
        assert!(matches!(
            Drivetrain::new(&config, Vec::new()),
            Err(DrivetrainError::Geometry(_))
        ));
    }

    #[test]
    fn test_translation_drives_every_module() {
        let mut rig = rig();
        let now = Instant::now();
        rig.handle.set_control_at(teleop(1.0, 0.0, 0.0), now);
        rig.drivetrain.periodic_at(now);

        assert_eq!(rig.drivetrain.status(), ControlStatus::Active);
        for (drive, steer) in rig.drives.iter().zip(&rig.steers) {
            assert_close(wheel_speed(drive), 1.0);
            assert_close(steer.position().unwrap(), 0.0);
        }
        assert_close(rig.drivetrain.current_chassis_speeds().vx, 1.0);
    }

    #[test]
    fn test_last_write_wins() {
        let mut rig = rig();
        let now = Instant::now();
        rig.handle.set_control_at(teleop(1.0, 0.0, 0.0), now);
        rig.handle.set_control_at(teleop(0.0, 0.5, 0.0), now);
        rig.drivetrain.periodic_at(now);

        for (drive, steer) in rig.drives.iter().zip(&rig.steers) {
            assert_close(wheel_speed(drive), 0.5);
            assert_close(steer.position().unwrap(), FRAC_PI_2);
        }
    }

    #[test]
    fn test_overspeed_is_scaled_uniformly() {
        let mut rig = rig();
        let now = Instant::now();
        rig.handle.set_control_at(teleop(6.0, 0.0, 10.0), now);
        rig.drivetrain.periodic_at(now);

        let speeds: Vec<f64> = rig.drives.iter().map(|d| wheel_speed(d).abs()).collect();
        let peak = speeds.iter().cloned().fold(0.0, f64::max);
        assert_close(peak, 4.0);
    }

    #[test]
    fn test_field_relative_uses_pose_heading() {
        let mut rig = rig();
        rig.drivetrain.seed_pose(Pose::new(0.0, 0.0, FRAC_PI_2));
        let now = Instant::now();
        rig.handle.set_control_at(
            DriveRequest::Teleop {
                speeds: ChassisSpeeds::new(1.0, 0.0, 0.0),
                frame: DriveFrame::Field,
            },
            now,
        );
        rig.drivetrain.periodic_at(now);

        // Field +x is robot -y when facing +y
        let speeds = rig.drivetrain.current_chassis_speeds();
        assert_close(speeds.vx, 0.0);
        assert_close(speeds.vy, -1.0);
    }

    #[test]
    fn test_stale_request_stops_robot() {
        let mut rig = rig();
        let sent = Instant::now();
        rig.handle.set_control_at(teleop(1.0, 0.0, 0.0), sent);
        rig.drivetrain.periodic_at(sent);
        rig.drivetrain
            .periodic_at(sent + CMD_TIMEOUT + Duration::from_millis(1));

        assert_eq!(rig.drivetrain.status(), ControlStatus::Stale);
        for drive in &rig.drives {
            assert_eq!(drive.velocity().unwrap(), 0.0);
        }
    }

    #[test]
    fn test_voltage_override_bypasses_kinematics() {
        let mut rig = rig();
        let now = Instant::now();
        rig.handle.set_control_at(
            DriveRequest::VoltageOverride {
                axis: VoltageAxis::Steer,
                volts: vec![1.0, 2.0, 3.0],
            },
            now,
        );
        rig.drivetrain.periodic_at(now);

        assert_eq!(rig.steers[1].last_output(), Some(SimOutput::Voltage(2.0)));
        // Short vector: remaining modules get zero
        assert_eq!(rig.steers[3].last_output(), Some(SimOutput::Voltage(0.0)));
        assert_eq!(rig.drives[0].last_output(), Some(SimOutput::Voltage(0.0)));
    }

    #[test]
    fn test_failed_module_does_not_stop_others() {
        let mut rig = rig();
        rig.drives[2].set_offline(true);
        let now = Instant::now();
        rig.handle.set_control_at(teleop(0.0, 0.0, 2.0), now);
        rig.drivetrain.periodic_at(now);

        for (i, drive) in rig.drives.iter().enumerate() {
            if i != 2 {
                // 2 rad/s at 0.3 * sqrt(2) m from centre
                assert_close(wheel_speed(drive).abs(), 2.0 * 0.3 * 2f64.sqrt());
            }
        }
    }

    #[test]
    fn test_rotation_points_modules_tangent() {
        let mut rig = rig();
        let now = Instant::now();
        rig.handle.set_control_at(teleop(0.0, 0.0, 2.0), now);
        rig.drivetrain.periodic_at(now);

        // Front-left module at (0.3, 0.3): tangent is atan2(0.3, -0.3), possibly flipped
        let angle = rig.drivetrain.modules()[0].sensors().azimuth().unwrap();
        let expected = 0.3f64.atan2(-0.3);
        let delta = kinematics::normalize_angle(angle - expected);
        assert!(delta.abs() < 1e-6 || (delta.abs() - PI).abs() < 1e-6);
        assert_close(rig.drivetrain.current_chassis_speeds().omega, 2.0);
    }

    #[test]
    fn test_diagnostic_session_overrides_requests() {
        let mut rig = rig();
        rig.drivetrain
            .start_diagnostic(SysIdRoutine::Drive, SysIdTest::Dynamic, Direction::Forward);
        rig.handle.set_control(teleop(1.0, 0.0, 0.0));
        rig.drivetrain.periodic();

        assert_eq!(rig.drivetrain.status(), ControlStatus::Diagnostics);
        for drive in &rig.drives {
            assert_eq!(drive.last_output(), Some(SimOutput::Voltage(7.0)));
        }

        let log = rig.drivetrain.stop_diagnostic().unwrap();
        assert_eq!(log.samples.len(), 1);
        assert_eq!(log.samples[0].volts, 7.0);
        assert_eq!(log.samples[0].positions.len(), 4);
        assert!(!rig.drivetrain.diagnostic_active());
    }

    #[test]
    fn test_diagnostic_times_out_and_resumes() {
        let mut rig = rig();
        rig.drivetrain
            .start_diagnostic(SysIdRoutine::Steer, SysIdTest::Quasistatic, Direction::Reverse);
        rig.drivetrain
            .periodic_at(Instant::now() + Duration::from_secs(11));

        assert!(!rig.drivetrain.diagnostic_active());
        assert_ne!(rig.drivetrain.status(), ControlStatus::Diagnostics);
        let log = rig.drivetrain.take_finished_diagnostic().unwrap();
        assert!(log.samples.is_empty());
        for steer in &rig.steers {
            assert_eq!(steer.last_output(), Some(SimOutput::Voltage(0.0)));
        }
    }

    #[test]
    fn test_limits_reach_drive_actuators_only() {
        let rig = rig();
        rig.drives[1].set_offline(true);
        let report = rig
            .drivetrain
            .set_current_limit(&CurrentLimitConfig::supply(25.0));
        assert_eq!(report.applied.len(), 3);
        assert_eq!(report.failures[0].module, "front_right");
        assert_eq!(rig.steers[0].current_limit(), None);
        assert_eq!(
            rig.drives[0].current_limit(),
            Some(CurrentLimitConfig::supply(25.0))
        );
    }

    #[test]
    fn test_odometry_follows_modules() {
        let mut rig = rig();
        let sampler = rig.drivetrain.odometry_sampler(Arc::new(NoGyro));
        sampler.sample();

        let now = Instant::now();
        rig.handle.set_control_at(teleop(1.0, 0.0, 0.0), now);
        rig.drivetrain.periodic_at(now);
        for drive in &rig.drives {
            drive.step(0.5);
        }
        std::thread::sleep(Duration::from_millis(1));
        sampler.sample();

        let pose = rig.drivetrain.pose();
        assert_close(pose.x, 0.5);
        assert_close(pose.y, 0.0);
    }

    #[test]
    fn test_request_json_shape() {
        let request: DriveRequest = serde_json::from_str(
            r#"{"type": "teleop", "speeds": {"vx": 0.5, "vy": 0.0, "omega": 0.1}, "frame": "field"}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            DriveRequest::Teleop {
                speeds: ChassisSpeeds::new(0.5, 0.0, 0.1),
                frame: DriveFrame::Field,
            }
        );
        let idle: DriveRequest = serde_json::from_str(r#"{"type": "idle"}"#).unwrap();
        assert_eq!(idle, DriveRequest::Idle);
    }
}

// Drive actuator limits and system-identification sessions
//
// Limit pushes are out-of-band calls that may block on the bus; they keep
// going past individual failures and report what happened. A diagnostic
// session replaces normal control with an open-loop voltage ramp or step and
// records the resulting motion.

use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::module::VoltageAxis;
use super::DriveRequest;
use crate::motor::{Actuator, ActuatorError, CurrentLimitConfig, TorqueLimitConfig};

/// One drive actuator that refused a limit
#[derive(Debug)]
pub struct LimitFailure {
    pub module: String,
    pub actuator_id: u8,
    pub error: ActuatorError,
}

/// Outcome of pushing a limit to every drive actuator
#[derive(Debug, Default)]
pub struct LimitReport {
    /// Modules whose drive actuator accepted the limit
    pub applied: Vec<String>,
    pub failures: Vec<LimitFailure>,
}

impl LimitReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for LimitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} applied", self.applied.len())?;
        for failure in &self.failures {
            write!(
                f,
                "; {} (actuator {}) failed: {}",
                failure.module, failure.actuator_id, failure.error
            )?;
        }
        Ok(())
    }
}

/// The drive actuators of every module, detached from the control loop
#[derive(Clone)]
pub struct DriveLimits {
    drives: Vec<(String, Arc<dyn Actuator>)>,
}

impl DriveLimits {
    pub fn new(drives: Vec<(String, Arc<dyn Actuator>)>) -> Self {
        Self { drives }
    }

    pub fn set_current_limit(&self, config: &CurrentLimitConfig) -> LimitReport {
        self.push("current limit", |drive| drive.configure_current_limit(config))
    }

    pub fn set_torque_limit(&self, config: &TorqueLimitConfig) -> LimitReport {
        self.push("torque limit", |drive| drive.configure_torque_limit(config))
    }

    fn push<F>(&self, what: &str, apply: F) -> LimitReport
    where
        F: Fn(&dyn Actuator) -> Result<(), ActuatorError>,
    {
        let mut report = LimitReport::default();
        for (module, drive) in &self.drives {
            match apply(drive.as_ref()) {
                Ok(()) => report.applied.push(module.clone()),
                Err(error) => {
                    warn!(
                        "Drive actuator {} ({}) failed {} config: {}",
                        drive.id(),
                        module,
                        what,
                        error
                    );
                    report.failures.push(LimitFailure {
                        module: module.clone(),
                        actuator_id: drive.id(),
                        error,
                    });
                }
            }
        }
        info!("Pushed {}: {}", what, report);
        report
    }
}

/// Which mechanism a sysid routine characterizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SysIdRoutine {
    Drive,
    Steer,
    /// Slow drive ramp that finds where the wheels start slipping
    Slip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SysIdTest {
    /// Slow voltage ramp
    Quasistatic,
    /// Voltage step
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    fn sign(self) -> f64 {
        match self {
            Direction::Forward => 1.0,
            Direction::Reverse => -1.0,
        }
    }
}

/// Ramp rate, step size and time limit of a routine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SysIdConfig {
    /// Volts per second for quasistatic tests
    pub ramp_rate: f64,
    /// Volts for dynamic tests
    pub step_voltage: f64,
    pub timeout: Duration,
}

impl Default for SysIdConfig {
    fn default() -> Self {
        Self {
            ramp_rate: 1.0,
            step_voltage: 7.0,
            timeout: Duration::from_secs(10),
        }
    }
}

impl SysIdRoutine {
    pub fn axis(self) -> VoltageAxis {
        match self {
            SysIdRoutine::Drive | SysIdRoutine::Slip => VoltageAxis::Drive,
            SysIdRoutine::Steer => VoltageAxis::Steer,
        }
    }

    pub fn config(self) -> SysIdConfig {
        match self {
            SysIdRoutine::Slip => SysIdConfig {
                ramp_rate: 0.25,
                ..SysIdConfig::default()
            },
            _ => SysIdConfig::default(),
        }
    }
}

/// One logged control cycle of a sysid test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SysIdSample {
    pub elapsed_secs: f64,
    pub volts: f64,
    /// Per-module position of the excited axis (m for drive, rad for steer)
    pub positions: Vec<Option<f64>>,
    pub velocities: Vec<Option<f64>>,
}

/// Everything recorded by one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SysIdLog {
    pub routine: SysIdRoutine,
    pub test: SysIdTest,
    pub direction: Direction,
    pub samples: Vec<SysIdSample>,
}

impl SysIdLog {
    /// Test state label, e.g. `quasistatic-forward`
    pub fn state(&self) -> String {
        state_label(self.test, self.direction)
    }

    /// One JSON object per sample, each tagged with routine and state
    pub fn write_json_lines(&self, mut out: impl Write) -> std::io::Result<()> {
        let state = self.state();
        for sample in &self.samples {
            let line = serde_json::json!({
                "routine": self.routine,
                "state": state,
                "elapsed_secs": sample.elapsed_secs,
                "volts": sample.volts,
                "positions": sample.positions,
                "velocities": sample.velocities,
            });
            writeln!(out, "{}", line)?;
        }
        Ok(())
    }
}

fn state_label(test: SysIdTest, direction: Direction) -> String {
    let test = match test {
        SysIdTest::Quasistatic => "quasistatic",
        SysIdTest::Dynamic => "dynamic",
    };
    let direction = match direction {
        Direction::Forward => "forward",
        Direction::Reverse => "reverse",
    };
    format!("{}-{}", test, direction)
}

/// An active sysid test, owned by the drivetrain while it runs
#[derive(Debug)]
pub struct DiagnosticSession {
    log: SysIdLog,
    config: SysIdConfig,
    module_count: usize,
    started: Instant,
}

impl DiagnosticSession {
    /// The slip routine only runs as a forward quasistatic ramp
    pub fn new(
        routine: SysIdRoutine,
        test: SysIdTest,
        direction: Direction,
        module_count: usize,
        now: Instant,
    ) -> Self {
        let (test, direction) = match routine {
            SysIdRoutine::Slip => (SysIdTest::Quasistatic, Direction::Forward),
            _ => (test, direction),
        };
        info!(
            "Starting {:?} sysid, {}",
            routine,
            state_label(test, direction)
        );
        Self {
            log: SysIdLog {
                routine,
                test,
                direction,
                samples: Vec::new(),
            },
            config: routine.config(),
            module_count,
            started: now,
        }
    }

    pub fn routine(&self) -> SysIdRoutine {
        self.log.routine
    }

    pub fn axis(&self) -> VoltageAxis {
        self.log.routine.axis()
    }

    /// Output voltage `elapsed` into the test, `None` once it has timed out
    pub fn voltage_at(&self, elapsed: Duration) -> Option<f64> {
        if elapsed >= self.config.timeout {
            return None;
        }
        let magnitude = match self.log.test {
            SysIdTest::Quasistatic => self.config.ramp_rate * elapsed.as_secs_f64(),
            SysIdTest::Dynamic => self.config.step_voltage,
        };
        Some(self.log.direction.sign() * magnitude)
    }

    /// The voltage override for this cycle, `None` once finished
    pub fn request(&self, now: Instant) -> Option<DriveRequest> {
        self.voltage_at(now.saturating_duration_since(self.started))
            .map(|volts| DriveRequest::VoltageOverride {
                axis: self.axis(),
                volts: vec![volts; self.module_count],
            })
    }

    pub fn record(&mut self, now: Instant, volts: f64, readings: Vec<Option<(f64, f64)>>) {
        let (positions, velocities): (Vec<_>, Vec<_>) = readings
            .into_iter()
            .map(|r| (r.map(|(p, _)| p), r.map(|(_, v)| v)))
            .unzip();
        self.log.samples.push(SysIdSample {
            elapsed_secs: now.saturating_duration_since(self.started).as_secs_f64(),
            volts,
            positions,
            velocities,
        });
    }

    pub fn finish(self) -> SysIdLog {
        info!(
            "Finished {:?} sysid with {} samples",
            self.log.routine,
            self.log.samples.len()
        );
        self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::sim::SimActuator;

    fn drives(ids: &[u8]) -> (DriveLimits, Vec<Arc<SimActuator>>) {
        let sims: Vec<Arc<SimActuator>> = ids
            .iter()
            .map(|&id| Arc::new(SimActuator::new(id)))
            .collect();
        let limits = DriveLimits::new(
            sims.iter()
                .zip(["a", "b", "c"])
                .map(|(sim, name)| (name.to_string(), sim.clone() as Arc<dyn Actuator>))
                .collect(),
        );
        (limits, sims)
    }

    #[test]
    fn test_current_limit_survives_one_failure() {
        let (limits, sims) = drives(&[1, 3, 5]);
        sims[0].set_offline(true);

        let report = limits.set_current_limit(&CurrentLimitConfig::supply(30.0));

        assert!(!report.is_ok());
        assert_eq!(report.applied, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].module, "a");
        assert_eq!(report.failures[0].actuator_id, 1);
        assert_eq!(sims[1].current_limit(), Some(CurrentLimitConfig::supply(30.0)));
        assert_eq!(sims[2].current_limit(), Some(CurrentLimitConfig::supply(30.0)));
        assert_eq!(sims[0].current_limit(), None);
    }

    #[test]
    fn test_torque_limit_is_committed() {
        let (limits, sims) = drives(&[1, 3]);
        let report = limits.set_torque_limit(&TorqueLimitConfig::symmetric(60.0));
        assert!(report.is_ok());
        for sim in &sims {
            assert_eq!(sim.torque_limit(), Some(TorqueLimitConfig::symmetric(60.0)));
        }
    }

    #[test]
    fn test_reapplying_limit_is_harmless() {
        let (limits, sims) = drives(&[1]);
        let config = CurrentLimitConfig::supply(20.0);
        assert!(limits.set_current_limit(&config).is_ok());
        assert!(limits.set_current_limit(&config).is_ok());
        assert_eq!(sims[0].current_limit(), Some(config));
    }

    #[test]
    fn test_quasistatic_ramp() {
        let session = DiagnosticSession::new(
            SysIdRoutine::Drive,
            SysIdTest::Quasistatic,
            Direction::Reverse,
            4,
            Instant::now(),
        );
        assert_eq!(session.voltage_at(Duration::ZERO), Some(-0.0));
        assert_eq!(session.voltage_at(Duration::from_secs(3)), Some(-3.0));
        assert_eq!(session.voltage_at(Duration::from_secs(10)), None);
    }

    #[test]
    fn test_dynamic_step_on_steer() {
        let start = Instant::now();
        let session = DiagnosticSession::new(
            SysIdRoutine::Steer,
            SysIdTest::Dynamic,
            Direction::Forward,
            3,
            start,
        );
        match session.request(start + Duration::from_millis(500)) {
            Some(DriveRequest::VoltageOverride { axis, volts }) => {
                assert_eq!(axis, VoltageAxis::Steer);
                assert_eq!(volts, vec![7.0; 3]);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_slip_is_slow_forward_ramp() {
        let session = DiagnosticSession::new(
            SysIdRoutine::Slip,
            SysIdTest::Dynamic,
            Direction::Reverse,
            4,
            Instant::now(),
        );
        assert_eq!(session.axis(), VoltageAxis::Drive);
        assert_eq!(session.voltage_at(Duration::from_secs(4)), Some(1.0));
    }

    #[test]
    fn test_record_and_export() {
        let start = Instant::now();
        let mut session = DiagnosticSession::new(
            SysIdRoutine::Drive,
            SysIdTest::Dynamic,
            Direction::Forward,
            2,
            start,
        );
        session.record(
            start + Duration::from_millis(20),
            7.0,
            vec![Some((0.1, 1.0)), None],
        );
        let log = session.finish();
        assert_eq!(log.samples.len(), 1);
        assert_eq!(log.samples[0].positions, vec![Some(0.1), None]);
        assert_eq!(log.state(), "dynamic-forward");

        let mut out = Vec::new();
        log.write_json_lines(&mut out).unwrap();
        let line: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(line["state"], "dynamic-forward");
        assert_eq!(line["routine"], "drive");
        assert_eq!(line["velocities"][0], 1.0);
    }
}

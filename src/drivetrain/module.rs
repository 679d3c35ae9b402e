// Swerve module controller
//
// Turns a (speed, angle) target into an azimuth position setpoint and a drive
// velocity setpoint with feedforward. The closed loops themselves run on the
// actuators.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::kinematics::{normalize_angle, ModulePosition, ModuleState, MIN_MODULE_SPEED};
use crate::motor::{Actuator, ActuatorError};

/// Which motor a raw voltage override drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoltageAxis {
    /// Drive motors get the voltage, azimuths hold straight ahead
    Drive,
    /// Azimuth motors get the voltage, drive motors are held at zero
    Steer,
}

/// Mechanical conversion between rotor and wheel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModuleGearing {
    pub wheel_radius: f64,
    /// Drive rotor turns per wheel turn
    pub drive_ratio: f64,
    /// Steer rotor turns per azimuth turn
    pub steer_ratio: f64,
    /// Azimuth reading when the wheel points forward
    pub azimuth_offset: f64,
}

impl ModuleGearing {
    fn wheel_to_rotor(&self, linear: f64) -> f64 {
        linear / self.wheel_radius * self.drive_ratio
    }

    fn rotor_to_wheel(&self, rotor: f64) -> f64 {
        rotor / self.drive_ratio * self.wheel_radius
    }

    fn rotor_to_azimuth(&self, rotor: f64) -> f64 {
        normalize_angle(rotor / self.steer_ratio - self.azimuth_offset)
    }

    // Within the first rotor turn; only used when the present rotor is unknown
    fn azimuth_to_rotor(&self, azimuth: f64) -> f64 {
        normalize_angle(azimuth + self.azimuth_offset) * self.steer_ratio
    }
}

/// Open-loop drive voltage for a wheel speed: `ks * sgn(v) + kv * v`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveFeedforward {
    pub ks: f64,
    pub kv: f64,
}

impl DriveFeedforward {
    pub fn volts(&self, speed: f64) -> f64 {
        if speed.abs() < MIN_MODULE_SPEED {
            0.0
        } else {
            self.ks * speed.signum() + self.kv * speed
        }
    }
}

/// Read-only view of one module's sensors
///
/// Cheap to clone; the odometry thread holds its own copy.
#[derive(Clone)]
pub struct ModuleSensors {
    drive: Arc<dyn Actuator>,
    steer: Arc<dyn Actuator>,
    gearing: ModuleGearing,
}

impl ModuleSensors {
    pub fn azimuth(&self) -> Result<f64, ActuatorError> {
        Ok(self.gearing.rotor_to_azimuth(self.steer.position()?))
    }

    /// Measured wheel speed and azimuth
    pub fn state(&self) -> Result<ModuleState, ActuatorError> {
        let speed = self.gearing.rotor_to_wheel(self.drive.velocity()?);
        Ok(ModuleState::new(speed, self.azimuth()?))
    }

    /// Integrated wheel distance and azimuth
    pub fn position(&self) -> Result<ModulePosition, ActuatorError> {
        let distance = self.gearing.rotor_to_wheel(self.drive.position()?);
        Ok(ModulePosition::new(distance, self.azimuth()?))
    }

    /// Position and velocity of the axis a sysid test is exciting
    pub fn axis_reading(&self, axis: VoltageAxis) -> Result<(f64, f64), ActuatorError> {
        match axis {
            VoltageAxis::Drive => Ok((
                self.gearing.rotor_to_wheel(self.drive.position()?),
                self.gearing.rotor_to_wheel(self.drive.velocity()?),
            )),
            VoltageAxis::Steer => Ok((
                self.steer.position()? / self.gearing.steer_ratio,
                self.steer.velocity()? / self.gearing.steer_ratio,
            )),
        }
    }
}

pub struct SwerveModule {
    name: String,
    sensors: ModuleSensors,
    feedforward: DriveFeedforward,
}

impl SwerveModule {
    pub fn new(
        name: impl Into<String>,
        drive: Arc<dyn Actuator>,
        steer: Arc<dyn Actuator>,
        gearing: ModuleGearing,
        feedforward: DriveFeedforward,
    ) -> Self {
        Self {
            name: name.into(),
            sensors: ModuleSensors {
                drive,
                steer,
                gearing,
            },
            feedforward,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sensors(&self) -> &ModuleSensors {
        &self.sensors
    }

    pub fn drive_actuator(&self) -> &Arc<dyn Actuator> {
        &self.sensors.drive
    }

    /// Drive toward `target`, returning the state actually commanded
    ///
    /// The azimuth takes the shortest way round; a (near) stopped target keeps
    /// the wheel where it points. With the azimuth unreadable the drive is
    /// held at zero, since the wheel would push in an unknown direction.
    pub fn apply_state(&self, target: ModuleState) -> Result<ModuleState, ActuatorError> {
        let rotor = match self.sensors.steer.position() {
            Ok(rotor) => rotor,
            Err(e) => {
                warn!("Module {} azimuth unavailable, drive held: {}", self.name, e);
                let stopped = self.sensors.drive.set_velocity_setpoint(0.0, 0.0);
                if target.speed.abs() >= MIN_MODULE_SPEED {
                    let aim = self.sensors.gearing.azimuth_to_rotor(target.angle);
                    if let Err(e) = self.sensors.steer.set_position_setpoint(aim) {
                        debug!("Module {} steer write failed: {}", self.name, e);
                    }
                }
                stopped?;
                return Err(e);
            }
        };
        let current = self.sensors.gearing.rotor_to_azimuth(rotor);

        if target.speed.abs() < MIN_MODULE_SPEED {
            self.sensors.drive.set_velocity_setpoint(0.0, 0.0)?;
            return Ok(ModuleState::new(0.0, current));
        }

        let commanded = target.optimize(current);
        let steered = self.steer_to(rotor, current, commanded.angle);
        let driven = self.sensors.drive.set_velocity_setpoint(
            self.sensors.gearing.wheel_to_rotor(commanded.speed),
            self.feedforward.volts(commanded.speed),
        );
        steered.and(driven).map(|_| commanded)
    }

    /// Raw voltage on one axis, bypassing the velocity loop
    pub fn apply_voltage(&self, axis: VoltageAxis, volts: f64) -> Result<(), ActuatorError> {
        match axis {
            VoltageAxis::Drive => {
                let held = self.hold_azimuth(0.0);
                let driven = self.sensors.drive.set_voltage(volts);
                held.and(driven)
            }
            VoltageAxis::Steer => {
                let steered = self.sensors.steer.set_voltage(volts);
                let stopped = self.sensors.drive.set_voltage(0.0);
                steered.and(stopped)
            }
        }
    }

    fn hold_azimuth(&self, angle: f64) -> Result<(), ActuatorError> {
        let rotor = self.sensors.steer.position()?;
        let current = self.sensors.gearing.rotor_to_azimuth(rotor);
        self.steer_to(rotor, current, angle)
    }

    // Continuous setpoint: current rotor position plus the shortest azimuth delta
    fn steer_to(&self, rotor: f64, current: f64, angle: f64) -> Result<(), ActuatorError> {
        let delta = normalize_angle(angle - current);
        self.sensors
            .steer
            .set_position_setpoint(rotor + delta * self.sensors.gearing.steer_ratio)
    }
}

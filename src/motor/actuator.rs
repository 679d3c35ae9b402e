// Device traits the drivetrain is written against
//
// Angles and positions are in rotor radians, velocities in rotor rad/s.
// Gear ratios and wheel size are applied by the module controller.

use serde::{Deserialize, Serialize};

use super::feetech::FeetechError;

/// Error types for a single actuator
#[derive(Debug, thiserror::Error)]
pub enum ActuatorError {
    #[error(transparent)]
    Bus(#[from] FeetechError),

    #[error("Actuator {id} is not responding")]
    Disconnected { id: u8 },

    #[error("Actuator {id} rejected configuration: {reason}")]
    Rejected { id: u8, reason: String },
}

/// Supply current limiting for a drive actuator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurrentLimitConfig {
    pub supply_limit_amps: f64,
    /// Current above which the limit starts counting
    pub supply_threshold_amps: f64,
    /// How long the threshold may be exceeded before limiting
    pub supply_time_threshold_secs: f64,
    pub enabled: bool,
}

impl CurrentLimitConfig {
    /// Hard supply limit: limit and threshold equal, no grace period
    pub fn supply(amps: f64) -> Self {
        Self {
            supply_limit_amps: amps,
            supply_threshold_amps: amps,
            supply_time_threshold_secs: 0.0,
            enabled: true,
        }
    }
}

/// Peak torque-producing current for a drive actuator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TorqueLimitConfig {
    pub peak_forward_amps: f64,
    /// Negative or zero
    pub peak_reverse_amps: f64,
}

impl TorqueLimitConfig {
    pub fn symmetric(amps: f64) -> Self {
        Self {
            peak_forward_amps: amps.abs(),
            peak_reverse_amps: -amps.abs(),
        }
    }

    /// Largest magnitude in either direction
    pub fn peak_amps(&self) -> f64 {
        self.peak_forward_amps.abs().max(self.peak_reverse_amps.abs())
    }
}

/// One motor with its controller
///
/// Writes happen from the control loop while the odometry thread reads, so
/// implementations synchronize internally.
pub trait Actuator: Send + Sync {
    fn id(&self) -> u8;

    /// Open-loop output
    fn set_voltage(&self, volts: f64) -> Result<(), ActuatorError>;

    /// Closed-loop velocity on the controller, with an arbitrary feedforward term
    fn set_velocity_setpoint(&self, velocity: f64, feedforward_volts: f64)
    -> Result<(), ActuatorError>;

    /// Closed-loop position on the controller (continuous, not wrapped)
    fn set_position_setpoint(&self, position: f64) -> Result<(), ActuatorError>;

    fn position(&self) -> Result<f64, ActuatorError>;

    fn velocity(&self) -> Result<f64, ActuatorError>;

    fn configure_current_limit(&self, config: &CurrentLimitConfig) -> Result<(), ActuatorError>;

    fn configure_torque_limit(&self, config: &TorqueLimitConfig) -> Result<(), ActuatorError>;
}

/// Heading source for odometry
pub trait Gyro: Send + Sync {
    /// Yaw in radians (counter-clockwise positive), `None` when no sample is available
    fn heading(&self) -> Option<f64>;
}

/// Stand-in for a base without an IMU; odometry falls back to wheel heading
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGyro;

impl Gyro for NoGyro {
    fn heading(&self) -> Option<f64> {
        None
    }
}

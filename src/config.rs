// Loop rates, timeouts, topics, drivetrain configuration
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::drivetrain::kinematics::{GeometryError, ModuleGeometry, Translation2d};
use crate::drivetrain::module::{DriveFeedforward, ModuleGearing};

// Control loop frequency
pub const LOOP_HZ: u64 = 50;

// Odometry sampling frequency (runs on its own thread, faster than the control loop)
pub const ODOMETRY_HZ: u64 = 250;

// Odometry on the Feetech bus: 8 reads per sample share the line with the control loop
pub const FEETECH_ODOMETRY_HZ: u64 = 100;

// Command timeout for watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// Zenoh topics
pub const TOPIC_CMD_DRIVE: &str = "swerve/cmd/drive"; // drive requests
pub const TOPIC_POSE: &str = "swerve/state/pose"; // fused pose estimate
pub const TOPIC_SPEEDS: &str = "swerve/state/speeds"; // measured chassis speeds
pub const TOPIC_HEALTH: &str = "swerve/state/health"; // health status

// Serial port for the Feetech motor bus
pub const MOTOR_PORT: &str = "/dev/ttyUSB0";

// Enable hardware motor control (set to false for simulation/testing)
pub const MOTOR_ENABLED: bool = true;

/// Errors raised while loading a drivetrain configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// One swerve module: where it sits and which motors drive it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub name: String,
    /// Offset from robot centre in meters (+x forward, +y left)
    pub x: f64,
    pub y: f64,
    pub drive_id: u8,
    pub steer_id: u8,
    /// Raw azimuth reading (rad) when the wheel points straight ahead
    #[serde(default)]
    pub azimuth_offset: f64,
}

impl ModuleConfig {
    fn new(name: &str, x: f64, y: f64, drive_id: u8, steer_id: u8) -> Self {
        Self {
            name: name.to_string(),
            x,
            y,
            drive_id,
            steer_id,
            azimuth_offset: 0.0,
        }
    }
}

/// Complete drivetrain description, loaded from JSON
///
/// Missing fields fall back to the defaults of a 0.6 m square base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrivetrainConfig {
    pub modules: Vec<ModuleConfig>,
    /// Wheel radius in meters
    pub wheel_radius: f64,
    /// Drive motor rotations per wheel rotation
    pub drive_gear_ratio: f64,
    /// Steer motor rotations per azimuth rotation
    pub steer_gear_ratio: f64,
    /// Fastest a single module may be commanded (m/s)
    pub max_module_speed: f64,
    /// Static friction feedforward (V)
    pub drive_ks: f64,
    /// Velocity feedforward (V per m/s)
    pub drive_kv: f64,
    /// How strongly gyro heading overrides encoder heading (0.0..=1.0)
    pub gyro_weight: f64,
    /// Bus voltage used to scale voltage requests into duty cycle
    pub supply_voltage: f64,
    /// Drive supply current limit applied at startup (A)
    pub drive_current_limit: Option<f64>,
    /// Drive torque current limit applied at startup (A)
    pub drive_torque_limit: Option<f64>,
}

impl Default for DrivetrainConfig {
    fn default() -> Self {
        Self {
            modules: vec![
                ModuleConfig::new("front_left", 0.3, 0.3, 1, 2),
                ModuleConfig::new("front_right", 0.3, -0.3, 3, 4),
                ModuleConfig::new("back_left", -0.3, 0.3, 5, 6),
                ModuleConfig::new("back_right", -0.3, -0.3, 7, 8),
            ],
            wheel_radius: 0.0508,
            drive_gear_ratio: 6.75,
            steer_gear_ratio: 1.0,
            max_module_speed: 4.5,
            drive_ks: 0.2,
            drive_kv: 12.0 / 4.5,
            gyro_weight: 1.0,
            supply_voltage: 12.0,
            drive_current_limit: None,
            drive_torque_limit: None,
        }
    }
}

impl DrivetrainConfig {
    /// Load a configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the scalar settings; geometry is checked by the kinematics
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.max_module_speed > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "max_module_speed must be positive, got {}",
                self.max_module_speed
            )));
        }
        if !(0.0..=1.0).contains(&self.gyro_weight) {
            return Err(ConfigError::Invalid(format!(
                "gyro_weight must be within 0..=1, got {}",
                self.gyro_weight
            )));
        }
        if !(self.supply_voltage > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "supply_voltage must be positive, got {}",
                self.supply_voltage
            )));
        }
        Ok(())
    }

    /// Extra checks for the Feetech bus
    ///
    /// The steer encoder sits on the rotor and counts turns from power-up, so
    /// the azimuth is only absolute with a 1:1 steer gear.
    pub fn validate_feetech(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.steer_gear_ratio != 1.0 {
            return Err(ConfigError::Invalid(format!(
                "Feetech steering needs steer_gear_ratio 1.0, got {}",
                self.steer_gear_ratio
            )));
        }
        Ok(())
    }

    pub fn geometry(&self) -> Result<ModuleGeometry, GeometryError> {
        let positions = self
            .modules
            .iter()
            .map(|m| Translation2d::new(m.x, m.y))
            .collect();
        ModuleGeometry::new(
            positions,
            self.wheel_radius,
            self.drive_gear_ratio,
            self.steer_gear_ratio,
        )
    }

    pub fn gearing(&self, module: &ModuleConfig) -> ModuleGearing {
        ModuleGearing {
            wheel_radius: self.wheel_radius,
            drive_ratio: self.drive_gear_ratio,
            steer_ratio: self.steer_gear_ratio,
            azimuth_offset: module.azimuth_offset,
        }
    }

    pub fn feedforward(&self) -> DriveFeedforward {
        DriveFeedforward {
            ks: self.drive_ks,
            kv: self.drive_kv,
        }
    }
}

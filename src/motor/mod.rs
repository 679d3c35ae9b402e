// Motor layer for the swerve base
//
// Provides:
// - The actuator and gyro traits the drivetrain is written against
// - Feetech STS3215 serial protocol implementation
// - Feetech-backed actuators on a shared bus
// - Ideal simulated devices

pub mod actuator;
mod driver;
pub mod feetech;
pub mod sim;

pub use actuator::{Actuator, ActuatorError, CurrentLimitConfig, Gyro, NoGyro, TorqueLimitConfig};
pub use driver::{FeetechActuator, STALL_CURRENT_AMPS, SharedBus, shared_bus};
pub use feetech::{FeetechBus, FeetechError, OperatingMode};
pub use sim::{SimActuator, SimGyro};

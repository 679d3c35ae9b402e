// Feetech-backed actuators for the swerve modules
//
// All motors share one serial bus; each actuator holds the bus lock for the
// duration of a transaction. Positions are unwrapped across encoder rollover
// so drive odometry sees a continuous wheel angle.

use std::f64::consts::TAU;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::actuator::{Actuator, ActuatorError, CurrentLimitConfig, TorqueLimitConfig};
use super::feetech::{
    FeetechBus, OperatingMode, Register, STEPS_PER_REVOLUTION, encode_sign_magnitude,
};

/// Maximum raw velocity command (safety limit)
const MAX_RAW_VELOCITY: f64 = 3000.0;

/// Largest relative move a step-mode goal can encode
const MAX_RELATIVE_STEPS: f64 = 32767.0;

/// Full-scale PWM command
const MAX_PWM: f64 = 1000.0;

/// Protection current resolution (A per register count)
const AMPS_PER_CURRENT_COUNT: f64 = 0.0065;

/// Factory protection current, restored when limiting is disabled
const FACTORY_PROTECTION_CURRENT: u16 = 500;

/// Stall current at 12 V; torque limits are expressed relative to it
pub const STALL_CURRENT_AMPS: f64 = 2.7;

pub type SharedBus = Arc<Mutex<FeetechBus>>;

pub fn shared_bus(bus: FeetechBus) -> SharedBus {
    Arc::new(Mutex::new(bus))
}

fn rad_to_steps(rad: f64) -> f64 {
    rad / TAU * STEPS_PER_REVOLUTION
}

fn steps_to_rad(steps: f64) -> f64 {
    steps / STEPS_PER_REVOLUTION * TAU
}

struct Tracking {
    mode: OperatingMode,
    last_raw: Option<u16>,
    turns: i64,
}

impl Tracking {
    /// Fold a single-turn reading into a multi-turn step count
    fn accumulate(&mut self, raw: u16) -> i64 {
        let half = (STEPS_PER_REVOLUTION / 2.0) as i32;
        if let Some(last) = self.last_raw {
            let delta = raw as i32 - last as i32;
            if delta > half {
                self.turns -= 1;
            } else if delta < -half {
                self.turns += 1;
            }
        }
        self.last_raw = Some(raw);
        self.turns * STEPS_PER_REVOLUTION as i64 + raw as i64
    }
}

/// One STS3215 motor on a shared bus
pub struct FeetechActuator {
    bus: SharedBus,
    id: u8,
    supply_voltage: f64,
    tracking: Mutex<Tracking>,
}

impl FeetechActuator {
    /// Check that the motor answers and put it in `mode`
    pub fn connect(
        bus: SharedBus,
        id: u8,
        mode: OperatingMode,
        supply_voltage: f64,
    ) -> Result<Self, ActuatorError> {
        info!("Initializing motor {} in {:?} mode", id, mode);
        {
            let mut guard = bus.lock();
            if !guard.ping(id)? {
                warn!("Motor {} not responding to ping", id);
                return Err(ActuatorError::Disconnected { id });
            }
            guard.set_operating_mode(id, mode)?;
        }
        Ok(Self {
            bus,
            id,
            supply_voltage,
            tracking: Mutex::new(Tracking {
                mode,
                last_raw: None,
                turns: 0,
            }),
        })
    }

    // Lock order is always bus, then tracking
    fn ensure_mode(&self, bus: &mut FeetechBus, mode: OperatingMode) -> Result<(), ActuatorError> {
        let mut tracking = self.tracking.lock();
        if tracking.mode != mode {
            debug!("Motor {} switching {:?} -> {:?}", self.id, tracking.mode, mode);
            bus.set_operating_mode(self.id, mode)?;
            tracking.mode = mode;
        }
        Ok(())
    }

    /// Read a register and write it only if it differs
    fn refresh_then_write(
        &self,
        register: Register,
        value: u16,
        what: &str,
    ) -> Result<(), ActuatorError> {
        let mut bus = self.bus.lock();
        match bus.read_u16(self.id, register) {
            Ok(current) if current == value => {
                debug!("Motor {} {} already {}", self.id, what, value);
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => warn!("Motor {} failed refresh of {} configs: {}", self.id, what, e),
        }
        if register.is_eeprom() {
            bus.write_eeprom_u16(self.id, register, value)?;
        } else {
            bus.write_u16(self.id, register, value)?;
        }
        info!("Motor {} {} set to {}", self.id, what, value);
        Ok(())
    }
}

impl Actuator for FeetechActuator {
    fn id(&self) -> u8 {
        self.id
    }

    fn set_voltage(&self, volts: f64) -> Result<(), ActuatorError> {
        let pwm = (volts / self.supply_voltage * MAX_PWM)
            .clamp(-MAX_PWM, MAX_PWM)
            .round() as i16;
        let mut bus = self.bus.lock();
        self.ensure_mode(&mut bus, OperatingMode::Pwm)?;
        bus.write_u16(self.id, Register::GoalPwm, encode_sign_magnitude(pwm, 10))?;
        Ok(())
    }

    // The servo firmware has no feedforward input; its own loop carries the load
    fn set_velocity_setpoint(&self, velocity: f64, _feedforward_volts: f64) -> Result<(), ActuatorError> {
        let raw = rad_to_steps(velocity)
            .clamp(-MAX_RAW_VELOCITY, MAX_RAW_VELOCITY)
            .round() as i16;
        let mut bus = self.bus.lock();
        self.ensure_mode(&mut bus, OperatingMode::Velocity)?;
        bus.write_u16(self.id, Register::GoalVelocity, encode_sign_magnitude(raw, 15))?;
        Ok(())
    }

    // Step mode moves relative to where the servo stands, so a goal across the
    // encoder rollover is reached the short way
    fn set_position_setpoint(&self, position: f64) -> Result<(), ActuatorError> {
        let mut bus = self.bus.lock();
        self.ensure_mode(&mut bus, OperatingMode::Step)?;
        let raw = bus.read_u16(self.id, Register::PresentPosition)? % STEPS_PER_REVOLUTION as u16;
        let present = self.tracking.lock().accumulate(raw);
        let steps = (rad_to_steps(position) - present as f64)
            .round()
            .clamp(-MAX_RELATIVE_STEPS, MAX_RELATIVE_STEPS) as i16;
        bus.write_u16(self.id, Register::GoalPosition, encode_sign_magnitude(steps, 15))?;
        Ok(())
    }

    fn position(&self) -> Result<f64, ActuatorError> {
        let mut bus = self.bus.lock();
        let raw = bus.read_u16(self.id, Register::PresentPosition)? % STEPS_PER_REVOLUTION as u16;
        let steps = self.tracking.lock().accumulate(raw);
        Ok(steps_to_rad(steps as f64))
    }

    fn velocity(&self) -> Result<f64, ActuatorError> {
        let raw = self.bus.lock().get_velocity(self.id)?;
        Ok(steps_to_rad(raw as f64))
    }

    // Only the supply limit maps onto the servo; threshold and time window do not
    fn configure_current_limit(&self, config: &CurrentLimitConfig) -> Result<(), ActuatorError> {
        if config.enabled && !(config.supply_limit_amps > 0.0) {
            return Err(ActuatorError::Rejected {
                id: self.id,
                reason: format!("supply limit {} A", config.supply_limit_amps),
            });
        }
        let raw = if config.enabled {
            (config.supply_limit_amps / AMPS_PER_CURRENT_COUNT)
                .round()
                .clamp(0.0, u16::MAX as f64) as u16
        } else {
            FACTORY_PROTECTION_CURRENT
        };
        self.refresh_then_write(Register::ProtectionCurrent, raw, "current limit")
    }

    fn configure_torque_limit(&self, config: &TorqueLimitConfig) -> Result<(), ActuatorError> {
        if !config.peak_amps().is_finite() {
            return Err(ActuatorError::Rejected {
                id: self.id,
                reason: format!("peak torque current {} A", config.peak_amps()),
            });
        }
        let raw = (config.peak_amps() / STALL_CURRENT_AMPS * 1000.0)
            .round()
            .clamp(0.0, 1000.0) as u16;
        self.refresh_then_write(Register::TorqueLimit, raw, "torque limit")
    }
}

impl Drop for FeetechActuator {
    fn drop(&mut self) {
        // Zero the output so the motor does not keep spinning after shutdown
        let mode = self.tracking.lock().mode;
        let register = match mode {
            OperatingMode::Velocity => Register::GoalVelocity,
            OperatingMode::Pwm => Register::GoalPwm,
            OperatingMode::Position | OperatingMode::Step => return,
        };
        if let Err(e) = self.bus.lock().write_u16(self.id, register, 0) {
            warn!("Failed to stop motor {} on drop: {}", self.id, e);
        }
    }
}

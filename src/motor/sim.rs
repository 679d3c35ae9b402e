// Ideal simulated devices
//
// Setpoints are tracked perfectly: position setpoints snap, velocity setpoints
// are held and integrated by `step`. Used for `--sim` runs and as test fakes.

use parking_lot::Mutex;

use super::actuator::{Actuator, ActuatorError, CurrentLimitConfig, Gyro, TorqueLimitConfig};

/// Rotor speed per volt of open-loop output (rad/s/V), roughly a 600 rad/s free speed at 12 V
pub const DEFAULT_SPEED_PER_VOLT: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimOutput {
    Voltage(f64),
    Velocity { velocity: f64, feedforward_volts: f64 },
    Position(f64),
}

#[derive(Debug, Default)]
struct SimState {
    position: f64,
    velocity: f64,
    output: Option<SimOutput>,
    current_limit: Option<CurrentLimitConfig>,
    torque_limit: Option<TorqueLimitConfig>,
    offline: bool,
}

pub struct SimActuator {
    id: u8,
    speed_per_volt: f64,
    state: Mutex<SimState>,
}

impl SimActuator {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            speed_per_volt: DEFAULT_SPEED_PER_VOLT,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Advance the rotor by `dt` seconds at its current velocity
    pub fn step(&self, dt: f64) {
        let mut state = self.state.lock();
        state.position += state.velocity * dt;
    }

    /// Simulate a dropped connection: every call fails until brought back
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    pub fn last_output(&self) -> Option<SimOutput> {
        self.state.lock().output
    }

    pub fn current_limit(&self) -> Option<CurrentLimitConfig> {
        self.state.lock().current_limit
    }

    pub fn torque_limit(&self) -> Option<TorqueLimitConfig> {
        self.state.lock().torque_limit
    }

    /// Place the rotor somewhere, e.g. to emulate an external push
    pub fn set_position(&self, position: f64) {
        self.state.lock().position = position;
    }

    fn online(&self) -> Result<parking_lot::MutexGuard<'_, SimState>, ActuatorError> {
        let state = self.state.lock();
        if state.offline {
            Err(ActuatorError::Disconnected { id: self.id })
        } else {
            Ok(state)
        }
    }
}

impl Actuator for SimActuator {
    fn id(&self) -> u8 {
        self.id
    }

    fn set_voltage(&self, volts: f64) -> Result<(), ActuatorError> {
        let mut state = self.online()?;
        state.velocity = volts * self.speed_per_volt;
        state.output = Some(SimOutput::Voltage(volts));
        Ok(())
    }

    fn set_velocity_setpoint(
        &self,
        velocity: f64,
        feedforward_volts: f64,
    ) -> Result<(), ActuatorError> {
        let mut state = self.online()?;
        state.velocity = velocity;
        state.output = Some(SimOutput::Velocity {
            velocity,
            feedforward_volts,
        });
        Ok(())
    }

    fn set_position_setpoint(&self, position: f64) -> Result<(), ActuatorError> {
        let mut state = self.online()?;
        state.position = position;
        state.velocity = 0.0;
        state.output = Some(SimOutput::Position(position));
        Ok(())
    }

    fn position(&self) -> Result<f64, ActuatorError> {
        Ok(self.online()?.position)
    }

    fn velocity(&self) -> Result<f64, ActuatorError> {
        Ok(self.online()?.velocity)
    }

    fn configure_current_limit(&self, config: &CurrentLimitConfig) -> Result<(), ActuatorError> {
        self.online()?.current_limit = Some(*config);
        Ok(())
    }

    fn configure_torque_limit(&self, config: &TorqueLimitConfig) -> Result<(), ActuatorError> {
        self.online()?.torque_limit = Some(*config);
        Ok(())
    }
}

/// Gyro whose heading is set (or advanced) by the simulation
#[derive(Debug, Default)]
pub struct SimGyro {
    heading: Mutex<Option<f64>>,
}

impl SimGyro {
    pub fn new(heading: f64) -> Self {
        Self {
            heading: Mutex::new(Some(heading)),
        }
    }

    pub fn set_heading(&self, heading: Option<f64>) {
        *self.heading.lock() = heading;
    }

    /// Integrate a yaw rate over `dt`; a disconnected gyro stays disconnected
    pub fn advance(&self, omega: f64, dt: f64) {
        if let Some(heading) = self.heading.lock().as_mut() {
            *heading += omega * dt;
        }
    }
}

impl Gyro for SimGyro {
    fn heading(&self) -> Option<f64> {
        *self.heading.lock()
    }
}

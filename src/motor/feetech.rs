// Feetech STS3215 serial protocol
//
// Packet format: [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]
// Length counts instruction + params + checksum; the checksum is the inverted
// low byte of the sum over ID..Params.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use tracing::{debug, trace};

/// Default serial configuration for Feetech motors
pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Encoder resolution
pub const STEPS_PER_REVOLUTION: f64 = 4096.0;

/// Packet header bytes
const HEADER: [u8; 2] = [0xFF, 0xFF];

/// Instruction set (only what the drivetrain uses)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
}

/// Register addresses for STS3215
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Register {
    // EEPROM area (needs Lock = 0 to write)
    ProtectionCurrent = 28, // 2 bytes, units of 6.5 mA
    OperatingMode = 33,     // 1 byte: 0=position, 1=velocity, 2=PWM, 3=step

    // RAM area
    TorqueEnable = 40,    // 1 byte
    GoalPosition = 42,    // 2 bytes
    GoalPwm = 44,         // 2 bytes, shares the goal-time slot, used in PWM mode
    GoalVelocity = 46,    // 2 bytes, sign-magnitude (bit 15)
    TorqueLimit = 48,     // 2 bytes, 0..=1000 per mille of max torque
    Lock = 55,            // 1 byte
    PresentPosition = 56, // 2 bytes, read-only
    PresentVelocity = 58, // 2 bytes, read-only, sign-magnitude (bit 15)
}

impl Register {
    /// Registers below the torque-enable address live in EEPROM
    pub fn is_eeprom(self) -> bool {
        (self as u8) < Register::TorqueEnable as u8
    }
}

/// Operating modes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatingMode {
    Position = 0,
    Velocity = 1,
    Pwm = 2,
    /// Goal position is a signed step count relative to the present position
    Step = 3,
}

/// Error types for Feetech communication
#[derive(Debug, thiserror::Error)]
pub enum FeetechError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from motor {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("Checksum mismatch for motor {id}")]
    ChecksumMismatch { id: u8 },

    #[error("Motor {id} returned error status: 0x{status:02X}")]
    MotorError { id: u8, status: u8 },

    #[error("Timeout waiting for response from motor {id}")]
    Timeout { id: u8 },
}

pub type Result<T> = std::result::Result<T, FeetechError>;

/// Byte stream the bus talks over (a serial port, or a fake in tests)
pub trait Transport: Read + Write + Send {}

impl<T: Read + Write + Send> Transport for T {}

/// Inverted low byte of the sum
pub fn checksum(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u16, |acc, &b| acc + b as u16);
    !(sum as u8)
}

/// Build a packet with header and checksum
pub fn build_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(6 + params.len());
    packet.extend_from_slice(&HEADER);
    packet.extend_from_slice(&[id, (params.len() + 2) as u8, instruction as u8]);
    packet.extend_from_slice(params);
    packet.push(checksum(&packet[2..]));
    packet
}

/// Feetech motor bus - handles serial communication with motors
pub struct FeetechBus {
    port: Box<dyn Transport>,
}

impl FeetechBus {
    /// Open a new connection to the motor bus
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    /// Open with custom baudrate
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;
        Ok(Self::from_transport(Box::new(port)))
    }

    pub fn from_transport(port: Box<dyn Transport>) -> Self {
        Self { port }
    }

    fn send(&mut self, id: u8, instruction: Instruction, params: &[u8]) -> Result<()> {
        let packet = build_packet(id, instruction, params);
        trace!("TX {:02X?}", packet);
        self.port.write_all(&packet)?;
        self.port.flush()?;
        Ok(())
    }

    /// Send an instruction and return the status packet's parameters
    fn transact(&mut self, id: u8, instruction: Instruction, params: &[u8]) -> Result<Vec<u8>> {
        self.send(id, instruction, params)?;
        self.read_status(id)
    }

    fn read_status(&mut self, expected_id: u8) -> Result<Vec<u8>> {
        let timeout = |e: std::io::Error| match e.kind() {
            ErrorKind::TimedOut | ErrorKind::UnexpectedEof => {
                FeetechError::Timeout { id: expected_id }
            }
            _ => FeetechError::Io(e),
        };

        // [0xFF, 0xFF, ID, Length]
        let mut head = [0u8; 4];
        self.port.read_exact(&mut head).map_err(timeout)?;
        if head[..2] != HEADER {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("Invalid header: {:02X?}", &head[..2]),
            });
        }
        let (id, length) = (head[2], head[3] as usize);
        if id != expected_id {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("ID mismatch: expected {}, got {}", expected_id, id),
            });
        }
        if length < 2 {
            return Err(FeetechError::InvalidResponse {
                id,
                reason: format!("Length {} too short", length),
            });
        }

        // [Error, Params..., Checksum]
        let mut body = vec![0u8; length];
        self.port.read_exact(&mut body).map_err(timeout)?;
        let (payload, received) = body.split_at(length - 1);

        let mut summed = vec![id, length as u8];
        summed.extend_from_slice(payload);
        if checksum(&summed) != received[0] {
            return Err(FeetechError::ChecksumMismatch { id });
        }
        if payload[0] != 0 {
            return Err(FeetechError::MotorError {
                id,
                status: payload[0],
            });
        }
        Ok(payload[1..].to_vec())
    }

    /// Ping a motor to check if it's connected
    pub fn ping(&mut self, id: u8) -> Result<bool> {
        match self.transact(id, Instruction::Ping, &[]) {
            Ok(_) => Ok(true),
            Err(FeetechError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn write_u8(&mut self, id: u8, register: Register, value: u8) -> Result<()> {
        debug!("Write u8 to motor {}: reg={:?}, value={}", id, register, value);
        self.transact(id, Instruction::Write, &[register as u8, value])?;
        Ok(())
    }

    /// Two bytes, little-endian
    pub fn write_u16(&mut self, id: u8, register: Register, value: u16) -> Result<()> {
        debug!("Write u16 to motor {}: reg={:?}, value={}", id, register, value);
        let [lo, hi] = value.to_le_bytes();
        self.transact(id, Instruction::Write, &[register as u8, lo, hi])?;
        Ok(())
    }

    pub fn read_u8(&mut self, id: u8, register: Register) -> Result<u8> {
        let response = self.transact(id, Instruction::Read, &[register as u8, 1])?;
        response
            .first()
            .copied()
            .ok_or_else(|| FeetechError::InvalidResponse {
                id,
                reason: "Empty response".to_string(),
            })
    }

    pub fn read_u16(&mut self, id: u8, register: Register) -> Result<u16> {
        let response = self.transact(id, Instruction::Read, &[register as u8, 2])?;
        match response[..] {
            [lo, hi, ..] => Ok(u16::from_le_bytes([lo, hi])),
            _ => Err(FeetechError::InvalidResponse {
                id,
                reason: format!("Expected 2 bytes, got {}", response.len()),
            }),
        }
    }

    /// Write an EEPROM register, unlocking around the write
    pub fn write_eeprom_u16(&mut self, id: u8, register: Register, value: u16) -> Result<()> {
        self.write_u8(id, Register::Lock, 0)?;
        let written = self.write_u16(id, register, value);
        // Relock even if the write failed
        let relocked = self.write_u8(id, Register::Lock, 1);
        written.and(relocked)
    }

    pub fn set_torque(&mut self, id: u8, enabled: bool) -> Result<()> {
        self.write_u8(id, Register::TorqueEnable, enabled as u8)
    }

    /// Switch operating mode; torque is dropped for the change and restored
    pub fn set_operating_mode(&mut self, id: u8, mode: OperatingMode) -> Result<()> {
        self.set_torque(id, false)?;
        self.write_u8(id, Register::Lock, 0)?;
        self.write_u8(id, Register::OperatingMode, mode as u8)?;
        self.write_u8(id, Register::Lock, 1)?;
        self.set_torque(id, true)
    }

    pub fn get_velocity(&mut self, id: u8) -> Result<i16> {
        let raw = self.read_u16(id, Register::PresentVelocity)?;
        Ok(decode_sign_magnitude(raw, 15))
    }
}

/// Encode a signed value with the sign stored in `sign_bit`
///
/// Velocities use bit 15, PWM output uses bit 10.
pub fn encode_sign_magnitude(value: i16, sign_bit: u8) -> u16 {
    let magnitude = value.unsigned_abs() & ((1u16 << sign_bit) - 1);
    if value < 0 {
        magnitude | (1 << sign_bit)
    } else {
        magnitude
    }
}

pub fn decode_sign_magnitude(raw: u16, sign_bit: u8) -> i16 {
    let magnitude = (raw & ((1u16 << sign_bit) - 1)) as i16;
    if raw & (1 << sign_bit) != 0 {
        -magnitude
    } else {
        magnitude
    }
}


#[cfg(test)]
mod tests {
    use super::fake::{FakePort, FakeServos};
    use super::*;

    #[test]
    fn test_checksum() {
        // ID=1, Length=4, Instruction=WRITE, Addr=30, Data=0, 2
        let data = [1u8, 4, 0x03, 30, 0, 2];
        // ~(1+4+3+30+0+2) = ~40 = 215
        assert_eq!(checksum(&data), 215);
    }

    #[test]
    fn test_build_packet() {
        let packet = build_packet(1, Instruction::Ping, &[]);
        assert_eq!(packet, vec![0xFF, 0xFF, 1, 2, 0x01, !(1u8 + 2 + 1)]);
    }

    #[test]
    fn test_sign_magnitude_velocity() {
        assert_eq!(encode_sign_magnitude(0, 15), 0);
        assert_eq!(encode_sign_magnitude(100, 15), 100);
        assert_eq!(encode_sign_magnitude(-100, 15), 0x8064);
        assert_eq!(decode_sign_magnitude(0x8064, 15), -100);
        assert_eq!(decode_sign_magnitude(0x8001, 15), -1);
    }

    #[test]
    fn test_sign_magnitude_pwm() {
        assert_eq!(encode_sign_magnitude(-500, 10), 0x400 | 500);
        assert_eq!(decode_sign_magnitude(0x400 | 500, 10), -500);
        assert_eq!(encode_sign_magnitude(1000, 10), 1000);
    }

    #[test]
    fn test_eeprom_split() {
        assert!(Register::ProtectionCurrent.is_eeprom());
        assert!(Register::OperatingMode.is_eeprom());
        assert!(!Register::TorqueLimit.is_eeprom());
    }

    #[test]
    fn test_fake_round_trip_and_missing_motor() {
        let servos = FakeServos::with_ids(&[7]);
        let mut bus = FeetechBus::from_transport(Box::new(FakePort(servos.clone())));

        assert!(bus.ping(7).unwrap());
        assert!(!bus.ping(9).unwrap());

        bus.write_u16(7, Register::TorqueLimit, 640).unwrap();
        assert_eq!(bus.read_u16(7, Register::TorqueLimit).unwrap(), 640);
        assert_eq!(servos.lock().reg_u16(7, Register::TorqueLimit), 640);
    }

    #[test]
    fn test_eeprom_write_relocks() {
        let servos = FakeServos::with_ids(&[3]);
        let mut bus = FeetechBus::from_transport(Box::new(FakePort(servos.clone())));
        bus.write_eeprom_u16(3, Register::ProtectionCurrent, 400).unwrap();
        assert_eq!(bus.read_u8(3, Register::Lock).unwrap(), 1);
        assert_eq!(servos.lock().reg_u16(3, Register::ProtectionCurrent), 400);
    }

    #[test]
    fn test_motor_error_status() {
        let servos = FakeServos::with_ids(&[4]);
        servos.lock().fail_writes.push(4);
        let mut bus = FeetechBus::from_transport(Box::new(FakePort(servos)));
        let err = bus.write_u8(4, Register::TorqueEnable, 1).unwrap_err();
        assert!(matches!(err, FeetechError::MotorError { id: 4, status: 0x20 }));
    }
}

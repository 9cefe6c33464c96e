//! GrovePi+ board access over I2C.
//!
//! The board's microcontroller listens at 0x04. Every command is a 4-byte
//! block written to register 1: `[cmd, arg1, arg2, arg3]`. Replies are read
//! back from register 1 and start with the command byte that produced them.
//!
//! One `I2c` handle serves both the pin backend (used by the hardware
//! gateway) and the DHT sensor; it sits behind a mutex so a multi-step
//! command/reply exchange is never interleaved with another.

use crate::error::HardwareError;
use crate::sensor::Sample;

pub const ADDRESS: u16 = 0x04;
const REGISTER: u8 = 1;

pub const CMD_DIGITAL_READ: u8 = 1;
pub const CMD_DIGITAL_WRITE: u8 = 2;
pub const CMD_PIN_MODE: u8 = 5;
pub const CMD_DHT: u8 = 40;

pub const MODE_INPUT: u8 = 0;
pub const MODE_OUTPUT: u8 = 1;

/// DHT module variant as understood by the GrovePi firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DhtType {
    /// DHT11
    Blue,
    /// DHT22 / AM2302
    White,
}

impl DhtType {
    pub fn code(self) -> u8 {
        match self {
            Self::Blue => 0,
            Self::White => 1,
        }
    }
}

/// Bytes to put on the wire for one command.
pub fn command_frame(cmd: u8, a: u8, b: u8, c: u8) -> [u8; 5] {
    [REGISTER, cmd, a, b, c]
}

/// Strip and check the command-id byte of a reply.
pub fn parse_identified(cmd: u8, reply: &[u8]) -> Result<&[u8], HardwareError> {
    match reply.split_first() {
        Some((&id, rest)) if id == cmd => Ok(rest),
        Some((&id, _)) => Err(HardwareError::UnexpectedResponse {
            device: "grovepi",
            detail: format!("reply for command {id}, expected {cmd}"),
        }),
        None => Err(HardwareError::UnexpectedResponse {
            device: "grovepi",
            detail: "empty reply".to_string(),
        }),
    }
}

/// Decode a DHT reply: command id followed by two little-endian f32 values
/// (temperature, humidity).
pub fn parse_dht(reply: &[u8; 9]) -> Result<Sample, HardwareError> {
    let body = parse_identified(CMD_DHT, reply)?;
    let t = f32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let h = f32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    Sample::from_raw(t as f64, h as f64)
}

#[cfg(feature = "hardware")]
pub use driver::{GroveDht, GrovePi, SharedGrovePi};

#[cfg(feature = "hardware")]
mod driver {
    use rppal::i2c::I2c;
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::{thread, time::Duration};

    use super::*;
    use crate::gateway::{Direction, PinBackend};
    use crate::sensor::SampleSource;

    /// The firmware needs time to bit-bang the DHT before the reply is ready.
    const DHT_WAIT: Duration = Duration::from_millis(600);
    const REPLY_WAIT: Duration = Duration::from_millis(10);

    fn io(e: rppal::i2c::Error) -> HardwareError {
        HardwareError::Io {
            device: "grovepi",
            detail: e.to_string(),
        }
    }

    pub struct GrovePi {
        i2c: I2c,
    }

    impl GrovePi {
        pub fn open() -> Result<Self, HardwareError> {
            let mut i2c = I2c::new().map_err(io)?;
            i2c.set_slave_address(ADDRESS).map_err(io)?;
            tracing::info!(addr = format_args!("0x{ADDRESS:02x}"), "grovepi initialised");
            Ok(Self { i2c })
        }

        fn command(&mut self, cmd: u8, a: u8, b: u8, c: u8) -> Result<(), HardwareError> {
            self.i2c.write(&command_frame(cmd, a, b, c)).map_err(io)?;
            Ok(())
        }

        fn read_reply(&mut self, buf: &mut [u8]) -> Result<(), HardwareError> {
            self.i2c.write_read(&[REGISTER], buf).map_err(io)
        }

        pub fn read_dht(&mut self, port: u8, ty: DhtType) -> Result<Sample, HardwareError> {
            self.command(CMD_DHT, port, ty.code(), 0)?;
            thread::sleep(DHT_WAIT);
            let mut reply = [0u8; 9];
            self.read_reply(&mut reply)?;
            parse_dht(&reply)
        }
    }

    /// GrovePi handle shared between the gateway worker and the DHT source.
    #[derive(Clone)]
    pub struct SharedGrovePi(Arc<Mutex<GrovePi>>);

    impl SharedGrovePi {
        pub fn new(board: GrovePi) -> Self {
            Self(Arc::new(Mutex::new(board)))
        }

        fn lock(&self) -> Result<MutexGuard<'_, GrovePi>, HardwareError> {
            self.0
                .lock()
                .map_err(|_| HardwareError::Unavailable("grovepi lock poisoned".to_string()))
        }
    }

    impl PinBackend for SharedGrovePi {
        fn set_pin_mode(&mut self, pin: u8, direction: Direction) -> Result<(), HardwareError> {
            let mode = match direction {
                Direction::Input => MODE_INPUT,
                Direction::Output => MODE_OUTPUT,
            };
            self.lock()?.command(CMD_PIN_MODE, pin, mode, 0)
        }

        fn digital_write(&mut self, pin: u8, level: u8) -> Result<(), HardwareError> {
            self.lock()?.command(CMD_DIGITAL_WRITE, pin, level, 0)
        }

        fn digital_read(&mut self, pin: u8) -> Result<u8, HardwareError> {
            let mut board = self.lock()?;
            board.command(CMD_DIGITAL_READ, pin, 0, 0)?;
            thread::sleep(REPLY_WAIT);
            let mut reply = [0u8; 2];
            board.read_reply(&mut reply)?;
            Ok(parse_identified(CMD_DIGITAL_READ, &reply)?[0])
        }
    }

    /// DHT sensor plugged into a GrovePi digital port.
    pub struct GroveDht {
        board: SharedGrovePi,
        port: u8,
        ty: DhtType,
    }

    impl GroveDht {
        pub fn new(board: SharedGrovePi, port: u8, ty: DhtType) -> Self {
            Self { board, port, ty }
        }
    }

    impl SampleSource for GroveDht {
        fn name(&self) -> &'static str {
            "grove-dht"
        }

        fn read_sample(&mut self) -> Result<Sample, HardwareError> {
            self.board.lock()?.read_dht(self.port, self.ty)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frame_targets_register_one() {
        assert_eq!(command_frame(CMD_DIGITAL_WRITE, 4, 1, 0), [1, 2, 4, 1, 0]);
        assert_eq!(command_frame(CMD_PIN_MODE, 6, MODE_OUTPUT, 0), [1, 5, 6, 1, 0]);
    }

    #[test]
    fn dht_type_codes() {
        assert_eq!(DhtType::Blue.code(), 0);
        assert_eq!(DhtType::White.code(), 1);
    }

    #[test]
    fn parse_identified_accepts_matching_id() {
        assert_eq!(parse_identified(CMD_DIGITAL_READ, &[1, 1]).unwrap(), &[1]);
    }

    #[test]
    fn parse_identified_rejects_other_id() {
        assert!(parse_identified(CMD_DIGITAL_READ, &[40, 1]).is_err());
        assert!(parse_identified(CMD_DIGITAL_READ, &[]).is_err());
    }

    fn dht_reply(t: f32, h: f32) -> [u8; 9] {
        let mut r = [0u8; 9];
        r[0] = CMD_DHT;
        r[1..5].copy_from_slice(&t.to_le_bytes());
        r[5..9].copy_from_slice(&h.to_le_bytes());
        r
    }

    #[test]
    fn parse_dht_valid() {
        let s = parse_dht(&dht_reply(23.5, 41.25)).unwrap();
        assert_eq!(s.temperature, Some(23.5));
        assert_eq!(s.humidity, Some(41.25));
    }

    #[test]
    fn parse_dht_nan_is_invalid() {
        assert!(matches!(
            parse_dht(&dht_reply(f32::NAN, 41.0)),
            Err(HardwareError::InvalidReading(_))
        ));
    }

    #[test]
    fn parse_dht_wrong_id_is_unexpected() {
        let mut r = dht_reply(20.0, 40.0);
        r[0] = 0;
        assert!(matches!(
            parse_dht(&r),
            Err(HardwareError::UnexpectedResponse { .. })
        ));
    }
}

//! Sensirion SHT35 temperature/humidity sensor over I2C.
//!
//! Single-shot measurement, high repeatability, clock stretching enabled
//! (command 0x2C 0x06). The sensor answers with six bytes:
//! `T_msb T_lsb T_crc RH_msb RH_lsb RH_crc`, each word protected by a
//! CRC-8 (polynomial 0x31, init 0xFF).

use crate::error::HardwareError;
use crate::sensor::Sample;

pub const DEFAULT_ADDR: u16 = 0x44;

/// Single shot, high repeatability, clock stretching.
pub const MEASURE_CMD: [u8; 2] = [0x2C, 0x06];

const CRC_POLY: u8 = 0x31;
const CRC_INIT: u8 = 0xFF;

/// Sensirion CRC-8 over one data word.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = CRC_INIT;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ CRC_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

pub fn raw_to_celsius(raw: u16) -> f64 {
    -45.0 + 175.0 * (raw as f64 / 65535.0)
}

pub fn raw_to_humidity(raw: u16) -> f64 {
    100.0 * (raw as f64 / 65535.0)
}

/// Verify both CRCs and convert a measurement response.
pub fn decode(data: &[u8; 6]) -> Result<Sample, HardwareError> {
    if crc8(&data[0..2]) != data[2] || crc8(&data[3..5]) != data[5] {
        return Err(HardwareError::Checksum("sht35"));
    }
    let t_raw = u16::from_be_bytes([data[0], data[1]]);
    let h_raw = u16::from_be_bytes([data[3], data[4]]);
    Sample::from_raw(raw_to_celsius(t_raw), raw_to_humidity(h_raw))
}

#[cfg(feature = "hardware")]
pub use driver::Sht35;

#[cfg(feature = "hardware")]
mod driver {
    use rppal::i2c::I2c;
    use std::{thread, time::Duration};

    use super::{decode, MEASURE_CMD};
    use crate::error::HardwareError;
    use crate::sensor::{Sample, SampleSource};

    /// High-repeatability measurement takes up to 15 ms.
    const MEASURE_WAIT: Duration = Duration::from_millis(15);

    fn io(e: rppal::i2c::Error) -> HardwareError {
        HardwareError::Io {
            device: "sht35",
            detail: e.to_string(),
        }
    }

    pub struct Sht35 {
        i2c: I2c,
    }

    impl Sht35 {
        /// Open I2C `bus` and address the sensor at `addr`.
        pub fn new(bus: u8, addr: u16) -> Result<Self, HardwareError> {
            let mut i2c = I2c::with_bus(bus).map_err(io)?;
            i2c.set_slave_address(addr).map_err(io)?;
            tracing::info!(bus, addr = format_args!("0x{addr:02x}"), "sht35 initialised");
            Ok(Self { i2c })
        }
    }

    impl SampleSource for Sht35 {
        fn name(&self) -> &'static str {
            "sht35"
        }

        fn read_sample(&mut self) -> Result<Sample, HardwareError> {
            self.i2c.write(&MEASURE_CMD).map_err(io)?;
            thread::sleep(MEASURE_WAIT);
            let mut buf = [0u8; 6];
            let n = self.i2c.read(&mut buf).map_err(io)?;
            if n != buf.len() {
                return Err(HardwareError::UnexpectedResponse {
                    device: "sht35",
                    detail: format!("short read: {n} of 6 bytes"),
                });
            }
            decode(&buf)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

//! Error types for sensor and pin access.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("hardware backend unavailable: {0}")]
    Unavailable(String),

    #[error("i/o error on {device}: {detail}")]
    Io { device: &'static str, detail: String },

    #[error("invalid reading: {0}")]
    InvalidReading(String),

    #[error("checksum mismatch in {0} response")]
    Checksum(&'static str),

    #[error("unexpected response from {device}: {detail}")]
    UnexpectedResponse { device: &'static str, detail: String },
}

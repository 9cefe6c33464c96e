//! Sample type shared by every temperature/humidity source.

use crate::error::HardwareError;

/// One reading from a climate sensor, rounded to two decimals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

impl Sample {
    /// Build a sample from raw values, rejecting NaN/infinite readings.
    pub fn from_raw(temperature: f64, humidity: f64) -> Result<Self, HardwareError> {
        if !temperature.is_finite() || !humidity.is_finite() {
            return Err(HardwareError::InvalidReading(format!(
                "temperature={temperature} humidity={humidity}"
            )));
        }
        Ok(Self {
            temperature: Some(round2(temperature)),
            humidity: Some(round2(humidity)),
        })
    }
}

/// Round to two decimals. This is the only deadband: samples are compared
/// for exact equality after rounding.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Anything that can produce a climate sample. Reads may block briefly on
/// the bus; callers run them off the async executor.
pub trait SampleSource: Send {
    fn name(&self) -> &'static str;
    fn read_sample(&mut self) -> Result<Sample, HardwareError>;
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn read_sample(&mut self) -> Result<Sample, HardwareError> {
        (**self).read_sample()
    }
}

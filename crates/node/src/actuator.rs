//! Actuators driven by command topics.

use std::sync::Arc;

use tracing::{debug, info};

use crate::gateway::{HardwareGateway, PinChannel};

/// Something that listens on one command topic and drives hardware.
pub trait Actuator: Send {
    fn topic(&self) -> &str;

    /// Handle one raw payload. Returns true if it changed the hardware state.
    fn on_message(&mut self, payload: &[u8]) -> bool;

    /// Force the output into its safe state.
    fn tear_down(&mut self);
}

const LED_VOCABULARY: [&str; 4] = ["true", "false", "on", "off"];

/// Normalise a payload against the LED vocabulary. Anything that is not
/// valid UTF-8 or not in the vocabulary is `None`.
fn parse_led_command(payload: &[u8]) -> Option<bool> {
    let text = std::str::from_utf8(payload).unwrap_or("");
    let word = text.trim().to_ascii_lowercase();
    if !LED_VOCABULARY.contains(&word.as_str()) {
        return None;
    }
    Some(word == "true" || word == "on")
}

/// A single LED on a gateway output pin.
pub struct LedActuator {
    topic: String,
    gateway: Arc<HardwareGateway>,
    pin: PinChannel,
    state: bool,
}

impl LedActuator {
    /// Register the pin and queue the initial OFF so the LED starts dark.
    pub fn new(gateway: Arc<HardwareGateway>, connector: u8, topic: impl Into<String>) -> Self {
        let pin = gateway.register_output(connector);
        gateway.submit(&pin, 0);
        let topic = topic.into();
        info!(%topic, pin = connector, "led actuator ready");
        Self {
            topic,
            gateway,
            pin,
            state: false,
        }
    }

    pub fn state(&self) -> bool {
        self.state
    }
}

impl Actuator for LedActuator {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn on_message(&mut self, payload: &[u8]) -> bool {
        let Some(on) = parse_led_command(payload) else {
            debug!(topic = %self.topic, payload = %String::from_utf8_lossy(payload), "ignoring invalid command");
            return false;
        };
        if on == self.state {
            return false;
        }
        if !self.gateway.submit(&self.pin, u8::from(on)) {
            return false;
        }
        self.state = on;
        info!(topic = %self.topic, state = if on { "ON" } else { "OFF" }, "led");
        true
    }

    fn tear_down(&mut self) {
        if self.gateway.submit(&self.pin, 0) {
            self.state = false;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

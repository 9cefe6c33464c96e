use anyhow::Context;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Outbound side of the message bus. Publishing must not block: the
/// poller calls it from inside its sampling loop.
pub trait Publish: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()>;
}

impl Publish for AsyncClient {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        self.try_publish(topic, QoS::AtMostOnce, false, payload)
            .with_context(|| format!("publish to {topic} failed"))
    }
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Topics derived from a zone's temperature topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorTopics {
    pub zone: String,
    pub temperature: String,
    pub humidity: String,
}

impl SensorTopics {
    /// `base` is the temperature topic, e.g. "sensors/zone/red/temperature".
    pub fn from_base(base: &str) -> Self {
        let segments: Vec<&str> = base.split('/').collect();
        let zone = if segments.len() >= 2 {
            segments[segments.len() - 2].to_string()
        } else {
            "unknown".to_string()
        };
        Self {
            zone,
            temperature: base.to_string(),
            humidity: base.replace("/temperature", "/humidity"),
        }
    }

    pub fn for_zone(zone: &str) -> Self {
        Self::from_base(&format!("sensors/zone/{zone}/temperature"))
    }
}

pub fn command_topic(zone: &str, actuator: &str) -> String {
    format!("actuators/zone/{zone}/{actuator}")
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// One metric reading as published on a sensor topic.
#[derive(Debug, Serialize)]
pub struct ReadingMsg<'a> {
    pub zone: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    pub timestamp: String,
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::UNIX_EPOCH.to_string())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_from_base() {
        let t = SensorTopics::from_base("sensors/zone/purple/temperature");
        assert_eq!(t.zone, "purple");
        assert_eq!(t.temperature, "sensors/zone/purple/temperature");
        assert_eq!(t.humidity, "sensors/zone/purple/humidity");
    }

    #[test]
    fn zone_is_second_to_last_segment() {
        assert_eq!(SensorTopics::from_base("home/attic/temperature").zone, "attic");
    }

    #[test]
    fn topic_without_slash_has_unknown_zone() {
        let t = SensorTopics::from_base("temperature");
        assert_eq!(t.zone, "unknown");
        assert_eq!(t.humidity, "temperature");
    }

    #[test]
    fn for_zone_matches_hub_subscription() {
        assert_eq!(SensorTopics::for_zone("red"), SensorTopics::from_base("sensors/zone/red/temperature"));
        assert_eq!(command_topic("purple", "led_humidity"), "actuators/zone/purple/led_humidity");
    }

    #[test]
    fn reading_omits_absent_metric() {
        let msg = ReadingMsg {
            zone: "red",
            temperature: Some(21.5),
            humidity: None,
            timestamp: "2024-01-01T00:00:00Z".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["zone"], "red");
        assert_eq!(json["temperature"], 21.5);
        assert!(json.get("humidity").is_none());
        assert_eq!(json["timestamp"], "2024-01-01T00:00:00Z");
    }

    #[test]
    fn now_is_rfc3339() {
        let ts = now_rfc3339();
        assert!(OffsetDateTime::parse(&ts, &Rfc3339).is_ok(), "{ts}");
    }
}

use serde::{Deserialize, Deserializer};
use std::fmt;
use thiserror::Error;
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// Wildcard subscriptions covering every zone's sensor topics.
pub(crate) const SENSOR_TOPICS: [&str; 2] = [
    "sensors/zone/+/temperature",
    "sensors/zone/+/humidity",
];

// ---------------------------------------------------------------------------
// Shared types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Metric {
    Temperature,
    Humidity,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temperature => write!(f, "temperature"),
            Self::Humidity => write!(f, "humidity"),
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum IngestError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawReadingMsg {
    zone: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    temperature: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    humidity: Option<f64>,
    timestamp: Option<String>,
}

/// A validated sensor message: zone present, at least one metric present.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ReadingMsg {
    pub(crate) zone: String,
    pub(crate) temperature: Option<f64>,
    pub(crate) humidity: Option<f64>,
    pub(crate) timestamp: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(f64),
    Text(String),
}

/// Accepts a JSON number or a numeric string; `null` maps to `None`.
fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<NumberOrText>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrText::Number(n)) => Ok(Some(n)),
        Some(NumberOrText::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("non-numeric value {s:?}"))),
    }
}

/// Decode and validate a sensor payload.
pub(crate) fn parse_reading(payload: &[u8]) -> Result<ReadingMsg, IngestError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| IngestError::Malformed(format!("payload is not utf-8: {e}")))?;
    let raw: RawReadingMsg = serde_json::from_str(text)
        .map_err(|e| IngestError::Malformed(format!("bad json: {e}")))?;

    let zone = match raw.zone {
        Some(z) if !z.trim().is_empty() => z,
        _ => return Err(IngestError::Malformed(format!("no zone in {text}"))),
    };

    if raw.temperature.is_none() && raw.humidity.is_none() {
        return Err(IngestError::Malformed(format!(
            "no temperature or humidity in {text}"
        )));
    }
    for (name, v) in [("temperature", raw.temperature), ("humidity", raw.humidity)] {
        if let Some(v) = v {
            if !v.is_finite() {
                return Err(IngestError::Malformed(format!("{name} is not finite: {v}")));
            }
        }
    }

    let timestamp = match raw.timestamp {
        Some(ts) if !ts.trim().is_empty() => {
            if !is_iso8601(ts.trim()) {
                return Err(IngestError::Malformed(format!("bad timestamp {ts:?}")));
            }
            ts
        }
        _ => now_rfc3339(),
    };

    Ok(ReadingMsg {
        zone,
        temperature: raw.temperature,
        humidity: raw.humidity,
        timestamp,
    })
}

/// True for an ISO-8601 date-time with or without a UTC offset. The
/// original string is stored unchanged.
fn is_iso8601(ts: &str) -> bool {
    let compact_offset = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]][offset_hour sign:mandatory][offset_minute]"
    );
    let naive = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"
    );
    OffsetDateTime::parse(ts, &Rfc3339).is_ok()
        || OffsetDateTime::parse(ts, &Iso8601::DEFAULT).is_ok()
        || OffsetDateTime::parse(ts, compact_offset).is_ok()
        || PrimitiveDateTime::parse(ts, &Iso8601::DEFAULT).is_ok()
        || PrimitiveDateTime::parse(ts, naive).is_ok()
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::UNIX_EPOCH.to_string())
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract (zone, metric) from "sensors/zone/<zone>/<temperature|humidity>".
pub(crate) fn parse_sensor_topic(topic: &str) -> Option<(&str, Metric)> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 4 || parts[0] != "sensors" || parts[1] != "zone" || parts[2].is_empty() {
        return None;
    }
    let metric = match parts[3] {
        "temperature" => Metric::Temperature,
        "humidity" => Metric::Humidity,
        _ => return None,
    };
    Some((parts[2], metric))
}

/// Plain-text command payload.
pub(crate) fn command_payload(on: bool) -> &'static [u8] {
    if on {
        b"ON"
    } else {
        b"OFF"
    }
}

// ===========================================================================
// Tests
// ===========================================================================

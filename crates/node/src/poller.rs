//! Periodic sensor sampling with publish-on-change.
//!
//! Each metric is compared against the last value that was *successfully*
//! published; a failed publish leaves it untouched so the next cycle retries.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mqtt::{now_rfc3339, Publish, ReadingMsg, SensorTopics};
use crate::sensor::{Sample, SampleSource};
use crate::sim::ClimateSim;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Sampling,
    Publishing,
}

pub struct SensorPoller {
    source: Box<dyn SampleSource>,
    fallback: Option<ClimateSim>,
    publisher: Arc<dyn Publish>,
    topics: SensorTopics,
    state: PollerState,
    last_temperature: Option<f64>,
    last_humidity: Option<f64>,
}

impl SensorPoller {
    pub fn new(
        source: Box<dyn SampleSource>,
        publisher: Arc<dyn Publish>,
        topics: SensorTopics,
    ) -> Self {
        Self {
            source,
            fallback: None,
            publisher,
            topics,
            state: PollerState::Idle,
            last_temperature: None,
            last_humidity: None,
        }
    }

    /// Substitute simulated samples when the real source fails.
    pub fn with_fallback(mut self, sim: ClimateSim) -> Self {
        self.fallback = Some(sim);
        self
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn zone(&self) -> &str {
        &self.topics.zone
    }

    fn sample(&mut self) -> Option<Sample> {
        match self.source.read_sample() {
            Ok(sample) => Some(sample),
            Err(e) => match self.fallback.as_mut() {
                Some(sim) => {
                    warn!(zone = %self.topics.zone, source = self.source.name(), "read failed, using simulated sample: {e}");
                    Some(sim.sample())
                }
                None => {
                    warn!(zone = %self.topics.zone, source = self.source.name(), "read failed, skipping cycle: {e}");
                    None
                }
            },
        }
    }

    /// One sample-and-publish cycle. Returns how many messages went out.
    pub fn poll_once(&mut self) -> usize {
        self.state = PollerState::Sampling;
        let Some(sample) = self.sample() else {
            self.state = PollerState::Idle;
            return 0;
        };

        self.state = PollerState::Publishing;
        let timestamp = now_rfc3339();
        let mut published = 0;

        if let Some(t) = sample.temperature {
            if self.last_temperature != Some(t) {
                let msg = ReadingMsg {
                    zone: &self.topics.zone,
                    temperature: Some(t),
                    humidity: None,
                    timestamp: timestamp.clone(),
                };
                if publish_reading(self.publisher.as_ref(), &self.topics.temperature, &msg) {
                    self.last_temperature = Some(t);
                    published += 1;
                }
            }
        }

        if let Some(h) = sample.humidity {
            if self.last_humidity != Some(h) {
                let msg = ReadingMsg {
                    zone: &self.topics.zone,
                    temperature: None,
                    humidity: Some(h),
                    timestamp,
                };
                if publish_reading(self.publisher.as_ref(), &self.topics.humidity, &msg) {
                    self.last_humidity = Some(h);
                    published += 1;
                }
            }
        }

        self.state = PollerState::Idle;
        published
    }

    /// Sample every `interval` until `cancel` fires. Sensor reads block, so
    /// they run via `block_in_place`; this needs the multi-threaded runtime.
    pub async fn run(mut self, cancel: CancellationToken, interval: Duration) {
        info!(
            zone = %self.topics.zone,
            source = self.source.name(),
            interval_s = interval.as_secs(),
            "sensor poller started"
        );
        while !cancel.is_cancelled() {
            tokio::task::block_in_place(|| self.poll_once());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!(zone = %self.topics.zone, "sensor poller stopped");
    }
}

fn publish_reading(publisher: &dyn Publish, topic: &str, msg: &ReadingMsg<'_>) -> bool {
    let payload = match serde_json::to_vec(msg) {
        Ok(p) => p,
        Err(e) => {
            warn!(topic, "failed to encode reading: {e}");
            return false;
        }
    };
    match publisher.publish(topic, payload) {
        Ok(()) => {
            debug!(topic, "published reading");
            true
        }
        Err(e) => {
            warn!(topic, "{e:#}");
            false
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

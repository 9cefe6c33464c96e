//! Inbound sensor message handling: validate, append to the ledger,
//! re-evaluate the control rules, and hand back the commands to publish.

use crate::control::{Command, ControlEvaluator};
use crate::db::Ledger;
use crate::mqtt::{parse_reading, parse_sensor_topic, IngestError};

pub struct Aggregator {
    ledger: Ledger,
    evaluator: ControlEvaluator,
}

impl Aggregator {
    pub fn new(ledger: Ledger, evaluator: ControlEvaluator) -> Self {
        Self { ledger, evaluator }
    }

    /// Handle one sensor message. Malformed payloads are rejected before
    /// anything is written; a storage failure is returned to the caller.
    pub async fn ingest(&mut self, topic: &str, payload: &[u8]) -> Result<Vec<Command>, IngestError> {
        let msg = parse_reading(payload)?;

        if let Some((topic_zone, metric)) = parse_sensor_topic(topic) {
            if topic_zone != msg.zone {
                tracing::debug!(
                    topic_zone,
                    payload_zone = %msg.zone,
                    %metric,
                    "zone in topic differs from payload; using payload"
                );
            }
        }

        tracing::info!(
            zone = %msg.zone,
            temperature = ?msg.temperature,
            humidity = ?msg.humidity,
            ts = %msg.timestamp,
            "reading received"
        );

        self.ledger
            .insert(&msg.zone, msg.temperature, msg.humidity, &msg.timestamp)
            .await?;

        let desired = self.evaluator.evaluate(&self.ledger).await?;
        Ok(self.evaluator.commands(&desired))
    }

    /// Evaluate against whatever the ledger already holds, so actuators get
    /// a known state right after startup.
    pub async fn initial_commands(&mut self) -> Result<Vec<Command>, IngestError> {
        let desired = self.evaluator.evaluate(&self.ledger).await?;
        Ok(self.evaluator.commands(&desired))
    }

    /// Confirm a command reached the bus; until then it is re-emitted.
    pub fn mark_published(&mut self, cmd: &Command) {
        self.evaluator.mark_published(cmd);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

//! Threshold control: maps the latest reading of every monitored zone to a
//! desired ON/OFF state per actuator, and turns state changes into commands.
//!
//! A rule is ON when ANY monitored zone's latest value of the rule's metric
//! passes the threshold in the rule's direction:
//!
//! ```text
//! policy = "above"  ->  ON iff value >  threshold   (cooling / alert)
//! policy = "below"  ->  ON iff value <  threshold   (heating)
//! ```
//!
//! Commands are edge-triggered: an actuator's command is published only when
//! its desired state differs from the last one published by this process.
//! The last state starts out unknown, so the first evaluation always emits.
//! A state only counts as published once the caller confirms it with
//! `mark_published`; a command whose publish failed is emitted again on the
//! next evaluation.

use anyhow::Result;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

use crate::db::{Ledger, ZoneLatest};
use crate::mqtt::{command_payload, Metric};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// ON while any zone reads strictly above the threshold.
    Above,
    /// ON while any zone reads strictly below the threshold.
    Below,
}

impl Policy {
    fn triggers(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Above => value > threshold,
            Self::Below => value < threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub actuator_id: String,
    pub metric: Metric,
    pub threshold: f64,
    pub policy: Policy,
    pub command_topic: String,
}

/// A command ready to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub actuator_id: String,
    pub topic: String,
    pub on: bool,
}

impl Command {
    pub fn payload(&self) -> &'static [u8] {
        command_payload(self.on)
    }
}

pub struct ControlEvaluator {
    zones: Vec<String>,
    rules: Vec<Rule>,
    /// actuator_id -> last published state. Absent means unknown.
    last_published: HashMap<String, bool>,
}

impl ControlEvaluator {
    pub fn new(zones: Vec<String>, rules: Vec<Rule>) -> Self {
        Self {
            zones,
            rules,
            last_published: HashMap::new(),
        }
    }

    pub fn zones(&self) -> &[String] {
        &self.zones
    }

    /// Desired state per actuator from a snapshot of the latest readings.
    pub fn decide(&self, latest: &ZoneLatest) -> BTreeMap<String, bool> {
        self.rules
            .iter()
            .map(|rule| {
                let on = self.zones.iter().any(|zone| {
                    latest
                        .get(&(zone.clone(), rule.metric))
                        .is_some_and(|&v| rule.policy.triggers(v, rule.threshold))
                });
                (rule.actuator_id.clone(), on)
            })
            .collect()
    }

    /// Read the latest values from the ledger and decide.
    pub async fn evaluate(&self, ledger: &Ledger) -> Result<BTreeMap<String, bool>> {
        let latest = ledger.latest(&self.zones).await?;
        Ok(self.decide(&latest))
    }

    /// Commands for every actuator whose desired state differs from the last
    /// published one.
    pub fn commands(&self, desired: &BTreeMap<String, bool>) -> Vec<Command> {
        let mut out = Vec::new();
        for rule in &self.rules {
            let Some(&on) = desired.get(&rule.actuator_id) else {
                continue;
            };
            if self.last_published.get(&rule.actuator_id) == Some(&on) {
                continue;
            }
            out.push(Command {
                actuator_id: rule.actuator_id.clone(),
                topic: rule.command_topic.clone(),
                on,
            });
        }
        out
    }

    /// Record that `cmd` reached the bus.
    pub fn mark_published(&mut self, cmd: &Command) {
        self.last_published.insert(cmd.actuator_id.clone(), cmd.on);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_rule(policy: Policy) -> Rule {
        Rule {
            actuator_id: "led".into(),
            metric: Metric::Temperature,
            threshold: 22.0,
            policy,
            command_topic: "actuators/zone/purple/led".into(),
        }
    }

    fn humidity_rule() -> Rule {
        Rule {
            actuator_id: "led_humidity".into(),
            metric: Metric::Humidity,
            threshold: 60.0,
            policy: Policy::Above,
            command_topic: "actuators/zone/purple/led_humidity".into(),
        }
    }

    fn evaluator(policy: Policy) -> ControlEvaluator {
        ControlEvaluator::new(
            vec!["red".into(), "purple".into()],
            vec![temp_rule(policy), humidity_rule()],
        )
    }

    fn publish_all(ev: &mut ControlEvaluator, cmds: &[Command]) {
        for cmd in cmds {
            ev.mark_published(cmd);
        }
    }

    fn latest(entries: &[(&str, Metric, f64)]) -> ZoneLatest {
        entries
            .iter()
            .map(|(z, m, v)| ((z.to_string(), *m), *v))
            .collect()
    }

    // -- decide -------------------------------------------------------------

    #[test]
    fn above_threshold_is_on() {
        let ev = evaluator(Policy::Above);
        let d = ev.decide(&latest(&[("red", Metric::Temperature, 25.0)]));
        assert!(d["led"]);
    }

    #[test]
    fn below_threshold_is_off() {
        let ev = evaluator(Policy::Above);
        let d = ev.decide(&latest(&[("red", Metric::Temperature, 20.0)]));
        assert!(!d["led"]);
    }

    #[test]
    fn equal_to_threshold_is_off() {
        let ev = evaluator(Policy::Above);
        let d = ev.decide(&latest(&[("red", Metric::Temperature, 22.0)]));
        assert!(!d["led"]);

        let ev = evaluator(Policy::Below);
        let d = ev.decide(&latest(&[("red", Metric::Temperature, 22.0)]));
        assert!(!d["led"]);
    }

    #[test]
    fn any_zone_over_threshold_turns_on() {
        let ev = evaluator(Policy::Above);
        let d = ev.decide(&latest(&[
            ("red", Metric::Temperature, 18.0),
            ("purple", Metric::Temperature, 22.5),
        ]));
        assert!(d["led"]);
    }

    #[test]
    fn unmonitored_zone_is_ignored() {
        let ev = evaluator(Policy::Above);
        let d = ev.decide(&latest(&[("black", Metric::Temperature, 40.0)]));
        assert!(!d["led"]);
    }

    #[test]
    fn below_policy_for_heating() {
        let ev = evaluator(Policy::Below);
        let d = ev.decide(&latest(&[("purple", Metric::Temperature, 19.0)]));
        assert!(d["led"]);
        let d = ev.decide(&latest(&[("purple", Metric::Temperature, 23.0)]));
        assert!(!d["led"]);
    }

    #[test]
    fn no_readings_means_off() {
        let ev = evaluator(Policy::Below);
        let d = ev.decide(&ZoneLatest::new());
        assert!(!d["led"]);
        assert!(!d["led_humidity"]);
    }

    #[test]
    fn rules_use_their_own_metric() {
        let ev = evaluator(Policy::Above);
        let d = ev.decide(&latest(&[
            ("red", Metric::Humidity, 75.0),
            ("red", Metric::Temperature, 10.0),
        ]));
        assert!(!d["led"]);
        assert!(d["led_humidity"]);
    }

    // -- commands (edge trigger) -------------------------------------------

    #[test]
    fn first_evaluation_always_emits() {
        let ev = evaluator(Policy::Above);
        let d = ev.decide(&latest(&[("red", Metric::Temperature, 20.0)]));
        let cmds = ev.commands(&d);
        assert_eq!(cmds.len(), 2);
        assert!(cmds.iter().all(|c| !c.on));
    }

    #[test]
    fn unchanged_state_is_suppressed() {
        let mut ev = evaluator(Policy::Above);
        let d = ev.decide(&latest(&[("red", Metric::Temperature, 25.0)]));
        let first = ev.commands(&d);
        assert!(first
            .iter()
            .any(|c| c.actuator_id == "led" && c.on && c.payload() == b"ON"));
        publish_all(&mut ev, &first);

        let d = ev.decide(&latest(&[("red", Metric::Temperature, 25.0)]));
        assert!(ev.commands(&d).is_empty());
    }

    #[test]
    fn change_emits_only_the_changed_actuator() {
        let mut ev = evaluator(Policy::Above);
        let d = ev.decide(&latest(&[("red", Metric::Temperature, 25.0)]));
        let first = ev.commands(&d);
        publish_all(&mut ev, &first);

        let d = ev.decide(&latest(&[("red", Metric::Temperature, 20.0)]));
        let cmds = ev.commands(&d);
        assert_eq!(
            cmds,
            vec![Command {
                actuator_id: "led".into(),
                topic: "actuators/zone/purple/led".into(),
                on: false,
            }]
        );
        assert_eq!(cmds[0].payload(), b"OFF");
    }

    #[test]
    fn unpublished_command_is_emitted_again() {
        let mut ev = evaluator(Policy::Above);
        let d = ev.decide(&latest(&[("red", Metric::Temperature, 25.0)]));
        let first = ev.commands(&d);
        // Only the humidity command made it onto the bus.
        let humidity: Vec<Command> = first
            .iter()
            .filter(|c| c.actuator_id == "led_humidity")
            .cloned()
            .collect();
        publish_all(&mut ev, &humidity);

        let retry = ev.commands(&d);
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].actuator_id, "led");
        assert!(retry[0].on);
    }

    #[test]
    fn failed_change_is_retried_against_last_published_state() {
        let mut ev = evaluator(Policy::Above);
        let on = ev.decide(&latest(&[("red", Metric::Temperature, 25.0)]));
        let first = ev.commands(&on);
        publish_all(&mut ev, &first);

        // OFF is computed but never confirmed; the next evaluation still
        // sees ON as the published state.
        let off = ev.decide(&latest(&[("red", Metric::Temperature, 20.0)]));
        assert_eq!(ev.commands(&off).len(), 1);
        assert_eq!(ev.commands(&off).len(), 1);
        assert!(ev.commands(&on).is_empty());
    }

    // -- evaluate (ledger-backed) -------------------------------------------

    #[tokio::test]
    async fn evaluate_reads_latest_from_ledger() {
        let ledger = Ledger::connect("sqlite::memory:").await.unwrap();
        ledger.migrate().await.unwrap();
        ledger
            .insert("red", Some(25.0), None, "2024-01-01T00:00:00Z")
            .await
            .unwrap();

        let ev = evaluator(Policy::Above);
        let d = ev.evaluate(&ledger).await.unwrap();
        assert!(d["led"]);
        assert!(!d["led_humidity"]);
    }
}

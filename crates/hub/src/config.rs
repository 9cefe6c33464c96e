//! TOML rule file loading and validation, plus the built-in defaults used
//! when no file is given.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

use crate::control::{Policy, Rule};
use crate::mqtt::Metric;

pub const DEFAULT_TEMP_THRESHOLD: f64 = 22.0;
pub const DEFAULT_HUMIDITY_THRESHOLD: f64 = 60.0;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_zones")]
    pub monitored_zones: Vec<String>,
    #[serde(default = "default_rules")]
    pub rules: Vec<RuleEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleEntry {
    pub actuator_id: String,
    pub metric: Metric,
    pub threshold: f64,
    pub policy: Policy,
    pub command_topic: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitored_zones: default_zones(),
            rules: default_rules(),
        }
    }
}

fn default_zones() -> Vec<String> {
    vec!["red".to_string(), "purple".to_string()]
}

fn default_rules() -> Vec<RuleEntry> {
    vec![
        RuleEntry {
            actuator_id: "led".to_string(),
            metric: Metric::Temperature,
            threshold: DEFAULT_TEMP_THRESHOLD,
            policy: Policy::Above,
            command_topic: "actuators/zone/purple/led".to_string(),
        },
        RuleEntry {
            actuator_id: "led_humidity".to_string(),
            metric: Metric::Humidity,
            threshold: DEFAULT_HUMIDITY_THRESHOLD,
            policy: Policy::Above,
            command_topic: "actuators/zone/purple/led_humidity".to_string(),
        },
    ]
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Default, Clone, Copy)]
pub struct Overrides {
    pub temp_threshold: Option<f64>,
    pub humidity_threshold: Option<f64>,
    pub temp_policy: Option<Policy>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all entries. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_zones(&mut errors);
        self.validate_rules(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        if self.monitored_zones.is_empty() {
            errors.push("monitored_zones is empty".to_string());
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, z) in self.monitored_zones.iter().enumerate() {
            if z.trim().is_empty() {
                errors.push(format!("monitored_zones[{i}]: zone is empty"));
            } else if z.contains(['/', '+', '#']) {
                errors.push(format!("zone '{z}': must not contain '/', '+' or '#'"));
            } else if !seen.insert(z) {
                errors.push(format!("zone '{z}': listed twice"));
            }
        }
    }

    fn validate_rules(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, r) in self.rules.iter().enumerate() {
            let ctx = || {
                if r.actuator_id.is_empty() {
                    format!("rules[{i}]")
                } else {
                    format!("rule '{}'", r.actuator_id)
                }
            };

            if r.actuator_id.trim().is_empty() {
                errors.push(format!("{}: actuator_id is empty", ctx()));
            } else if !seen_ids.insert(&r.actuator_id) {
                errors.push(format!("{}: duplicate actuator_id", ctx()));
            }

            if !r.threshold.is_finite() {
                errors.push(format!("{}: threshold {} is not finite", ctx(), r.threshold));
            }

            if r.command_topic.trim().is_empty() {
                errors.push(format!("{}: command_topic is empty", ctx()));
            } else if r.command_topic.contains(['+', '#']) {
                errors.push(format!(
                    "{}: command_topic '{}' must not contain wildcards",
                    ctx(),
                    r.command_topic
                ));
            }
        }
    }

    /// Apply command-line overrides. Threshold and policy overrides apply to
    /// every rule of the matching metric.
    pub fn apply(&mut self, o: Overrides) {
        for r in &mut self.rules {
            match r.metric {
                Metric::Temperature => {
                    if let Some(t) = o.temp_threshold {
                        r.threshold = t;
                    }
                    if let Some(p) = o.temp_policy {
                        r.policy = p;
                    }
                }
                Metric::Humidity => {
                    if let Some(t) = o.humidity_threshold {
                        r.threshold = t;
                    }
                }
            }
        }
    }

    pub fn to_rules(&self) -> Vec<Rule> {
        self.rules
            .iter()
            .map(|r| Rule {
                actuator_id: r.actuator_id.clone(),
                metric: r.metric,
                threshold: r.threshold,
                policy: r.policy,
                command_topic: r.command_topic.clone(),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read the optional TOML file, apply overrides, and validate the result.
pub fn load(path: Option<&str>, overrides: Overrides) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config: {path}"))?;
            toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
        }
        None => Config::default(),
    };
    config.apply(overrides);
    config
        .validate()
        .with_context(|| format!("invalid config: {}", path.unwrap_or("<defaults>")))?;

    tracing::info!(
        zones = ?config.monitored_zones,
        rules = config.rules.len(),
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
monitored_zones = ["red", "purple", "black"]

[[rules]]
actuator_id = "heater"
metric = "temperature"
threshold = 19.5
policy = "below"
command_topic = "actuators/zone/black/led"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.monitored_zones.len(), 3);
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].policy, Policy::Below);
        assert_eq!(config.rules[0].metric, Metric::Temperature);
        config.validate().unwrap();
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.monitored_zones, vec!["red", "purple"]);
        assert_eq!(config.rules.len(), 2);
        config.validate().unwrap();
    }

    #[test]
    fn parse_unknown_policy_fails() {
        let toml_str = r#"
[[rules]]
actuator_id = "led"
metric = "temperature"
threshold = 22.0
policy = "sideways"
command_topic = "actuators/zone/purple/led"
"#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    // -- Defaults -----------------------------------------------------------

    #[test]
    fn default_rules_match_command_topics() {
        let config = Config::default();
        let rules = config.to_rules();
        assert_eq!(rules[0].command_topic, "actuators/zone/purple/led");
        assert_eq!(rules[0].threshold, DEFAULT_TEMP_THRESHOLD);
        assert_eq!(rules[1].command_topic, "actuators/zone/purple/led_humidity");
        assert_eq!(rules[1].threshold, DEFAULT_HUMIDITY_THRESHOLD);
    }

    // -- Overrides ----------------------------------------------------------

    #[test]
    fn overrides_apply_by_metric() {
        let mut config = Config::default();
        config.apply(Overrides {
            temp_threshold: Some(18.0),
            humidity_threshold: Some(70.0),
            temp_policy: Some(Policy::Below),
        });
        assert_eq!(config.rules[0].threshold, 18.0);
        assert_eq!(config.rules[0].policy, Policy::Below);
        assert_eq!(config.rules[1].threshold, 70.0);
        assert_eq!(config.rules[1].policy, Policy::Above);
    }

    #[test]
    fn no_overrides_leaves_config_alone() {
        let mut config = Config::default();
        config.apply(Overrides::default());
        assert_eq!(config.rules[0].threshold, DEFAULT_TEMP_THRESHOLD);
    }

    // -- Validation ---------------------------------------------------------

    #[test]
    fn empty_zone_list_rejected() {
        let config = Config {
            monitored_zones: vec![],
            ..Config::default()
        };
        assert_validation_err(&config, "monitored_zones is empty");
    }

    #[test]
    fn duplicate_zone_rejected() {
        let config = Config {
            monitored_zones: vec!["red".into(), "red".into()],
            ..Config::default()
        };
        assert_validation_err(&config, "listed twice");
    }

    #[test]
    fn wildcard_zone_rejected() {
        let config = Config {
            monitored_zones: vec!["+".into()],
            ..Config::default()
        };
        assert_validation_err(&config, "must not contain");
    }

    #[test]
    fn duplicate_actuator_rejected() {
        let mut config = Config::default();
        config.rules[1].actuator_id = "led".into();
        assert_validation_err(&config, "duplicate actuator_id");
    }

    #[test]
    fn nan_threshold_rejected() {
        let mut config = Config::default();
        config.apply(Overrides {
            temp_threshold: Some(f64::NAN),
            ..Overrides::default()
        });
        assert_validation_err(&config, "not finite");
    }

    #[test]
    fn wildcard_command_topic_rejected() {
        let mut config = Config::default();
        config.rules[0].command_topic = "actuators/zone/+/led".into();
        assert_validation_err(&config, "must not contain wildcards");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut config = Config::default();
        config.monitored_zones = vec![];
        config.rules[0].command_topic = String::new();
        let err = format!("{:#}", config.validate().unwrap_err());
        assert!(err.contains("2 errors"), "got: {err}");
    }

    // -- load ---------------------------------------------------------------

    #[test]
    fn load_without_file_uses_defaults_and_overrides() {
        let config = load(
            None,
            Overrides {
                temp_threshold: Some(25.0),
                ..Overrides::default()
            },
        )
        .unwrap();
        assert_eq!(config.rules[0].threshold, 25.0);
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"monitored_zones = ["attic"]"#).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = load(Some(&path), Overrides::default()).unwrap();
        assert_eq!(config.monitored_zones, vec!["attic"]);
        assert_eq!(config.rules.len(), 2);
    }

    #[test]
    fn load_missing_file_fails() {
        assert!(load(Some("/nonexistent/climate.toml"), Overrides::default()).is_err());
    }
}

mod config;
mod control;
mod db;
mod ingest;
mod mqtt;

use anyhow::{Context, Result};
use clap::Parser;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Overrides;
use control::{Command, ControlEvaluator, Policy};
use db::Ledger;
use ingest::Aggregator;
use mqtt::{IngestError, SENSOR_TOPICS};

const CLIENT_ID: &str = "climate-hub";
const KEEP_ALIVE_SECS: u64 = 60;

#[derive(Parser)]
#[command(name = "climate-hub", about = "Aggregates zone readings and drives actuators")]
struct Cli {
    /// MQTT broker host
    #[arg(long, env = "MQTT_HOST", default_value = "localhost")]
    broker: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Temperature threshold (C) for every temperature rule
    #[arg(long, env = "TEMP_THRESHOLD")]
    threshold: Option<f64>,

    /// Humidity threshold (%) for every humidity rule
    #[arg(long, env = "HUMIDITY_THRESHOLD")]
    humidity_threshold: Option<f64>,

    /// Which side of the temperature threshold turns the actuator ON
    #[arg(long, env = "TEMP_POLICY", value_enum)]
    temp_policy: Option<Policy>,

    /// SQLite connection string for the readings ledger
    #[arg(long, env = "DB_URL", default_value = "sqlite:temperatures.db?mode=rwc")]
    db: String,

    /// Optional TOML file with monitored zones and rules
    #[arg(long, env = "CONFIG_PATH")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // ── Config ──────────────────────────────────────────────────────
    let cfg = config::load(
        cli.config.as_deref(),
        Overrides {
            temp_threshold: cli.threshold,
            humidity_threshold: cli.humidity_threshold,
            temp_policy: cli.temp_policy,
        },
    )?;

    // ── Ledger ──────────────────────────────────────────────────────
    let ledger = Ledger::connect(&cli.db).await?;
    ledger.migrate().await?;
    info!(rows = ledger.count().await?, db = %cli.db, "ledger ready");

    let evaluator = ControlEvaluator::new(cfg.monitored_zones.clone(), cfg.to_rules());
    info!(zones = ?evaluator.zones(), "control rules armed");
    let mut aggregator = Aggregator::new(ledger, evaluator);

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(CLIENT_ID, cli.broker.clone(), cli.port);
    mqttoptions.set_keep_alive(Duration::from_secs(KEEP_ALIVE_SECS));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    await_connack(&mut eventloop)
        .await
        .with_context(|| format!("could not reach broker {}:{}", cli.broker, cli.port))?;
    on_connected(&client, &mut aggregator).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("stopping hub");
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    match aggregator.ingest(&p.topic, &p.payload).await {
                        Ok(cmds) => publish_commands(&client, &mut aggregator, &cmds).await,
                        Err(IngestError::Malformed(msg)) => {
                            warn!(topic = %p.topic, "dropping message: {msg}");
                        }
                        Err(e @ IngestError::Storage(_)) => {
                            error!(topic = %p.topic, "{e}");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt reconnected");
                    on_connected(&client, &mut aggregator).await?;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt disconnected");
                }
                Ok(_) => {}
                Err(e) => {
                    error!("mqtt error: {e}. reconnecting...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    client.disconnect().await.ok();
    Ok(())
}

/// Poll until the broker acknowledges the connection. The first poll error
/// is fatal: there is no startup retry.
async fn await_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Packet::ConnAck(_)) => {
                info!("mqtt connected");
                return Ok(());
            }
            _ => continue,
        }
    }
}

async fn on_connected(client: &AsyncClient, aggregator: &mut Aggregator) -> Result<()> {
    for topic in SENSOR_TOPICS {
        client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .with_context(|| format!("subscribe {topic} failed"))?;
    }
    info!(topics = ?SENSOR_TOPICS, "hub subscribed");

    match aggregator.initial_commands().await {
        Ok(cmds) => publish_commands(client, aggregator, &cmds).await,
        Err(e) => error!("initial evaluation failed: {e}"),
    }
    Ok(())
}

/// Publish each command; only the ones the client accepted are recorded as
/// the actuator's state, so a failed one is sent again on the next reading.
async fn publish_commands(client: &AsyncClient, aggregator: &mut Aggregator, cmds: &[Command]) {
    for cmd in cmds {
        match client
            .publish(cmd.topic.as_str(), QoS::AtMostOnce, false, cmd.payload())
            .await
        {
            Ok(()) => {
                aggregator.mark_published(cmd);
                info!(
                    actuator = %cmd.actuator_id,
                    topic = %cmd.topic,
                    state = if cmd.on { "ON" } else { "OFF" },
                    "command published"
                );
            }
            Err(e) => error!(actuator = %cmd.actuator_id, "failed to publish command: {e}"),
        }
    }
}

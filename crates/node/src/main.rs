use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use climate_node::actuator::{Actuator, LedActuator};
use climate_node::gateway::{HardwareGateway, MockPins};
use climate_node::grovepi::DhtType;
use climate_node::mqtt::{command_topic, SensorTopics};
use climate_node::poller::SensorPoller;
use climate_node::sensor::SampleSource;
use climate_node::sim::ClimateSim;

const KEEP_ALIVE_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Sensor only
    Red,
    /// Sensor plus temperature and humidity LEDs
    Purple,
}

impl Role {
    fn zone(self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Purple => "purple",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SensorKind {
    /// DHT on a GrovePi digital port
    Dht,
    /// Sensirion SHT35 on I2C bus 1
    Sht35,
}

#[derive(Parser)]
#[command(name = "climate-node", about = "Publishes zone climate readings and drives zone LEDs")]
struct Cli {
    /// MQTT broker host
    #[arg(long, env = "MQTT_HOST", default_value = "172.16.32.182")]
    broker: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Which zone this node serves
    #[arg(long, env = "NODE_ROLE", value_enum)]
    role: Role,

    /// Use the climate simulator and mock pins instead of hardware
    #[arg(long, env = "SIMULATE")]
    simulate: bool,

    /// GrovePi port of the temperature LED
    #[arg(long, env = "LED_PIN", default_value_t = 4)]
    led_pin: u8,

    /// GrovePi port of the humidity LED
    #[arg(long, env = "HUMIDITY_LED_PIN", default_value_t = 6)]
    humidity_led_pin: u8,

    /// Seconds between samples
    #[arg(long, env = "POLL_INTERVAL", default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

    /// Sensor hardware
    #[arg(long, env = "SENSOR", value_enum, default_value_t = SensorKind::Dht)]
    sensor: SensorKind,

    /// GrovePi port of the DHT sensor
    #[arg(long, env = "DHT_PORT", default_value_t = 3)]
    dht_port: u8,

    /// DHT module variant
    #[arg(long, env = "DHT_TYPE", value_enum, default_value_t = DhtType::White)]
    dht_type: DhtType,
}

/// Pin backend plus sample source for this run.
struct Hardware {
    gateway: HardwareGateway,
    source: Box<dyn SampleSource>,
    /// Fall back to simulated samples when a read fails.
    fallback: bool,
}

fn simulated() -> Result<Hardware> {
    Ok(Hardware {
        gateway: HardwareGateway::start(MockPins::new()).context("failed to start hardware gateway")?,
        source: Box::new(ClimateSim::new()),
        fallback: false,
    })
}

#[cfg(feature = "hardware")]
fn open_hardware(cli: &Cli) -> Result<Hardware> {
    use climate_node::grovepi::{GroveDht, GrovePi, SharedGrovePi};
    use climate_node::sht35::{self, Sht35};

    const SHT35_BUS: u8 = 1;

    let board = SharedGrovePi::new(GrovePi::open().context("GrovePi not reachable on I2C")?);
    let gateway = HardwareGateway::start(board.clone()).context("failed to start hardware gateway")?;

    let (source, fallback): (Box<dyn SampleSource>, bool) = match cli.sensor {
        SensorKind::Dht => (Box::new(GroveDht::new(board, cli.dht_port, cli.dht_type)), false),
        SensorKind::Sht35 => match Sht35::new(SHT35_BUS, sht35::DEFAULT_ADDR) {
            Ok(sensor) => (Box::new(sensor), true),
            Err(e) => {
                warn!("sht35 unavailable, simulating readings: {e}");
                (Box::new(ClimateSim::new()), false)
            }
        },
    };
    Ok(Hardware {
        gateway,
        source,
        fallback,
    })
}

#[cfg(not(feature = "hardware"))]
fn open_hardware(cli: &Cli) -> Result<Hardware> {
    warn!(sensor = ?cli.sensor, "built without the `hardware` feature; using simulated sensor and mock pins");
    simulated()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let zone = cli.role.zone();

    // ── Hardware ────────────────────────────────────────────────────
    let hw = if cli.simulate {
        info!("simulation mode");
        simulated()?
    } else {
        open_hardware(&cli)?
    };
    let gateway = Arc::new(hw.gateway);

    let mut actuators: Vec<Box<dyn Actuator>> = Vec::new();
    if cli.role == Role::Purple {
        actuators.push(Box::new(LedActuator::new(
            Arc::clone(&gateway),
            cli.led_pin,
            command_topic(zone, "led"),
        )));
        actuators.push(Box::new(LedActuator::new(
            Arc::clone(&gateway),
            cli.humidity_led_pin,
            command_topic(zone, "led_humidity"),
        )));
    }

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(format!("climate-node-{zone}"), cli.broker.clone(), cli.port);
    mqttoptions.set_keep_alive(Duration::from_secs(KEEP_ALIVE_SECS));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    await_connack(&mut eventloop)
        .await
        .with_context(|| format!("could not reach broker {}:{}", cli.broker, cli.port))?;
    subscribe_actuators(&client, &actuators).await?;

    // ── Poller ──────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let mut poller = SensorPoller::new(hw.source, Arc::new(client.clone()), SensorTopics::for_zone(zone));
    if hw.fallback {
        poller = poller.with_fallback(ClimateSim::new());
    }
    let poller_task = tokio::spawn(poller.run(cancel.clone(), Duration::from_secs(cli.interval)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("stopping node");
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    for actuator in actuators.iter_mut().filter(|a| a.topic() == p.topic) {
                        actuator.on_message(&p.payload);
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt reconnected");
                    subscribe_actuators(&client, &actuators).await?;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("mqtt error: {e}. reconnecting...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────
    cancel.cancel();
    if let Err(e) = poller_task.await {
        error!("sensor poller task failed: {e}");
    }
    for actuator in actuators.iter_mut() {
        actuator.tear_down();
    }
    gateway.stop();
    gateway.join();
    client.disconnect().await.ok();
    Ok(())
}

/// Poll until the broker acknowledges the connection. The first poll error
/// is fatal.
async fn await_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            info!("mqtt connected");
            return Ok(());
        }
    }
}

async fn subscribe_actuators(client: &AsyncClient, actuators: &[Box<dyn Actuator>]) -> Result<()> {
    for actuator in actuators {
        client
            .subscribe(actuator.topic(), QoS::AtMostOnce)
            .await
            .with_context(|| format!("subscribe {} failed", actuator.topic()))?;
        info!(topic = actuator.topic(), "subscribed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["climate-node", "--role", "red"]).unwrap();
        assert_eq!(cli.broker, "172.16.32.182");
        assert_eq!(cli.port, 1883);
        assert_eq!(cli.role, Role::Red);
        assert!(!cli.simulate);
        assert_eq!(cli.led_pin, 4);
        assert_eq!(cli.humidity_led_pin, 6);
        assert_eq!(cli.interval, 10);
        assert_eq!(cli.sensor, SensorKind::Dht);
        assert_eq!(cli.dht_port, 3);
        assert_eq!(cli.dht_type, DhtType::White);
    }

    #[test]
    fn role_is_required() {
        assert!(Cli::try_parse_from(["climate-node"]).is_err());
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(Cli::try_parse_from(["climate-node", "--role", "red", "--interval", "0"]).is_err());
    }

    #[test]
    fn role_maps_to_zone() {
        assert_eq!(Role::Red.zone(), "red");
        assert_eq!(Role::Purple.zone(), "purple");
    }

    #[test]
    fn simulated_hardware_never_falls_back() {
        let hw = simulated().unwrap();
        assert!(!hw.fallback);
        assert_eq!(hw.source.name(), "simulated");
        hw.gateway.stop();
    }
}

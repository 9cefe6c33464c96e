//! Climate sensor/actuator node: samples temperature and humidity, publishes
//! changes over MQTT and drives LEDs from hub commands.

pub mod actuator;
pub mod error;
pub mod gateway;
pub mod grovepi;
pub mod mqtt;
pub mod poller;
pub mod sensor;
pub mod sht35;
pub mod sim;

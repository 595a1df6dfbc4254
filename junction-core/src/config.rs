//! Relay configuration: sources, devices, brokers and junctions.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use junction_common::{Format, LoggingConfig, TOPIC_PREFIX};

use crate::collector::{SourceDescriptor, SourceType};
use crate::error::{CoreError, Result};
use crate::transport::websocket::BackendConfig;

/// Complete relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Collector sources
    #[serde(default)]
    pub collectors: Vec<CollectorConfig>,

    /// Devices (sources of their own sensors and/or stream targets)
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// MQTT brokers
    #[serde(default)]
    pub mqtt_brokers: Vec<MqttBrokerConfig>,

    /// WebSocket device endpoint (disabled when absent)
    #[serde(default)]
    pub websocket: Option<WebSocketConfig>,

    /// MQTT publishing of sampled values
    #[serde(default)]
    pub publish: Option<PublishConfig>,

    /// Junctions wiring sources to targets
    #[serde(default)]
    pub junctions: Vec<JunctionConfig>,
}

/// A collector polling an external system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub id: i64,
    pub name: String,

    /// Collector type; unknown names fail to parse
    #[serde(rename = "type")]
    pub source_type: SourceType,

    /// Endpoint of the external system
    #[serde(default)]
    pub url: Option<String>,

    /// Access token for the external system
    #[serde(default)]
    pub access_token: Option<String>,

    /// Source-level default poll rate in milliseconds
    #[serde(default)]
    pub poll_rate_ms: Option<i64>,

    /// Broker to read from (mqtt collectors)
    #[serde(default)]
    pub broker_id: Option<i64>,
}

impl CollectorConfig {
    /// Scheduler descriptor for this collector.
    pub fn descriptor(&self) -> SourceDescriptor {
        let mut descriptor = SourceDescriptor::collector(self.id, &self.name, self.source_type);
        descriptor.endpoint = self.url.clone();
        descriptor.access_token = self.access_token.clone();
        descriptor.broker_id = self.broker_id;
        descriptor
    }
}

/// A device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: i64,
    pub name: String,

    /// Device-level default poll rate in milliseconds
    #[serde(default)]
    pub poll_rate_ms: Option<i64>,

    /// Sensors the device itself reports
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,

    /// How the relay reaches the device
    #[serde(default)]
    pub transport: Option<TransportConfig>,
}

impl DeviceConfig {
    /// Scheduler descriptor for this device.
    pub fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor::device(self.id, &self.name)
    }
}

/// A sensor definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Identifier in the external system
    pub external_id: String,

    /// Display name (defaults to the external id)
    #[serde(default)]
    pub name: Option<String>,

    /// Unit of measurement
    #[serde(default)]
    pub unit: Option<String>,
}

/// Transport configuration of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Serial-attached panel
    Serial {
        /// Serial port path (e.g., "/dev/ttyUSB0" or "COM3")
        port: String,
        /// Baud rate (default: 115200)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// Device subscribed to an MQTT topic
    Mqtt {
        broker_id: i64,
        /// Topic the device listens on
        topic: String,
    },
    /// Device connecting to the relay's WebSocket endpoint
    Websocket {
        /// Device identifier announced on connect (MAC address)
        mac: String,
    },
}

fn default_baud_rate() -> u32 {
    115_200
}

/// MQTT broker settings.
///
/// Host and port are optional here so that incomplete settings surface as a
/// connect-time error instead of a parse failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttBrokerConfig {
    pub id: i64,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Client id (default: "junction-relay-<id>")
    #[serde(default)]
    pub client_id: Option<String>,

    /// Keep-alive in seconds (default: 15)
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Time allowed for the broker to acknowledge a connect (default: 10)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_keep_alive() -> u64 {
    15
}

fn default_connect_timeout() -> u64 {
    10
}

/// WebSocket device endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Listen address (default: "0.0.0.0:7180")
    #[serde(default = "default_ws_listen")]
    pub listen: String,

    /// Settings sent to every device on connect
    #[serde(default)]
    pub backend: BackendConfig,
}

fn default_ws_listen() -> String {
    "0.0.0.0:7180".to_string()
}

/// MQTT publishing of every sampled value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    pub broker_id: i64,

    /// Topic prefix (default: "junctionrelay")
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Payload encoding (default: json)
    #[serde(default)]
    pub format: Format,

    /// QoS for published values (default: 0)
    #[serde(default)]
    pub qos: i32,
}

fn default_topic_prefix() -> String {
    TOPIC_PREFIX.to_string()
}

/// A junction: one consumer wiring sources to targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JunctionConfig {
    pub id: i64,
    pub name: String,

    /// Send cadence for stream targets (default: 1000)
    #[serde(default = "default_stream_cadence")]
    pub stream_cadence_ms: u64,

    #[serde(default)]
    pub device_links: Vec<DeviceLinkConfig>,

    #[serde(default)]
    pub collector_links: Vec<CollectorLinkConfig>,

    /// Devices receiving this junction's values
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

fn default_stream_cadence() -> u64 {
    1000
}

/// Link from a junction to a device source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceLinkConfig {
    pub device_id: i64,

    /// Poll rate override; zero or negative means none
    #[serde(default)]
    pub poll_rate_override_ms: Option<i64>,

    /// External ids of the device sensors to use (all when empty)
    #[serde(default)]
    pub sensors: Vec<String>,
}

/// Link from a junction to a collector source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorLinkConfig {
    pub collector_id: i64,

    /// Poll rate override; zero or negative means none
    #[serde(default)]
    pub poll_rate_override_ms: Option<i64>,

    /// Sensors selected from the collector
    pub sensors: Vec<SensorConfig>,
}

/// A device receiving a junction's values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub device_id: i64,

    /// Logical screen on the device (default: "onboard")
    #[serde(default = "default_screen_id")]
    pub screen_id: String,
}

fn default_screen_id() -> String {
    "onboard".to_string()
}

/// Read-only lookup of transport configuration by device or broker id.
pub trait ConfigRegistry: Send + Sync {
    /// Transport configuration of a device.
    fn device_transport(&self, device_id: i64) -> Option<TransportConfig>;

    /// Settings of an MQTT broker.
    fn mqtt_broker(&self, broker_id: i64) -> Option<MqttBrokerConfig>;
}

impl ConfigRegistry for RelayConfig {
    fn device_transport(&self, device_id: i64) -> Option<TransportConfig> {
        self.device(device_id).and_then(|d| d.transport.clone())
    }

    fn mqtt_broker(&self, broker_id: i64) -> Option<MqttBrokerConfig> {
        self.mqtt_brokers.iter().find(|b| b.id == broker_id).cloned()
    }
}

impl RelayConfig {
    /// Load configuration from a JSON5 file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(CoreError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string and validate it.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a collector by id.
    pub fn collector(&self, id: i64) -> Option<&CollectorConfig> {
        self.collectors.iter().find(|c| c.id == id)
    }

    /// Look up a device by id.
    pub fn device(&self, id: i64) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        ensure_unique("collector", self.collectors.iter().map(|c| c.id))?;
        ensure_unique("device", self.devices.iter().map(|d| d.id))?;
        ensure_unique("mqtt broker", self.mqtt_brokers.iter().map(|b| b.id))?;
        ensure_unique("junction", self.junctions.iter().map(|j| j.id))?;

        let broker_known = |id: i64| self.mqtt_brokers.iter().any(|b| b.id == id);

        for collector in &self.collectors {
            if collector.source_type == SourceType::Mqtt {
                match collector.broker_id {
                    Some(id) if broker_known(id) => {}
                    Some(id) => {
                        return Err(CoreError::validation(format!(
                            "Collector {}: unknown broker_id {}",
                            collector.id, id
                        )));
                    }
                    None => {
                        return Err(CoreError::validation(format!(
                            "Collector {}: mqtt collectors require broker_id",
                            collector.id
                        )));
                    }
                }
            }
        }

        for device in &self.devices {
            match &device.transport {
                Some(TransportConfig::Serial { port, .. }) if port.is_empty() => {
                    return Err(CoreError::validation(format!(
                        "Device {}: serial port cannot be empty",
                        device.id
                    )));
                }
                Some(TransportConfig::Mqtt { broker_id, .. }) if !broker_known(*broker_id) => {
                    return Err(CoreError::validation(format!(
                        "Device {}: unknown broker_id {}",
                        device.id, broker_id
                    )));
                }
                _ => {}
            }
        }

        if let Some(publish) = &self.publish {
            if !broker_known(publish.broker_id) {
                return Err(CoreError::validation(format!(
                    "publish: unknown broker_id {}",
                    publish.broker_id
                )));
            }
        }

        for junction in &self.junctions {
            for link in &junction.device_links {
                let device = self.device(link.device_id).ok_or_else(|| {
                    CoreError::validation(format!(
                        "Junction {}: unknown device {}",
                        junction.id, link.device_id
                    ))
                })?;
                for sensor in &link.sensors {
                    if !device.sensors.iter().any(|s| &s.external_id == sensor) {
                        return Err(CoreError::validation(format!(
                            "Junction {}: device {} has no sensor '{}'",
                            junction.id, device.id, sensor
                        )));
                    }
                }
            }

            for link in &junction.collector_links {
                if self.collector(link.collector_id).is_none() {
                    return Err(CoreError::validation(format!(
                        "Junction {}: unknown collector {}",
                        junction.id, link.collector_id
                    )));
                }
            }

            for target in &junction.targets {
                if self.device(target.device_id).is_none() {
                    return Err(CoreError::validation(format!(
                        "Junction {}: unknown target device {}",
                        junction.id, target.device_id
                    )));
                }
            }
        }

        Ok(())
    }
}

fn ensure_unique(what: &str, ids: impl Iterator<Item = i64>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(CoreError::validation(format!("Duplicate {} id {}", what, id)));
        }
    }
    Ok(())
}

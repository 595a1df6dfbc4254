//! Outbound transports for device streams.

pub mod frame;
pub mod mqtt;
pub mod payload;
pub mod serial;
pub mod websocket;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::{ConfigRegistry, TransportConfig};
use crate::error::{CoreError, Result};
use crate::stream::TransportResolver;

use mqtt::MqttClient;
use serial::SerialSender;
use websocket::{DeviceHub, WebSocketSender};

/// A destination a stream session sends payloads to.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Prepare the transport. Opening an open transport is a no-op.
    async fn open(&self) -> Result<()>;

    /// Send one payload.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Publishes payloads to the topic a device listens on.
pub struct MqttTopicSender {
    client: Arc<MqttClient>,
    topic: String,
}

impl MqttTopicSender {
    pub fn new(client: Arc<MqttClient>, topic: impl Into<String>) -> Self {
        Self {
            client,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl StreamTransport for MqttTopicSender {
    async fn open(&self) -> Result<()> {
        self.client.connect().await
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        self.client
            .publish(&self.topic, payload.to_vec(), 0, false)
            .await
            .map_err(|e| CoreError::send(&self.topic, e))
    }

    fn describe(&self) -> String {
        format!("mqtt:{}", self.topic)
    }
}

/// Resolves device transports from configuration.
///
/// Serial senders are shared per port, so two devices on one port write
/// through a single stream.
pub struct ConfigTransportResolver {
    registry: Arc<dyn ConfigRegistry>,
    mqtt_clients: HashMap<i64, Arc<MqttClient>>,
    hub: Option<Arc<DeviceHub>>,
    serial_ports: DashMap<String, Arc<SerialSender>>,
}

impl ConfigTransportResolver {
    pub fn new(registry: Arc<dyn ConfigRegistry>) -> Self {
        Self {
            registry,
            mqtt_clients: HashMap::new(),
            hub: None,
            serial_ports: DashMap::new(),
        }
    }

    pub fn with_mqtt_clients(mut self, clients: impl IntoIterator<Item = Arc<MqttClient>>) -> Self {
        self.mqtt_clients
            .extend(clients.into_iter().map(|c| (c.broker_id(), c)));
        self
    }

    pub fn with_hub(mut self, hub: Arc<DeviceHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    fn serial_sender(&self, port: &str, baud_rate: u32) -> Arc<SerialSender> {
        self.serial_ports
            .entry(port.to_string())
            .or_insert_with(|| Arc::new(SerialSender::new(port, baud_rate)))
            .clone()
    }
}

impl TransportResolver for ConfigTransportResolver {
    fn resolve(&self, device_id: i64) -> Result<Arc<dyn StreamTransport>> {
        let transport = self
            .registry
            .device_transport(device_id)
            .ok_or(CoreError::MissingTransport { device_id })?;

        match transport {
            TransportConfig::Serial { port, baud_rate } => {
                Ok(self.serial_sender(&port, baud_rate))
            }
            TransportConfig::Mqtt { broker_id, topic } => {
                let client = self.mqtt_clients.get(&broker_id).ok_or_else(|| {
                    CoreError::config(format!(
                        "device {}: no client for MQTT broker {}",
                        device_id, broker_id
                    ))
                })?;
                Ok(Arc::new(MqttTopicSender::new(client.clone(), topic)))
            }
            TransportConfig::Websocket { mac } => {
                let hub = self.hub.as_ref().ok_or_else(|| {
                    CoreError::config(format!(
                        "device {}: websocket transport requires the websocket endpoint",
                        device_id
                    ))
                })?;
                Ok(Arc::new(WebSocketSender::new(hub.clone(), mac)))
            }
        }
    }
}

//! Collector reading sensor values out of MQTT last-value caches.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use junction_common::{SensorReading, SensorValue};

use super::{SensorCollector, SourceDescriptor};
use crate::error::{CoreError, Result};
use crate::transport::mqtt::MqttClient;

/// QoS used when the collector subscribes to a sensor topic.
const SENSOR_TOPIC_QOS: i32 = 1;

/// Treats each external sensor id as an MQTT topic on the source's broker.
///
/// Topics are subscribed lazily on first fetch; values come from the last
/// payload received on each topic.
pub struct MqttCollector {
    clients: HashMap<i64, Arc<MqttClient>>,
}

impl MqttCollector {
    /// Create a collector over the given broker clients.
    pub fn new(clients: impl IntoIterator<Item = Arc<MqttClient>>) -> Self {
        Self {
            clients: clients
                .into_iter()
                .map(|client| (client.broker_id(), client))
                .collect(),
        }
    }
}

/// Interpret an MQTT payload as a sensor value.
///
/// JSON scalars are decoded as such; anything else is kept as UTF-8 text.
pub fn parse_payload(payload: &[u8]) -> SensorValue {
    match serde_json::from_slice::<SensorValue>(payload) {
        Ok(value) => value,
        Err(_) => SensorValue::Text(String::from_utf8_lossy(payload).trim().to_string()),
    }
}

#[async_trait]
impl SensorCollector for MqttCollector {
    async fn fetch_selected(
        &self,
        source: &SourceDescriptor,
        sensor_ids: &[String],
    ) -> Result<Vec<SensorReading>> {
        let broker_id = source.broker_id.ok_or_else(|| {
            CoreError::config(format!("source {} has no MQTT broker", source.key))
        })?;
        let client = self.clients.get(&broker_id).ok_or_else(|| {
            CoreError::config(format!("source {}: unknown MQTT broker {}", source.key, broker_id))
        })?;

        let mut readings = Vec::new();
        for topic in sensor_ids {
            client.subscribe(topic, SENSOR_TOPIC_QOS, false).await?;

            match client.latest_payload(topic) {
                Some(payload) => {
                    readings.push(SensorReading::new(topic.as_str(), parse_payload(&payload)))
                }
                None => debug!(source = %source.key, topic = %topic, "No payload cached yet"),
            }
        }

        Ok(readings)
    }
}

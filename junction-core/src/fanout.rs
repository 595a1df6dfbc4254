//! Destinations for sampled sensor sets.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use junction_common::{Format, Sensor, SourceKey, TopicBuilder, encode};

use crate::error::Result;
use crate::stream::PayloadSource;
use crate::transport::mqtt::MqttClient;
use crate::transport::payload::DevicePayload;

/// Receives the sensors of one source after every sample.
#[async_trait]
pub trait SensorSink: Send + Sync {
    async fn deliver(&self, source: SourceKey, sensors: &[Sensor]) -> Result<()>;
}

/// Delivers to several sinks in order.
///
/// Every sink is tried; the first failure is returned.
#[derive(Default, Clone)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn SensorSink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn SensorSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl SensorSink for SinkSet {
    async fn deliver(&self, source: SourceKey, sensors: &[Sensor]) -> Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.deliver(source, sensors).await {
                debug!(source = %source, error = %e, "Sink delivery failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

struct Route {
    screen_id: String,
    consumer_id: i64,
}

#[derive(Default)]
struct DeviceRoutes {
    routes: Vec<Route>,
    next: AtomicUsize,
}

/// Keeps the latest delivered sensors per source and renders them for
/// stream targets.
///
/// A device routed to several screens gets one screen per payload, in
/// rotation.
#[derive(Default)]
pub struct LatestSensorStore {
    latest: DashMap<SourceKey, Vec<Sensor>>,
    routes: DashMap<i64, DeviceRoutes>,
}

impl LatestSensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send the sensors of a consumer to a screen of a device.
    pub fn route(&self, device_id: i64, screen_id: impl Into<String>, consumer_id: i64) {
        let screen_id = screen_id.into();
        let mut entry = self.routes.entry(device_id).or_default();
        if !entry
            .routes
            .iter()
            .any(|r| r.consumer_id == consumer_id && r.screen_id == screen_id)
        {
            entry.routes.push(Route {
                screen_id,
                consumer_id,
            });
        }
    }

    /// Forget every route of a consumer.
    pub fn unroute_consumer(&self, consumer_id: i64) {
        for mut entry in self.routes.iter_mut() {
            entry.routes.retain(|r| r.consumer_id != consumer_id);
        }
        self.routes.retain(|_, device| !device.routes.is_empty());
    }

    /// Latest sensors delivered for a source.
    pub fn latest(&self, source: &SourceKey) -> Vec<Sensor> {
        self.latest
            .get(source)
            .map(|sensors| sensors.value().clone())
            .unwrap_or_default()
    }

    /// Sensors of one consumer across all sources, ordered by source.
    pub fn sensors_for_consumer(&self, consumer_id: i64) -> Vec<Sensor> {
        let sources: BTreeSet<SourceKey> = self.latest.iter().map(|e| *e.key()).collect();

        let mut sensors = Vec::new();
        for source in sources {
            if let Some(entry) = self.latest.get(&source) {
                sensors.extend(
                    entry
                        .iter()
                        .filter(|s| s.consumer_id == consumer_id)
                        .cloned(),
                );
            }
        }
        sensors
    }
}

#[async_trait]
impl SensorSink for LatestSensorStore {
    async fn deliver(&self, source: SourceKey, sensors: &[Sensor]) -> Result<()> {
        self.latest.insert(source, sensors.to_vec());
        Ok(())
    }
}

#[async_trait]
impl PayloadSource for LatestSensorStore {
    async fn next_payload(&self, device_id: i64) -> Option<Vec<u8>> {
        let (screen_id, consumer_id) = {
            let device = self.routes.get(&device_id)?;
            if device.routes.is_empty() {
                return None;
            }
            let index = device.next.fetch_add(1, Ordering::Relaxed) % device.routes.len();
            let route = &device.routes[index];
            (route.screen_id.clone(), route.consumer_id)
        };

        let sensors = self.sensors_for_consumer(consumer_id);
        if sensors.is_empty() {
            return None;
        }

        match DevicePayload::sensors(screen_id, &sensors).to_bytes() {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(device = device_id, error = %e, "Failed to render sensor payload");
                None
            }
        }
    }
}

/// Publishes every sampled sensor to `<prefix>/<source>/<external_id>`.
pub struct MqttFanout {
    client: Arc<MqttClient>,
    topics: TopicBuilder,
    format: Format,
    qos: i32,
}

impl MqttFanout {
    pub fn new(client: Arc<MqttClient>, topics: TopicBuilder, format: Format, qos: i32) -> Self {
        Self {
            client,
            topics,
            format,
            qos,
        }
    }
}

#[async_trait]
impl SensorSink for MqttFanout {
    async fn deliver(&self, source: SourceKey, sensors: &[Sensor]) -> Result<()> {
        // One publish per physical sensor, however many consumers share it.
        let mut published = HashSet::new();
        for sensor in sensors {
            if !published.insert(sensor.external_id.as_str()) {
                continue;
            }
            let topic = self.topics.sensor_topic(&source, &sensor.external_id);
            let payload = encode(sensor, self.format)?;
            self.client.publish(&topic, payload, self.qos, true).await?;
        }
        Ok(())
    }
}

//! Collector contract and concrete in-tree collectors.
//!
//! A collector answers one question: "give me the current values of these
//! sensor ids". It owns no scheduling logic; the [`PollingScheduler`] decides
//! when to ask.
//!
//! [`PollingScheduler`]: crate::scheduler::PollingScheduler

mod host;
mod mqtt;

pub use host::HostCollector;
pub use mqtt::MqttCollector;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use junction_common::{SensorReading, SourceKey};

use crate::error::{CoreError, Result};

/// The closed set of collector types a source may declare.
///
/// Unknown names are rejected when the configuration is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Home Assistant REST API.
    HomeAssistant,
    /// LibreHardwareMonitor `data.json` feed.
    LibreHardwareMonitor,
    /// Uptime Kuma metrics feed.
    UptimeKuma,
    /// Sensors of the host running the relay.
    Host,
    /// Retained values arriving on MQTT topics.
    Mqtt,
}

impl SourceType {
    /// Get the configuration name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::HomeAssistant => "home_assistant",
            SourceType::LibreHardwareMonitor => "libre_hardware_monitor",
            SourceType::UptimeKuma => "uptime_kuma",
            SourceType::Host => "host",
            SourceType::Mqtt => "mqtt",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the scheduler knows about a source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDescriptor {
    /// Key of the source.
    pub key: SourceKey,
    /// Display name.
    pub name: String,
    /// Collector type; `None` for device sources.
    pub source_type: Option<SourceType>,
    /// Endpoint of the external system, if it has one.
    pub endpoint: Option<String>,
    /// Access token for the external system.
    pub access_token: Option<String>,
    /// MQTT broker id for [`SourceType::Mqtt`] sources.
    pub broker_id: Option<i64>,
}

impl SourceDescriptor {
    /// Descriptor for a device source.
    pub fn device(id: i64, name: impl Into<String>) -> Self {
        Self {
            key: SourceKey::device(id),
            name: name.into(),
            source_type: None,
            endpoint: None,
            access_token: None,
            broker_id: None,
        }
    }

    /// Descriptor for a collector source.
    pub fn collector(id: i64, name: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            key: SourceKey::collector(id),
            name: name.into(),
            source_type: Some(source_type),
            endpoint: None,
            access_token: None,
            broker_id: None,
        }
    }

    /// Set the endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the access token.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Set the MQTT broker id.
    pub fn with_broker(mut self, broker_id: i64) -> Self {
        self.broker_id = Some(broker_id);
        self
    }
}

/// Fetches current values for a subset of a source's sensors.
#[async_trait]
pub trait SensorCollector: Send + Sync {
    /// Fetch values for exactly the given external sensor ids.
    ///
    /// Ids the collector does not know are left out of the result.
    async fn fetch_selected(
        &self,
        source: &SourceDescriptor,
        sensor_ids: &[String],
    ) -> Result<Vec<SensorReading>>;
}

/// Maps source types to collector implementations.
#[derive(Clone, Default)]
pub struct CollectorRegistry {
    collectors: HashMap<SourceType, Arc<dyn SensorCollector>>,
}

impl CollectorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collector for a source type, replacing any previous one.
    pub fn with(mut self, source_type: SourceType, collector: Arc<dyn SensorCollector>) -> Self {
        self.register(source_type, collector);
        self
    }

    /// Register a collector for a source type, replacing any previous one.
    pub fn register(&mut self, source_type: SourceType, collector: Arc<dyn SensorCollector>) {
        self.collectors.insert(source_type, collector);
    }

    /// Resolve the collector for a source type.
    pub fn resolve(&self, source_type: SourceType) -> Result<Arc<dyn SensorCollector>> {
        self.collectors
            .get(&source_type)
            .cloned()
            .ok_or_else(|| CoreError::UnknownSourceType(source_type.to_string()))
    }

    /// Whether a collector is registered for the type.
    pub fn contains(&self, source_type: SourceType) -> bool {
        self.collectors.contains_key(&source_type)
    }
}

impl fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field("types", &self.collectors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl SensorCollector for Fixed {
        async fn fetch_selected(
            &self,
            _source: &SourceDescriptor,
            sensor_ids: &[String],
        ) -> Result<Vec<SensorReading>> {
            Ok(sensor_ids
                .iter()
                .map(|id| SensorReading::new(id.clone(), 1.0))
                .collect())
        }
    }

    #[test]
    fn test_source_type_names() {
        let parsed: SourceType = serde_json::from_str("\"libre_hardware_monitor\"").unwrap();
        assert_eq!(parsed, SourceType::LibreHardwareMonitor);
        assert!(serde_json::from_str::<SourceType>("\"grafana\"").is_err());
    }

    #[test]
    fn test_registry_resolve() {
        let registry = CollectorRegistry::new().with(SourceType::Host, Arc::new(Fixed));
        assert!(registry.resolve(SourceType::Host).is_ok());
        assert!(matches!(
            registry.resolve(SourceType::HomeAssistant),
            Err(CoreError::UnknownSourceType(name)) if name == "home_assistant"
        ));
    }

    #[tokio::test]
    async fn test_partial_fetch_contract() {
        let registry = CollectorRegistry::new().with(SourceType::Host, Arc::new(Fixed));
        let collector = registry.resolve(SourceType::Host).unwrap();
        let source = SourceDescriptor::collector(1, "host", SourceType::Host);

        let readings = collector
            .fetch_selected(&source, &["a".to_string()])
            .await
            .unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].external_id, "a");
    }
}

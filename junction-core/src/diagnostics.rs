//! Per-source snapshots of the most recent successful sample.

use dashmap::DashMap;
use serde::Serialize;

use junction_common::{Sensor, SensorValue, SourceKey};

/// One sensor as shown in diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSummary {
    pub id: i64,
    pub external_id: String,
    pub consumer_id: i64,
    pub name: String,
    pub value: SensorValue,
    pub unit: String,
}

impl From<&Sensor> for SensorSummary {
    fn from(sensor: &Sensor) -> Self {
        Self {
            id: sensor.id,
            external_id: sensor.external_id.clone(),
            consumer_id: sensor.consumer_id,
            name: sensor.name.clone(),
            value: sensor.value.clone(),
            unit: sensor.unit.clone(),
        }
    }
}

/// State of one poller after its last successful tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollerSnapshot {
    pub source: SourceKey,
    pub rate_ms: u64,
    pub sensor_count: usize,
    pub consumer_count: usize,
    /// Milliseconds since the Unix epoch
    pub last_sample_at: i64,
    pub sensors: Vec<SensorSummary>,
}

impl PollerSnapshot {
    pub fn new(
        source: SourceKey,
        rate_ms: u64,
        consumer_count: usize,
        last_sample_at: i64,
        sensors: &[Sensor],
    ) -> Self {
        Self {
            source,
            rate_ms,
            sensor_count: sensors.len(),
            consumer_count,
            last_sample_at,
            sensors: sensors.iter().map(SensorSummary::from).collect(),
        }
    }
}

/// Snapshots keyed by source.
#[derive(Debug, Default)]
pub struct DiagnosticsRegistry {
    snapshots: DashMap<SourceKey, PollerSnapshot>,
}

impl DiagnosticsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot for its source.
    pub fn update(&self, snapshot: PollerSnapshot) {
        self.snapshots.insert(snapshot.source, snapshot);
    }

    pub fn remove(&self, key: &SourceKey) -> Option<PollerSnapshot> {
        self.snapshots.remove(key).map(|(_, snapshot)| snapshot)
    }

    pub fn get(&self, key: &SourceKey) -> Option<PollerSnapshot> {
        self.snapshots.get(key).map(|s| s.value().clone())
    }

    /// All snapshots sorted by source key.
    pub fn list(&self) -> Vec<PollerSnapshot> {
        let mut snapshots: Vec<PollerSnapshot> =
            self.snapshots.iter().map(|s| s.value().clone()).collect();
        snapshots.sort_by_key(|s| s.source);
        snapshots
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(key: SourceKey, sensors: &[Sensor]) -> PollerSnapshot {
        PollerSnapshot::new(key, 1000, 1, 1_700_000_000_000, sensors)
    }

    #[test]
    fn test_update_replaces() {
        let registry = DiagnosticsRegistry::new();
        let key = SourceKey::collector(7);

        registry.update(snapshot(key, &[]));
        let sensors = vec![Sensor::new(key, 1, "cpu", "CPU")];
        registry.update(snapshot(key, &sensors));

        let current = registry.get(&key).unwrap();
        assert_eq!(current.sensor_count, 1);
        assert_eq!(current.sensors[0].external_id, "cpu");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_sorted_and_remove() {
        let registry = DiagnosticsRegistry::new();
        registry.update(snapshot(SourceKey::collector(2), &[]));
        registry.update(snapshot(SourceKey::device(9), &[]));
        registry.update(snapshot(SourceKey::collector(1), &[]));

        let keys: Vec<SourceKey> = registry.list().into_iter().map(|s| s.source).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        assert!(registry.remove(&SourceKey::device(9)).is_some());
        assert!(registry.get(&SourceKey::device(9)).is_none());
        assert_eq!(registry.len(), 2);
    }
}

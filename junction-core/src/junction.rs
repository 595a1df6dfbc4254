//! Turning configured junctions into scheduler registrations.

use junction_common::{Sensor, SourceKey};

use crate::collector::SourceDescriptor;
use crate::config::{JunctionConfig, RelayConfig, SensorConfig};
use crate::rate::resolve_poll_rate;

/// One consumer registration for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub key: SourceKey,
    pub consumer_id: i64,
    pub interval_ms: u64,
    pub descriptor: SourceDescriptor,
    pub sensors: Vec<Sensor>,
}

/// Poll rate a junction requests from all of its sources.
///
/// Overrides come from every link of the junction. Without one, the first
/// linked device with a default wins, then the first linked collector with
/// one.
pub fn junction_poll_rate(config: &RelayConfig, junction: &JunctionConfig) -> u64 {
    let device_overrides: Vec<i64> = junction
        .device_links
        .iter()
        .filter_map(|link| link.poll_rate_override_ms)
        .collect();
    let collector_overrides: Vec<i64> = junction
        .collector_links
        .iter()
        .filter_map(|link| link.poll_rate_override_ms)
        .collect();

    let device_default = junction
        .device_links
        .iter()
        .filter_map(|link| config.device(link.device_id))
        .find_map(|device| device.poll_rate_ms.filter(|ms| *ms > 0));
    let collector_default = junction
        .collector_links
        .iter()
        .filter_map(|link| config.collector(link.collector_id))
        .find_map(|collector| collector.poll_rate_ms.filter(|ms| *ms > 0));

    resolve_poll_rate(
        &device_overrides,
        &collector_overrides,
        device_default,
        collector_default,
    )
}

fn to_sensor(source: SourceKey, consumer_id: i64, index: usize, config: &SensorConfig) -> Sensor {
    let name = config
        .name
        .clone()
        .unwrap_or_else(|| config.external_id.clone());
    let mut sensor =
        Sensor::new(source, consumer_id, config.external_id.as_str(), name).with_id(index as i64 + 1);
    if let Some(unit) = &config.unit {
        sensor.unit = unit.clone();
    }
    sensor
}

/// Registrations of a junction, one per linked source.
///
/// Links to sources missing from the configuration are skipped.
pub fn junction_registrations(config: &RelayConfig, junction: &JunctionConfig) -> Vec<Registration> {
    let interval_ms = junction_poll_rate(config, junction);
    let mut registrations = Vec::new();

    for link in &junction.device_links {
        let Some(device) = config.device(link.device_id) else {
            continue;
        };
        let key = SourceKey::device(device.id);
        let sensors = device
            .sensors
            .iter()
            .enumerate()
            .filter(|(_, s)| link.sensors.is_empty() || link.sensors.contains(&s.external_id))
            .map(|(index, s)| to_sensor(key, junction.id, index, s))
            .collect();

        registrations.push(Registration {
            key,
            consumer_id: junction.id,
            interval_ms,
            descriptor: device.descriptor(),
            sensors,
        });
    }

    for link in &junction.collector_links {
        let Some(collector) = config.collector(link.collector_id) else {
            continue;
        };
        let key = SourceKey::collector(collector.id);
        let sensors = link
            .sensors
            .iter()
            .enumerate()
            .map(|(index, s)| to_sensor(key, junction.id, index, s))
            .collect();

        registrations.push(Registration {
            key,
            consumer_id: junction.id,
            interval_ms,
            descriptor: collector.descriptor(),
            sensors,
        });
    }

    registrations
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        collectors: [
            { id: 7, name: "ha", type: "home_assistant", poll_rate_ms: 2000 },
            { id: 8, name: "host", type: "host" },
        ],
        devices: [
            { id: 1, name: "panel", poll_rate_ms: 750, sensors: [{ external_id: "temp" }, { external_id: "lux", unit: "lx" }] },
        ],
        junctions: [
            {
                id: 10,
                name: "fast",
                collector_links: [
                    { collector_id: 7, poll_rate_override_ms: 0, sensors: [{ external_id: "sensor.door" }] },
                    { collector_id: 8, poll_rate_override_ms: 300, sensors: [{ external_id: "cpu/usage", name: "CPU" }] },
                ],
            },
            {
                id: 11,
                name: "defaults",
                device_links: [{ device_id: 1, sensors: ["lux"] }],
                collector_links: [{ collector_id: 7, sensors: [] }],
            },
            {
                id: 12,
                name: "collector default",
                collector_links: [{ collector_id: 7, sensors: [] }],
            },
        ],
    }"#;

    #[test]
    fn test_poll_rate_per_junction() {
        let config = RelayConfig::parse(CONFIG).unwrap();

        assert_eq!(junction_poll_rate(&config, &config.junctions[0]), 300);
        assert_eq!(junction_poll_rate(&config, &config.junctions[1]), 750);
        assert_eq!(junction_poll_rate(&config, &config.junctions[2]), 2000);
    }

    #[test]
    fn test_registrations() {
        let config = RelayConfig::parse(CONFIG).unwrap();
        let registrations = junction_registrations(&config, &config.junctions[0]);

        assert_eq!(registrations.len(), 2);
        assert_eq!(registrations[0].key, SourceKey::collector(7));
        assert_eq!(registrations[0].interval_ms, 300);
        assert_eq!(registrations[1].sensors[0].name, "CPU");
        assert_eq!(registrations[1].sensors[0].consumer_id, 10);
    }

    #[test]
    fn test_device_link_selects_sensors() {
        let config = RelayConfig::parse(CONFIG).unwrap();
        let registrations = junction_registrations(&config, &config.junctions[1]);

        let device = &registrations[0];
        assert_eq!(device.key, SourceKey::device(1));
        assert_eq!(device.sensors.len(), 1);
        assert_eq!(device.sensors[0].external_id, "lux");
        assert_eq!(device.sensors[0].unit, "lx");
    }
}

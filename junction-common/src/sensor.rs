use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Error;

/// Kind of physical origin a source key names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    /// A device that reports its own sensors.
    Device,
    /// A collector polling an external system.
    Collector,
}

impl SourceKind {
    /// Get the string representation used in keys and topics.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Device => "Device",
            SourceKind::Collector => "Collector",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of one physical sampling origin.
///
/// Rendered as `<Kind>-<id>`, e.g. `Collector-7`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SourceKey {
    pub kind: SourceKind,
    pub id: i64,
}

impl SourceKey {
    /// Key for a device source.
    pub fn device(id: i64) -> Self {
        Self {
            kind: SourceKind::Device,
            id,
        }
    }

    /// Key for a collector source.
    pub fn collector(id: i64) -> Self {
        Self {
            kind: SourceKind::Collector,
            id,
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind.as_str(), self.id)
    }
}

impl FromStr for SourceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once('-')
            .ok_or_else(|| Error::SourceKey(format!("missing '-' in '{}'", s)))?;

        let kind = match kind {
            "Device" => SourceKind::Device,
            "Collector" => SourceKind::Collector,
            other => return Err(Error::SourceKey(format!("unknown kind '{}'", other))),
        };

        let id = id
            .parse::<i64>()
            .map_err(|e| Error::SourceKey(format!("invalid id in '{}': {}", s, e)))?;

        Ok(Self { kind, id })
    }
}

impl From<SourceKey> for String {
    fn from(key: SourceKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for SourceKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A sensor value as sampled from a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorValue {
    /// Numeric reading.
    Number(f64),
    /// Boolean reading.
    Boolean(bool),
    /// Text reading (states, labels).
    Text(String),
    /// No value sampled yet.
    #[default]
    Unavailable,
}

impl SensorValue {
    /// Whether a value has been sampled.
    pub fn is_available(&self) -> bool {
        !matches!(self, SensorValue::Unavailable)
    }
}

impl fmt::Display for SensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorValue::Number(v) => write!(f, "{}", v),
            SensorValue::Boolean(v) => write!(f, "{}", v),
            SensorValue::Text(v) => f.write_str(v),
            SensorValue::Unavailable => Ok(()),
        }
    }
}

impl From<f64> for SensorValue {
    fn from(v: f64) -> Self {
        SensorValue::Number(v)
    }
}

impl From<i64> for SensorValue {
    fn from(v: i64) -> Self {
        SensorValue::Number(v as f64)
    }
}

impl From<bool> for SensorValue {
    fn from(v: bool) -> Self {
        SensorValue::Boolean(v)
    }
}

impl From<String> for SensorValue {
    fn from(v: String) -> Self {
        SensorValue::Text(v)
    }
}

impl From<&str> for SensorValue {
    fn from(v: &str) -> Self {
        SensorValue::Text(v.to_string())
    }
}

/// One logical sensor entry tracked by the scheduler.
///
/// The same physical sensor requested by two consumers is two entries; the
/// logical identity is `(external_id, consumer_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sensor {
    /// Local identifier.
    pub id: i64,
    /// Identifier of the sensor in the external system (entity id, topic, path).
    pub external_id: String,
    /// Consumer (junction) this entry belongs to.
    pub consumer_id: i64,
    /// Source owning this sensor.
    pub source: SourceKey,
    /// Display name.
    pub name: String,
    /// Last sampled value.
    #[serde(default)]
    pub value: SensorValue,
    /// Unit of measurement.
    #[serde(default)]
    pub unit: String,
    /// Unix epoch milliseconds of the last sample.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<i64>,
}

impl Sensor {
    /// Create a sensor entry without a value.
    pub fn new(
        source: SourceKey,
        consumer_id: i64,
        external_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            external_id: external_id.into(),
            consumer_id,
            source,
            name: name.into(),
            value: SensorValue::Unavailable,
            unit: String::new(),
            last_updated: None,
        }
    }

    /// Set the local identifier.
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    /// Set the unit of measurement.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Whether two entries are the same logical sensor.
    pub fn same_entry(&self, other: &Sensor) -> bool {
        self.consumer_id == other.consumer_id && self.external_id == other.external_id
    }

    /// Copy a fresh reading into this entry.
    pub fn apply(&mut self, reading: &SensorReading, timestamp: i64) {
        self.value = reading.value.clone();
        if let Some(unit) = &reading.unit {
            self.unit = unit.clone();
        }
        self.last_updated = Some(timestamp);
    }
}

/// A value returned by a collector for one external sensor id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub external_id: String,
    pub value: SensorValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl SensorReading {
    /// Create a reading without unit information.
    pub fn new(external_id: impl Into<String>, value: impl Into<SensorValue>) -> Self {
        Self {
            external_id: external_id.into(),
            value: value.into(),
            unit: None,
        }
    }

    /// Attach a unit to the reading.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
///
/// Returns 0 if system time is before Unix epoch.
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_key_display_and_parse() {
        let key = SourceKey::collector(7);
        assert_eq!(key.to_string(), "Collector-7");
        assert_eq!("Collector-7".parse::<SourceKey>().unwrap(), key);
        assert_eq!("Device-12".parse::<SourceKey>().unwrap(), SourceKey::device(12));
    }

    #[test]
    fn test_source_key_parse_errors() {
        assert!("Collector7".parse::<SourceKey>().is_err());
        assert!("Gateway-1".parse::<SourceKey>().is_err());
        assert!("Device-x".parse::<SourceKey>().is_err());
    }

    #[test]
    fn test_source_key_serializes_as_string() {
        let json = serde_json::to_string(&SourceKey::device(3)).unwrap();
        assert_eq!(json, "\"Device-3\"");
    }

    #[test]
    fn test_sensor_entry_identity() {
        let source = SourceKey::collector(1);
        let a = Sensor::new(source, 10, "sensor.kitchen_temp", "Kitchen");
        let b = Sensor::new(source, 10, "sensor.kitchen_temp", "Kitchen (dup)");
        let c = Sensor::new(source, 11, "sensor.kitchen_temp", "Kitchen");

        assert!(a.same_entry(&b));
        assert!(!a.same_entry(&c));
    }

    #[test]
    fn test_apply_reading() {
        let mut sensor = Sensor::new(SourceKey::collector(1), 1, "cpu", "CPU").with_unit("%");
        sensor.apply(&SensorReading::new("cpu", 42.5), 1_000);
        assert_eq!(sensor.value, SensorValue::Number(42.5));
        assert_eq!(sensor.unit, "%");
        assert_eq!(sensor.last_updated, Some(1_000));

        sensor.apply(&SensorReading::new("cpu", 40.0).with_unit("percent"), 2_000);
        assert_eq!(sensor.unit, "percent");
    }

    #[test]
    fn test_value_display() {
        assert_eq!(SensorValue::Number(88.5).to_string(), "88.5");
        assert_eq!(SensorValue::from("on").to_string(), "on");
        assert_eq!(SensorValue::Unavailable.to_string(), "");
        assert!(!SensorValue::Unavailable.is_available());
    }
}

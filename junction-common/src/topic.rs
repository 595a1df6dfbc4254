use crate::error::{Error, Result};
use crate::sensor::SourceKey;

/// Default topic prefix for all JunctionRelay MQTT traffic.
pub const TOPIC_PREFIX: &str = "junctionrelay";

/// Builder for constructing JunctionRelay MQTT topics.
///
/// Sensor topics follow the pattern:
/// `junctionrelay/<source>/<external_id>`
#[derive(Debug, Clone)]
pub struct TopicBuilder {
    prefix: String,
}

impl Default for TopicBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicBuilder {
    /// Create a builder using the default prefix.
    pub fn new() -> Self {
        Self {
            prefix: TOPIC_PREFIX.to_string(),
        }
    }

    /// Create a builder with a custom prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Get the prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build the topic for one sensor of a source.
    ///
    /// MQTT wildcard characters in the external id are replaced by `_`.
    ///
    /// # Example
    /// ```
    /// use junction_common::{SourceKey, TopicBuilder};
    ///
    /// let topic = TopicBuilder::new().sensor_topic(&SourceKey::collector(7), "sensor.office_temp");
    /// assert_eq!(topic, "junctionrelay/Collector-7/sensor.office_temp");
    /// ```
    pub fn sensor_topic(&self, source: &SourceKey, external_id: &str) -> String {
        let sanitized: String = external_id
            .chars()
            .map(|c| if matches!(c, '+' | '#') { '_' } else { c })
            .collect();
        format!("{}/{}/{}", self.prefix, source, sanitized)
    }

    /// Build a wildcard topic for all sensors of a source.
    ///
    /// # Example
    /// ```
    /// use junction_common::{SourceKey, TopicBuilder};
    ///
    /// let topic = TopicBuilder::new().source_wildcard(&SourceKey::device(3));
    /// assert_eq!(topic, "junctionrelay/Device-3/#");
    /// ```
    pub fn source_wildcard(&self, source: &SourceKey) -> String {
        format!("{}/{}/#", self.prefix, source)
    }

    /// Build the topic the relay publishes its status on.
    pub fn status_topic(&self) -> String {
        format!("{}/@/status", self.prefix)
    }
}

/// Parse a sensor topic back into its source key and external id.
pub fn parse_sensor_topic(topic: &str) -> Result<(SourceKey, String)> {
    let mut parts = topic.splitn(3, '/');

    let prefix = parts
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::Topic(format!("empty topic '{}'", topic)))?;
    let source = parts
        .next()
        .ok_or_else(|| Error::Topic(format!("missing source in '{}'", topic)))?;
    let external_id = parts
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::Topic(format!("missing sensor in '{}'", topic)))?;

    if prefix.is_empty() || source == "@" {
        return Err(Error::Topic(format!("not a sensor topic: '{}'", topic)));
    }

    let source = source
        .parse::<SourceKey>()
        .map_err(|e| Error::Topic(format!("'{}': {}", topic, e)))?;

    Ok((source, external_id.to_string()))
}

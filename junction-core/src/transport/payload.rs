//! JSON payloads understood by display devices.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use junction_common::Sensor;

use crate::error::Result;

/// One value of a sensor as rendered by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorEntry {
    #[serde(rename = "Value")]
    pub value: String,
    #[serde(rename = "Unit")]
    pub unit: String,
}

/// Messages sent to a device, keyed by their `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DevicePayload {
    /// Layout configuration for one screen.
    #[serde(rename = "config")]
    Config {
        #[serde(rename = "screenId")]
        screen_id: String,
        #[serde(flatten)]
        body: Map<String, Value>,
    },

    /// Current sensor values for one screen, keyed by sensor tag.
    #[serde(rename = "sensor")]
    Sensor {
        #[serde(rename = "screenId")]
        screen_id: String,
        sensors: BTreeMap<String, Vec<SensorEntry>>,
    },

    /// Ask the device to subscribe to MQTT topics itself.
    #[serde(rename = "MQTT_Subscription_Request")]
    MqttSubscriptionRequest { subscriptions: Vec<String> },
}

impl DevicePayload {
    /// Build a configuration payload.
    pub fn config(screen_id: impl Into<String>, body: Map<String, Value>) -> Self {
        Self::Config {
            screen_id: screen_id.into(),
            body,
        }
    }

    /// Build a sensor payload, tagging each sensor by its external id.
    pub fn sensors(screen_id: impl Into<String>, sensors: &[Sensor]) -> Self {
        let mut tagged: BTreeMap<String, Vec<SensorEntry>> = BTreeMap::new();
        for sensor in sensors {
            tagged
                .entry(sensor.external_id.clone())
                .or_default()
                .push(SensorEntry {
                    value: sensor.value.to_string(),
                    unit: sensor.unit.clone(),
                });
        }

        Self::Sensor {
            screen_id: screen_id.into(),
            sensors: tagged,
        }
    }

    /// Build a subscription request.
    pub fn subscriptions(topics: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::MqttSubscriptionRequest {
            subscriptions: topics.into_iter().map(Into::into).collect(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use junction_common::{SensorValue, SourceKey};
    use serde_json::json;

    #[test]
    fn test_sensor_payload_shape() {
        let mut sensor = Sensor::new(SourceKey::collector(7), 1, "cpu_temp", "CPU").with_unit("°C");
        sensor.value = SensorValue::Number(54.5);

        let payload = DevicePayload::sensors("onboard", &[sensor]);
        let value: Value = serde_json::from_slice(&payload.to_bytes().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "sensor",
                "screenId": "onboard",
                "sensors": { "cpu_temp": [{ "Value": "54.5", "Unit": "°C" }] }
            })
        );
    }

    #[test]
    fn test_config_payload_flattens_body() {
        let body = json!({ "layout": [{ "id": "cpu_temp" }] });
        let Value::Object(body) = body else {
            panic!("object literal");
        };

        let payload = DevicePayload::config("quad", body);
        let value: Value = serde_json::from_slice(&payload.to_bytes().unwrap()).unwrap();

        assert_eq!(value["type"], "config");
        assert_eq!(value["screenId"], "quad");
        assert_eq!(value["layout"][0]["id"], "cpu_temp");
    }

    #[test]
    fn test_parse_subscription_request() {
        let raw = br#"{"type":"MQTT_Subscription_Request","subscriptions":["home/temp","home/door"]}"#;
        assert_eq!(
            DevicePayload::parse(raw).unwrap(),
            DevicePayload::subscriptions(["home/temp", "home/door"])
        );
    }
}

//! Error types for the relay core.

use thiserror::Error;

/// Result type alias using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur in the relay core.
///
/// Configuration variants are fatal at registration/start time. Collector and
/// send failures are transient and handled inside the loops. Cancellation is
/// never reported as an error.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration parse error.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration validation error.
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// No collector is registered for a source type.
    #[error("No collector registered for source type '{0}'")]
    UnknownSourceType(String),

    /// No transport configuration exists for a device.
    #[error("No transport configured for device {device_id}")]
    MissingTransport { device_id: i64 },

    /// A collector failed to fetch values.
    #[error("Collector fetch failed: {0}")]
    Collector(String),

    /// An outbound send failed.
    #[error("Failed to send to {target}: {message}")]
    Send { target: String, message: String },

    /// MQTT broker settings are incomplete.
    #[error("MQTT broker not configured: {0}")]
    MqttNotConfigured(String),

    /// MQTT client error.
    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Frame decoding error.
    #[error("Invalid frame: {0}")]
    Frame(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a configuration validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    /// Create a collector error.
    pub fn collector(msg: impl Into<String>) -> Self {
        Self::Collector(msg.into())
    }

    /// Create a send error.
    pub fn send(target: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Send {
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// Create an MQTT error.
    pub fn mqtt(msg: impl std::fmt::Display) -> Self {
        Self::Mqtt(msg.to_string())
    }

    /// Whether this error is a configuration problem rather than a runtime fault.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::ConfigNotFound { .. }
                | Self::ConfigParse(_)
                | Self::ConfigValidation(_)
                | Self::UnknownSourceType(_)
                | Self::MissingTransport { .. }
                | Self::MqttNotConfigured(_)
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<json5::Error> for CoreError {
    fn from(err: json5::Error) -> Self {
        Self::ConfigParse(err.to_string())
    }
}

impl From<junction_common::Error> for CoreError {
    fn from(err: junction_common::Error) -> Self {
        match err {
            junction_common::Error::Config(msg) => Self::Config(msg),
            junction_common::Error::Io(e) => Self::Io(e),
            other => Self::Serialization(other.to_string()),
        }
    }
}

impl From<rumqttc::ClientError> for CoreError {
    fn from(err: rumqttc::ClientError) -> Self {
        Self::Mqtt(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CoreError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

impl From<tokio_serial::Error> for CoreError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::Io(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_classification() {
        assert!(CoreError::UnknownSourceType("Host".into()).is_config());
        assert!(CoreError::MissingTransport { device_id: 4 }.is_config());
        assert!(!CoreError::collector("timeout").is_config());
        assert!(!CoreError::send("/dev/ttyUSB0", "broken pipe").is_config());
    }

    #[test]
    fn test_send_message() {
        let err = CoreError::send("/dev/ttyACM0", "device disconnected");
        assert_eq!(
            err.to_string(),
            "Failed to send to /dev/ttyACM0: device disconnected"
        );
    }
}

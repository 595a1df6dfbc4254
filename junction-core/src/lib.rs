//! JunctionRelay Core
//!
//! Samples sensor sources and streams their values to display devices.
//!
//! # Overview
//!
//! This crate provides:
//! - [`PollingScheduler`] running one sample loop per source at the smallest
//!   interval any consumer asks for
//! - [`StreamManager`] running one paced send loop per destination device
//! - [`transport`] senders: length-prefixed serial frames, MQTT and WebSocket
//! - [`DiagnosticsRegistry`] with the last successful sample of every source
//! - [`SensorCollector`] and [`SensorSink`], the seams to external systems
//! - [`RelayConfig`] for JSON5 configuration loading and validation
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use junction_core::{
//!     CollectorRegistry, DiagnosticsRegistry, HostCollector, LatestSensorStore,
//!     PollingScheduler, SourceType,
//! };
//!
//! let collectors = CollectorRegistry::new().with(SourceType::Host, Arc::new(HostCollector::new()));
//! let store = Arc::new(LatestSensorStore::new());
//! let scheduler = PollingScheduler::new(
//!     Arc::new(collectors),
//!     store.clone(),
//!     Arc::new(DiagnosticsRegistry::new()),
//! );
//!
//! for registration in junction_core::junction_registrations(&config, &config.junctions[0]) {
//!     scheduler
//!         .register_consumer(
//!             registration.key,
//!             registration.consumer_id,
//!             registration.interval_ms,
//!             registration.descriptor,
//!             registration.sensors,
//!         )
//!         .await?;
//! }
//! ```

pub mod collector;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fanout;
pub mod junction;
pub mod rate;
pub mod scheduler;
pub mod stream;
pub mod transport;

pub use collector::{
    CollectorRegistry, HostCollector, MqttCollector, SensorCollector, SourceDescriptor, SourceType,
};
pub use config::{ConfigRegistry, RelayConfig, TransportConfig};
pub use diagnostics::{DiagnosticsRegistry, PollerSnapshot, SensorSummary};
pub use error::{CoreError, Result};
pub use fanout::{LatestSensorStore, MqttFanout, SensorSink, SinkSet};
pub use junction::{Registration, junction_poll_rate, junction_registrations};
pub use rate::{DEFAULT_POLL_RATE_MS, resolve_poll_rate};
pub use scheduler::{
    LoopPhase, LoopStats, PollerInfo, PollingScheduler, RegistrationOutcome, UnregistrationOutcome,
};
pub use stream::{
    PayloadSource, SessionInfo, SessionStatus, StartOutcome, StreamManager, TransportResolver,
    compute_next_wait,
};
pub use transport::StreamTransport;

// Re-export commonly used types from junction-common
pub use junction_common::{Sensor, SensorReading, SensorValue, SourceKey, SourceKind};

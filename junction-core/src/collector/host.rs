//! Host sensor collection using sysinfo.

use async_trait::async_trait;
use sysinfo::System;
use tokio::sync::Mutex;
use tracing::debug;

use junction_common::SensorReading;

use super::{SensorCollector, SourceDescriptor};
use crate::error::Result;

/// Collector for sensors of the machine running the relay.
pub struct HostCollector {
    system: Mutex<System>,
}

impl Default for HostCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl HostCollector {
    /// Create a new host collector.
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

#[async_trait]
impl SensorCollector for HostCollector {
    async fn fetch_selected(
        &self,
        source: &SourceDescriptor,
        sensor_ids: &[String],
    ) -> Result<Vec<SensorReading>> {
        let wants = |prefix: &str| sensor_ids.iter().any(|id| id.starts_with(prefix));

        let mut system = self.system.lock().await;
        if wants("cpu/") {
            system.refresh_cpu_usage();
        }
        if wants("memory/") {
            system.refresh_memory();
        }

        let mut readings = Vec::with_capacity(sensor_ids.len());
        for id in sensor_ids {
            let reading = match id.as_str() {
                "cpu/usage" => {
                    SensorReading::new(id.as_str(), system.global_cpu_usage() as f64).with_unit("%")
                }
                "memory/used" => {
                    SensorReading::new(id.as_str(), system.used_memory() as f64).with_unit("B")
                }
                "memory/total" => {
                    SensorReading::new(id.as_str(), system.total_memory() as f64).with_unit("B")
                }
                "memory/used_percent" => {
                    let total = system.total_memory();
                    let percent = if total > 0 {
                        (system.used_memory() as f64 / total as f64) * 100.0
                    } else {
                        0.0
                    };
                    SensorReading::new(id.as_str(), percent).with_unit("%")
                }
                "system/load1" => SensorReading::new(id.as_str(), System::load_average().one),
                "system/load5" => SensorReading::new(id.as_str(), System::load_average().five),
                "system/load15" => {
                    SensorReading::new(id.as_str(), System::load_average().fifteen)
                }
                "system/uptime" => {
                    SensorReading::new(id.as_str(), System::uptime() as f64).with_unit("s")
                }
                other => {
                    debug!(source = %source.key, sensor = %other, "Unknown host sensor");
                    continue;
                }
            };
            readings.push(reading);
        }

        Ok(readings)
    }
}

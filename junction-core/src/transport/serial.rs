//! Framed sender for serial-attached panels.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tracing::{debug, info};

use junction_common::Sensor;

use super::StreamTransport;
use super::frame::write_frame;
use super::payload::DevicePayload;
use crate::error::{CoreError, Result};

type SerialWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One serial port, opened on demand.
///
/// A failed write closes the port; the next [`open`](StreamTransport::open)
/// reopens it.
pub struct SerialSender {
    port: String,
    baud_rate: u32,
    writer: Mutex<Option<SerialWriter>>,
}

impl SerialSender {
    /// Create a sender for a port. The port is not opened yet.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            writer: Mutex::new(None),
        }
    }

    /// Create a sender over an already open writer.
    pub fn from_writer<W>(port: impl Into<String>, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            port: port.into(),
            baud_rate: 0,
            writer: Mutex::new(Some(Box::new(writer))),
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub async fn is_open(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Send a layout configuration to one screen of the panel.
    pub async fn send_config(&self, screen_id: &str, config: Map<String, Value>) -> Result<()> {
        let payload = DevicePayload::config(screen_id, config).to_bytes()?;
        self.send(&payload).await
    }

    /// Send current sensor values to one screen of the panel.
    pub async fn send_sensors(&self, screen_id: &str, sensors: &[Sensor]) -> Result<()> {
        let payload = DevicePayload::sensors(screen_id, sensors).to_bytes()?;
        self.send(&payload).await
    }
}

#[async_trait]
impl StreamTransport for SerialSender {
    async fn open(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if writer.is_some() {
            return Ok(());
        }

        let builder = tokio_serial::new(&self.port, self.baud_rate);
        let stream = tokio_serial::SerialStream::open(&builder)
            .map_err(|e| CoreError::send(&self.port, format!("open failed: {}", e)))?;

        info!(port = %self.port, baud_rate = self.baud_rate, "Opened serial port");
        *writer = Some(Box::new(stream));
        Ok(())
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| CoreError::send(&self.port, "port not open"))?;

        if let Err(e) = write_frame(writer, payload).await {
            *guard = None;
            return Err(CoreError::send(&self.port, e));
        }

        debug!(port = %self.port, bytes = payload.len(), "Sent frame");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("serial:{}", self.port)
    }
}

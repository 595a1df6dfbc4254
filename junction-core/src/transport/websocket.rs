//! WebSocket endpoint for display devices.
//!
//! Devices connect to `/api/device-websocket/connect?mac=<mac>&name=<name>`.
//! Control messages travel as `{type, data}` envelopes; device payloads are
//! sent as plain JSON text.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::StreamTransport;
use crate::error::{CoreError, Result};

/// Settings pushed to a device right after it connects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    #[serde(default = "default_backend_version")]
    pub backend_version: String,
    #[serde(default = "default_health_report_interval")]
    pub health_report_interval: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    #[serde(default)]
    pub enable_payload_ack: bool,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
}

fn default_backend_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_health_report_interval() -> u64 {
    60_000
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_delay() -> u64 {
    5000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend_version: default_backend_version(),
            health_report_interval: default_health_report_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            enable_payload_ack: false,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay(),
        }
    }
}

/// A device's answer to a configuration payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigAck {
    pub config_id: String,
    pub screen_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub applied_at: DateTime<Utc>,
}

/// ESP-NOW mesh report of a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EspNowStatus {
    pub is_initialized: bool,
    pub peer_count: u32,
    /// MAC addresses per peer health.
    pub online_peers: Vec<String>,
    pub offline_peers: Vec<String>,
    pub degraded_peers: Vec<String>,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub send_errors: u64,
    pub receive_errors: u64,
    pub channel: u8,
    pub peer_details: Vec<PeerDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeerDetail {
    pub mac: String,
    pub name: String,
    pub is_active: bool,
    pub last_seen: u64,
    pub rssi: i32,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_successful_send: Option<u64>,
}

/// Control message exchanged with a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Envelope {
    #[serde(rename = "backend_config")]
    BackendConfig(BackendConfig),
    #[serde(rename = "config_ack")]
    ConfigAck(ConfigAck),
    #[serde(rename = "espnow_status")]
    EspNowStatus(EspNowStatus),
}

impl Envelope {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// One connected device.
pub struct DeviceSession<S> {
    mac: String,
    name: String,
    ws: WebSocketStream<S>,
}

impl<S> DeviceSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(mac: impl Into<String>, name: impl Into<String>, ws: WebSocketStream<S>) -> Self {
        Self {
            mac: mac.into(),
            name: name.into(),
            ws,
        }
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn send_envelope(&mut self, envelope: &Envelope) -> Result<()> {
        self.ws.send(Message::Text(envelope.to_json()?)).await?;
        Ok(())
    }

    /// Send a device payload as text, or binary if it is not UTF-8.
    pub async fn send_payload(&mut self, payload: &[u8]) -> Result<()> {
        let message = match std::str::from_utf8(payload) {
            Ok(text) => Message::Text(text.to_string()),
            Err(_) => Message::Binary(payload.to_vec()),
        };
        self.ws.send(message).await?;
        Ok(())
    }

    /// Next envelope from the device; `None` once the connection closes.
    ///
    /// Messages that are not envelopes are logged and skipped.
    pub async fn next_envelope(&mut self) -> Option<Result<Envelope>> {
        while let Some(message) = self.ws.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(data)) => String::from_utf8_lossy(&data).into_owned(),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            };

            match Envelope::parse(&text) {
                Ok(envelope) => return Some(Ok(envelope)),
                Err(e) => debug!(device = %self.mac, error = %e, "Ignoring non-envelope message"),
            }
        }
        None
    }

    pub async fn close(&mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}

struct ConnectedDevice {
    name: String,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// Accepts device connections and keeps their latest reports.
pub struct DeviceHub {
    backend: BackendConfig,
    devices: DashMap<String, ConnectedDevice>,
    statuses: DashMap<String, EspNowStatus>,
    acks: DashMap<String, ConfigAck>,
}

impl DeviceHub {
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            devices: DashMap::new(),
            statuses: DashMap::new(),
            acks: DashMap::new(),
        }
    }

    /// Accept connections until cancelled.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let hub = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = hub.handle_connection(stream).await {
                                warn!(peer = %peer, error = %e, "Device connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept device connection"),
                }
            }
        }
        info!("Device hub stopped");
    }

    /// Run one device connection to completion.
    pub async fn handle_connection<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut identity = None;
        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
                identity = parse_identity(request.uri().query().unwrap_or_default());
                Ok(response)
            },
        )
        .await?;

        let (mac, name) = identity
            .ok_or_else(|| CoreError::WebSocket("device connected without a mac".to_string()))?;
        let mut session = DeviceSession::new(mac.as_str(), name.as_str(), ws);

        session
            .send_envelope(&Envelope::BackendConfig(self.backend.clone()))
            .await?;

        let (outbound, mut queue) = mpsc::unbounded_channel();
        self.devices.insert(
            mac.clone(),
            ConnectedDevice {
                name: name.clone(),
                outbound: outbound.clone(),
            },
        );
        info!(device = %mac, name = %name, "Device connected");

        let result = self.run_session(&mut session, &mut queue).await;

        self.devices
            .remove_if(&mac, |_, device| device.outbound.same_channel(&outbound));
        info!(device = %mac, "Device disconnected");
        result
    }

    async fn run_session<S>(
        &self,
        session: &mut DeviceSession<S>,
        queue: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                outgoing = queue.recv() => match outgoing {
                    Some(payload) => session.send_payload(&payload).await?,
                    None => break,
                },
                incoming = session.next_envelope() => match incoming {
                    Some(Ok(envelope)) => self.record(session.mac(), envelope),
                    Some(Err(e)) => return Err(e),
                    None => break,
                },
            }
        }
        Ok(())
    }

    fn record(&self, mac: &str, envelope: Envelope) {
        match envelope {
            Envelope::EspNowStatus(status) => {
                debug!(device = %mac, peers = status.peer_count, "ESP-NOW status");
                self.statuses.insert(mac.to_string(), status);
            }
            Envelope::ConfigAck(ack) => {
                if ack.success {
                    debug!(device = %mac, screen = %ack.screen_id, "Config applied");
                } else {
                    warn!(
                        device = %mac,
                        screen = %ack.screen_id,
                        error = ack.error_message.as_deref().unwrap_or("unknown"),
                        "Device rejected config"
                    );
                }
                self.acks.insert(mac.to_string(), ack);
            }
            Envelope::BackendConfig(_) => {
                debug!(device = %mac, "Ignoring backend_config from device");
            }
        }
    }

    /// Queue a payload for a connected device.
    pub fn send_to(&self, mac: &str, payload: Vec<u8>) -> Result<()> {
        let device = self
            .devices
            .get(mac)
            .ok_or_else(|| CoreError::send(mac, "device not connected"))?;
        device
            .outbound
            .send(payload)
            .map_err(|_| CoreError::send(mac, "device connection closed"))
    }

    pub fn is_connected(&self, mac: &str) -> bool {
        self.devices.contains_key(mac)
    }

    /// Connected devices as `(mac, name)`, sorted by mac.
    pub fn connected_devices(&self) -> Vec<(String, String)> {
        let mut devices: Vec<(String, String)> = self
            .devices
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().name.clone()))
            .collect();
        devices.sort();
        devices
    }

    pub fn espnow_status(&self, mac: &str) -> Option<EspNowStatus> {
        self.statuses.get(mac).map(|s| s.value().clone())
    }

    pub fn last_config_ack(&self, mac: &str) -> Option<ConfigAck> {
        self.acks.get(mac).map(|a| a.value().clone())
    }
}

fn parse_identity(query: &str) -> Option<(String, String)> {
    let mut mac = None;
    let mut name = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("mac", value)) if !value.is_empty() => mac = Some(value.to_string()),
            Some(("name", value)) => name = Some(value.to_string()),
            _ => {}
        }
    }
    mac.map(|mac| {
        let name = name.unwrap_or_else(|| mac.clone());
        (mac, name)
    })
}

/// Stream transport delivering payloads to one device through the hub.
pub struct WebSocketSender {
    hub: Arc<DeviceHub>,
    mac: String,
}

impl WebSocketSender {
    pub fn new(hub: Arc<DeviceHub>, mac: impl Into<String>) -> Self {
        Self {
            hub,
            mac: mac.into(),
        }
    }
}

#[async_trait]
impl StreamTransport for WebSocketSender {
    async fn open(&self) -> Result<()> {
        if self.hub.is_connected(&self.mac) {
            Ok(())
        } else {
            Err(CoreError::send(&self.mac, "device not connected"))
        }
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        self.hub.send_to(&self.mac, payload.to_vec())
    }

    fn describe(&self) -> String {
        format!("websocket:{}", self.mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::time::Duration;

    #[test]
    fn test_backend_config_defaults() {
        let envelope = Envelope::BackendConfig(BackendConfig {
            backend_version: "1.2.0".to_string(),
            ..BackendConfig::default()
        });
        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "backend_config",
                "data": {
                    "backendVersion": "1.2.0",
                    "healthReportInterval": 60000,
                    "heartbeatInterval": 30000,
                    "enablePayloadAck": false,
                    "maxReconnectAttempts": 5,
                    "reconnectDelayMs": 5000
                }
            })
        );
    }

    #[test]
    fn test_parse_config_ack() {
        let text = r#"{"type":"config_ack","data":{"configId":"c-1","screenId":"onboard","success":false,"errorMessage":"bad layout","appliedAt":"2024-05-01T10:00:00Z"}}"#;
        match Envelope::parse(text).unwrap() {
            Envelope::ConfigAck(ack) => {
                assert_eq!(ack.config_id, "c-1");
                assert!(!ack.success);
                assert_eq!(ack.error_message.as_deref(), Some("bad layout"));
            }
            other => panic!("Expected config_ack, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_espnow_status() {
        let text = r#"{"type":"espnow_status","data":{"isInitialized":true,"peerCount":2,"onlinePeers":["AA:BB:CC:DD:EE:FF"],"offlinePeers":["11:22:33:44:55:66"],"degradedPeers":[],"messagesSent":10,"messagesReceived":8,"sendErrors":1,"receiveErrors":0,"channel":6,"peerDetails":[{"mac":"AA:BB:CC:DD:EE:FF","name":"node","isActive":true,"lastSeen":1200,"rssi":-61,"consecutiveFailures":0}]}}"#;
        match Envelope::parse(text).unwrap() {
            Envelope::EspNowStatus(status) => {
                assert_eq!(status.peer_count, 2);
                assert_eq!(status.online_peers, vec!["AA:BB:CC:DD:EE:FF".to_string()]);
                assert_eq!(status.offline_peers, vec!["11:22:33:44:55:66".to_string()]);
                assert!(status.degraded_peers.is_empty());
                assert_eq!(status.channel, 6);
                assert_eq!(status.peer_details[0].rssi, -61);
                assert_eq!(status.peer_details[0].last_successful_send, None);
            }
            other => panic!("Expected espnow_status, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_identity() {
        assert_eq!(
            parse_identity("mac=AA:BB&name=panel"),
            Some(("AA:BB".to_string(), "panel".to_string()))
        );
        assert_eq!(
            parse_identity("mac=AA:BB"),
            Some(("AA:BB".to_string(), "AA:BB".to_string()))
        );
        assert_eq!(parse_identity("name=panel"), None);
    }

    #[tokio::test]
    async fn test_hub_session() {
        let hub = Arc::new(DeviceHub::new(BackendConfig::default()));
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        let server = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.handle_connection(server_io).await })
        };

        let (mut client, _) = tokio_tungstenite::client_async(
            "ws://relay.local/api/device-websocket/connect?mac=AA:BB&name=panel",
            client_io,
        )
        .await
        .unwrap();

        let greeting = client.next().await.unwrap().unwrap();
        let Message::Text(text) = greeting else {
            panic!("Expected text greeting");
        };
        assert!(matches!(
            Envelope::parse(&text).unwrap(),
            Envelope::BackendConfig(_)
        ));

        let status = Envelope::EspNowStatus(EspNowStatus {
            is_initialized: true,
            peer_count: 3,
            online_peers: vec!["CC:DD".to_string()],
            ..EspNowStatus::default()
        });
        client
            .send(Message::Text(status.to_json().unwrap()))
            .await
            .unwrap();

        let mut reported = None;
        for _ in 0..100 {
            reported = hub.espnow_status("AA:BB");
            if reported.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let reported = reported.unwrap();
        assert_eq!(reported.peer_count, 3);
        assert_eq!(reported.online_peers, vec!["CC:DD".to_string()]);
        assert_eq!(
            hub.connected_devices(),
            vec![("AA:BB".to_string(), "panel".to_string())]
        );

        let sender = WebSocketSender::new(hub.clone(), "AA:BB");
        sender.open().await.unwrap();
        sender.send(br#"{"type":"sensor"}"#).await.unwrap();

        let delivered = client.next().await.unwrap().unwrap();
        assert_eq!(delivered, Message::Text(r#"{"type":"sensor"}"#.to_string()));

        client.close(None).await.unwrap();
        server.await.unwrap().unwrap();
        assert!(!hub.is_connected("AA:BB"));
    }
}

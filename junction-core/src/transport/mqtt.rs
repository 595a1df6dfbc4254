//! MQTT client with a subscription table and a last-value cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MqttBrokerConfig;
use crate::error::{CoreError, Result};

/// Callback invoked for every inbound message.
pub type MessageCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Capacity of the request channel between the client and its event loop.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Clamp a requested QoS level to `[0, 2]`.
pub fn clamp_qos(requested: i32) -> u8 {
    requested.clamp(0, 2) as u8
}

fn to_qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// State shared between the API and the inbound event loop.
struct MqttShared {
    broker: String,
    connected: AtomicBool,
    subscriptions: DashMap<String, u8>,
    payloads: DashMap<String, Vec<u8>>,
    callback: RwLock<Option<MessageCallback>>,
}

impl MqttShared {
    fn handle_incoming(&self, topic: &str, payload: &[u8]) {
        self.payloads.insert(topic.to_string(), payload.to_vec());

        let callback = match self.callback.read() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        if let Some(callback) = callback {
            callback(topic, payload);
        }
    }
}

struct Connection {
    client: AsyncClient,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// One client per configured broker.
pub struct MqttClient {
    config: MqttBrokerConfig,
    shared: Arc<MqttShared>,
    connection: Mutex<Option<Connection>>,
}

impl MqttClient {
    /// Create a client; no network activity happens until [`connect`](Self::connect).
    pub fn new(config: MqttBrokerConfig) -> Self {
        let broker = format!(
            "{}:{}",
            config.host.as_deref().unwrap_or("?"),
            config.port.unwrap_or(0)
        );

        Self {
            config,
            shared: Arc::new(MqttShared {
                broker,
                connected: AtomicBool::new(false),
                subscriptions: DashMap::new(),
                payloads: DashMap::new(),
                callback: RwLock::new(None),
            }),
            connection: Mutex::new(None),
        }
    }

    /// Broker id from the configuration.
    pub fn broker_id(&self) -> i64 {
        self.config.id
    }

    /// Whether the client currently holds a live broker connection.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Register the callback for inbound messages, replacing any previous one.
    pub fn set_callback(&self, callback: MessageCallback) {
        if let Ok(mut guard) = self.shared.callback.write() {
            *guard = Some(callback);
        }
    }

    fn options(&self) -> Result<MqttOptions> {
        let host = self
            .config
            .host
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                CoreError::MqttNotConfigured(format!("broker {}: missing host", self.config.id))
            })?;

        let port = self.config.port.filter(|p| *p > 0).ok_or_else(|| {
            CoreError::MqttNotConfigured(format!("broker {}: missing port", self.config.id))
        })?;

        let client_id = self
            .config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("junction-relay-{}", self.config.id));

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(5)));

        if let Some(username) = self.config.username.as_deref().filter(|u| !u.is_empty()) {
            let password = self.config.password.as_deref().ok_or_else(|| {
                CoreError::MqttNotConfigured(format!(
                    "broker {}: username set without password",
                    self.config.id
                ))
            })?;
            options.set_credentials(username, password);
        }

        Ok(options)
    }

    /// Connect to the broker.
    ///
    /// A no-op when already connected. Tracked topics are resubscribed after
    /// every successful connect; a topic that cannot be resubscribed is logged
    /// and the connection is kept.
    pub async fn connect(&self) -> Result<()> {
        let mut connection = self.connection.lock().await;
        if connection.is_some() && self.is_connected() {
            return Ok(());
        }

        let options = self.options()?;

        if let Some(stale) = connection.take() {
            stale.cancel.cancel();
            stale.task.abort();
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let timeout = Duration::from_secs(self.config.connect_timeout_secs.max(1));

        tokio::time::timeout(timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| {
                CoreError::Mqtt(format!("connect to {} timed out", self.shared.broker))
            })??;

        self.shared.connected.store(true, Ordering::SeqCst);
        info!(broker = %self.shared.broker, "Connected to MQTT broker");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(drive_event_loop(
            eventloop,
            self.shared.clone(),
            cancel.clone(),
        ));

        *connection = Some(Connection {
            client: client.clone(),
            cancel,
            task,
        });

        for (topic, qos) in self.subscriptions() {
            match client.subscribe(topic.as_str(), to_qos(qos)).await {
                Ok(()) => debug!(broker = %self.shared.broker, topic = %topic, qos, "Resubscribed"),
                Err(e) => warn!(
                    broker = %self.shared.broker,
                    topic = %topic,
                    error = %e,
                    "Failed to resubscribe"
                ),
            }
        }

        Ok(())
    }

    async fn client(&self) -> Result<AsyncClient> {
        if !self.is_connected() {
            info!(broker = %self.shared.broker, "MQTT client disconnected, reconnecting");
            self.connect().await?;
        }

        self.connection
            .lock()
            .await
            .as_ref()
            .map(|c| c.client.clone())
            .ok_or_else(|| CoreError::Mqtt(format!("no connection to {}", self.shared.broker)))
    }

    /// Subscribe to a topic and return the granted QoS.
    ///
    /// Idempotent for tracked topics unless `force` is set.
    pub async fn subscribe(&self, topic: &str, qos: i32, force: bool) -> Result<u8> {
        let granted = clamp_qos(qos);

        if !force {
            if let Some(existing) = self.shared.subscriptions.get(topic) {
                return Ok(*existing);
            }
        }

        let client = self.client().await?;
        client.subscribe(topic, to_qos(granted)).await?;
        self.shared.subscriptions.insert(topic.to_string(), granted);

        debug!(broker = %self.shared.broker, topic = %topic, qos = granted, "Subscribed");
        Ok(granted)
    }

    /// Unsubscribe from a topic.
    ///
    /// Returns `false` (and does nothing) if the topic was never tracked.
    pub async fn unsubscribe(&self, topic: &str) -> Result<bool> {
        if self.shared.subscriptions.remove(topic).is_none() {
            debug!(broker = %self.shared.broker, topic = %topic, "Unsubscribe for untracked topic ignored");
            return Ok(false);
        }
        self.shared.payloads.remove(topic);

        if self.is_connected() {
            let client = self.client().await?;
            client.unsubscribe(topic).await?;
        }

        Ok(true)
    }

    /// Publish a payload.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: i32,
        retain: bool,
    ) -> Result<()> {
        let client = self.client().await?;
        client
            .publish(topic, to_qos(clamp_qos(qos)), retain, payload.into())
            .await?;
        Ok(())
    }

    /// Disconnect and stop the event loop. Tracked topics are kept.
    pub async fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.cancel.cancel();
            if let Err(e) = connection.client.disconnect().await {
                debug!(broker = %self.shared.broker, error = %e, "Disconnect request failed");
            }
            connection.task.abort();
        }
        self.shared.connected.store(false, Ordering::SeqCst);
    }

    /// Granted QoS of a tracked topic.
    pub fn subscription(&self, topic: &str) -> Option<u8> {
        self.shared.subscriptions.get(topic).map(|q| *q)
    }

    /// All tracked topics with their granted QoS, sorted by topic.
    pub fn subscriptions(&self) -> Vec<(String, u8)> {
        let mut subs: Vec<(String, u8)> = self
            .shared
            .subscriptions
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        subs.sort();
        subs
    }

    /// Most recent payload received on a topic.
    pub fn latest_payload(&self, topic: &str) -> Option<Vec<u8>> {
        self.shared.payloads.get(topic).map(|p| p.value().clone())
    }

    /// Topics that have a cached payload.
    pub fn cached_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .shared
            .payloads
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        topics.sort();
        topics
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(CoreError::Mqtt(format!("broker refused connection: {:?}", ack.code)))
                };
            }
            Ok(_) => continue,
            Err(e) => return Err(CoreError::mqtt(e)),
        }
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    shared: Arc<MqttShared>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    shared.handle_incoming(&publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(broker = %shared.broker, error = %e, "MQTT connection lost");
                    break;
                }
            }
        }
    }
    shared.connected.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    type Seen = mpsc::UnboundedReceiver<(usize, String, u8)>;

    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    /// Minimal MQTT 3.1.1 broker reporting every SUBSCRIBE as
    /// `(connection, topic, qos)`.
    async fn fake_broker(listener: TcpListener, seen: mpsc::UnboundedSender<(usize, String, u8)>) {
        let mut connections = 0;
        while let Ok((mut stream, _)) = listener.accept().await {
            connections += 1;
            let connection = connections;
            let seen = seen.clone();
            tokio::spawn(async move {
                while let Ok((header, body)) = read_packet(&mut stream).await {
                    let reply = match header >> 4 {
                        1 => vec![0x20, 0x02, 0x00, 0x00],
                        8 => {
                            let len = u16::from_be_bytes([body[2], body[3]]) as usize;
                            let topic = String::from_utf8_lossy(&body[4..4 + len]).into_owned();
                            let qos = body[4 + len];
                            let _ = seen.send((connection, topic, qos));
                            vec![0x90, 0x03, body[0], body[1], qos]
                        }
                        12 => vec![0xD0, 0x00],
                        14 => break,
                        _ => continue,
                    };
                    if stream.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    }

    async fn start_broker() -> (u16, Seen) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(fake_broker(listener, tx));
        (port, rx)
    }

    async fn next_subscribe(seen: &mut Seen) -> (usize, String, u8) {
        tokio::time::timeout(Duration::from_secs(5), seen.recv())
            .await
            .expect("subscribe within timeout")
            .expect("broker running")
    }

    fn broker(host: Option<&str>, port: Option<u16>) -> MqttBrokerConfig {
        MqttBrokerConfig {
            id: 1,
            host: host.map(str::to_string),
            port,
            username: None,
            password: None,
            client_id: None,
            keep_alive_secs: 15,
            connect_timeout_secs: 1,
        }
    }

    #[test]
    fn test_qos_clamp() {
        assert_eq!(clamp_qos(5), 2);
        assert_eq!(clamp_qos(-1), 0);
        assert_eq!(clamp_qos(1), 1);
    }

    #[tokio::test]
    async fn test_connect_fails_fast_without_host() {
        let client = MqttClient::new(broker(None, Some(1883)));
        assert!(matches!(
            client.connect().await,
            Err(CoreError::MqttNotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_fails_fast_without_port() {
        let client = MqttClient::new(broker(Some("localhost"), None));
        assert!(matches!(
            client.connect().await,
            Err(CoreError::MqttNotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_requires_password_with_username() {
        let mut config = broker(Some("localhost"), Some(1883));
        config.username = Some("relay".to_string());
        let client = MqttClient::new(config);

        assert!(matches!(
            client.connect().await,
            Err(CoreError::MqttNotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_reconnect_failure_leaves_table_untouched() {
        let client = MqttClient::new(broker(None, None));
        assert!(client.subscribe("sensors/#", 1, false).await.is_err());
        assert!(client.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_untracked_is_noop() {
        let client = MqttClient::new(broker(None, None));
        assert!(!client.unsubscribe("never/subscribed").await.unwrap());
    }

    #[tokio::test]
    async fn test_subscriptions_clamped_forced_and_restored() {
        let (port, mut seen) = start_broker().await;
        let client = MqttClient::new(broker(Some("127.0.0.1"), Some(port)));
        client.connect().await.unwrap();
        assert!(client.is_connected());

        assert_eq!(client.subscribe("t", 5, false).await.unwrap(), 2);
        assert_eq!(client.subscription("t"), Some(2));
        assert_eq!(next_subscribe(&mut seen).await, (1, "t".to_string(), 2));

        // A tracked topic is not resent without force.
        assert_eq!(client.subscribe("t", 0, false).await.unwrap(), 2);
        assert_eq!(client.subscribe("u", -1, false).await.unwrap(), 0);
        assert_eq!(next_subscribe(&mut seen).await, (1, "u".to_string(), 0));

        assert_eq!(client.subscribe("t", 1, true).await.unwrap(), 1);
        assert_eq!(client.subscription("t"), Some(1));
        assert_eq!(next_subscribe(&mut seen).await, (1, "t".to_string(), 1));

        client.disconnect().await;
        assert!(!client.is_connected());
        client.connect().await.unwrap();

        let mut restored = vec![next_subscribe(&mut seen).await, next_subscribe(&mut seen).await];
        restored.sort();
        assert_eq!(
            restored,
            vec![(2, "t".to_string(), 1), (2, "u".to_string(), 0)]
        );

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_bad_tracked_topic_keeps_connection() {
        let (port, mut seen) = start_broker().await;
        let client = MqttClient::new(broker(Some("127.0.0.1"), Some(port)));
        client.shared.subscriptions.insert("a/#/b".to_string(), 0);
        client.shared.subscriptions.insert("ok".to_string(), 1);

        client.connect().await.unwrap();
        assert!(client.is_connected());
        assert!(client.connection.lock().await.is_some());

        loop {
            let (_, topic, qos) = next_subscribe(&mut seen).await;
            if topic == "ok" {
                assert_eq!(qos, 1);
                break;
            }
        }

        client.publish("status", "up", 0, false).await.unwrap();
        client.disconnect().await;
    }

    #[test]
    fn test_inbound_keeps_last_value_only() {
        let client = MqttClient::new(broker(None, None));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        client.set_callback(Arc::new(move |_topic, _payload| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        client.shared.handle_incoming("home/temp", b"20.5");
        client.shared.handle_incoming("home/temp", b"21.0");
        client.shared.handle_incoming("home/humidity", b"40");

        assert_eq!(client.latest_payload("home/temp"), Some(b"21.0".to_vec()));
        assert_eq!(client.cached_topics(), vec!["home/humidity", "home/temp"]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

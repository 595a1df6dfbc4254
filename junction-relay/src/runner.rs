//! Relay lifecycle: wiring, supervision and shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use junction_common::TopicBuilder;
use junction_core::config::{JunctionConfig, PublishConfig};
use junction_core::transport::ConfigTransportResolver;
use junction_core::transport::mqtt::MqttClient;
use junction_core::transport::websocket::DeviceHub;
use junction_core::{
    CollectorRegistry, DiagnosticsRegistry, HostCollector, LatestSensorStore, MqttCollector,
    MqttFanout, PollingScheduler, RelayConfig, SinkSet, SourceType, StartOutcome, StreamManager,
    junction_registrations,
};

/// How often stopped target streams are restarted.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// How often a diagnostics summary is logged.
const DIAGNOSTICS_INTERVAL: Duration = Duration::from_secs(30);

/// Running relay built from a [`RelayConfig`].
///
/// Owns the polling scheduler, the stream sessions, the MQTT clients and the
/// optional WebSocket device hub.
pub struct RelayRunner {
    config: Arc<RelayConfig>,
    mqtt_clients: HashMap<i64, Arc<MqttClient>>,
    store: Arc<LatestSensorStore>,
    scheduler: Arc<PollingScheduler>,
    streams: Arc<StreamManager>,
    hub: Option<Arc<DeviceHub>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayRunner {
    /// Build every component. Nothing is polled or streamed until [`start`](Self::start).
    ///
    /// Unreachable brokers are logged and reconnected on first use; a
    /// WebSocket endpoint that cannot be bound is an error.
    pub async fn new(config: RelayConfig) -> Result<Self> {
        let config = Arc::new(config);
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let mut mqtt_clients = HashMap::new();
        for broker in &config.mqtt_brokers {
            let client = Arc::new(MqttClient::new(broker.clone()));
            if let Err(e) = client.connect().await {
                warn!(broker_id = broker.id, error = %e, "Failed to connect to MQTT broker");
            }
            mqtt_clients.insert(broker.id, client);
        }

        let collectors = CollectorRegistry::new()
            .with(SourceType::Host, Arc::new(HostCollector::new()))
            .with(
                SourceType::Mqtt,
                Arc::new(MqttCollector::new(mqtt_clients.values().cloned())),
            );

        let store = Arc::new(LatestSensorStore::new());
        let mut sinks = SinkSet::new().with(store.clone());
        if let Some(publish) = &config.publish {
            let client = publish_client(&mqtt_clients, publish)?;
            sinks = sinks.with(Arc::new(MqttFanout::new(
                client,
                TopicBuilder::with_prefix(&publish.topic_prefix),
                publish.format,
                publish.qos,
            )));
        }

        let scheduler = Arc::new(PollingScheduler::new(
            Arc::new(collectors),
            Arc::new(sinks),
            Arc::new(DiagnosticsRegistry::new()),
        ));

        let hub = match &config.websocket {
            Some(ws) => {
                let listener = TcpListener::bind(&ws.listen)
                    .await
                    .with_context(|| format!("Failed to bind WebSocket endpoint {}", ws.listen))?;
                info!(listen = %ws.listen, "Accepting device WebSocket connections");

                let hub = Arc::new(DeviceHub::new(ws.backend.clone()));
                tasks.push(tokio::spawn(hub.clone().serve(listener, cancel.clone())));
                Some(hub)
            }
            None => None,
        };

        let mut resolver = ConfigTransportResolver::new(config.clone())
            .with_mqtt_clients(mqtt_clients.values().cloned());
        if let Some(hub) = &hub {
            resolver = resolver.with_hub(hub.clone());
        }
        let streams = Arc::new(StreamManager::new(Arc::new(resolver), store.clone()));

        Ok(Self {
            config,
            mqtt_clients,
            store,
            scheduler,
            streams,
            hub,
            cancel,
            tasks,
        })
    }

    pub fn scheduler(&self) -> &Arc<PollingScheduler> {
        &self.scheduler
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    pub fn store(&self) -> &Arc<LatestSensorStore> {
        &self.store
    }

    pub fn hub(&self) -> Option<&Arc<DeviceHub>> {
        self.hub.as_ref()
    }

    /// Register every junction with the scheduler and start its target streams.
    ///
    /// A junction or target that fails is logged and skipped.
    pub async fn start(&mut self) {
        for junction in &self.config.junctions {
            self.start_junction(junction).await;
        }

        let supervisor = tokio::spawn(supervise(
            self.config.clone(),
            self.scheduler.clone(),
            self.streams.clone(),
            self.cancel.clone(),
        ));
        self.tasks.push(supervisor);

        self.publish_status("running").await;

        info!(
            junctions = self.config.junctions.len(),
            sources = self.scheduler.sources().len(),
            streams = self.streams.active_sessions().len(),
            "Relay running"
        );
    }

    async fn start_junction(&self, junction: &JunctionConfig) {
        for registration in junction_registrations(&self.config, junction) {
            let key = registration.key;
            match self
                .scheduler
                .register_consumer(
                    registration.key,
                    registration.consumer_id,
                    registration.interval_ms,
                    registration.descriptor,
                    registration.sensors,
                )
                .await
            {
                Ok(outcome) => {
                    debug!(junction = %junction.name, source = %key, ?outcome, "Registered source")
                }
                Err(e) => {
                    error!(junction = %junction.name, source = %key, error = %e, "Failed to register source")
                }
            }
        }

        for target in &junction.targets {
            self.store
                .route(target.device_id, target.screen_id.as_str(), junction.id);
            start_stream(&self.streams, target.device_id, junction.stream_cadence_ms).await;
        }
    }

    /// Run until Ctrl+C, then shut down.
    pub async fn run(mut self) -> Result<()> {
        self.start().await;

        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");

        self.shutdown().await;
        Ok(())
    }

    /// Stop streams and pollers, then disconnect from brokers.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.streams.shutdown().await;
        self.scheduler.shutdown().await;

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                debug!(error = %e, "Relay task ended abnormally");
            }
        }

        self.publish_status("offline").await;
        for client in self.mqtt_clients.values() {
            client.disconnect().await;
        }

        info!("Relay stopped");
    }

    async fn publish_status(&self, status: &str) {
        let Some(publish) = &self.config.publish else {
            return;
        };
        let Some(client) = self.mqtt_clients.get(&publish.broker_id) else {
            return;
        };

        let topic = TopicBuilder::with_prefix(&publish.topic_prefix).status_topic();
        let payload = serde_json::json!({
            "relay": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "junctions": self.config.junctions.iter().map(|j| &j.name).collect::<Vec<_>>(),
            "status": status,
        });

        if let Err(e) = client
            .publish(&topic, payload.to_string(), publish.qos, true)
            .await
        {
            warn!(topic = %topic, error = %e, "Failed to publish relay status");
        }
    }
}

fn publish_client(
    clients: &HashMap<i64, Arc<MqttClient>>,
    publish: &PublishConfig,
) -> Result<Arc<MqttClient>> {
    clients
        .get(&publish.broker_id)
        .cloned()
        .with_context(|| format!("No MQTT broker {} for publishing", publish.broker_id))
}

async fn start_stream(streams: &StreamManager, device_id: i64, cadence_ms: u64) {
    match streams.start(device_id, cadence_ms).await {
        Ok(StartOutcome::Started) => debug!(device_id, cadence_ms, "Target stream started"),
        Ok(StartOutcome::AlreadyActive) => {}
        Err(e) => warn!(device_id, error = %e, "Failed to start stream"),
    }
}

/// Restart target streams that are not active and log diagnostics periodically.
async fn supervise(
    config: Arc<RelayConfig>,
    scheduler: Arc<PollingScheduler>,
    streams: Arc<StreamManager>,
    cancel: CancellationToken,
) {
    let mut reconcile = tokio::time::interval(RECONCILE_INTERVAL);
    let mut report = tokio::time::interval(DIAGNOSTICS_INTERVAL);
    reconcile.tick().await;
    report.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = reconcile.tick() => {
                let active = streams.active_sessions();
                for junction in &config.junctions {
                    for target in &junction.targets {
                        if !active.contains(&target.device_id) {
                            start_stream(&streams, target.device_id, junction.stream_cadence_ms).await;
                        }
                    }
                }
            }
            _ = report.tick() => {
                for snapshot in scheduler.diagnostics().list() {
                    let stats = scheduler.loop_stats(&snapshot.source);
                    info!(
                        source = %snapshot.source,
                        rate_ms = snapshot.rate_ms,
                        sensors = snapshot.sensor_count,
                        consumers = snapshot.consumer_count,
                        restarts = stats.restarts,
                        "Poller"
                    );
                }
                for session in streams.sessions() {
                    info!(
                        device_id = session.device_id,
                        transport = %session.transport,
                        status = ?session.status,
                        latency_ms = session.latency.map(|l| l.as_millis() as u64),
                        "Stream"
                    );
                }
            }
        }
    }
}

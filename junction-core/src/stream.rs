//! Paced outbound stream sessions, one per destination device.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use junction_common::current_timestamp_millis;

use crate::error::Result;
use crate::transport::StreamTransport;

/// Looks up the transport for a device.
pub trait TransportResolver: Send + Sync {
    /// Fails with a configuration error when the device has no transport.
    fn resolve(&self, device_id: i64) -> Result<Arc<dyn StreamTransport>>;
}

/// Supplies the next payload for a device.
#[async_trait]
pub trait PayloadSource: Send + Sync {
    /// `None` means nothing to send this cycle.
    async fn next_payload(&self, device_id: i64) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyActive,
}

/// Time to wait after a send so that sends start once per cadence.
pub fn compute_next_wait(cadence: Duration, latency: Duration) -> Duration {
    cadence.saturating_sub(latency)
}

#[derive(Default)]
struct SessionMetrics {
    active: AtomicBool,
    has_latency: AtomicBool,
    last_latency_us: AtomicU64,
    last_sent_ms: AtomicI64,
}

impl SessionMetrics {
    fn claimed() -> Arc<Self> {
        let metrics = Self::default();
        metrics.active.store(true, Ordering::SeqCst);
        Arc::new(metrics)
    }

    fn record_send(&self, latency: Duration) {
        self.last_latency_us
            .store(latency.as_micros() as u64, Ordering::SeqCst);
        self.has_latency.store(true, Ordering::SeqCst);
        self.last_sent_ms
            .store(current_timestamp_millis(), Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn latency(&self) -> Option<Duration> {
        self.has_latency
            .load(Ordering::SeqCst)
            .then(|| Duration::from_micros(self.last_latency_us.load(Ordering::SeqCst)))
    }

    fn last_sent_at(&self) -> Option<DateTime<Utc>> {
        match self.last_sent_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }
}

struct StreamSession {
    cadence: Duration,
    transport: String,
    cancel: CancellationToken,
    metrics: Arc<SessionMetrics>,
    task: Option<JoinHandle<()>>,
}

/// Snapshot of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub device_id: i64,
    pub status: SessionStatus,
    pub cadence: Duration,
    pub transport: String,
    pub latency: Option<Duration>,
    pub last_sent_at: Option<DateTime<Utc>>,
}

/// Owns one send loop per device.
///
/// A session whose send fails stays listed as inactive until it is stopped
/// or started again. A replacement session does not send until the loop it
/// replaces has exited, so a device only ever has one writer.
pub struct StreamManager {
    sessions: DashMap<i64, StreamSession>,
    writers: DashMap<i64, Arc<Mutex<()>>>,
    resolver: Arc<dyn TransportResolver>,
    payloads: Arc<dyn PayloadSource>,
}

impl StreamManager {
    pub fn new(resolver: Arc<dyn TransportResolver>, payloads: Arc<dyn PayloadSource>) -> Self {
        Self {
            sessions: DashMap::new(),
            writers: DashMap::new(),
            resolver,
            payloads,
        }
    }

    /// Start streaming to a device at the given cadence.
    pub async fn start(&self, device_id: i64, cadence_ms: u64) -> Result<StartOutcome> {
        let cadence = Duration::from_millis(cadence_ms);
        let cancel = CancellationToken::new();
        let metrics = SessionMetrics::claimed();

        let claimed = StreamSession {
            cadence,
            transport: String::from("pending"),
            cancel: cancel.clone(),
            metrics: metrics.clone(),
            task: None,
        };

        match self.sessions.entry(device_id) {
            Entry::Occupied(mut entry) => {
                if entry.get().metrics.is_active() {
                    return Ok(StartOutcome::AlreadyActive);
                }
                entry.insert(claimed);
            }
            Entry::Vacant(entry) => {
                entry.insert(claimed);
            }
        }

        let transport = match self.resolver.resolve(device_id) {
            Ok(transport) => transport,
            Err(e) => {
                self.release(device_id, &metrics);
                return Err(e);
            }
        };

        if let Err(e) = transport.open().await {
            self.release(device_id, &metrics);
            return Err(e);
        }

        let description = transport.describe();
        let writer = self.writers.entry(device_id).or_default().clone();
        let task = tokio::spawn(run_session(
            device_id,
            writer,
            cadence,
            transport,
            self.payloads.clone(),
            metrics.clone(),
            cancel.clone(),
        ));

        match self.sessions.get_mut(&device_id) {
            Some(mut session) if Arc::ptr_eq(&session.metrics, &metrics) => {
                session.transport = description.clone();
                session.task = Some(task);
            }
            _ => cancel.cancel(),
        }

        info!(device = device_id, transport = %description, cadence_ms, "Stream started");
        Ok(StartOutcome::Started)
    }

    fn release(&self, device_id: i64, metrics: &Arc<SessionMetrics>) {
        self.sessions
            .remove_if(&device_id, |_, session| Arc::ptr_eq(&session.metrics, metrics));
    }

    /// Stop streaming to a device and wait for its loop to exit.
    ///
    /// Returns whether a session existed.
    pub async fn stop(&self, device_id: i64) -> bool {
        let Some((_, session)) = self.sessions.remove(&device_id) else {
            return false;
        };

        session.cancel.cancel();
        session.metrics.active.store(false, Ordering::SeqCst);
        if let Some(task) = session.task {
            if let Err(e) = task.await {
                warn!(device = device_id, error = %e, "Stream loop did not exit cleanly");
            }
        }
        info!(device = device_id, "Stream stopped");
        true
    }

    /// Stop every session and wait for the loops to exit.
    pub async fn shutdown(&self) {
        let ids: Vec<i64> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.cancel.cancel();
                session.metrics.active.store(false, Ordering::SeqCst);
                if let Some(task) = session.task {
                    let _ = task.await;
                }
            }
        }
    }

    pub fn status(&self, device_id: i64) -> Option<SessionStatus> {
        self.sessions.get(&device_id).map(|session| {
            if session.metrics.is_active() {
                SessionStatus::Active
            } else {
                SessionStatus::Inactive
            }
        })
    }

    /// Duration of the most recent successful send.
    pub fn latency(&self, device_id: i64) -> Option<Duration> {
        self.sessions
            .get(&device_id)
            .and_then(|session| session.metrics.latency())
    }

    pub fn last_sent_at(&self, device_id: i64) -> Option<DateTime<Utc>> {
        self.sessions
            .get(&device_id)
            .and_then(|session| session.metrics.last_sent_at())
    }

    /// Ids of devices with an active session, sorted.
    pub fn active_sessions(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .sessions
            .iter()
            .filter(|entry| entry.metrics.is_active())
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshots of all sessions, sorted by device id.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| SessionInfo {
                device_id: *entry.key(),
                status: if entry.metrics.is_active() {
                    SessionStatus::Active
                } else {
                    SessionStatus::Inactive
                },
                cadence: entry.cadence,
                transport: entry.transport.clone(),
                latency: entry.metrics.latency(),
                last_sent_at: entry.metrics.last_sent_at(),
            })
            .collect();
        infos.sort_by_key(|info| info.device_id);
        infos
    }
}

async fn run_session(
    device_id: i64,
    writer: Arc<Mutex<()>>,
    cadence: Duration,
    transport: Arc<dyn StreamTransport>,
    payloads: Arc<dyn PayloadSource>,
    metrics: Arc<SessionMetrics>,
    cancel: CancellationToken,
) {
    let _writer = tokio::select! {
        _ = cancel.cancelled() => return,
        guard = writer.lock_owned() => guard,
    };

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let wait = match payloads.next_payload(device_id).await {
            None => cadence,
            Some(payload) => {
                let started = Instant::now();
                match transport.send(&payload).await {
                    Ok(()) => {
                        let latency = started.elapsed();
                        metrics.record_send(latency);
                        debug!(device = device_id, latency_ms = latency.as_millis() as u64, "Payload sent");
                        compute_next_wait(cadence, latency)
                    }
                    Err(e) => {
                        warn!(
                            device = device_id,
                            transport = %transport.describe(),
                            error = %e,
                            "Send failed, stream session terminated"
                        );
                        metrics.active.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    debug!(device = device_id, "Stream loop exited");
}

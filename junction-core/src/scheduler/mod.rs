//! Polling scheduler: one sample loop per source, shared by all consumers.
//!
//! Consumers register interest in a source with a requested interval and a
//! set of sensors. The source is sampled at the smallest requested interval
//! and every consumer's sensors are refreshed on each tick.
//!
//! Registration for one key is serialised by that key's mutex; different keys
//! never wait on each other. A loop restart cancels the running loop, waits
//! for it to exit and only then spawns its replacement, so a key never has two
//! loops at once.

mod poller;
mod sample;

pub use poller::LoopPhase;
pub use sample::LoopStats;

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use junction_common::{Sensor, SourceKey, SourceKind};

use crate::collector::{CollectorRegistry, SourceDescriptor};
use crate::diagnostics::DiagnosticsRegistry;
use crate::error::{CoreError, Result};
use crate::fanout::SensorSink;
use crate::rate::DEFAULT_POLL_RATE_MS;

use poller::{PollerState, RunningLoop};
use sample::{LoopCounters, SampleAction, SampleJob, run_sample_loop};

type PollerSlot = Arc<Mutex<PollerState>>;

/// Result of [`PollingScheduler::register_consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// A new poller was created and its loop started.
    Started,
    /// The poller changed and its loop was restarted.
    Restarted,
    /// Nothing changed; the running loop was left alone.
    Unchanged,
}

/// Result of [`PollingScheduler::unregister_consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregistrationOutcome {
    /// The last consumer left; the poller was stopped and discarded.
    Removed,
    /// The effective interval changed and the loop was restarted.
    Restarted,
    /// The consumer was removed without touching the loop.
    Unchanged,
    /// The key or the consumer was not registered.
    NotRegistered,
}

/// Point-in-time view of a poller.
#[derive(Debug, Clone, PartialEq)]
pub struct PollerInfo {
    pub key: SourceKey,
    pub phase: LoopPhase,
    pub generation: u64,
    pub started_at: Option<Instant>,
    pub interval_ms: u64,
    pub consumers: Vec<i64>,
    pub sensor_count: usize,
}

/// Owns every poller of the relay.
pub struct PollingScheduler {
    pollers: DashMap<SourceKey, PollerSlot>,
    counters: DashMap<SourceKey, Arc<LoopCounters>>,
    collectors: Arc<CollectorRegistry>,
    sink: Arc<dyn SensorSink>,
    diagnostics: Arc<DiagnosticsRegistry>,
}

impl PollingScheduler {
    pub fn new(
        collectors: Arc<CollectorRegistry>,
        sink: Arc<dyn SensorSink>,
        diagnostics: Arc<DiagnosticsRegistry>,
    ) -> Self {
        Self {
            pollers: DashMap::new(),
            counters: DashMap::new(),
            collectors,
            sink,
            diagnostics,
        }
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticsRegistry> {
        &self.diagnostics
    }

    /// Register a consumer's interest in a source.
    ///
    /// A zero interval is treated as the default rate. Sensor entries are
    /// re-owned by `key` and `consumer_id`.
    pub async fn register_consumer(
        &self,
        key: SourceKey,
        consumer_id: i64,
        requested_interval_ms: u64,
        descriptor: SourceDescriptor,
        selected_sensors: Vec<Sensor>,
    ) -> Result<RegistrationOutcome> {
        if descriptor.key != key {
            return Err(CoreError::config(format!(
                "descriptor for {} registered under {}",
                descriptor.key, key
            )));
        }

        let action = self.resolve_action(&descriptor)?;
        let interval_ms = if requested_interval_ms == 0 {
            DEFAULT_POLL_RATE_MS
        } else {
            requested_interval_ms
        };
        let sensors: Vec<Sensor> = selected_sensors
            .into_iter()
            .map(|mut sensor| {
                sensor.source = key;
                sensor.consumer_id = consumer_id;
                sensor
            })
            .collect();

        loop {
            let slot = match self.pollers.entry(key) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(entry) => {
                    let state = PollerState::new(key, descriptor.clone(), action.clone());
                    entry.insert(Arc::new(Mutex::new(state))).clone()
                }
            };

            let mut state = slot.lock().await;
            if !self.is_current(&key, &slot) {
                continue;
            }

            if state.consumers.is_empty() {
                state.descriptor = descriptor;
                state.action = action;
                state.apply_registration(consumer_id, interval_ms, sensors);
                self.spawn_loop(&mut state);
                info!(
                    source = %key,
                    consumer = consumer_id,
                    interval_ms = state.effective_interval(),
                    "Poller started"
                );
                return Ok(RegistrationOutcome::Started);
            }

            if !state.registration_changes(consumer_id, interval_ms, &sensors) {
                state.consumers.insert(consumer_id, interval_ms);
                debug!(source = %key, consumer = consumer_id, "Registration unchanged");
                return Ok(RegistrationOutcome::Unchanged);
            }

            self.drain_loop(&mut state).await;
            state.descriptor = descriptor;
            state.action = action;
            state.apply_registration(consumer_id, interval_ms, sensors);
            state.prune_sensors();
            self.restart_loop(&mut state);
            info!(
                source = %key,
                consumer = consumer_id,
                interval_ms = state.effective_interval(),
                generation = state.generation,
                "Poller restarted"
            );
            return Ok(RegistrationOutcome::Restarted);
        }
    }

    /// Remove a consumer's interest in a source.
    pub async fn unregister_consumer(&self, key: SourceKey, consumer_id: i64) -> UnregistrationOutcome {
        loop {
            let slot = match self.pollers.get(&key) {
                Some(slot) => slot.value().clone(),
                None => return UnregistrationOutcome::NotRegistered,
            };

            let mut state = slot.lock().await;
            if !self.is_current(&key, &slot) {
                continue;
            }

            if !state.consumers.contains_key(&consumer_id) {
                return UnregistrationOutcome::NotRegistered;
            }

            let Some(remaining_ms) = state.interval_without(consumer_id) else {
                self.drain_loop(&mut state).await;
                state.consumers.clear();
                state.sensors.clear();
                self.pollers
                    .remove_if(&key, |_, current| Arc::ptr_eq(current, &slot));
                self.diagnostics.remove(&key);
                info!(source = %key, consumer = consumer_id, "Poller removed");
                return UnregistrationOutcome::Removed;
            };

            if remaining_ms == state.effective_interval() {
                state.consumers.remove(&consumer_id);
                state.prune_sensors();
                if let Some(running) = &state.running {
                    running.consumers.send_replace(state.consumer_ids());
                }
                debug!(source = %key, consumer = consumer_id, "Consumer removed, interval unchanged");
                return UnregistrationOutcome::Unchanged;
            }

            self.drain_loop(&mut state).await;
            state.consumers.remove(&consumer_id);
            state.prune_sensors();
            self.restart_loop(&mut state);
            info!(
                source = %key,
                consumer = consumer_id,
                interval_ms = remaining_ms,
                generation = state.generation,
                "Poller restarted"
            );
            return UnregistrationOutcome::Restarted;
        }
    }

    /// Stop every poller and wait for the loops to exit.
    pub async fn shutdown(&self) {
        let keys: Vec<SourceKey> = self.pollers.iter().map(|entry| *entry.key()).collect();

        for key in keys {
            let Some((_, slot)) = self.pollers.remove(&key) else {
                continue;
            };
            let mut state = slot.lock().await;
            self.drain_loop(&mut state).await;
            state.consumers.clear();
            self.diagnostics.remove(&key);
        }
        info!("Polling scheduler stopped");
    }

    /// Loop counters of a key, kept after the poller is removed.
    pub fn loop_stats(&self, key: &SourceKey) -> LoopStats {
        self.counters
            .get(key)
            .map(|counters| counters.snapshot())
            .unwrap_or_default()
    }

    pub async fn poller_info(&self, key: &SourceKey) -> Option<PollerInfo> {
        let slot = self.pollers.get(key)?.value().clone();
        let state = slot.lock().await;

        Some(PollerInfo {
            key: *key,
            phase: state.phase,
            generation: state.generation,
            started_at: state.running.as_ref().map(|running| running.started_at),
            interval_ms: state
                .running
                .as_ref()
                .map_or_else(|| state.effective_interval(), |running| running.interval_ms),
            consumers: state.consumer_ids(),
            sensor_count: state.sensors.len(),
        })
    }

    /// Keys with a poller, sorted.
    pub fn sources(&self) -> Vec<SourceKey> {
        let mut keys: Vec<SourceKey> = self.pollers.iter().map(|entry| *entry.key()).collect();
        keys.sort();
        keys
    }

    fn resolve_action(&self, descriptor: &SourceDescriptor) -> Result<SampleAction> {
        match descriptor.key.kind {
            SourceKind::Device => Ok(SampleAction::Device),
            SourceKind::Collector => {
                let source_type = descriptor.source_type.ok_or_else(|| {
                    CoreError::config(format!("{} has no source type", descriptor.key))
                })?;
                Ok(SampleAction::Collector(self.collectors.resolve(source_type)?))
            }
        }
    }

    fn is_current(&self, key: &SourceKey, slot: &PollerSlot) -> bool {
        self.pollers
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }

    fn counters(&self, key: SourceKey) -> Arc<LoopCounters> {
        self.counters.entry(key).or_default().clone()
    }

    /// Cancel the running loop and take back its sensor entries.
    async fn drain_loop(&self, state: &mut PollerState) {
        let Some(running) = state.running.take() else {
            state.phase = LoopPhase::Stopped;
            return;
        };

        state.phase = LoopPhase::Draining;
        running.cancel.cancel();

        match running.handle.await {
            Ok(sensors) => state.sensors = sensors,
            Err(e) => warn!(
                source = %state.key,
                generation = running.generation,
                error = %e,
                "Sample loop did not exit cleanly, keeping last known sensors"
            ),
        }

        state.phase = LoopPhase::Stopped;
    }

    fn restart_loop(&self, state: &mut PollerState) {
        self.counters(state.key).record_restart();
        self.spawn_loop(state);
    }

    fn spawn_loop(&self, state: &mut PollerState) {
        debug_assert!(state.running.is_none());

        state.generation += 1;
        let interval_ms = state.effective_interval();
        let cancel = CancellationToken::new();
        let (consumers, consumers_rx) = watch::channel(state.consumer_ids());

        let job = SampleJob {
            key: state.key,
            descriptor: state.descriptor.clone(),
            action: state.action.clone(),
            sensors: state.sensors.clone(),
            interval_ms,
            consumers: consumers_rx,
            sink: self.sink.clone(),
            diagnostics: self.diagnostics.clone(),
        };

        let handle = tokio::spawn(run_sample_loop(
            job,
            cancel.clone(),
            self.counters(state.key),
        ));

        state.running = Some(RunningLoop {
            generation: state.generation,
            started_at: Instant::now(),
            interval_ms,
            cancel,
            consumers,
            handle,
        });
        state.phase = LoopPhase::Active;
    }
}

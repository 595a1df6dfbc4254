//! State of one source's poller.

use std::collections::BTreeMap;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use junction_common::{Sensor, SourceKey};

use super::sample::SampleAction;
use crate::collector::SourceDescriptor;
use crate::rate::DEFAULT_POLL_RATE_MS;

/// Lifecycle of a poller's sample loop.
///
/// A restart always walks `Active → Draining → Stopped → Active`; the
/// replacement loop is spawned only once the old one has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Active,
    Draining,
    Stopped,
}

pub(crate) struct RunningLoop {
    pub generation: u64,
    pub started_at: Instant,
    pub interval_ms: u64,
    pub cancel: CancellationToken,
    /// Live consumer ids, read by the loop before every tick.
    pub consumers: watch::Sender<Vec<i64>>,
    pub handle: JoinHandle<Vec<Sensor>>,
}

pub(crate) struct PollerState {
    pub key: SourceKey,
    pub descriptor: SourceDescriptor,
    pub action: SampleAction,
    /// Consumer id to requested interval in milliseconds.
    pub consumers: BTreeMap<i64, u64>,
    pub sensors: Vec<Sensor>,
    pub phase: LoopPhase,
    pub generation: u64,
    pub running: Option<RunningLoop>,
}

impl PollerState {
    pub fn new(key: SourceKey, descriptor: SourceDescriptor, action: SampleAction) -> Self {
        Self {
            key,
            descriptor,
            action,
            consumers: BTreeMap::new(),
            sensors: Vec::new(),
            phase: LoopPhase::Stopped,
            generation: 0,
            running: None,
        }
    }

    /// Minimum requested interval over all consumers.
    pub fn effective_interval(&self) -> u64 {
        self.consumers
            .values()
            .copied()
            .min()
            .unwrap_or(DEFAULT_POLL_RATE_MS)
    }

    /// Effective interval once `consumer_id` requests `interval_ms`.
    pub fn interval_with(&self, consumer_id: i64, interval_ms: u64) -> u64 {
        self.consumers
            .iter()
            .filter(|(id, _)| **id != consumer_id)
            .map(|(_, ms)| *ms)
            .chain(std::iter::once(interval_ms))
            .min()
            .unwrap_or(interval_ms)
    }

    /// Effective interval once `consumer_id` is gone, if anyone is left.
    pub fn interval_without(&self, consumer_id: i64) -> Option<u64> {
        self.consumers
            .iter()
            .filter(|(id, _)| **id != consumer_id)
            .map(|(_, ms)| *ms)
            .min()
    }

    /// Whether registering these sensors and interval would change the loop.
    ///
    /// Besides new consumers and new sensor entries, a rate change by an
    /// existing consumer counts when it moves the effective interval. This
    /// goes beyond the change events of new sensors and new consumer ids.
    pub fn registration_changes(&self, consumer_id: i64, interval_ms: u64, sensors: &[Sensor]) -> bool {
        if !self.consumers.contains_key(&consumer_id) {
            return true;
        }
        if self.interval_with(consumer_id, interval_ms) != self.effective_interval() {
            return true;
        }
        sensors
            .iter()
            .any(|incoming| !self.sensors.iter().any(|s| s.same_entry(incoming)))
    }

    /// Record a consumer's interval and merge its new sensor entries.
    pub fn apply_registration(&mut self, consumer_id: i64, interval_ms: u64, sensors: Vec<Sensor>) {
        self.consumers.insert(consumer_id, interval_ms);
        for incoming in sensors {
            if !self.sensors.iter().any(|s| s.same_entry(&incoming)) {
                self.sensors.push(incoming);
            }
        }
    }

    /// Drop entries of consumers that are no longer registered.
    pub fn prune_sensors(&mut self) {
        let consumers = &self.consumers;
        self.sensors
            .retain(|sensor| consumers.contains_key(&sensor.consumer_id));
    }

    pub fn consumer_ids(&self) -> Vec<i64> {
        self.consumers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> PollerState {
        let key = SourceKey::device(3);
        PollerState::new(key, SourceDescriptor::device(3, "panel"), SampleAction::Device)
    }

    fn sensor(consumer: i64, external_id: &str) -> Sensor {
        Sensor::new(SourceKey::device(3), consumer, external_id, external_id)
    }

    #[test]
    fn test_effective_interval_is_minimum() {
        let mut state = state();
        state.apply_registration(1, 1000, vec![]);
        state.apply_registration(2, 200, vec![]);
        state.apply_registration(3, 500, vec![]);

        assert_eq!(state.effective_interval(), 200);
        assert_eq!(state.interval_without(2), Some(500));
        assert_eq!(state.interval_without(4), Some(200));
    }

    #[test]
    fn test_same_registration_is_not_a_change() {
        let mut state = state();
        state.apply_registration(1, 1000, vec![sensor(1, "temp")]);

        assert!(!state.registration_changes(1, 1000, &[sensor(1, "temp")]));
        assert!(state.registration_changes(1, 1000, &[sensor(1, "humidity")]));
        assert!(state.registration_changes(2, 1000, &[]));
        assert!(state.registration_changes(1, 500, &[]));
    }

    #[test]
    fn test_same_sensor_per_consumer_is_separate_entry() {
        let mut state = state();
        state.apply_registration(1, 1000, vec![sensor(1, "temp")]);
        state.apply_registration(2, 1000, vec![sensor(2, "temp"), sensor(2, "temp")]);

        assert_eq!(state.sensors.len(), 2);

        state.consumers.remove(&1);
        state.prune_sensors();
        assert_eq!(state.sensors.len(), 1);
        assert_eq!(state.sensors[0].consumer_id, 2);
    }
}

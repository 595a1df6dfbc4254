//! The sample loop run for every active poller.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use junction_common::{Sensor, SourceKey, current_timestamp_millis};

use crate::collector::{SensorCollector, SourceDescriptor};
use crate::diagnostics::{DiagnosticsRegistry, PollerSnapshot};
use crate::error::Result;
use crate::fanout::SensorSink;

/// What a tick of the loop does for its source.
#[derive(Clone)]
pub(crate) enum SampleAction {
    /// Fetch the selected sensors from a collector.
    Collector(Arc<dyn SensorCollector>),
    /// Forward the device's own sensor entries.
    Device,
}

/// Loop counters of one source key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Loops currently running.
    pub running: usize,
    /// Highest number of loops ever running at once.
    pub peak: usize,
    /// Loops started.
    pub started: u64,
    /// Restarts performed.
    pub restarts: u64,
}

#[derive(Debug, Default)]
pub(crate) struct LoopCounters {
    running: AtomicUsize,
    peak: AtomicUsize,
    started: AtomicU64,
    restarts: AtomicU64,
}

impl LoopCounters {
    fn enter(self: &Arc<Self>) -> RunningGuard {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.started.fetch_add(1, Ordering::SeqCst);
        RunningGuard(self.clone())
    }

    pub fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> LoopStats {
        LoopStats {
            running: self.running.load(Ordering::SeqCst),
            peak: self.peak.load(Ordering::SeqCst),
            started: self.started.load(Ordering::SeqCst),
            restarts: self.restarts.load(Ordering::SeqCst),
        }
    }
}

struct RunningGuard(Arc<LoopCounters>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything one loop generation owns.
pub(crate) struct SampleJob {
    pub key: SourceKey,
    pub descriptor: SourceDescriptor,
    pub action: SampleAction,
    pub sensors: Vec<Sensor>,
    pub interval_ms: u64,
    pub consumers: watch::Receiver<Vec<i64>>,
    pub sink: Arc<dyn SensorSink>,
    pub diagnostics: Arc<DiagnosticsRegistry>,
}

impl SampleJob {
    fn selected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::with_capacity(self.sensors.len());
        for sensor in &self.sensors {
            if !ids.contains(&sensor.external_id) {
                ids.push(sensor.external_id.clone());
            }
        }
        ids
    }

    /// Drop entries of consumers that left since the last tick.
    fn refresh_consumers(&mut self) -> usize {
        if self.consumers.has_changed().unwrap_or(false) {
            let live = self.consumers.borrow_and_update().clone();
            self.sensors
                .retain(|sensor| live.contains(&sensor.consumer_id));
            debug!(source = %self.key, consumers = live.len(), "Consumer set updated");
        }
        self.consumers.borrow().len()
    }

    async fn sample(&mut self) -> Result<()> {
        let consumer_count = self.refresh_consumers();
        let now = current_timestamp_millis();

        if let SampleAction::Collector(collector) = &self.action {
            let ids = self.selected_ids();
            let readings = collector.fetch_selected(&self.descriptor, &ids).await?;

            for reading in &readings {
                for sensor in self
                    .sensors
                    .iter_mut()
                    .filter(|s| s.external_id == reading.external_id)
                {
                    sensor.apply(reading, now);
                }
            }
            trace!(source = %self.key, readings = readings.len(), "Fetched readings");
        }

        let delivered = self.sink.deliver(self.key, &self.sensors).await;

        self.diagnostics.update(PollerSnapshot::new(
            self.key,
            self.interval_ms,
            consumer_count,
            now,
            &self.sensors,
        ));

        delivered
    }
}

/// Run ticks until cancelled and hand the sensor entries back.
pub(crate) async fn run_sample_loop(
    mut job: SampleJob,
    cancel: CancellationToken,
    counters: Arc<LoopCounters>,
) -> Vec<Sensor> {
    let _running = counters.enter();
    let interval = Duration::from_millis(job.interval_ms);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match AssertUnwindSafe(job.sample()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(source = %job.key, error = %e, "Sample failed, keeping previous values"),
            Err(_) => warn!(source = %job.key, "Sample action panicked, keeping previous values"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    job.sensors
}

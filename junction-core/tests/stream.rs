//! Integration tests for stream sessions.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use junction_core::{
    CoreError, PayloadSource, Result, SessionStatus, StartOutcome, StreamManager, StreamTransport,
    TransportResolver,
};

/// Transport that takes `latency` per send and fails from send `fail_from` on.
struct FakeTransport {
    latency: Duration,
    fail_from: Option<usize>,
    opens: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    sends: Mutex<Vec<(Instant, Vec<u8>)>>,
}

impl FakeTransport {
    fn new(latency_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            latency: Duration::from_millis(latency_ms),
            fail_from: None,
            opens: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            sends: Mutex::new(Vec::new()),
        })
    }

    fn failing_from(latency_ms: u64, n: usize) -> Arc<Self> {
        Arc::new(Self {
            latency: Duration::from_millis(latency_ms),
            fail_from: Some(n),
            opens: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            sends: Mutex::new(Vec::new()),
        })
    }

    async fn send_gaps(&self) -> Vec<Duration> {
        let sends = self.sends.lock().await;
        sends
            .windows(2)
            .map(|pair| pair[1].0.duration_since(pair[0].0))
            .collect()
    }
}

#[async_trait]
impl StreamTransport for FakeTransport {
    async fn open(&self) -> Result<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        let started = Instant::now();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let attempt = {
            let mut sends = self.sends.lock().await;
            sends.push((started, payload.to_vec()));
            sends.len()
        };
        tokio::time::sleep(self.latency).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.fail_from {
            Some(n) if attempt >= n => Err(CoreError::send("fake", "link down")),
            _ => Ok(()),
        }
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

struct FixedResolver {
    transport: Option<Arc<FakeTransport>>,
    resolves: AtomicUsize,
}

impl FixedResolver {
    fn new(transport: Arc<FakeTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport: Some(transport),
            resolves: AtomicUsize::new(0),
        })
    }

    fn empty() -> Arc<Self> {
        Arc::new(Self {
            transport: None,
            resolves: AtomicUsize::new(0),
        })
    }
}

impl TransportResolver for FixedResolver {
    fn resolve(&self, device_id: i64) -> Result<Arc<dyn StreamTransport>> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        match &self.transport {
            Some(transport) => Ok(transport.clone()),
            None => Err(CoreError::MissingTransport { device_id }),
        }
    }
}

/// Payload source replaying a script, then repeating a fixed payload.
struct ScriptedPayloads {
    script: Mutex<VecDeque<Option<Vec<u8>>>>,
}

impl ScriptedPayloads {
    fn always() -> Arc<Self> {
        Self::scripted(Vec::new())
    }

    fn scripted(script: Vec<Option<&[u8]>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().map(|p| p.map(<[u8]>::to_vec)).collect()),
        })
    }
}

#[async_trait]
impl PayloadSource for ScriptedPayloads {
    async fn next_payload(&self, _device_id: i64) -> Option<Vec<u8>> {
        match self.script.lock().await.pop_front() {
            Some(scripted) => scripted,
            None => Some(b"{\"type\":\"sensor\"}".to_vec()),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_sends_are_paced_by_cadence() {
    let transport = FakeTransport::new(120);
    let manager = StreamManager::new(FixedResolver::new(transport.clone()), ScriptedPayloads::always());

    let outcome = manager.start(1, 500).await.expect("start");
    assert_eq!(outcome, StartOutcome::Started);

    tokio::time::sleep(Duration::from_millis(2100)).await;

    let gaps = transport.send_gaps().await;
    assert!(gaps.len() >= 3);
    assert!(gaps.iter().all(|gap| *gap == Duration::from_millis(500)));
    assert_eq!(manager.latency(1), Some(Duration::from_millis(120)));
    assert!(manager.last_sent_at(1).is_some());

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_sends_run_back_to_back() {
    let transport = FakeTransport::new(600);
    let manager = StreamManager::new(FixedResolver::new(transport.clone()), ScriptedPayloads::always());

    manager.start(2, 500).await.expect("start");
    tokio::time::sleep(Duration::from_millis(2000)).await;

    let gaps = transport.send_gaps().await;
    assert!(gaps.len() >= 2);
    assert!(gaps.iter().all(|gap| *gap == Duration::from_millis(600)));

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_nothing_to_send_waits_full_cadence() {
    let transport = FakeTransport::new(100);
    let payloads = ScriptedPayloads::scripted(vec![None, None, Some(&b"{}"[..])]);
    let manager = StreamManager::new(FixedResolver::new(transport.clone()), payloads);

    let started = Instant::now();
    manager.start(3, 500).await.expect("start");
    tokio::time::sleep(Duration::from_millis(1050)).await;

    let sends = transport.sends.lock().await;
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].0.duration_since(started), Duration::from_millis(1000));
    assert_eq!(sends[0].1, b"{}".to_vec());
    drop(sends);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_marks_session_inactive() {
    let transport = FakeTransport::failing_from(10, 3);
    let manager = StreamManager::new(FixedResolver::new(transport.clone()), ScriptedPayloads::always());

    manager.start(4, 100).await.expect("start");
    tokio::time::sleep(Duration::from_millis(1000)).await;

    assert_eq!(transport.sends.lock().await.len(), 3);
    assert_eq!(manager.status(4), Some(SessionStatus::Inactive));
    assert!(manager.active_sessions().is_empty());
    assert_eq!(manager.sessions().len(), 1);

    // Starting again replaces the failed session.
    assert_eq!(manager.start(4, 100).await.expect("restart"), StartOutcome::Started);
    assert_eq!(transport.opens.load(Ordering::SeqCst), 2);

    assert!(manager.stop(4).await);
    assert_eq!(manager.status(4), None);
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_stop_never_overlaps_sends() {
    let transport = FakeTransport::new(300);
    let manager = StreamManager::new(FixedResolver::new(transport.clone()), ScriptedPayloads::always());

    manager.start(1, 500).await.expect("start");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(manager.stop(1).await);
    assert_eq!(manager.start(1, 500).await.expect("restart"), StartOutcome::Started);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(transport.sends.lock().await.len() >= 3);
    assert_eq!(transport.peak_in_flight.load(Ordering::SeqCst), 1);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_stop_and_start_keep_one_writer() {
    let transport = FakeTransport::new(300);
    let manager = Arc::new(StreamManager::new(
        FixedResolver::new(transport.clone()),
        ScriptedPayloads::always(),
    ));

    manager.start(2, 500).await.expect("start");
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Concurrent stop and start race for the same device.
    let stopper = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.stop(2).await })
    };
    let starter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.start(2, 500).await })
    };
    stopper.await.expect("stop task");
    starter.await.expect("start task").expect("start");

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(transport.peak_in_flight.load(Ordering::SeqCst), 1);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_is_single_flight() {
    let transport = FakeTransport::new(1);
    let resolver = FixedResolver::new(transport.clone());
    let manager = Arc::new(StreamManager::new(resolver.clone(), ScriptedPayloads::always()));

    let starts: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.start(5, 250).await })
        })
        .collect();

    let mut started = 0;
    let mut already = 0;
    for start in starts {
        match start.await.expect("task").expect("start") {
            StartOutcome::Started => started += 1,
            StartOutcome::AlreadyActive => already += 1,
        }
    }

    assert_eq!(started, 1);
    assert_eq!(already, 7);
    assert_eq!(resolver.resolves.load(Ordering::SeqCst), 1);
    assert_eq!(manager.active_sessions(), vec![5]);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_missing_transport_leaves_no_session() {
    let manager = StreamManager::new(FixedResolver::empty(), ScriptedPayloads::always());

    let err = manager.start(6, 1000).await.unwrap_err();
    assert!(matches!(err, CoreError::MissingTransport { device_id: 6 }));
    assert_eq!(manager.status(6), None);
}

#[tokio::test]
async fn test_stop_unknown_is_noop() {
    let manager = StreamManager::new(FixedResolver::empty(), ScriptedPayloads::always());
    assert!(!manager.stop(42).await);
}

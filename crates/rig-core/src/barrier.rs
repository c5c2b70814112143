//! Release barrier.
//!
//! Sessions call [`Barrier::signal_ready`] after joining. The coordinator
//! polls the store until the quorum target is met or the deadline passes,
//! then fires the release action exactly once.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::{BarrierConfig, QuorumSource};
use crate::error::{RunError, StoreError};
use crate::stats::{StatsCollector, Trend};
use crate::store::{CoordinationStore, RigKeys};

/// Lowest accepted quorum poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Side effect fired when the barrier releases (opening the gates).
pub trait ReleaseAction: Send + Sync {
    fn release<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), RunError>> + Send + 'a>>;
}

/// Session-side handle.
#[derive(Clone)]
pub struct Barrier {
    store: Arc<dyn CoordinationStore>,
    key: String,
    ttl: Duration,
}

impl Barrier {
    pub fn new(store: Arc<dyn CoordinationStore>, keys: &RigKeys, ttl: Duration) -> Self {
        Self {
            store,
            key: keys.ready(),
            ttl,
        }
    }

    /// Marks one more session ready and returns the new count.
    pub async fn signal_ready(&self) -> Result<u64, StoreError> {
        self.store.incr(&self.key, Some(self.ttl)).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierPhase {
    WaitingForQuorum,
    Releasing,
    Released,
    TimedOut,
}

/// Where the coordinator reads the ready count from.
#[derive(Debug, Clone)]
pub enum QuorumCount {
    ReadyCounter { key: String },
    /// Sum of `ZCARD` over the service's waiting sets.
    WaitingQueue { keys: Vec<String> },
}

impl QuorumCount {
    pub fn from_config(source: QuorumSource, keys: &RigKeys, event_ids: &[String]) -> Self {
        match source {
            QuorumSource::ReadyCounter => QuorumCount::ReadyCounter { key: keys.ready() },
            QuorumSource::WaitingQueue => QuorumCount::WaitingQueue {
                keys: event_ids.iter().map(|id| keys.waiting(id)).collect(),
            },
        }
    }

    async fn read(&self, store: &dyn CoordinationStore) -> Result<u64, StoreError> {
        match self {
            QuorumCount::ReadyCounter { key } => Ok(store.get_u64(key).await?.unwrap_or(0)),
            QuorumCount::WaitingQueue { keys } => {
                let mut total = 0;
                for key in keys {
                    total += store.zcard(key).await?;
                }
                Ok(total)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarrierReport {
    pub phase: BarrierPhase,
    pub ready: u64,
    pub target: u64,
    pub waited_ms: u64,
    /// Epoch ms at which the release action completed.
    pub opened_at_ms: Option<i64>,
}

pub struct BarrierCoordinator {
    store: Arc<dyn CoordinationStore>,
    quorum: QuorumCount,
    target: u64,
    timeout: Duration,
    poll_interval: Duration,
    open_at_key: Option<String>,
    key_ttl: Duration,
    phase: Mutex<BarrierPhase>,
    stats: Option<Arc<StatsCollector>>,
}

impl BarrierCoordinator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        quorum: QuorumCount,
        target: u64,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            quorum,
            target,
            timeout,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            open_at_key: None,
            key_ttl: Duration::from_secs(3_600),
            phase: Mutex::new(BarrierPhase::WaitingForQuorum),
            stats: None,
        }
    }

    pub fn from_config(
        store: Arc<dyn CoordinationStore>,
        config: &BarrierConfig,
        keys: &RigKeys,
        event_ids: &[String],
        default_target: u64,
    ) -> Self {
        let mut coordinator = Self::new(
            store,
            QuorumCount::from_config(config.quorum, keys, event_ids),
            config.target.unwrap_or(default_target),
            Duration::from_millis(config.timeout_ms),
            Duration::from_millis(config.poll_interval_ms),
        );
        coordinator.key_ttl = Duration::from_secs(config.key_ttl_secs.max(1));
        if config.write_open_at {
            coordinator.open_at_key = Some(keys.open_at());
        }
        coordinator
    }

    pub fn with_stats(mut self, stats: Arc<StatsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn phase(&self) -> BarrierPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    fn set_phase(&self, next: BarrierPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Polls until `ready >= target`. Store errors are logged and polling
    /// continues; only the deadline ends the wait unsuccessfully.
    pub async fn await_quorum(&self) -> Result<u64, RunError> {
        let started = Instant::now();
        let mut last_ready = 0;
        let mut last_logged = 0;
        loop {
            match self.quorum.read(self.store.as_ref()).await {
                Ok(ready) => last_ready = ready,
                Err(e) => warn!("barrier quorum read failed: {e}"),
            }
            if last_ready >= self.target {
                let waited = started.elapsed();
                if let Some(stats) = &self.stats {
                    stats.observe(Trend::BarrierWait, waited);
                }
                info!(
                    ready = last_ready,
                    target = self.target,
                    waited_ms = waited.as_millis() as u64,
                    "barrier quorum reached"
                );
                return Ok(last_ready);
            }

            let waited = started.elapsed();
            if waited >= self.timeout {
                self.set_phase(BarrierPhase::TimedOut);
                warn!(ready = last_ready, target = self.target, "barrier timed out");
                return Err(RunError::BarrierTimeout {
                    ready: last_ready,
                    target: self.target,
                    waited,
                });
            }
            if last_ready != last_logged {
                info!(ready = last_ready, target = self.target, "waiting for quorum");
                last_logged = last_ready;
            }
            sleep(self.poll_interval.min(self.timeout - waited)).await;
        }
    }

    /// Fires `action` if no release has started yet. Returns `Ok(false)` when
    /// another caller already released (or the barrier timed out).
    pub async fn release(&self, action: &dyn ReleaseAction) -> Result<bool, RunError> {
        {
            let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
            if *phase != BarrierPhase::WaitingForQuorum {
                return Ok(false);
            }
            *phase = BarrierPhase::Releasing;
        }

        let result = action.release().await;
        self.set_phase(BarrierPhase::Released);
        result?;

        if let Some(key) = &self.open_at_key {
            let now_ms = chrono::Utc::now().timestamp_millis().to_string();
            if let Err(e) = self.store.set(key, &now_ms, Some(self.key_ttl)).await {
                warn!("failed to publish gate-open timestamp: {e}");
            }
        }
        Ok(true)
    }

    /// Quorum wait followed by the one-time release.
    pub async fn run(&self, action: &dyn ReleaseAction) -> Result<BarrierReport, RunError> {
        let started = Instant::now();
        let ready = self.await_quorum().await?;
        self.release(action).await?;
        Ok(BarrierReport {
            phase: self.phase(),
            ready,
            target: self.target,
            waited_ms: started.elapsed().as_millis() as u64,
            opened_at_ms: Some(chrono::Utc::now().timestamp_millis()),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    pub(crate) struct CountingAction {
        pub(crate) calls: AtomicU32,
    }

    impl ReleaseAction for CountingAction {
        fn release<'a>(
            &'a self,
        ) -> Pin<Box<dyn Future<Output = Result<(), RunError>> + Send + 'a>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    fn setup(target: u64, timeout_ms: u64) -> (Arc<MemoryStore>, Barrier, BarrierCoordinator) {
        let store = Arc::new(MemoryStore::new());
        let keys = RigKeys::new(&Default::default(), "test-run");
        let barrier = Barrier::new(store.clone(), &keys, Duration::from_secs(60));
        let config = BarrierConfig {
            timeout_ms,
            poll_interval_ms: 10,
            target: Some(target),
            ..Default::default()
        };
        let coordinator = BarrierCoordinator::from_config(store.clone(), &config, &keys, &[], 0);
        (store, barrier, coordinator)
    }

    #[tokio::test]
    async fn test_release_fires_once_at_quorum() {
        let (store, barrier, coordinator) = setup(5, 2_000);
        let action = CountingAction::default();

        for _ in 0..5 {
            barrier.signal_ready().await.unwrap();
        }
        let report = coordinator.run(&action).await.unwrap();
        assert_eq!(report.phase, BarrierPhase::Released);
        assert_eq!(report.ready, 5);
        assert_eq!(action.calls.load(Ordering::SeqCst), 1);

        // re-entry is a no-op
        assert!(!coordinator.release(&action).await.unwrap());
        assert_eq!(action.calls.load(Ordering::SeqCst), 1);
        assert!(store.get_u64("RIG:open_at:test-run").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_short_quorum_times_out_without_release() {
        let (_store, barrier, coordinator) = setup(5, 150);
        let action = CountingAction::default();

        for _ in 0..4 {
            barrier.signal_ready().await.unwrap();
        }
        let err = coordinator.run(&action).await.unwrap_err();
        assert!(matches!(
            err,
            RunError::BarrierTimeout {
                ready: 4,
                target: 5,
                ..
            }
        ));
        assert_eq!(coordinator.phase(), BarrierPhase::TimedOut);
        assert!(!coordinator.release(&action).await.unwrap());
        assert_eq!(action.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_quorum_reached_while_waiting() {
        let (_store, barrier, coordinator) = setup(3, 2_000);
        let coordinator = Arc::new(coordinator);
        let action = Arc::new(CountingAction::default());

        let handle = {
            let coordinator = coordinator.clone();
            let action = action.clone();
            tokio::spawn(async move { coordinator.run(action.as_ref()).await })
        };
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            barrier.signal_ready().await.unwrap();
        }
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.phase, BarrierPhase::Released);
        assert_eq!(action.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_release_calls_fire_once() {
        let (_store, _barrier, coordinator) = setup(0, 100);
        let coordinator = Arc::new(coordinator);
        let action = Arc::new(CountingAction::default());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let action = action.clone();
            handles.push(tokio::spawn(async move {
                coordinator.release(action.as_ref()).await.unwrap()
            }));
        }
        let mut fired = 0;
        for h in handles {
            if h.await.unwrap() {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
        assert_eq!(action.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiting_queue_count_sums_events() {
        let store = Arc::new(MemoryStore::new());
        let keys = RigKeys::new(&Default::default(), "r");
        store.seed_collection_len("WAITING:a", 2);
        store.seed_collection_len("WAITING:b", 3);
        let quorum = QuorumCount::from_config(
            QuorumSource::WaitingQueue,
            &keys,
            &["a".to_string(), "b".to_string()],
        );
        let coordinator = BarrierCoordinator::new(
            store,
            quorum,
            5,
            Duration::from_millis(500),
            Duration::from_millis(1),
        );
        assert_eq!(coordinator.await_quorum().await.unwrap(), 5);
    }
}

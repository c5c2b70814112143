use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{info, warn};

use crate::admin::{ensure_queues_empty, AdminClient, GateOpener, GateStatus, NoopRelease};
use crate::barrier::{Barrier, BarrierCoordinator, BarrierReport, ReleaseAction};
use crate::client::SessionClient;
use crate::config::{Config, QuorumSource};
use crate::error::RunError;
use crate::lifecycle::{run_session, SessionContext, SessionOutcome};
use crate::order::OrderTracker;
use crate::ramp::RampPlanner;
use crate::report::RunReport;
use crate::stats::{Counter, StatsCollector};
use crate::store::{CoordinationStore, RigKeys};

pub fn generate_run_id() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Converts an epoch-ms burst start into a point on the tokio clock.
fn burst_instant(burst_start_ms: i64) -> Instant {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let ahead = u64::try_from(burst_start_ms - now_ms).unwrap_or(0);
    Instant::now() + Duration::from_millis(ahead)
}

/// Triggers a global abort of a running driver.
#[derive(Clone)]
pub struct AbortHandle(Arc<watch::Sender<bool>>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.0.borrow()
    }
}

/// Outcome of a full setup, run and teardown cycle.
pub struct Execution {
    pub report: RunReport,
    /// Run-level failure; teardown already ran when this is set.
    pub error: Option<RunError>,
}

/// Owns the run: setup, session spawning, barrier coordination and
/// teardown.
pub struct LoadDriver {
    config: Config,
    run_id: String,
    keys: RigKeys,
    store: Arc<dyn CoordinationStore>,
    stats: Arc<StatsCollector>,
    tracker: Arc<OrderTracker>,
    admin: Option<Arc<AdminClient>>,
    abort: AbortHandle,
}

impl LoadDriver {
    pub fn new(config: Config, store: Arc<dyn CoordinationStore>) -> Result<Self, RunError> {
        config.validate()?;
        let run_id = config
            .scenario
            .run_id
            .clone()
            .unwrap_or_else(generate_run_id);
        let keys = RigKeys::new(&config.store, run_id.clone());
        let admin = if config.admin.manage_gates {
            Some(Arc::new(AdminClient::new(&config)?))
        } else {
            None
        };
        let (abort_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            run_id,
            keys,
            store,
            stats: Arc::new(StatsCollector::new()),
            tracker: Arc::new(OrderTracker::new()),
            admin,
            abort: AbortHandle(Arc::new(abort_tx)),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Precondition check, gate closing and burst scheduling. Returns the
    /// burst start as epoch ms.
    pub async fn setup(&self) -> Result<i64, RunError> {
        let events = &self.config.events.ids;
        if self.config.admin.require_empty_queue {
            ensure_queues_empty(self.store.as_ref(), &self.keys, events).await?;
        }

        // a reused run id must not inherit a previous count
        self.store.del(&self.keys.ready()).await?;
        self.store.del(&self.keys.open_at()).await?;

        if let Some(admin) = &self.admin {
            admin.login().await?;
            admin
                .set_gates(
                    events,
                    GateStatus::Closed,
                    Duration::from_millis(self.config.admin.status_change_pause_ms),
                )
                .await?;
            sleep(Duration::from_millis(self.config.admin.status_change_pause_ms)).await;
        }

        let burst_start_ms = self.config.scenario.burst_start_ms.unwrap_or_else(|| {
            chrono::Utc::now().timestamp_millis() + self.config.scenario.burst_offset_ms as i64
        });
        info!(
            run_id = %self.run_id,
            events = events.len(),
            burst_start_ms,
            "setup complete"
        );
        Ok(burst_start_ms)
    }

    /// Reopens every gate. Runs after success and failure alike.
    pub async fn teardown(&self) -> Result<(), RunError> {
        let Some(admin) = &self.admin else {
            return Ok(());
        };
        admin.login().await?;
        admin
            .set_gates(
                &self.config.events.ids,
                GateStatus::Open,
                Duration::from_millis(self.config.admin.status_change_pause_ms),
            )
            .await?;
        info!(run_id = %self.run_id, "teardown complete, gates reopened");
        Ok(())
    }

    pub fn coordinator(&self) -> BarrierCoordinator {
        BarrierCoordinator::from_config(
            self.store.clone(),
            &self.config.barrier,
            &self.keys,
            &self.config.events.ids,
            RampPlanner::new(&self.config.load).reached(),
        )
        .with_stats(self.stats.clone())
    }

    pub fn release_action(&self) -> Box<dyn ReleaseAction> {
        match &self.admin {
            Some(admin) => Box::new(GateOpener::new(
                admin.clone(),
                self.config.events.ids.clone(),
                Duration::from_millis(self.config.admin.release_pause_ms),
            )),
            None => Box::new(NoopRelease),
        }
    }

    /// Waits for quorum and releases. Without a barrier the gates open at
    /// the burst start.
    pub async fn coordinate(&self, burst_start_ms: i64) -> Result<Option<BarrierReport>, RunError> {
        let action = self.release_action();
        let mut abort = self.abort.0.subscribe();
        let aborted = async move {
            while !*abort.borrow() {
                if abort.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };

        if !self.config.barrier.enabled {
            tokio::select! {
                _ = sleep_until(burst_instant(burst_start_ms)) => {}
                _ = aborted => return Err(RunError::Aborted),
            }
            action.release().await?;
            return Ok(None);
        }

        let coordinator = self.coordinator();
        let result = tokio::select! {
            result = coordinator.run(action.as_ref()) => result,
            _ = aborted => Err(RunError::Aborted),
        };
        match result {
            Ok(report) => Ok(Some(report)),
            Err(e) => {
                warn!(run_id = %self.run_id, "coordination failed: {e}");
                self.abort.abort();
                Err(e)
            }
        }
    }

    fn session_context(&self, burst_start_ms: i64) -> Result<SessionContext, RunError> {
        let client = SessionClient::new(&self.config, self.stats.clone(), self.tracker.clone())
            .map_err(|e| RunError::Precondition(format!("http client: {e}")))?;
        let barrier_cfg = &self.config.barrier;
        let barrier = (barrier_cfg.enabled && barrier_cfg.quorum == QuorumSource::ReadyCounter)
            .then(|| {
                Barrier::new(
                    self.store.clone(),
                    &self.keys,
                    Duration::from_secs(barrier_cfg.key_ttl_secs.max(1)),
                )
            });

        Ok(SessionContext {
            client,
            auth: self.config.auth.clone(),
            events: self.config.events.clone(),
            stats: self.stats.clone(),
            store: self.store.clone(),
            barrier,
            wait_for_promotion: self.config.promotion.wait_for_promotion,
            open_at_key: barrier_cfg.write_open_at.then(|| self.keys.open_at()),
            burst_start: burst_instant(burst_start_ms),
            abort: self.abort.0.subscribe(),
        })
    }

    /// Spawns this process's VUs per the load plan and waits for them.
    pub async fn run(&self, burst_start_ms: i64) -> Result<BTreeMap<SessionOutcome, u64>, RunError> {
        let ctx = Arc::new(self.session_context(burst_start_ms)?);
        let plan = RampPlanner::new(&self.config.load).plan(self.config.load.vu_ids());
        info!(
            run_id = %self.run_id,
            planned = plan.len(),
            shape = ?self.config.load.shape,
            mode = ?self.config.promotion.mode,
            "starting sessions"
        );

        let progress = self.spawn_progress();
        let semaphore = Arc::new(Semaphore::new(self.config.target.max_in_flight.max(1) as usize));
        let mut abort = self.abort.0.subscribe();
        let mut sessions = JoinSet::new();

        for start in plan {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = abort.wait_for(|aborted| *aborted) => break,
            };
            let ctx = ctx.clone();
            sessions.spawn(async move {
                let outcome = run_session(ctx, start).await;
                drop(permit);
                outcome
            });
        }

        let mut outcomes = BTreeMap::new();
        {
            let drained = async {
                while let Some(joined) = sessions.join_next().await {
                    match joined {
                        Ok(outcome) => *outcomes.entry(outcome).or_insert(0u64) += 1,
                        Err(e) => warn!("session task failed: {e}"),
                    }
                }
            };
            tokio::pin!(drained);

            tokio::select! {
                _ = &mut drained => {}
                _ = abort.wait_for(|aborted| *aborted) => {
                    let grace = Duration::from_millis(self.config.admin.abort_grace_ms);
                    warn!(grace_ms = grace.as_millis() as u64, "abort requested, draining sessions");
                    if timeout(grace, &mut drained).await.is_err() {
                        warn!("grace period elapsed, cancelling remaining sessions");
                    }
                }
            }
        }
        sessions.abort_all();
        progress.abort();

        info!(run_id = %self.run_id, ?outcomes, "sessions finished");
        Ok(outcomes)
    }

    fn spawn_progress(&self) -> tokio::task::JoinHandle<()> {
        let stats = self.stats.clone();
        let tracker = self.tracker.clone();
        let every = Duration::from_millis(self.config.scenario.print_every_ms.max(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (entries, promotions) = tracker.counts().await;
                info!(
                    "Progress: sessions={} logins={} joins={} promotions={} entries={} timeouts={} conn_failures={} elapsed={}ms",
                    stats.get(Counter::TotalSessions),
                    stats.get(Counter::SuccessfulLogins),
                    stats.get(Counter::QueueJoins),
                    promotions,
                    entries,
                    stats.get(Counter::PromotionTimeouts),
                    stats.get(Counter::ConnectionFailures),
                    stats.elapsed_ms()
                );
            }
        })
    }

    pub async fn report(
        &self,
        worker_id: Option<String>,
        barrier: Option<BarrierReport>,
        error: Option<&RunError>,
    ) -> RunReport {
        RunReport::new(
            self.run_id.clone(),
            self.config.scenario.name.clone(),
            worker_id,
            self.stats.snapshot(),
            self.tracker.snapshot().await,
        )
        .with_barrier(barrier)
        .with_error(error.map(|e| e.to_string()))
    }

    /// Worker entry point: runs the VU slice against a burst start chosen by
    /// the controller. No setup, coordination or teardown.
    pub async fn run_slice(&self, burst_start_ms: i64, worker_id: &str) -> (RunReport, Option<RunError>) {
        let error = self.run(burst_start_ms).await.err();
        let error = error.or_else(|| self.abort.is_aborted().then_some(RunError::Aborted));
        let report = self
            .report(Some(worker_id.to_string()), None, error.as_ref())
            .await;
        (report, error)
    }

    /// Setup, sessions and coordination concurrently, then teardown. The
    /// first run-level failure is returned alongside the report.
    pub async fn execute(&self) -> Execution {
        let mut error = None;
        let mut barrier = None;

        match self.setup().await {
            Ok(burst_start_ms) => {
                let (sessions, coordination) =
                    tokio::join!(self.run(burst_start_ms), self.coordinate(burst_start_ms));
                match coordination {
                    Ok(report) => barrier = report,
                    Err(e) => error = Some(e),
                }
                if let Err(e) = sessions {
                    error.get_or_insert(e);
                }
            }
            Err(e) => {
                warn!("setup failed: {e}");
                error = Some(e);
            }
        }

        if let Err(e) = self.teardown().await {
            warn!("teardown failed: {e}");
            error.get_or_insert(e);
        }
        if error.is_none() && self.abort.is_aborted() {
            error = Some(RunError::Aborted);
        }

        let report = self.report(None, barrier, error.as_ref()).await;
        Execution { report, error }
    }
}

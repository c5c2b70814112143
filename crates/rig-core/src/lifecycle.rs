use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::barrier::Barrier;
use crate::client::SessionClient;
use crate::config::{AuthConfig, EventsConfig};
use crate::error::SessionError;
use crate::ramp::VuStart;
use crate::session::{Credentials, Session};
use crate::stats::{Counter, StatsCollector, Trend};
use crate::store::CoordinationStore;

/// How one session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Promoted,
    /// Joined without waiting for promotion.
    Joined,
    Retired,
    Aborted,
    Failed,
}

/// Everything a session task needs, shared by all sessions of a process.
pub struct SessionContext {
    pub client: SessionClient,
    pub auth: AuthConfig,
    pub events: EventsConfig,
    pub stats: Arc<StatsCollector>,
    pub store: Arc<dyn CoordinationStore>,
    /// Ready signal target; `None` when quorum is read from the service.
    pub barrier: Option<Barrier>,
    pub wait_for_promotion: bool,
    /// Key holding the gate-open timestamp (epoch ms).
    pub open_at_key: Option<String>,
    /// Burst start on the tokio clock; start and retire offsets are relative to it.
    pub burst_start: Instant,
    pub abort: watch::Receiver<bool>,
}

/// Bumps the counter matching a session-ending error. Login failures are
/// counted by the client's retry loop.
pub fn record_failure(stats: &StatsCollector, err: &SessionError) {
    match err {
        SessionError::PromotionTimeout(_) => stats.incr(Counter::PromotionTimeouts),
        SessionError::ConnectionClosed | SessionError::Connection(_) => {
            stats.incr(Counter::ConnectionFailures)
        }
        _ => {}
    }
}

async fn aborted(mut abort: watch::Receiver<bool>) {
    while !*abort.borrow() {
        if abort.changed().await.is_err() {
            // sender dropped without aborting
            std::future::pending::<()>().await;
        }
    }
}

async fn retire_deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Runs one VU from login to disconnect. Never fails: errors end the session
/// and are folded into counters.
pub async fn run_session(ctx: Arc<SessionContext>, start: VuStart) -> SessionOutcome {
    let scheduled = ctx.burst_start + Duration::from_millis(start.offset_ms);
    let retire_at = start
        .retire_at_ms
        .map(|ms| ctx.burst_start + Duration::from_millis(ms));

    tokio::select! {
        _ = sleep_until(scheduled) => {}
        _ = aborted(ctx.abort.clone()) => return SessionOutcome::Aborted,
    }
    ctx.stats
        .observe(Trend::StartDelay, Instant::now().saturating_duration_since(scheduled));
    ctx.stats.incr(Counter::TotalSessions);

    let credentials = Credentials::new(ctx.auth.email_for(start.vu_id), ctx.auth.password.clone());
    let mut session = Session::new(start.vu_id, credentials, ctx.events.event_for(start.vu_id));

    let outcome = drive(&ctx, &mut session, retire_at).await;
    ctx.client.disconnect(&mut session).await;
    debug!(vu = start.vu_id, ?outcome, state = ?session.state(), "session finished");
    outcome
}

async fn drive(
    ctx: &SessionContext,
    session: &mut Session,
    retire_at: Option<Instant>,
) -> SessionOutcome {
    let tokens = match ctx.client.login(&session.credentials).await {
        Ok(tokens) => tokens,
        Err(e) => {
            debug!(vu = session.id, "login failed: {e}");
            session.fail();
            return SessionOutcome::Failed;
        }
    };
    if let Err(e) = session.logged_in(tokens) {
        warn!(vu = session.id, "{e}");
        session.fail();
        return SessionOutcome::Failed;
    }

    let ack = match ctx.client.join_waiting_queue(session).await {
        Ok(ack) => ack,
        Err(e) => {
            warn!(vu = session.id, event = %session.event_id, "queue join failed: {e}");
            record_failure(&ctx.stats, &e);
            session.fail();
            return SessionOutcome::Failed;
        }
    };

    if let Some(barrier) = &ctx.barrier {
        if let Err(e) = barrier.signal_ready().await {
            warn!(vu = session.id, "ready signal failed: {e}");
        }
    }

    if !ctx.wait_for_promotion {
        return SessionOutcome::Joined;
    }

    let result = tokio::select! {
        result = ctx.client.await_promotion(session, ack) => result,
        _ = retire_deadline(retire_at) => {
            ctx.stats.incr(Counter::Retired);
            return SessionOutcome::Retired;
        }
        _ = aborted(ctx.abort.clone()) => return SessionOutcome::Aborted,
    };

    match result {
        Ok(_) => {
            record_open_to_promote(ctx).await;
            SessionOutcome::Promoted
        }
        Err(e) => {
            debug!(vu = session.id, "promotion wait failed: {e}");
            record_failure(&ctx.stats, &e);
            session.fail();
            SessionOutcome::Failed
        }
    }
}

async fn record_open_to_promote(ctx: &SessionContext) {
    let Some(key) = &ctx.open_at_key else {
        return;
    };
    match ctx.store.get(key).await {
        Ok(Some(value)) => {
            if let Ok(open_ms) = value.trim().parse::<i64>() {
                let now_ms = chrono::Utc::now().timestamp_millis();
                let delta = u64::try_from(now_ms - open_ms).unwrap_or(0);
                ctx.stats.observe(Trend::OpenToPromote, Duration::from_millis(delta));
            }
        }
        Ok(None) => {}
        Err(e) => debug!("open_at read failed: {e}"),
    }
}

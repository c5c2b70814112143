use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::barrier::ReleaseAction;
use crate::client::{authorize, classify_status, login_with_retry};
use crate::config::{Config, EndpointConfig};
use crate::error::{RunError, SessionError};
use crate::retry::{retry, RetryPolicy};
use crate::session::{AuthTokens, Credentials};
use crate::store::{CoordinationStore, RigKeys};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    Open,
    Closed,
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GateStatus::Open => "OPEN",
            GateStatus::Closed => "CLOSED",
        })
    }
}

/// Administrative calls against the service: admin login and event gate
/// status changes.
pub struct AdminClient {
    http: reqwest::Client,
    base_url: String,
    login_path: String,
    event_status_path: String,
    credentials: Credentials,
    login_timeout: Duration,
    request_timeout: Duration,
    retry: RetryPolicy,
    tokens: RwLock<Option<AuthTokens>>,
}

impl AdminClient {
    pub fn new(config: &Config) -> Result<Self, RunError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(RunError::admin)?;
        Ok(Self {
            http,
            base_url: config.target.base_url.trim_end_matches('/').to_string(),
            login_path: config.endpoints.login.clone(),
            event_status_path: config.endpoints.event_status.clone(),
            credentials: Credentials::new(
                config.auth.admin_email.clone(),
                config.auth.admin_password.clone(),
            ),
            login_timeout: Duration::from_millis(config.target.login_timeout_ms),
            request_timeout: Duration::from_millis(config.target.status_timeout_ms),
            retry: config.retry.admin.clone(),
            tokens: RwLock::new(None),
        })
    }

    /// Logs the admin in (with retry) and caches the tokens.
    pub async fn login(&self) -> Result<(), RunError> {
        let url = format!("{}{}", self.base_url, self.login_path);
        let tokens = login_with_retry(
            &self.http,
            &url,
            &self.credentials,
            self.login_timeout,
            &self.retry,
        )
        .await
        .map_err(|e| RunError::Admin(format!("admin login failed: {e}")))?;
        *self.tokens.write().await = Some(tokens);
        info!(email = %self.credentials.email, "admin logged in");
        Ok(())
    }

    async fn tokens(&self) -> Result<AuthTokens, RunError> {
        if let Some(tokens) = self.tokens.read().await.clone() {
            return Ok(tokens);
        }
        self.login().await?;
        self.tokens
            .read()
            .await
            .clone()
            .ok_or_else(|| RunError::Admin("admin tokens unavailable".into()))
    }

    async fn set_gate_once(
        &self,
        event_id: &str,
        status: GateStatus,
        tokens: &AuthTokens,
    ) -> Result<(), SessionError> {
        let url = format!(
            "{}{}",
            self.base_url,
            EndpointConfig::resolve(&self.event_status_path, event_id)
        );
        let request = self
            .http
            .patch(url)
            .query(&[("status", status.to_string())])
            .timeout(self.request_timeout);
        let response = authorize(request, tokens)
            .send()
            .await
            .map_err(SessionError::from_reqwest)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(classify_status(response.status(), "gate status"))
        }
    }

    /// Sets one event's gate, retrying transient failures.
    pub async fn set_gate(&self, event_id: &str, status: GateStatus) -> Result<(), RunError> {
        let tokens = self.tokens().await?;
        let tokens = &tokens;
        retry(
            &self.retry,
            |_| self.set_gate_once(event_id, status, tokens),
            |attempt, err| warn!(event_id, attempt, "gate change retry: {err}"),
        )
        .await
        .into_result("gate status")
        .map_err(|e| RunError::Admin(format!("set {event_id} to {status}: {e}")))?;
        info!(event_id, %status, "gate status changed");
        Ok(())
    }

    /// Applies `status` to every event with `pause` between changes.
    pub async fn set_gates(
        &self,
        event_ids: &[String],
        status: GateStatus,
        pause: Duration,
    ) -> Result<(), RunError> {
        for (i, event_id) in event_ids.iter().enumerate() {
            if i > 0 && !pause.is_zero() {
                sleep(pause).await;
            }
            self.set_gate(event_id, status).await?;
        }
        Ok(())
    }
}

/// Release action that opens every event gate.
pub struct GateOpener {
    admin: Arc<AdminClient>,
    event_ids: Vec<String>,
    pause: Duration,
}

impl GateOpener {
    pub fn new(admin: Arc<AdminClient>, event_ids: Vec<String>, pause: Duration) -> Self {
        Self {
            admin,
            event_ids,
            pause,
        }
    }
}

impl ReleaseAction for GateOpener {
    fn release<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), RunError>> + Send + 'a>> {
        Box::pin(async move {
            self.admin
                .set_gates(&self.event_ids, GateStatus::Open, self.pause)
                .await
        })
    }
}

/// Release action for runs without gate management.
pub struct NoopRelease;

impl ReleaseAction for NoopRelease {
    fn release<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), RunError>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}

/// Fails when any waiting queue still holds entries from an earlier run.
pub async fn ensure_queues_empty(
    store: &dyn CoordinationStore,
    keys: &RigKeys,
    event_ids: &[String],
) -> Result<(), RunError> {
    for event_id in event_ids {
        let waiting = store.zcard(&keys.waiting(event_id)).await?;
        let user_ids = store.hlen(&keys.waiting_user_ids(event_id)).await?;
        if waiting > 0 || user_ids > 0 {
            return Err(RunError::Precondition(format!(
                "waiting queue for {event_id} is not empty ({waiting} queued, {user_ids} user ids)"
            )));
        }
    }
    Ok(())
}

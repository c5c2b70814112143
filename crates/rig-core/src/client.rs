use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, CACHE_CONTROL, COOKIE, SET_COOKIE};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::{Config, EndpointConfig, EntryPolicy, PromotionConfig, PromotionMode, RetryConfig};
use crate::detector::{PollDetector, PollStatus, PollStep, Promoted, StreamDetector, StreamEvent};
use crate::error::SessionError;
use crate::order::OrderTracker;
use crate::retry::{retry, RetryOutcome, RetryPolicy};
use crate::session::{AuthTokens, Credentials, Session, SessionState};
use crate::sse::SseDecoder;
use crate::stats::{Counter, StatsCollector, Trend};

const REFRESH_COOKIE: &str = "refreshToken";

/// Per-operation request timeouts.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub login: Duration,
    pub join: Duration,
    pub status: Duration,
    pub disconnect: Duration,
}

impl Timeouts {
    pub fn from_config(config: &Config) -> Self {
        let t = &config.target;
        Self {
            login: Duration::from_millis(t.login_timeout_ms),
            join: Duration::from_millis(t.join_timeout_ms),
            status: Duration::from_millis(t.status_timeout_ms),
            disconnect: Duration::from_millis(t.disconnect_timeout_ms),
        }
    }
}

/// Acknowledgement of a successful queue join.
#[derive(Debug)]
pub enum JoinAck {
    /// Poll mode: the join request returned 200.
    Accepted,
    /// Stream mode: the open event stream, handed to the detector.
    Stream(reqwest::Response),
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// Maps a non-success status onto the retry taxonomy.
pub(crate) fn classify_status(status: StatusCode, context: &str) -> SessionError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SessionError::Transient(format!("{context}: HTTP {status}"))
    } else {
        SessionError::Auth(format!("{context}: HTTP {status}"))
    }
}

fn strip_bearer(value: &str) -> &str {
    let trimmed = value.trim();
    trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))
        .unwrap_or(trimmed)
        .trim()
}

fn refresh_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| name.trim() == REFRESH_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// One login round trip. Shared by sessions and the admin client.
pub(crate) async fn login_once(
    http: &reqwest::Client,
    url: &str,
    credentials: &Credentials,
    request_timeout: Duration,
) -> Result<AuthTokens, SessionError> {
    let response = http
        .post(url)
        .timeout(request_timeout)
        .json(&LoginRequest {
            email: &credentials.email,
            password: &credentials.password,
        })
        .send()
        .await
        .map_err(SessionError::from_reqwest)?;

    let status = response.status();
    if !status.is_success() {
        return Err(classify_status(status, "login"));
    }

    let headers = response.headers();
    let access_token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(strip_bearer)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| SessionError::Auth("login response missing Authorization header".into()))?;
    let refresh_token = refresh_cookie(headers)
        .ok_or_else(|| SessionError::Auth("login response missing refreshToken cookie".into()))?;

    Ok(AuthTokens {
        access_token,
        refresh_token,
    })
}

pub(crate) fn authorize(builder: RequestBuilder, tokens: &AuthTokens) -> RequestBuilder {
    builder
        .header(AUTHORIZATION, format!("Bearer {}", tokens.access_token))
        .header(COOKIE, format!("{REFRESH_COOKIE}={}", tokens.refresh_token))
}

/// HTTP side of a virtual user: login, join, promotion wait and disconnect,
/// each wrapped in the configured retry policy and timeouts.
pub struct SessionClient {
    http: reqwest::Client,
    base_url: String,
    broker_url: String,
    endpoints: EndpointConfig,
    timeouts: Timeouts,
    retry: RetryConfig,
    promotion: PromotionConfig,
    /// Held across the entry append and the join call under the serialized policy.
    turnstile: Option<Mutex<()>>,
    stats: Arc<StatsCollector>,
    tracker: Arc<OrderTracker>,
}

impl SessionClient {
    pub fn new(
        config: &Config,
        stats: Arc<StatsCollector>,
        tracker: Arc<OrderTracker>,
    ) -> Result<Self, SessionError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(config.target.max_in_flight as usize)
            .build()
            .map_err(|e| SessionError::Connection(e.to_string()))?;
        Ok(Self::with_http(http, config, stats, tracker))
    }

    pub fn with_http(
        http: reqwest::Client,
        config: &Config,
        stats: Arc<StatsCollector>,
        tracker: Arc<OrderTracker>,
    ) -> Self {
        let turnstile = match config.load.entry_policy {
            EntryPolicy::Serialized => Some(Mutex::new(())),
            EntryPolicy::Concurrent => None,
        };
        Self {
            http,
            base_url: config.target.base_url.trim_end_matches('/').to_string(),
            broker_url: config.broker_base_url().trim_end_matches('/').to_string(),
            endpoints: config.endpoints.clone(),
            timeouts: Timeouts::from_config(config),
            retry: config.retry.clone(),
            promotion: config.promotion.clone(),
            turnstile,
            stats,
            tracker,
        }
    }

    fn broker(&self, template: &str, event_id: &str) -> String {
        format!(
            "{}{}",
            self.broker_url,
            EndpointConfig::resolve(template, event_id)
        )
    }

    /// Logs in with retry. Malformed credentials fail without a request.
    pub async fn login(&self, credentials: &Credentials) -> Result<AuthTokens, SessionError> {
        credentials.validate()?;
        let url = format!("{}{}", self.base_url, self.endpoints.login);
        let url = url.as_str();

        let outcome = retry(
            &self.retry.login,
            |_| async move {
                let started = Instant::now();
                let result = login_once(&self.http, url, credentials, self.timeouts.login).await;
                if result.is_ok() {
                    self.stats.observe(Trend::Login, started.elapsed());
                }
                result
            },
            |attempt, err| {
                self.stats.incr(Counter::LoginFailures);
                debug!(email = %credentials.email, attempt, "login retry: {err}");
            },
        )
        .await;

        match outcome {
            RetryOutcome::Success { value, .. } => {
                self.stats.incr(Counter::SuccessfulLogins);
                Ok(value)
            }
            RetryOutcome::Fatal { error, .. } => {
                self.stats.incr(Counter::LoginFinalFailures);
                Err(error)
            }
            exhausted @ RetryOutcome::Exhausted { .. } => {
                self.stats.incr(Counter::LoginFailures);
                self.stats.incr(Counter::LoginFinalFailures);
                exhausted.into_result("login")
            }
        }
    }

    async fn join_once(&self, event_id: &str, tokens: &AuthTokens) -> Result<JoinAck, SessionError> {
        let request = match self.promotion.mode {
            PromotionMode::Poll => self
                .http
                .get(self.broker(&self.endpoints.poll_join, event_id))
                .timeout(self.timeouts.join),
            // The stream stays open for the whole wait; only connection setup
            // is bounded here.
            PromotionMode::Stream => self
                .http
                .get(self.broker(&self.endpoints.stream_join, event_id))
                .header(ACCEPT, "text/event-stream")
                .header(CACHE_CONTROL, "no-cache"),
        };

        let send = authorize(request, tokens).send();
        let response = match self.promotion.mode {
            PromotionMode::Poll => send.await,
            PromotionMode::Stream => timeout(self.timeouts.join, send)
                .await
                .map_err(|_| SessionError::Transient("queue join timed out".into()))?,
        }
        .map_err(SessionError::from_reqwest)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(classify_status(status, "queue join"));
        }
        if status != StatusCode::OK {
            return Err(SessionError::QueueJoin(format!("HTTP {status}")));
        }
        Ok(match self.promotion.mode {
            PromotionMode::Poll => JoinAck::Accepted,
            PromotionMode::Stream => JoinAck::Stream(response),
        })
    }

    /// Records the entry, then joins the waiting queue with retry. A retried
    /// join never appends a second entry.
    pub async fn join_waiting_queue(&self, session: &mut Session) -> Result<JoinAck, SessionError> {
        let tokens = session
            .tokens()
            .cloned()
            .ok_or_else(|| SessionError::QueueJoin("session has no tokens".into()))?;
        let event_id = session.event_id.clone();
        let session_id = session.id;

        let _turn = match &self.turnstile {
            Some(turnstile) => Some(turnstile.lock().await),
            None => None,
        };

        self.tracker.record_entry(session_id).await?;
        let started = Instant::now();
        session.mark_entry(started);

        let (event_ref, tokens_ref) = (event_id.as_str(), &tokens);
        let outcome = retry(
            &self.retry.join,
            |_| self.join_once(event_ref, tokens_ref),
            |attempt, err| debug!(session = session_id, attempt, "queue join retry: {err}"),
        )
        .await;

        match outcome.into_result("queue join") {
            Ok(ack) => {
                self.stats.incr(Counter::QueueJoins);
                self.stats.observe(Trend::QueueJoin, started.elapsed());
                session.advance(SessionState::Waiting)?;
                Ok(ack)
            }
            Err(e) => {
                self.stats.incr(Counter::QueueJoinFailures);
                Err(e)
            }
        }
    }

    /// Waits for the promotion, bounded by `max_wait_ms`, and records it in
    /// the order tracker.
    pub async fn await_promotion(
        &self,
        session: &mut Session,
        ack: JoinAck,
    ) -> Result<Promoted, SessionError> {
        let max_wait = Duration::from_millis(self.promotion.max_wait_ms);
        let detection = match ack {
            JoinAck::Accepted => timeout(max_wait, self.poll_until_promoted(session)).await,
            JoinAck::Stream(response) => {
                timeout(max_wait, self.stream_until_promoted(session.id, response)).await
            }
        };
        let promoted = match detection {
            Ok(result) => result?,
            Err(_) => return Err(SessionError::PromotionTimeout(max_wait)),
        };

        if session.mark_promoted(promoted.at)? {
            self.tracker.record_promotion(session.id).await?;
            self.stats.incr(Counter::Promotions);
            if promoted.entry_token.is_some() {
                self.stats.incr(Counter::EntryTokens);
            }
            if let Some(wait) = session.wait_time() {
                self.stats.observe(Trend::PromotionWait, wait);
            }
        }
        Ok(promoted)
    }

    async fn fetch_status(&self, event_id: &str, tokens: &AuthTokens) -> Option<PollStatus> {
        self.stats.incr(Counter::PollingRequests);
        let started = Instant::now();
        let request = self
            .http
            .get(self.broker(&self.endpoints.poll_status, event_id))
            .timeout(self.timeouts.status);

        let result = async {
            let response = authorize(request, tokens).send().await.ok()?;
            if response.status() != StatusCode::OK {
                return None;
            }
            let body = response.bytes().await.ok()?;
            PollStatus::from_body(&body)
        }
        .await;

        self.stats.observe(Trend::StatusFetch, started.elapsed());
        if result.is_none() {
            self.stats.incr(Counter::PollingFailures);
        }
        result
    }

    async fn poll_until_promoted(&self, session: &Session) -> Result<Promoted, SessionError> {
        let tokens = session
            .tokens()
            .ok_or_else(|| SessionError::Connection("session has no tokens".into()))?;
        let mut detector = PollDetector::new(&self.promotion);
        loop {
            let wait = match self.fetch_status(&session.event_id, tokens).await {
                Some(status) => match detector.observe(&status) {
                    PollStep::Promoted { entry_token } => {
                        return Ok(Promoted {
                            session_id: session.id,
                            at: Instant::now(),
                            entry_token: Some(entry_token),
                        })
                    }
                    PollStep::Wait(wait) => wait,
                },
                None => detector.on_failure(),
            };
            sleep(wait).await;
        }
    }

    async fn stream_until_promoted(
        &self,
        session_id: u64,
        response: reqwest::Response,
    ) -> Result<Promoted, SessionError> {
        let mut decoder = SseDecoder::new();
        let mut detector = StreamDetector::from_config(&self.promotion);
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| SessionError::Connection(e.to_string()))?;
            for frame in decoder.push(&chunk) {
                match detector.observe(&frame) {
                    StreamEvent::Promoted => {
                        return Ok(Promoted {
                            session_id,
                            at: Instant::now(),
                            entry_token: None,
                        })
                    }
                    StreamEvent::Status(status) => {
                        debug!(session = session_id, %status, "queue status")
                    }
                    StreamEvent::Heartbeat | StreamEvent::Ignored => {}
                }
            }
        }
        Err(SessionError::ConnectionClosed)
    }

    /// Best-effort disconnect. Runs at most once per logged-in session;
    /// failures are counted and logged, never returned.
    pub async fn disconnect(&self, session: &mut Session) {
        let Some(tokens) = session.tokens().cloned() else {
            return;
        };
        if !session.claim_disconnect() {
            return;
        }

        let (method, template) = match self.promotion.mode {
            PromotionMode::Poll => (Method::DELETE, &self.endpoints.poll_disconnect),
            PromotionMode::Stream => (Method::POST, &self.endpoints.stream_disconnect),
        };
        let request = self
            .http
            .request(method, self.broker(template, &session.event_id))
            .timeout(self.timeouts.disconnect);

        match authorize(request, &tokens).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                self.stats.incr(Counter::DisconnectFailures);
                warn!(session = session.id, status = %response.status(), "disconnect rejected");
            }
            Err(e) => {
                self.stats.incr(Counter::DisconnectFailures);
                warn!(session = session.id, "disconnect failed: {e}");
            }
        }
        session.mark_disconnected();
    }
}

/// Credentials-only retry used by callers outside a session (admin login).
pub(crate) async fn login_with_retry(
    http: &reqwest::Client,
    url: &str,
    credentials: &Credentials,
    request_timeout: Duration,
    policy: &RetryPolicy,
) -> Result<AuthTokens, SessionError> {
    credentials.validate()?;
    retry(
        policy,
        |_| login_once(http, url, credentials, request_timeout),
        |attempt, err| warn!(attempt, "admin login retry: {err}"),
    )
    .await
    .into_result("admin login")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::MINIMAL;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) fn login_ok() -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("Authorization", "Bearer access-1")
            .insert_header("Set-Cookie", "refreshToken=refresh-1; Path=/; HttpOnly")
    }

    pub(crate) fn test_config(base_url: &str) -> Config {
        let mut config = Config::from_toml(MINIMAL).unwrap();
        config.target.base_url = format!("{base_url}/api/v1");
        config.retry.login = RetryPolicy::fixed(3, 0);
        config.retry.join = RetryPolicy::fixed(3, 0);
        config.promotion.min_poll_after_ms = 10;
        config.promotion.max_poll_after_ms = 20;
        config
    }

    fn client(config: &Config) -> (SessionClient, Arc<StatsCollector>, Arc<OrderTracker>) {
        let stats = Arc::new(StatsCollector::new());
        let tracker = Arc::new(OrderTracker::new());
        let client = SessionClient::new(config, stats.clone(), tracker.clone()).unwrap();
        (client, stats, tracker)
    }

    fn logged_in_session(id: u64, event: &str) -> Session {
        session_with_token(id, event, "access-1")
    }

    fn session_with_token(id: u64, event: &str, access_token: &str) -> Session {
        let mut session = Session::new(id, Credentials::new(format!("user{id}@example.com"), "pw"), event);
        session
            .logged_in(AuthTokens {
                access_token: access_token.into(),
                refresh_token: "refresh-1".into(),
            })
            .unwrap();
        session
    }

    /// Joins sessions `1..=n` concurrently, each with its own access token.
    async fn join_all(client: Arc<SessionClient>, n: u64) {
        let mut joins = tokio::task::JoinSet::new();
        for id in 1..=n {
            let client = client.clone();
            joins.spawn(async move {
                let mut session = session_with_token(id, "evt-a", &format!("access-{id}"));
                client.join_waiting_queue(&mut session).await.unwrap();
            });
        }
        while let Some(joined) = joins.join_next().await {
            joined.unwrap();
        }
    }

    #[tokio::test]
    async fn test_login_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/auth/login"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/auth/login"))
            .and(body_json(serde_json::json!({
                "email": "user1@example.com",
                "password": "pw"
            })))
            .respond_with(login_ok())
            .expect(1)
            .mount(&server)
            .await;

        let config = test_config(&server.uri());
        let (client, stats, _) = client(&config);
        let tokens = client
            .login(&Credentials::new("user1@example.com", "pw"))
            .await
            .unwrap();

        assert_eq!(tokens.access_token, "access-1");
        assert_eq!(tokens.refresh_token, "refresh-1");
        assert_eq!(stats.get(Counter::LoginFailures), 1);
        assert_eq!(stats.get(Counter::SuccessfulLogins), 1);
        assert_eq!(stats.get(Counter::LoginFinalFailures), 0);
    }

    #[tokio::test]
    async fn test_login_unauthorized_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/auth/login"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let config = test_config(&server.uri());
        let (client, stats, _) = client(&config);
        let err = client
            .login(&Credentials::new("user1@example.com", "pw"))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Auth(_)));
        assert_eq!(stats.get(Counter::LoginFailures), 0);
        assert_eq!(stats.get(Counter::LoginFinalFailures), 1);
    }

    #[tokio::test]
    async fn test_login_missing_cookie_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/auth/login"))
            .respond_with(ResponseTemplate::new(200).insert_header("Authorization", "Bearer a"))
            .expect(1)
            .mount(&server)
            .await;

        let config = test_config(&server.uri());
        let (client, _, _) = client(&config);
        let err = client
            .login(&Credentials::new("user1@example.com", "pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Auth(_)));
    }

    #[tokio::test]
    async fn test_login_exhaustion_counts_final_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/auth/login"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let config = test_config(&server.uri());
        let (client, stats, _) = client(&config);
        let err = client
            .login(&Credentials::new("user1@example.com", "pw"))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Exhausted { attempts: 3, .. }));
        assert_eq!(stats.get(Counter::LoginFailures), 3);
        assert_eq!(stats.get(Counter::LoginFinalFailures), 1);
    }

    #[tokio::test]
    async fn test_malformed_credentials_make_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(login_ok())
            .expect(0)
            .mount(&server)
            .await;

        let config = test_config(&server.uri());
        let (client, _, _) = client(&config);
        let err = client
            .login(&Credentials::new("no-at-sign", "pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::MalformedCredentials(_)));
    }

    #[tokio::test]
    async fn test_join_records_entry_once_across_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/broker/polling/events/evt-a/waiting"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/broker/polling/events/evt-a/waiting"))
            .and(header("Authorization", "Bearer access-1"))
            .and(header("Cookie", "refreshToken=refresh-1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let config = test_config(&server.uri());
        let (client, stats, tracker) = client(&config);
        let mut session = logged_in_session(1, "evt-a");

        let ack = client.join_waiting_queue(&mut session).await.unwrap();
        assert!(matches!(ack, JoinAck::Accepted));
        assert_eq!(session.state(), SessionState::Waiting);
        assert_eq!(tracker.counts().await, (1, 0));
        assert_eq!(stats.get(Counter::QueueJoins), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_serialized_joins_reach_server_in_entry_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/broker/polling/events/evt-a/waiting"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(50)))
            .expect(5)
            .mount(&server)
            .await;

        let mut config = test_config(&server.uri());
        config.load.entry_policy = EntryPolicy::Serialized;
        let (client, stats, tracker) = client(&config);

        let started = Instant::now();
        join_all(Arc::new(client), 5).await;
        // one request in flight at a time
        assert!(started.elapsed() >= Duration::from_millis(250));

        let arrivals: Vec<u64> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| {
                let auth = r.headers.get("authorization").unwrap().to_str().unwrap();
                auth.trim_start_matches("Bearer access-").parse().unwrap()
            })
            .collect();
        assert_eq!(arrivals, tracker.snapshot().await.entry_order());
        assert_eq!(stats.get(Counter::QueueJoins), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_overlap() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/broker/polling/events/evt-a/waiting"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
            .expect(5)
            .mount(&server)
            .await;

        let mut config = test_config(&server.uri());
        config.load.entry_policy = EntryPolicy::Concurrent;
        let (client, stats, tracker) = client(&config);

        let started = Instant::now();
        join_all(Arc::new(client), 5).await;
        assert!(started.elapsed() < Duration::from_millis(1_200));

        let mut entered = tracker.snapshot().await.entry_order();
        entered.sort_unstable();
        assert_eq!(entered, vec![1, 2, 3, 4, 5]);
        assert_eq!(stats.get(Counter::QueueJoins), 5);
    }

    #[tokio::test]
    async fn test_join_rejection_keeps_entry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/broker/polling/events/evt-a/waiting"))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&server)
            .await;

        let config = test_config(&server.uri());
        let (client, stats, tracker) = client(&config);
        let mut session = logged_in_session(1, "evt-a");

        let err = client.join_waiting_queue(&mut session).await.unwrap_err();
        assert!(matches!(err, SessionError::QueueJoin(_)));
        assert_eq!(tracker.counts().await, (1, 0));
        assert_eq!(stats.get(Counter::QueueJoinFailures), 1);
    }

    #[tokio::test]
    async fn test_poll_promotion() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/broker/polling/events/evt-a/waiting"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/broker/polling/events/evt-a/current"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"state": "WAITING", "rank": 1, "pollAfterMs": 5}
            })))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/broker/polling/events/evt-a/current"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"state": "ENTRY", "rank": 0, "entryAuthToken": "entry-1", "pollAfterMs": 5}
            })))
            .mount(&server)
            .await;

        let config = test_config(&server.uri());
        let (client, stats, tracker) = client(&config);
        let mut session = logged_in_session(1, "evt-a");

        let ack = client.join_waiting_queue(&mut session).await.unwrap();
        let promoted = client.await_promotion(&mut session, ack).await.unwrap();

        assert_eq!(promoted.entry_token.as_deref(), Some("entry-1"));
        assert_eq!(session.state(), SessionState::Promoted);
        assert!(session.promoted_at().unwrap() >= session.entry_at().unwrap());
        assert_eq!(stats.get(Counter::PollingRequests), 3);
        assert_eq!(stats.get(Counter::Promotions), 1);
        assert_eq!(stats.get(Counter::EntryTokens), 1);
        assert_eq!(tracker.counts().await, (1, 1));
    }

    #[tokio::test]
    async fn test_poll_times_out_against_waiting_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/broker/polling/events/evt-a/waiting"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/broker/polling/events/evt-a/current"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                // the hint is far beyond the wait budget
                "data": {"state": "WAITING", "rank": 10, "pollAfterMs": 60000}
            })))
            .mount(&server)
            .await;

        let mut config = test_config(&server.uri());
        config.promotion.max_wait_ms = 300;
        config.promotion.max_poll_after_ms = 0;
        let (client, _, tracker) = client(&config);
        let mut session = logged_in_session(1, "evt-a");

        let started = Instant::now();
        let ack = client.join_waiting_queue(&mut session).await.unwrap();
        let err = client.await_promotion(&mut session, ack).await.unwrap_err();

        assert!(matches!(err, SessionError::PromotionTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(tracker.counts().await, (1, 0));
    }

    #[tokio::test]
    async fn test_poll_failures_are_counted_and_polling_continues() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/broker/polling/events/evt-a/waiting"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/broker/polling/events/evt-a/current"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/broker/polling/events/evt-a/current"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"state": "ENTRY", "entryAuthToken": "t"}
            })))
            .mount(&server)
            .await;

        let config = test_config(&server.uri());
        let (client, stats, _) = client(&config);
        let mut session = logged_in_session(1, "evt-a");
        let ack = client.join_waiting_queue(&mut session).await.unwrap();
        client.await_promotion(&mut session, ack).await.unwrap();

        assert_eq!(stats.get(Counter::PollingFailures), 1);
        assert_eq!(stats.get(Counter::PollingRequests), 2);
    }

    #[tokio::test]
    async fn test_stream_promotion_from_second_frame() {
        let server = MockServer::start().await;
        let body = "event: update\ndata: {\"status\":\"WAITING\"}\n\ndata: {\"status\":\"IN_ENTRY\"}\n\n";
        Mock::given(method("GET"))
            .and(path("/api/v1/broker/events/evt-a/tickets/waiting"))
            .and(header("Accept", "text/event-stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let mut config = test_config(&server.uri());
        config.promotion.mode = PromotionMode::Stream;
        let (client, stats, tracker) = client(&config);
        let mut session = logged_in_session(1, "evt-a");

        let ack = client.join_waiting_queue(&mut session).await.unwrap();
        assert!(matches!(ack, JoinAck::Stream(_)));
        let promoted = client.await_promotion(&mut session, ack).await.unwrap();

        assert_eq!(promoted.session_id, 1);
        assert_eq!(promoted.entry_token, None);
        assert_eq!(stats.get(Counter::Promotions), 1);
        assert_eq!(tracker.snapshot().await.promotion_order(), vec![1]);
    }

    #[tokio::test]
    async fn test_stream_closed_without_promotion() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/broker/events/evt-a/tickets/waiting"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("data: {\"status\":\"WAITING\"}\n\n: keep-alive\n\n"),
            )
            .mount(&server)
            .await;

        let mut config = test_config(&server.uri());
        config.promotion.mode = PromotionMode::Stream;
        let (client, _, tracker) = client(&config);
        let mut session = logged_in_session(1, "evt-a");

        let ack = client.join_waiting_queue(&mut session).await.unwrap();
        let err = client.await_promotion(&mut session, ack).await.unwrap_err();
        assert!(matches!(err, SessionError::ConnectionClosed));
        assert_eq!(tracker.counts().await, (1, 0));
    }

    #[tokio::test]
    async fn test_disconnect_twice_counts_at_most_once() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/broker/polling/events/evt-a/waiting"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let config = test_config(&server.uri());
        let (client, stats, _) = client(&config);
        let mut session = logged_in_session(1, "evt-a");

        client.disconnect(&mut session).await;
        client.disconnect(&mut session).await;

        assert_eq!(stats.get(Counter::DisconnectFailures), 1);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_without_tokens_is_noop() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let config = test_config(&server.uri());
        let (client, stats, _) = client(&config);
        let mut session = Session::new(1, Credentials::new("user1@example.com", "pw"), "evt-a");
        client.disconnect(&mut session).await;
        assert_eq!(stats.get(Counter::DisconnectFailures), 0);
        assert_eq!(session.state(), SessionState::Init);
    }

    #[test]
    fn test_bearer_prefix_is_normalised() {
        assert_eq!(strip_bearer("Bearer abc"), "abc");
        assert_eq!(strip_bearer("abc"), "abc");
        assert_eq!(strip_bearer(" bearer  abc "), "abc");
    }
}

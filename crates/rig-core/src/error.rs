use std::time::Duration;
use thiserror::Error;

/// Failures that end a single session. They are converted into counters at the
/// session boundary and never abort the run.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed credentials: {0}")]
    MalformedCredentials(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transient network error: {0}")]
    Transient(String),

    #[error("queue join rejected: {0}")]
    QueueJoin(String),

    #[error("promotion not observed within {0:?}")]
    PromotionTimeout(Duration),

    #[error("event stream closed before promotion")]
    ConnectionClosed,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("{operation} gave up after {attempts} attempts: {last}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        last: Box<SessionError>,
    },

    #[error("session retired by the load plan")]
    Retired,

    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::session::SessionState,
        to: crate::session::SessionState,
    },

    #[error(transparent)]
    Order(#[from] OrderError),
}

impl SessionError {
    /// Whether another attempt of the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SessionError::Transient(_))
    }

    /// Maps a reqwest failure onto the session taxonomy.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            SessionError::Transient(err.to_string())
        } else {
            SessionError::Connection(err.to_string())
        }
    }
}

/// Order tracker misuse. Recording these keeps `|promotions| <= |entries|`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrderError {
    #[error("session {0} already has an entry record")]
    DuplicateEntry(u64),

    #[error("session {0} already has a promotion record")]
    DuplicatePromotion(u64),

    #[error("session {0} was promoted without an entry record")]
    NotEntered(u64),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("value at {key} is not an integer: {value}")]
    NotAnInteger { key: String, value: String },

    #[error("store not configured: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failures that end the whole run. Teardown still executes before these
/// reach the caller.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("barrier timed out after {waited:?} with {ready}/{target} sessions ready")]
    BarrierTimeout {
        ready: u64,
        target: u64,
        waited: Duration,
    },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("admin action failed: {0}")]
    Admin(String),

    #[error("run aborted")]
    Aborted,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RunError {
    pub fn admin(err: impl std::fmt::Display) -> Self {
        RunError::Admin(err.to_string())
    }
}

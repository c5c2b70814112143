//! Promotion detection for one session.
//!
//! Both strategies are plain state machines fed by the caller. The HTTP
//! loops that drive them live in [`crate::client`].

use serde::Deserialize;
use std::time::{Duration, Instant};

use crate::config::PromotionConfig;
use crate::sse::{SseFrame, SsePayload};

/// Hint used when a poll response is missing or unusable.
pub const FALLBACK_POLL_AFTER_MS: u64 = 1_000;

/// The logical event both strategies produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promoted {
    pub session_id: u64,
    pub at: Instant,
    /// Entry token handed out on promotion (poll mode only).
    pub entry_token: Option<String>,
}

/// `data` object of a poll status response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollStatus {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub rank: Option<i64>,
    #[serde(default)]
    pub entry_auth_token: Option<String>,
    #[serde(default)]
    pub poll_after_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PollEnvelope {
    data: Option<PollStatus>,
}

impl PollStatus {
    /// Parses `{"data": {...}}`. `None` when the body is not that shape.
    pub fn from_body(body: &[u8]) -> Option<Self> {
        serde_json::from_slice::<PollEnvelope>(body).ok()?.data
    }
}

/// Next move of the poll loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep {
    Promoted { entry_token: String },
    Wait(Duration),
}

#[derive(Debug, Clone)]
pub struct PollDetector {
    promoted_state: String,
    min_poll_after_ms: u64,
    max_poll_after_ms: u64,
    promoted: bool,
}

impl PollDetector {
    pub fn new(config: &PromotionConfig) -> Self {
        Self {
            promoted_state: config.poll_promoted_state.clone(),
            min_poll_after_ms: config.min_poll_after_ms,
            max_poll_after_ms: config.max_poll_after_ms,
            promoted: false,
        }
    }

    pub fn clamp_poll_after(&self, hint_ms: u64) -> Duration {
        let mut ms = hint_ms.max(self.min_poll_after_ms);
        if self.max_poll_after_ms > 0 {
            ms = ms.min(self.max_poll_after_ms);
        }
        Duration::from_millis(ms)
    }

    /// Feeds one status response. A promotion is reported once; after that
    /// every observation is a plain wait.
    pub fn observe(&mut self, status: &PollStatus) -> PollStep {
        if !self.promoted && status.state.as_deref() == Some(self.promoted_state.as_str()) {
            if let Some(token) = status.entry_auth_token.as_deref().filter(|t| !t.is_empty()) {
                self.promoted = true;
                return PollStep::Promoted {
                    entry_token: token.to_string(),
                };
            }
        }
        PollStep::Wait(self.clamp_poll_after(status.poll_after_ms.unwrap_or(FALLBACK_POLL_AFTER_MS)))
    }

    /// Wait to use after a failed fetch or an unparseable body.
    pub fn on_failure(&self) -> Duration {
        self.clamp_poll_after(FALLBACK_POLL_AFTER_MS)
    }

    pub fn is_promoted(&self) -> bool {
        self.promoted
    }
}

/// What one frame meant for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Heartbeat,
    Status(String),
    Promoted,
    /// Text frames, JSON without a status, and anything after promotion.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct StreamDetector {
    promoted_statuses: Vec<String>,
    promoted: bool,
    frames: u64,
}

impl StreamDetector {
    pub fn new(promoted_statuses: Vec<String>) -> Self {
        Self {
            promoted_statuses,
            promoted: false,
            frames: 0,
        }
    }

    pub fn from_config(config: &PromotionConfig) -> Self {
        Self::new(config.promoted_statuses.clone())
    }

    pub fn observe(&mut self, frame: &SseFrame) -> StreamEvent {
        self.frames += 1;
        let value = match frame.payload() {
            SsePayload::Heartbeat => return StreamEvent::Heartbeat,
            SsePayload::Text(_) => return StreamEvent::Ignored,
            SsePayload::Json(value) => value,
        };
        let Some(status) = value.get("status").and_then(|s| s.as_str()) else {
            return StreamEvent::Ignored;
        };
        if self.promoted {
            return StreamEvent::Ignored;
        }
        if self.promoted_statuses.iter().any(|s| s == status) {
            self.promoted = true;
            return StreamEvent::Promoted;
        }
        StreamEvent::Status(status.to_string())
    }

    pub fn is_promoted(&self) -> bool {
        self.promoted
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames
    }
}

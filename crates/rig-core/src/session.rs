use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::SessionError;

/// Lifecycle of one virtual user. Variants are declared in progress order;
/// `Failed` is terminal and reachable from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Init,
    LoggedIn,
    Waiting,
    Promoted,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }

    /// Input checks that make a login attempt pointless.
    pub fn validate(&self) -> Result<(), SessionError> {
        let email = self.email.trim();
        if email.is_empty() || !email.contains('@') || email.starts_with('@') || email.ends_with('@')
        {
            return Err(SessionError::MalformedCredentials(format!(
                "invalid email {:?}",
                self.email
            )));
        }
        if self.password.is_empty() {
            return Err(SessionError::MalformedCredentials(format!(
                "empty password for {}",
                self.email
            )));
        }
        Ok(())
    }
}

/// Tokens returned by a successful login.
#[derive(Debug, Clone)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
}

/// One simulated user's run, exclusively owned by its lifecycle task.
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub credentials: Credentials,
    pub event_id: String,
    tokens: Option<AuthTokens>,
    state: SessionState,
    entry_at: Option<Instant>,
    promoted_at: Option<Instant>,
    disconnect_attempted: bool,
}

impl Session {
    pub fn new(id: u64, credentials: Credentials, event_id: impl Into<String>) -> Self {
        Self {
            id,
            credentials,
            event_id: event_id.into(),
            tokens: None,
            state: SessionState::Init,
            entry_at: None,
            promoted_at: None,
            disconnect_attempted: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn tokens(&self) -> Option<&AuthTokens> {
        self.tokens.as_ref()
    }

    pub fn entry_at(&self) -> Option<Instant> {
        self.entry_at
    }

    pub fn promoted_at(&self) -> Option<Instant> {
        self.promoted_at
    }

    /// Moves forward in the lifecycle. Going backwards, staying put, or
    /// leaving `Failed` is rejected.
    pub fn advance(&mut self, next: SessionState) -> Result<(), SessionError> {
        if self.state == SessionState::Failed || next <= self.state || next == SessionState::Failed {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn fail(&mut self) {
        self.state = SessionState::Failed;
    }

    pub fn logged_in(&mut self, tokens: AuthTokens) -> Result<(), SessionError> {
        self.advance(SessionState::LoggedIn)?;
        self.tokens = Some(tokens);
        Ok(())
    }

    /// Stamps the entry time when the join request is about to be issued.
    pub fn mark_entry(&mut self, at: Instant) {
        self.entry_at.get_or_insert(at);
    }

    /// Records the promotion; only the first call has an effect.
    pub fn mark_promoted(&mut self, at: Instant) -> Result<bool, SessionError> {
        if self.promoted_at.is_some() {
            return Ok(false);
        }
        self.advance(SessionState::Promoted)?;
        self.promoted_at = Some(at);
        Ok(true)
    }

    /// Claims the single disconnect attempt for this session.
    pub(crate) fn claim_disconnect(&mut self) -> bool {
        !std::mem::replace(&mut self.disconnect_attempted, true)
    }

    /// Disconnect finished; a failed session stays failed.
    pub(crate) fn mark_disconnected(&mut self) {
        if self.state != SessionState::Failed {
            self.state = SessionState::Disconnected;
        }
    }

    /// Time from queue entry to promotion, when both happened.
    pub fn wait_time(&self) -> Option<std::time::Duration> {
        match (self.entry_at, self.promoted_at) {
            (Some(entry), Some(promoted)) => Some(promoted.saturating_duration_since(entry)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(1, Credentials::new("user1@example.com", "pw"), "evt")
    }

    fn tokens() -> AuthTokens {
        AuthTokens {
            access_token: "a".into(),
            refresh_token: "r".into(),
        }
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let mut s = session();
        s.logged_in(tokens()).unwrap();
        s.advance(SessionState::Waiting).unwrap();
        assert!(s.advance(SessionState::LoggedIn).is_err());
        assert!(s.advance(SessionState::Waiting).is_err());
        s.advance(SessionState::Promoted).unwrap();
        s.mark_disconnected();
        assert_eq!(s.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut s = session();
        s.logged_in(tokens()).unwrap();
        s.fail();
        assert!(s.advance(SessionState::Waiting).is_err());
        s.mark_disconnected();
        assert_eq!(s.state(), SessionState::Failed);
    }

    #[test]
    fn test_promotion_is_recorded_once() {
        let mut s = session();
        s.logged_in(tokens()).unwrap();
        let entry = Instant::now();
        s.mark_entry(entry);
        s.advance(SessionState::Waiting).unwrap();
        let first = Instant::now();
        assert!(s.mark_promoted(first).unwrap());
        assert!(!s.mark_promoted(Instant::now()).unwrap());
        assert_eq!(s.promoted_at(), Some(first));
        assert!(s.promoted_at().unwrap() >= s.entry_at().unwrap());
    }

    #[test]
    fn test_disconnect_claimed_once() {
        let mut s = session();
        assert!(s.claim_disconnect());
        assert!(!s.claim_disconnect());
    }

    #[test]
    fn test_credentials_validation() {
        assert!(Credentials::new("user@example.com", "pw").validate().is_ok());
        assert!(Credentials::new("user.example.com", "pw").validate().is_err());
        assert!(Credentials::new("@example.com", "pw").validate().is_err());
        assert!(Credentials::new("user@example.com", "").validate().is_err());
        assert!(Credentials::new("", "pw").validate().is_err());
    }
}

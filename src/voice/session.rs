//! Single-use session tokens
//!
//! Every listening session mints a token at start. Any path that wants to
//! finalize the session (explicit stop, end-of-turn, connection close) must
//! present that token; the first presenter wins and the token is consumed.

use std::fmt;
use std::sync::Mutex;

use uuid::Uuid;

/// Identifier of one session; never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken(Uuid);

impl SessionToken {
    /// The id as handed to callers (`message_id`)
    #[must_use]
    pub fn id(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Holds the token of the currently live session, if any
#[derive(Debug, Default)]
pub struct SessionGuard {
    current: Mutex<Option<SessionToken>>,
}

impl SessionGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh token, replacing (and thereby invalidating) any live one
    pub fn mint(&self) -> SessionToken {
        let token = SessionToken(Uuid::new_v4());
        if let Ok(mut current) = self.current.lock() {
            *current = Some(token);
        }
        token
    }

    /// Consume the token; returns false if it was already consumed or replaced
    pub fn claim(&self, token: &SessionToken) -> bool {
        let Ok(mut current) = self.current.lock() else {
            return false;
        };
        if current.as_ref() == Some(token) {
            *current = None;
            true
        } else {
            false
        }
    }

    /// Whether `token` still names the live session
    #[must_use]
    pub fn is_current(&self, token: &SessionToken) -> bool {
        self.current
            .lock()
            .map(|current| current.as_ref() == Some(token))
            .unwrap_or(false)
    }

    /// The live token, if any
    #[must_use]
    pub fn current(&self) -> Option<SessionToken> {
        self.current.lock().ok().and_then(|current| *current)
    }

    /// Drop the live token without finalizing
    pub fn invalidate(&self) {
        if let Ok(mut current) = self.current.lock() {
            *current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_succeeds_once() {
        let guard = SessionGuard::new();
        let token = guard.mint();
        assert!(guard.is_current(&token));
        assert!(guard.claim(&token));
        assert!(!guard.claim(&token));
        assert!(!guard.is_current(&token));
    }

    #[test]
    fn minting_invalidates_previous() {
        let guard = SessionGuard::new();
        let first = guard.mint();
        let second = guard.mint();
        assert_ne!(first, second);
        assert!(!guard.claim(&first));
        assert!(guard.claim(&second));
    }

    #[test]
    fn invalidate_clears_without_claim() {
        let guard = SessionGuard::new();
        let token = guard.mint();
        guard.invalidate();
        assert!(guard.current().is_none());
        assert!(!guard.claim(&token));
    }
}

//! Agent session authentication
//!
//! The agent logs in with a bearer token issued by the contact-center
//! backend. Everything that talks to the backend, and the reconnection
//! policy, asks this module whether the session is still authenticated.

pub mod tokens;

use std::sync::Mutex;

pub use tokens::{StoredToken, TokenStore};

/// Read-only view of whether the session may keep talking to the backend.
pub trait AuthState: Send + Sync {
    fn is_authenticated(&self) -> bool;
}

/// In-memory authentication state of one agent session.
#[derive(Debug, Default)]
pub struct SessionAuth {
    token: Mutex<Option<StoredToken>>,
}

impl SessionAuth {
    pub fn new(token: Option<StoredToken>) -> Self {
        Self {
            token: Mutex::new(token),
        }
    }

    /// Current bearer token, if present and unexpired.
    pub fn bearer(&self) -> Option<String> {
        self.token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .filter(|t| !t.is_expired())
            .map(|t| t.token.clone())
    }

    /// Drop the token. Subsequent reconnection attempts are skipped.
    pub fn revoke(&self) {
        let had = self
            .token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some();
        if had {
            tracing::info!("Session token revoked");
        }
    }
}

impl AuthState for SessionAuth {
    fn is_authenticated(&self) -> bool {
        self.bearer().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revoke_clears_authentication() {
        let auth = SessionAuth::new(Some(StoredToken::new("abc".into(), None)));
        assert!(auth.is_authenticated());
        assert_eq!(auth.bearer().as_deref(), Some("abc"));

        auth.revoke();
        assert!(!auth.is_authenticated());
        auth.revoke();
    }

    #[test]
    fn test_expired_token_is_not_authenticated() {
        let auth = SessionAuth::new(Some(StoredToken::new("abc".into(), Some(10))));
        assert!(!auth.is_authenticated());
    }
}

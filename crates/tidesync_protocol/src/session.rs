//! Bearer-token session.

use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The process-wide authenticated session.
///
/// Created at login, replaced wholesale on every refresh and destroyed at
/// logout. Tokens are never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    /// Bearer token attached to every request.
    pub access_token: String,
    /// When the access token stops being accepted.
    pub expires_at: Timestamp,
    /// Token exchanged for a new session.
    pub refresh_token: String,
}

impl AuthSession {
    /// Creates a session.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: Timestamp,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at,
            refresh_token: refresh_token.into(),
        }
    }

    /// Returns true if the access token is known to be expired at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

//! Browser sessions and the token lifecycle attached to them
//!
//! A session starts empty, becomes authenticated once the OAuth callback
//! stores a token in it, and drops back when that token expires and cannot
//! be refreshed:
//!
//! ```text
//! Unauthenticated --callback--> Authenticated --expiry / 401--> Expired
//!        ^                            ^                           |
//!        |                            +------refresh token--------+
//!        +-----------------------no refresh token-----------------+
//! ```

mod store;

use serde::{Deserialize, Serialize};

use crate::oauth::TokenInfo;

pub use store::{SessionHandle, SessionStore};

/// What makes a session count as authenticated.
///
/// One predicate is chosen per process and applied to `/check-auth` and to
/// every guarded endpoint alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPredicate {
    /// A non-empty access token is present
    #[default]
    AccessToken,
    /// A non-empty access token and a non-empty account id are present
    AccessTokenAndAccount,
}

impl AuthPredicate {
    /// Check the predicate against a session
    #[must_use]
    pub fn is_satisfied(self, session: &Session) -> bool {
        let Some(token) = &session.token else {
            return false;
        };
        if token.access_token.is_empty() {
            return false;
        }
        match self {
            Self::AccessToken => true,
            Self::AccessTokenAndAccount => token.account_id.as_deref().is_some_and(|a| !a.is_empty()),
        }
    }
}

/// Lifecycle state of a session's token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No usable token
    Unauthenticated,
    /// Token present and not known to be expired
    Authenticated,
    /// Token present but past its expiry
    Expired,
}

/// Authorization request in progress, kept between `/auth` and `/callback`
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    /// CSRF state sent to the provider
    pub state: String,
    /// PKCE verifier matching the challenge sent to the provider
    pub code_verifier: Option<String>,
}

/// Per-browser session state
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Tokens from the last successful exchange or refresh
    pub token: Option<TokenInfo>,
    /// Authorization request awaiting its callback
    pub pending: Option<PendingAuthorization>,
}

impl Session {
    /// Current lifecycle state under `predicate`
    #[must_use]
    pub fn state(&self, predicate: AuthPredicate) -> SessionState {
        match &self.token {
            _ if !predicate.is_satisfied(self) => SessionState::Unauthenticated,
            Some(token) if token.is_expired() => SessionState::Expired,
            _ => SessionState::Authenticated,
        }
    }

    /// Current access token, if any
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.token.as_ref().map(|t| t.access_token.as_str())
    }

    /// Current account id, if any
    #[must_use]
    pub fn account_id(&self) -> Option<&str> {
        self.token.as_ref().and_then(|t| t.account_id.as_deref())
    }

    /// Current refresh token, if any
    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.token.as_ref().and_then(|t| t.refresh_token.as_deref())
    }

    /// Store the tokens from a completed callback
    pub fn establish(&mut self, token: TokenInfo) {
        self.pending = None;
        self.token = Some(token);
    }

    /// Store the tokens from a refresh, keeping what the provider omitted
    pub fn apply_refresh(&mut self, refreshed: TokenInfo) {
        self.token = Some(match self.token.take() {
            Some(previous) => previous.refreshed(refreshed),
            None => refreshed,
        });
    }

    /// Drop the token, returning the session to `Unauthenticated`
    pub fn expire(&mut self) {
        self.token = None;
    }
}

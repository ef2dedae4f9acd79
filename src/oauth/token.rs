//! OAuth token information held in a browser session

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};

/// Tokens are treated as expired this many seconds before the provider says so
const EXPIRY_SKEW_SECS: u64 = 60;

/// Token endpoint response (authorization code and refresh grants)
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    /// Access token
    pub access_token: String,
    /// Token type (usually "Bearer")
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Refresh token, only issued when `offline_access` was requested
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Granted scopes
    #[serde(default)]
    pub scope: Option<String>,
    /// OpenID Connect ID token
    #[serde(default)]
    pub id_token: Option<String>,
}

/// OAuth token information
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Access token
    pub access_token: String,

    /// Token type (usually "Bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Refresh token (optional)
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Provider-assigned account identifier (optional)
    #[serde(default)]
    pub account_id: Option<String>,

    /// Token expiration time (Unix timestamp)
    #[serde(default)]
    pub expires_at: Option<u64>,

    /// Granted scopes
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl TokenInfo {
    /// Create token info from a token endpoint response
    #[must_use]
    pub fn from_response(response: TokenResponse) -> Self {
        let account_id = response.id_token.as_deref().and_then(account_id_from_id_token);
        Self {
            access_token: response.access_token,
            token_type: response.token_type.unwrap_or_else(default_token_type),
            refresh_token: response.refresh_token,
            account_id,
            expires_at: response.expires_in.map(|secs| now_secs() + secs),
            scope: response.scope,
        }
    }

    /// Minimal token, as handed out by tests and non-OIDC providers
    #[must_use]
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            refresh_token: None,
            account_id: None,
            expires_at: None,
            scope: None,
        }
    }

    /// Set the account id
    #[must_use]
    pub fn with_account_id(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// Set the refresh token
    #[must_use]
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Set the lifetime from now
    #[must_use]
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.expires_at = Some(now_secs() + lifetime.as_secs());
        self
    }

    /// Check if the token is expired (with 60 second buffer)
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| now_secs() + EXPIRY_SKEW_SECS >= expires_at)
    }

    /// Time until expiration
    pub fn time_until_expiry(&self) -> Option<Duration> {
        let now = now_secs();
        self.expires_at
            .filter(|expires_at| *expires_at > now)
            .map(|expires_at| Duration::from_secs(expires_at - now))
    }

    /// Fold a refresh response into this token.
    ///
    /// Providers may omit the refresh token and ID token on refresh; the
    /// previous values stay valid in that case.
    #[must_use]
    pub fn refreshed(self, mut next: TokenInfo) -> TokenInfo {
        if next.refresh_token.is_none() {
            next.refresh_token = self.refresh_token;
        }
        if next.account_id.is_none() {
            next.account_id = self.account_id;
        }
        next
    }
}

impl std::fmt::Debug for TokenInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenInfo")
            .field("token_type", &self.token_type)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("account_id", &self.account_id)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Claims used to build the account identifier
#[derive(Deserialize)]
struct IdTokenClaims {
    #[serde(default)]
    oid: Option<String>,
    #[serde(default)]
    tid: Option<String>,
    #[serde(default)]
    sub: Option<String>,
}

/// Derive the account identifier (`<oid>.<tid>`, falling back to `sub`) from
/// an ID token's payload.
///
/// The token arrives straight from the token endpoint over TLS, so the
/// signature is not checked here; the claims only label the session.
pub fn account_id_from_id_token(id_token: &str) -> Option<String> {
    let payload = id_token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: IdTokenClaims = serde_json::from_slice(&bytes).ok()?;

    match (claims.oid, claims.tid) {
        (Some(oid), Some(tid)) => Some(format!("{oid}.{tid}")),
        (Some(oid), None) => Some(oid),
        _ => claims.sub,
    }
}

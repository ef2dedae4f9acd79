//! OAuth Client
//!
//! Confidential-client authorization code flow against the identity
//! provider's token endpoint, with optional PKCE.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use url::Url;

use super::token::{TokenInfo, TokenResponse};
use crate::config::ResolvedIdentity;
use crate::{Error, Result};

/// Scopes added to every authorization request so the provider returns an
/// ID token (used for the account id)
const OIDC_SCOPES: [&str; 2] = ["openid", "profile"];

/// Scope that makes the provider issue refresh tokens
const OFFLINE_SCOPE: &str = "offline_access";

/// Authorization URL plus the per-request secrets to keep in the session
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    /// Where to send the browser
    pub url: Url,
    /// CSRF state echoed back on the callback
    pub state: String,
    /// PKCE verifier, when PKCE is enabled
    pub code_verifier: Option<String>,
}

/// The three token operations the relay needs from an identity provider
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Build the provider's authorization URL for `redirect_uri`
    fn authorization_url(&self, redirect_uri: &str) -> Result<AuthorizationRequest>;

    /// Exchange an authorization code for tokens
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenInfo>;

    /// Exchange a refresh token for a new access token.
    ///
    /// Only reachable when the session holds a refresh token, which requires
    /// `identity.offline_access`.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenInfo>;
}

/// OAuth client for the configured identity provider
pub struct OAuthClient {
    /// HTTP client for token requests
    http_client: Client,
    /// Resolved credentials and endpoints
    identity: ResolvedIdentity,
}

impl OAuthClient {
    /// Create a new OAuth client
    #[must_use]
    pub fn new(http_client: Client, identity: ResolvedIdentity) -> Self {
        Self {
            http_client,
            identity,
        }
    }

    /// Redirect URI registered with the provider
    #[must_use]
    pub fn redirect_uri(&self) -> &Url {
        &self.identity.redirect_uri
    }

    /// Space-separated scope string sent to the provider
    fn scope_param(&self) -> String {
        let mut scopes: Vec<&str> = self.identity.scopes.iter().map(String::as_str).collect();
        scopes.extend(OIDC_SCOPES);
        if self.identity.offline_access {
            scopes.push(OFFLINE_SCOPE);
        }
        scopes.join(" ")
    }

    /// POST a form to the token endpoint and parse the token response
    async fn token_request(
        &self,
        operation: &'static str,
        params: &[(&str, &str)],
    ) -> Result<TokenInfo> {
        let response = self
            .http_client
            .post(self.identity.token_url.clone())
            .form(params)
            .send()
            .await
            .map_err(|e| Error::AuthExchange {
                operation,
                status: None,
                detail: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::AuthExchange {
                operation,
                status: Some(status),
                detail: body,
            });
        }

        let token_response: TokenResponse =
            response.json().await.map_err(|e| Error::AuthExchange {
                operation,
                status: None,
                detail: format!("Failed to parse token response: {e}"),
            })?;

        Ok(TokenInfo::from_response(token_response))
    }
}

#[async_trait]
impl TokenExchange for OAuthClient {
    fn authorization_url(&self, redirect_uri: &str) -> Result<AuthorizationRequest> {
        let state = generate_state();
        let pkce = self.identity.pkce.then(generate_pkce);

        let mut url = self.identity.authorize_url.clone();
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("client_id", &self.identity.client_id);
            params.append_pair("response_type", "code");
            params.append_pair("redirect_uri", redirect_uri);
            params.append_pair("response_mode", "query");
            params.append_pair("scope", &self.scope_param());
            params.append_pair("state", &state);
            if let Some((_, ref challenge)) = pkce {
                params.append_pair("code_challenge", challenge);
                params.append_pair("code_challenge_method", "S256");
            }
        }

        Ok(AuthorizationRequest {
            url,
            state,
            code_verifier: pkce.map(|(verifier, _)| verifier),
        })
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenInfo> {
        let scope = self.scope_param();
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.identity.client_id.as_str()),
            ("client_secret", self.identity.client_secret.as_str()),
            ("scope", scope.as_str()),
        ];
        if let Some(verifier) = code_verifier {
            params.push(("code_verifier", verifier));
        }

        let token = self.token_request("Token exchange", &params).await?;
        info!(
            has_refresh_token = token.refresh_token.is_some(),
            has_account = token.account_id.is_some(),
            expires_in = ?token.time_until_expiry(),
            "Authorization code exchanged"
        );
        Ok(token)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenInfo> {
        let scope = self.scope_param();
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.identity.client_id.as_str()),
            ("client_secret", self.identity.client_secret.as_str()),
            ("scope", scope.as_str()),
        ];

        let token = self.token_request("Token refresh", &params).await?;
        debug!(expires_in = ?token.time_until_expiry(), "Access token refreshed");
        Ok(token)
    }
}

/// Generate PKCE code verifier and challenge
fn generate_pkce() -> (String, String) {
    // Generate 32 random bytes for verifier
    let verifier_bytes: [u8; 32] = rand::random();
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

    // SHA256 hash for challenge
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let challenge_bytes = hasher.finalize();
    let challenge = URL_SAFE_NO_PAD.encode(challenge_bytes);

    (verifier, challenge)
}

/// Generate a random state parameter
fn generate_state() -> String {
    let state_bytes: [u8; 16] = rand::random();
    URL_SAFE_NO_PAD.encode(state_bytes)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::IdentityConfig;

    fn client(offline_access: bool, pkce: bool) -> OAuthClient {
        let identity = IdentityConfig {
            client_id: Some("client-abc".to_string()),
            client_secret: Some("secret".to_string()),
            offline_access,
            pkce,
            ..IdentityConfig::default()
        }
        .resolve()
        .unwrap();
        OAuthClient::new(Client::new(), identity)
    }

    fn query(url: &Url) -> HashMap<String, String> {
        url.query_pairs().into_owned().collect()
    }

    // =========================================================================
    // PKCE generation
    // =========================================================================

    #[test]
    fn test_pkce_generation() {
        let (verifier, challenge) = generate_pkce();

        // Verifier should be base64url encoded
        assert!(verifier.len() >= 43);
        assert!(!verifier.contains('+'));
        assert!(!verifier.contains('/'));

        // Challenge should be different from verifier (it's hashed)
        assert_ne!(verifier, challenge);
    }

    #[test]
    fn pkce_challenge_is_sha256_of_verifier() {
        let (verifier, challenge) = generate_pkce();
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let expected = URL_SAFE_NO_PAD.encode(hasher.finalize());
        assert_eq!(challenge, expected);
    }

    #[test]
    fn state_generates_unique_values() {
        let s1 = generate_state();
        let s2 = generate_state();
        assert_ne!(s1, s2);
        assert!(s1.len() >= 20, "State should be at least 20 chars, got {}", s1.len());
    }

    // =========================================================================
    // Authorization URL
    // =========================================================================

    #[test]
    fn authorization_url_carries_fixed_scopes_and_redirect() {
        let request = client(true, true)
            .authorization_url("http://localhost:3000/callback")
            .unwrap();
        let params = query(&request.url);

        assert!(request.url.as_str().starts_with(
            "https://login.microsoftonline.com/common/oauth2/v2.0/authorize?"
        ));
        assert_eq!(params["client_id"], "client-abc");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["redirect_uri"], "http://localhost:3000/callback");
        assert_eq!(
            params["scope"],
            "Files.Read Files.Read.All User.Read openid profile offline_access"
        );
        assert_eq!(params["state"], request.state);
        assert_eq!(params["code_challenge_method"], "S256");
        assert!(request.code_verifier.is_some());
    }

    #[test]
    fn authorization_url_without_offline_access_or_pkce() {
        let request = client(false, false)
            .authorization_url("http://localhost:3000/callback")
            .unwrap();
        let params = query(&request.url);

        assert_eq!(params["scope"], "Files.Read Files.Read.All User.Read openid profile");
        assert!(!params.contains_key("code_challenge"));
        assert!(request.code_verifier.is_none());
    }

    #[test]
    fn authorization_requests_are_unique() {
        let client = client(true, true);
        let a = client.authorization_url("http://localhost/cb").unwrap();
        let b = client.authorization_url("http://localhost/cb").unwrap();
        assert_ne!(a.state, b.state);
        assert_ne!(a.code_verifier, b.code_verifier);
    }

    #[test]
    fn client_secret_never_appears_in_authorization_url() {
        let request = client(true, true).authorization_url("http://localhost/cb").unwrap();
        assert!(!request.url.as_str().contains("secret"));
    }
}

//! OAuth 2.0 client for the identity provider
//!
//! Implements the authorization code flow used to sign a browser session in:
//! - Authorization URL construction (with CSRF state and PKCE)
//! - Code-for-token exchange
//! - Refresh-token exchange

mod client;
mod token;

pub use client::{AuthorizationRequest, OAuthClient, TokenExchange};
pub use token::{TokenInfo, TokenResponse, account_id_from_id_token};

//! Error types for the drive relay

use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for the drive relay
pub type Result<T> = std::result::Result<T, Error>;

/// Drive relay errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (missing credentials, bad URLs).
    /// Raised at startup; the process exits instead of serving.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The token endpoint rejected a code or refresh token, or could not be reached
    #[error("{operation} failed{}: {detail}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    AuthExchange {
        /// Which exchange was attempted
        operation: &'static str,
        /// HTTP status, absent on network failure
        status: Option<u16>,
        /// Response body or transport error
        detail: String,
    },

    /// The OAuth callback was malformed (missing code, state mismatch, provider error)
    #[error("Invalid callback: {0}")]
    InvalidCallback(String),

    /// No authenticated session
    #[error("Not authenticated")]
    NotAuthenticated,

    /// The drive API answered with a non-2xx status, or could not be reached
    #[error("Remote API error{}: {body}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    RemoteApi {
        /// HTTP status, absent on network failure
        status: Option<u16>,
        /// Response body or transport error
        body: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a failed drive API response
    pub fn remote(status: u16, body: impl Into<String>) -> Self {
        Self::RemoteApi {
            status: Some(status),
            body: body.into(),
        }
    }

    /// True when the drive API rejected the bearer token
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::RemoteApi { status: Some(401), .. })
    }

    /// HTTP status surfaced to the browser
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotAuthenticated => StatusCode::UNAUTHORIZED,
            Self::InvalidCallback(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            Self::NotAuthenticated => {
                (status, Json(json!({ "error": "Not authenticated" }))).into_response()
            }
            Self::InvalidCallback(ref reason) => {
                tracing::warn!(reason = %reason, "Rejected OAuth callback");
                (status, format!("Error during authentication: {reason}")).into_response()
            }
            Self::AuthExchange { .. } => {
                tracing::error!(error = %self, "Token exchange failed");
                (status, "Error during authentication").into_response()
            }
            Self::RemoteApi {
                status: upstream,
                ref body,
            } => {
                tracing::error!(upstream_status = ?upstream, "Drive API call failed");
                (
                    status,
                    Json(json!({
                        "error": "Remote API error",
                        "status": upstream,
                        "details": body,
                    })),
                )
                    .into_response()
            }
            _ => {
                tracing::error!(error = %self, "Internal error");
                (status, Json(json!({ "error": "Internal error" }))).into_response()
            }
        }
    }
}

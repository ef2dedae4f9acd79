//! Drive Relay Library
//!
//! OAuth-backed relay between a browser UI and a cloud drive API.
//!
//! # Features
//!
//! - **Sign-in**: authorization code flow with CSRF state and PKCE, tokens
//!   kept per browser session and never shared across sessions
//! - **Token lifecycle**: proactive refresh on expiry, one refresh-and-replay
//!   on a 401 from the drive API
//! - **Drive access**: root listing, streamed downloads, permission lookups
//! - **Polling**: bounded, order-preserving permission fan-out with one poll
//!   in flight per session
//! - **Webhook**: change-notification receiver guarded by a shared secret

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod drive;
pub mod error;
pub mod oauth;
pub mod relay;
pub mod session;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?,
    }

    Ok(())
}

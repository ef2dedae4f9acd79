//! Relay server

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use reqwest::Client;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::router::{AppState, RelaySettings, create_router};
use crate::config::Config;
use crate::drive::GraphClient;
use crate::oauth::OAuthClient;
use crate::{Error, Result};

/// Drive relay server
pub struct RelayServer {
    /// Configuration
    config: Config,
    /// Shared handler state
    state: Arc<AppState>,
}

impl RelayServer {
    /// Build the server from configuration.
    ///
    /// Credentials are resolved here, so a relay that cannot sign anyone in
    /// never binds a port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for missing credentials, unusable URLs or
    /// zero intervals.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let identity = config.resolve_identity()?;
        debug!(identity = ?identity, "Resolved identity provider settings");

        let webhook_client_state = if config.webhook.enabled {
            let client_state = config.webhook.resolve_client_state()?;
            if config.webhook.client_state == "auto" {
                info!(
                    prefix = secret_prefix(&client_state),
                    "Auto-generated webhook clientState (full value at debug level)"
                );
                debug!(client_state = %client_state, "Webhook clientState");
            }
            Some(client_state)
        } else {
            None
        };

        let token_http = Client::builder()
            .timeout(config.server.request_timeout)
            .build()?;

        let tokens = OAuthClient::new(token_http, identity);
        let drive = GraphClient::from_config(&config.drive)?;

        let settings = RelaySettings::from_config(&config, webhook_client_state);
        let state = Arc::new(AppState::new(Arc::new(tokens), Arc::new(drive), settings));

        Ok(Self { config, state })
    }

    /// Shared handler state
    #[must_use]
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Router serving this relay
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    /// Run until Ctrl-C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("DRIVE RELAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(redirect_uri = %self.config.identity.redirect_uri, "Sign-in redirect");
        info!(
            predicate = ?self.config.session.auth_predicate,
            offline_access = self.config.identity.offline_access,
            "Session policy"
        );
        if !self.config.identity.offline_access {
            warn!("offline_access disabled: expired sessions must sign in again");
        }
        if self.state.settings.webhook_client_state.is_none() {
            info!("Webhook endpoint disabled");
        }
        info!("============================================================");

        // Session sweeper
        let sessions = Arc::clone(&self.state.sessions);
        let sweep_interval = self.config.session.sweep_interval;
        let mut sweeper_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let evicted = sessions.sweep();
                        if evicted > 0 {
                            debug!(evicted, remaining = sessions.len(), "Evicted idle sessions");
                        }
                    }
                    _ = sweeper_shutdown.recv() => {
                        break;
                    }
                }
            }
        });

        let shutdown_timeout = self.config.server.shutdown_timeout;
        let mut deadline_rx = shutdown_tx.subscribe();
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .into_future();

        tokio::select! {
            result = server => result.map_err(|e| Error::Internal(e.to_string()))?,
            () = async {
                let _ = deadline_rx.recv().await;
                tokio::time::sleep(shutdown_timeout).await;
            } => {
                warn!(timeout = ?shutdown_timeout, "Graceful shutdown timed out, dropping open connections");
            }
        }

        info!("Drive relay stopped");
        Ok(())
    }
}

/// Leading characters of a secret, enough to tell two apart in logs
fn secret_prefix(secret: &str) -> &str {
    secret.get(..8).unwrap_or_default()
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}

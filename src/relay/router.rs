//! HTTP router and handlers

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tower_http::{
    catch_panic::CatchPanicLayer, compression::CompressionLayer, services::ServeDir,
    set_header::SetResponseHeaderLayer, timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::{debug, info};

use super::poll::{PollGuard, RETRY_AFTER_SECS, collect_updates};
use super::session::{AuthenticatedSession, CurrentSession, session_cookie, session_middleware};
use super::webhooks::{ChangeFeed, ChangeSink, WebhookReceiver, webhook_handler};
use crate::config::Config;
use crate::drive::DriveApi;
use crate::oauth::{AuthorizationRequest, TokenExchange};
use crate::session::{AuthPredicate, PendingAuthorization, SessionStore};
use crate::{Error, Result};

const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; script-src 'self'; connect-src 'self'; style-src 'self' 'unsafe-inline'";

/// Per-process settings the handlers read
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Redirect URI sent with authorization and token requests
    pub redirect_uri: String,
    /// What makes a session count as authenticated
    pub auth_predicate: AuthPredicate,
    /// Session cookie name
    pub cookie_name: String,
    /// Mark the session cookie `Secure`
    pub secure_cookie: bool,
    /// Idle sessions are evicted after this long
    pub idle_timeout: Duration,
    /// Bound on concurrent permission lookups per poll
    pub permission_concurrency: usize,
    /// Shared webhook secret; `None` leaves `/webhook` unmounted
    pub webhook_client_state: Option<String>,
    /// Directory served for unmatched paths
    pub static_dir: Option<PathBuf>,
    /// Timeout for non-streaming routes
    pub request_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        let config = Config::default();
        Self {
            redirect_uri: config.identity.redirect_uri,
            auth_predicate: config.session.auth_predicate,
            cookie_name: config.session.cookie_name,
            secure_cookie: config.session.secure_cookie,
            idle_timeout: config.session.idle_timeout,
            permission_concurrency: config.drive.permission_concurrency,
            webhook_client_state: None,
            static_dir: None,
            request_timeout: config.server.request_timeout,
        }
    }
}

impl RelaySettings {
    /// Settings from loaded configuration and the resolved webhook secret
    #[must_use]
    pub fn from_config(config: &Config, webhook_client_state: Option<String>) -> Self {
        Self {
            redirect_uri: config.identity.redirect_uri.clone(),
            auth_predicate: config.session.auth_predicate,
            cookie_name: config.session.cookie_name.clone(),
            secure_cookie: config.session.secure_cookie,
            idle_timeout: config.session.idle_timeout,
            permission_concurrency: config.drive.permission_concurrency,
            webhook_client_state,
            static_dir: Some(PathBuf::from(&config.server.static_dir)),
            request_timeout: config.server.request_timeout,
        }
    }
}

/// Shared application state
pub struct AppState {
    /// Identity provider client
    pub tokens: Arc<dyn TokenExchange>,
    /// Drive API client
    pub drive: Arc<dyn DriveApi>,
    /// Browser sessions
    pub sessions: Arc<SessionStore>,
    /// Accepted change notifications go here
    pub changes: Arc<dyn ChangeSink>,
    /// Sessions with a poll in flight
    pub polls: PollGuard,
    /// Handler settings
    pub settings: RelaySettings,
}

impl AppState {
    /// State with a fresh session store and an unobserved change feed
    #[must_use]
    pub fn new(
        tokens: Arc<dyn TokenExchange>,
        drive: Arc<dyn DriveApi>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            tokens,
            drive,
            sessions: Arc::new(SessionStore::new(settings.idle_timeout)),
            changes: Arc::new(ChangeFeed::default()),
            polls: PollGuard::default(),
            settings,
        }
    }

    /// Replace the change sink
    #[must_use]
    pub fn with_change_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.changes = sink;
        self
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    // Downloads stay outside the timeout and compression layers: they run as
    // long as the transfer does and keep the upstream Content-Length.
    let browser = Router::new()
        .route("/auth", get(auth_handler))
        .route("/callback", get(callback_handler))
        .route("/check-auth", get(check_auth_handler))
        .route("/files", get(files_handler))
        .route("/users/{file_id}", get(users_handler))
        .route("/check-updates", get(check_updates_handler))
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(state.settings.request_timeout))
        .route("/download/{file_id}", get(download_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            session_middleware,
        ));

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .merge(browser);

    if let Some(client_state) = &state.settings.webhook_client_state {
        let receiver = WebhookReceiver::new(client_state, Arc::clone(&state.changes));
        router = router.route("/webhook", post(webhook_handler).with_state(receiver));
    }
    if let Some(dir) = &state.settings.static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    router
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check handler
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Start the authorization code flow
async fn auth_handler(
    State(state): State<Arc<AppState>>,
    CurrentSession(session): CurrentSession,
) -> Result<Response> {
    let AuthorizationRequest {
        url,
        state: csrf_state,
        code_verifier,
    } = state.tokens.authorization_url(&state.settings.redirect_uri)?;

    session.update(|s| {
        s.pending = Some(PendingAuthorization {
            state: csrf_state,
            code_verifier,
        });
    });
    debug!("Redirecting to identity provider");

    Ok(found(url.as_str()))
}

/// Query of the provider's redirect back to us
#[derive(Debug, Deserialize)]
struct CallbackParams {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Finish the authorization code flow
async fn callback_handler(
    State(state): State<Arc<AppState>>,
    CurrentSession(session): CurrentSession,
    jar: CookieJar,
    Query(params): Query<CallbackParams>,
) -> Result<Response> {
    if let Some(error) = params.error {
        let description = params.error_description.unwrap_or_default();
        return Err(Error::InvalidCallback(format!("{error}: {description}")));
    }
    let code = params
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::InvalidCallback("missing authorization code".to_string()))?;

    // One callback per authorization request, successful or not
    let pending = session
        .update(|s| s.pending.take())
        .ok_or_else(|| Error::InvalidCallback("no authorization in progress".to_string()))?;

    let returned_state = params.state.unwrap_or_default();
    if !bool::from(returned_state.as_bytes().ct_eq(pending.state.as_bytes())) {
        return Err(Error::InvalidCallback("state mismatch".to_string()));
    }

    let token = state
        .tokens
        .exchange_code(
            &code,
            &state.settings.redirect_uri,
            pending.code_verifier.as_deref(),
        )
        .await?;

    let account = token.account_id.is_some();
    let signed_in = state.sessions.rotate(&session);
    signed_in.update(|s| s.establish(token));
    info!(has_account = account, "Session signed in");

    let jar = jar.add(session_cookie(&state.settings, signed_in.id()));
    Ok((jar, found("/")).into_response())
}

/// Report whether the session is signed in
async fn check_auth_handler(
    State(state): State<Arc<AppState>>,
    CurrentSession(session): CurrentSession,
) -> impl IntoResponse {
    let predicate = state.settings.auth_predicate;
    let authenticated = session.read(|s| predicate.is_satisfied(s));
    Json(json!({ "authenticated": authenticated }))
}

/// List the drive root
async fn files_handler(
    State(state): State<Arc<AppState>>,
    session: AuthenticatedSession,
) -> Result<Response> {
    let drive = state.drive.as_ref();
    let items = session
        .call(&state, |token| async move { drive.list_children(&token).await })
        .await?;
    debug!(items = items.len(), "Listed drive root");
    Ok(Json(items).into_response())
}

/// Query of `/download/{file_id}`
#[derive(Debug, Deserialize)]
struct DownloadParams {
    #[serde(default)]
    name: Option<String>,
}

/// Stream a file to the browser as an attachment
async fn download_handler(
    State(state): State<Arc<AppState>>,
    session: AuthenticatedSession,
    Path(file_id): Path<String>,
    Query(params): Query<DownloadParams>,
) -> Result<Response> {
    let drive = state.drive.as_ref();
    let id = file_id.as_str();
    let download = session
        .call(&state, |token| async move { drive.stream_content(&token, id).await })
        .await?;
    debug!(file_id = %file_id, length = ?download.content_length, "Streaming download");

    let filename = params.name.as_deref().unwrap_or("download");
    let content_type = download
        .content_type
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));

    let mut response = Response::new(Body::from_stream(download.body));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(filename));
    if let Some(length) = download.content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    Ok(response)
}

/// List who a file is shared with, in API order
async fn users_handler(
    State(state): State<Arc<AppState>>,
    session: AuthenticatedSession,
    Path(file_id): Path<String>,
) -> Result<Response> {
    let drive = state.drive.as_ref();
    let id = file_id.as_str();
    let users = session
        .call(&state, |token| async move { drive.list_permissions(&token, id).await })
        .await?;

    Ok((
        [
            (header::CACHE_CONTROL, "no-store, max-age=0"),
            (header::PRAGMA, "no-cache"),
        ],
        Json(users),
    )
        .into_response())
}

/// Poll permissions of every file in the drive root
async fn check_updates_handler(
    State(state): State<Arc<AppState>>,
    session: AuthenticatedSession,
) -> Result<Response> {
    let Some(_ticket) = state.polls.try_begin(session.id()) else {
        debug!("Poll already in flight for session");
        return Ok((
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, RETRY_AFTER_SECS.to_string())],
            Json(json!({ "error": "Update check already in progress" })),
        )
            .into_response());
    };

    let drive = state.drive.as_ref();
    let concurrency = state.settings.permission_concurrency;
    let updates = session
        .call(&state, |token| async move {
            let items = drive.list_children(&token).await?;
            Ok(collect_updates(drive, &token, &items, concurrency).await)
        })
        .await?;

    Ok(Json(updates).into_response())
}

/// `302 Found` to `location`
fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => Error::Internal(format!("unusable redirect target: {location}")).into_response(),
    }
}

/// `attachment; filename="..."` with an RFC 5987 `filename*` for non-ASCII names
fn content_disposition(name: &str) -> HeaderValue {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if c == '"' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    let cleaned = if cleaned.is_empty() { "download".to_string() } else { cleaned };

    let value = if cleaned.is_ascii() {
        format!("attachment; filename=\"{cleaned}\"")
    } else {
        let fallback: String = cleaned
            .chars()
            .map(|c| if c.is_ascii() { c } else { '_' })
            .collect();
        format!(
            "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
            encode_ext_value(&cleaned)
        )
    };

    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment; filename=\"download\""))
}

/// Percent-encode everything outside RFC 5987 `attr-char`
fn encode_ext_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len() * 3);
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

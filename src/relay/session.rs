//! Session cookie middleware, session extractors and the token lifecycle
//!
//! Every browser-facing route runs behind [`session_middleware`], which
//! resolves (or starts) the caller's session and puts its handle in the
//! request extensions. Handlers then pick one of two extractors:
//!
//! - [`CurrentSession`]: any session, authenticated or not
//! - [`AuthenticatedSession`]: rejects with 401 before the handler runs
//!   unless the configured predicate holds, so no unauthenticated request
//!   can reach the drive client

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{FromRequestParts, State},
    http::{Request, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use tracing::{debug, info, warn};

use super::router::{AppState, RelaySettings};
use crate::session::{SessionHandle, SessionState};
use crate::{Error, Result};

/// Resolve the session cookie and attach the session to the request
pub async fn session_middleware(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let settings = &state.settings;
    let cookie_id = jar.get(&settings.cookie_name).map(|c| c.value().to_string());
    let (handle, created) = state.sessions.resolve(cookie_id.as_deref());

    request.extensions_mut().insert(handle.clone());
    let response = next.run(request).await;

    // A session retired during the request (sign-in rotation) gets no cookie
    if !created || !state.sessions.contains(handle.id()) {
        return response;
    }

    debug!(sessions = state.sessions.len(), "Started new session");
    (jar.add(session_cookie(settings, handle.id())), response).into_response()
}

/// The session cookie for `id`: HttpOnly, SameSite=Lax, site-wide
pub(super) fn session_cookie(settings: &RelaySettings, id: &str) -> Cookie<'static> {
    Cookie::build((settings.cookie_name.clone(), id.to_string()))
        .http_only(true)
        .secure(settings.secure_cookie)
        .same_site(SameSite::Lax)
        .path("/")
        .build()
}

/// The caller's session, whatever its state
#[derive(Debug, Clone)]
pub struct CurrentSession(pub SessionHandle);

impl<S: Send + Sync> FromRequestParts<S> for CurrentSession {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .extensions
            .get::<SessionHandle>()
            .cloned()
            .map(Self)
            .ok_or_else(|| Error::Internal("session layer is not installed".to_string()))
    }
}

/// A session that satisfies the authentication predicate
#[derive(Debug, Clone)]
pub struct AuthenticatedSession {
    handle: SessionHandle,
}

impl FromRequestParts<Arc<AppState>> for AuthenticatedSession {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self> {
        let CurrentSession(handle) = CurrentSession::from_request_parts(parts, state).await?;
        let predicate = state.settings.auth_predicate;

        if handle.read(|s| predicate.is_satisfied(s)) {
            Ok(Self { handle })
        } else {
            debug!(path = %parts.uri.path(), "Rejected unauthenticated request");
            Err(Error::NotAuthenticated)
        }
    }
}

impl AuthenticatedSession {
    /// Opaque session id
    #[must_use]
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    /// Run a drive call with the session's access token.
    ///
    /// An expired token is refreshed before the call. A 401 from the call
    /// triggers one refresh and exactly one replay. Whenever no refresh
    /// token is held (or the refresh fails) the session's token is cleared
    /// and the call fails with [`Error::NotAuthenticated`].
    pub async fn call<T, F, Fut>(&self, state: &AppState, op: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = self.usable_token(state).await?;

        match op(token.clone()).await {
            Err(e) if e.is_unauthorized() => {
                debug!("Drive API rejected the access token");
                let token = self.renew(state, &token).await?;
                match op(token).await {
                    Err(e) if e.is_unauthorized() => {
                        warn!("Drive API rejected a freshly refreshed token");
                        self.handle.update(|s| s.expire());
                        Err(Error::NotAuthenticated)
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    /// Current access token, refreshed first if it has expired
    async fn usable_token(&self, state: &AppState) -> Result<String> {
        let predicate = state.settings.auth_predicate;
        let (session_state, token) = self
            .handle
            .read(|s| (s.state(predicate), s.access_token().map(String::from)));

        match (session_state, token) {
            (SessionState::Authenticated, Some(token)) => Ok(token),
            (SessionState::Expired, Some(token)) => {
                debug!("Access token expired, refreshing before the call");
                self.renew(state, &token).await
            }
            _ => Err(Error::NotAuthenticated),
        }
    }

    /// Replace `stale` with a fresh access token.
    ///
    /// Requests racing on the same session wait for one another; a request
    /// that finds the token already replaced uses the new one instead of
    /// refreshing again.
    async fn renew(&self, state: &AppState, stale: &str) -> Result<String> {
        let _guard = self.handle.lock_refresh().await;

        let (current, refresh_token) = self.handle.read(|s| {
            (
                s.access_token().map(String::from),
                s.refresh_token().map(String::from),
            )
        });

        match current {
            Some(current) if current != stale => return Ok(current),
            None => return Err(Error::NotAuthenticated),
            Some(_) => {}
        }

        let Some(refresh_token) = refresh_token else {
            info!("Access token no longer valid and no refresh token held, signing session out");
            self.handle.update(|s| s.expire());
            return Err(Error::NotAuthenticated);
        };

        match state.tokens.refresh(&refresh_token).await {
            Ok(refreshed) => {
                let token = refreshed.access_token.clone();
                self.handle.update(|s| s.apply_refresh(refreshed));
                info!("Session token refreshed");
                Ok(token)
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed, signing session out");
                self.handle.update(|s| s.expire());
                Err(Error::NotAuthenticated)
            }
        }
    }
}

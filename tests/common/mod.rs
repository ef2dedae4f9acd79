//! Shared fixtures: mock drive and identity provider, request helpers

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, Response, header},
};
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tower::ServiceExt;
use url::Url;

use drive_relay::drive::{DriveApi, DriveItem, Download, PermissionEntry};
use drive_relay::oauth::{AuthorizationRequest, TokenExchange, TokenInfo};
use drive_relay::relay::{AppState, RelaySettings, create_router};
use drive_relay::{Error, Result};

pub const COOKIE: &str = "drive_relay_sid";

// =============================================================================
// Mock drive
// =============================================================================

/// Drive double with call counters and scripted failures
#[derive(Default)]
pub struct MockDrive {
    pub items: Vec<DriveItem>,
    pub permissions: HashMap<String, Vec<PermissionEntry>>,
    /// Item ids whose permission lookup fails with 500
    pub failing: HashSet<String>,
    /// Listing the root fails with 503
    pub failing_listing: bool,
    /// Access tokens answered with 401
    pub rejected_tokens: Mutex<HashSet<String>>,
    /// Every drive call, in order
    pub calls: AtomicUsize,
    /// Bearer token of every drive call, in order
    pub tokens_seen: Mutex<Vec<String>>,
    /// Size of the generated download
    pub download_len: usize,
    pub chunk_len: usize,
    /// Bytes the download stream has produced so far
    pub produced: Arc<AtomicUsize>,
    /// When set, listing waits for this before answering
    pub hold_listing: Option<Arc<Notify>>,
    /// Notified when a listing starts
    pub listing_started: Arc<Notify>,
}

impl MockDrive {
    pub fn with_files(ids: &[&str]) -> Self {
        Self {
            items: ids.iter().map(|id| file(id)).collect(),
            ..Self::default()
        }
    }

    pub fn reject(&self, token: &str) {
        self.rejected_tokens.lock().insert(token.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens_seen.lock().clone()
    }

    fn record(&self, token: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens_seen.lock().push(token.to_string());
        if self.rejected_tokens.lock().contains(token) {
            return Err(Error::remote(401, r#"{"error":{"code":"InvalidAuthenticationToken"}}"#));
        }
        Ok(())
    }
}

#[async_trait]
impl DriveApi for MockDrive {
    async fn list_children(&self, token: &str) -> Result<Vec<DriveItem>> {
        self.record(token)?;
        if self.failing_listing {
            return Err(Error::remote(503, "serviceNotAvailable"));
        }
        self.listing_started.notify_one();
        if let Some(hold) = &self.hold_listing {
            hold.notified().await;
        }
        Ok(self.items.clone())
    }

    async fn stream_content(&self, token: &str, file_id: &str) -> Result<Download> {
        self.record(token)?;
        if self.failing.contains(file_id) {
            return Err(Error::remote(404, "itemNotFound"));
        }

        let total = self.download_len;
        let chunk_len = self.chunk_len.max(1);
        let produced = Arc::clone(&self.produced);
        let body = stream::unfold(0usize, move |offset| {
            let produced = Arc::clone(&produced);
            async move {
                if offset >= total {
                    return None;
                }
                let end = (offset + chunk_len).min(total);
                let chunk: Vec<u8> = (offset..end).map(pattern_byte).collect();
                produced.fetch_add(chunk.len(), Ordering::SeqCst);
                Some((Ok::<Bytes, Error>(Bytes::from(chunk)), end))
            }
        });

        Ok(Download {
            content_type: Some("application/pdf".to_string()),
            content_length: Some(total as u64),
            body: Box::pin(body),
        })
    }

    async fn list_permissions(&self, token: &str, file_id: &str) -> Result<Vec<PermissionEntry>> {
        self.record(token)?;
        if self.failing.contains(file_id) {
            return Err(Error::remote(500, "generalException"));
        }
        Ok(self.permissions.get(file_id).cloned().unwrap_or_default())
    }
}

/// Byte at `offset` of the generated download
pub fn pattern_byte(offset: usize) -> u8 {
    u8::try_from(offset % 251).unwrap()
}

pub fn file(id: &str) -> DriveItem {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "name": format!("{id}.txt"),
        "size": 10,
    }))
    .unwrap()
}

pub fn folder(id: &str) -> DriveItem {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "name": id,
        "folder": {"childCount": 1},
    }))
    .unwrap()
}

pub fn principal(id: &str, name: &str, role: &str) -> PermissionEntry {
    PermissionEntry {
        id: id.to_string(),
        display_name: name.to_string(),
        roles: vec![role.to_string()],
    }
}

// =============================================================================
// Mock identity provider
// =============================================================================

/// Token exchange double
pub struct MockTokens {
    /// Returned by `exchange_code`
    pub issued: TokenInfo,
    /// Returned by `refresh`; `None` makes refresh fail
    pub refreshed: Mutex<Option<TokenInfo>>,
    /// How long a refresh takes
    pub refresh_delay: Duration,
    pub authorizations: AtomicUsize,
    pub exchanges: Mutex<Vec<(String, Option<String>)>>,
    pub refreshes: Mutex<Vec<String>>,
}

impl Default for MockTokens {
    fn default() -> Self {
        Self {
            issued: TokenInfo::bearer("T").with_account_id("A"),
            refreshed: Mutex::new(None),
            refresh_delay: Duration::ZERO,
            authorizations: AtomicUsize::new(0),
            exchanges: Mutex::new(Vec::new()),
            refreshes: Mutex::new(Vec::new()),
        }
    }
}

impl MockTokens {
    pub fn refreshing_to(token: TokenInfo) -> Self {
        Self {
            refreshed: Mutex::new(Some(token)),
            ..Self::default()
        }
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges.lock().len()
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.lock().len()
    }
}

#[async_trait]
impl TokenExchange for MockTokens {
    fn authorization_url(&self, redirect_uri: &str) -> Result<AuthorizationRequest> {
        let n = self.authorizations.fetch_add(1, Ordering::SeqCst);
        let state = format!("state-{n}");
        let mut url = Url::parse("https://login.example.com/authorize").unwrap();
        url.query_pairs_mut()
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("state", &state);
        Ok(AuthorizationRequest {
            url,
            state,
            code_verifier: Some(format!("verifier-{n}")),
        })
    }

    async fn exchange_code(
        &self,
        code: &str,
        _redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenInfo> {
        self.exchanges
            .lock()
            .push((code.to_string(), code_verifier.map(String::from)));
        Ok(self.issued.clone())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenInfo> {
        self.refreshes.lock().push(refresh_token.to_string());
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        self.refreshed.lock().clone().ok_or_else(|| Error::AuthExchange {
            operation: "Token refresh",
            status: Some(400),
            detail: "invalid_grant".to_string(),
        })
    }
}

// =============================================================================
// Relay harness
// =============================================================================

pub struct TestRelay {
    pub router: Router,
    pub state: Arc<AppState>,
    pub drive: Arc<MockDrive>,
    pub tokens: Arc<MockTokens>,
}

impl TestRelay {
    pub fn new(drive: MockDrive, tokens: MockTokens) -> Self {
        Self::with_settings(drive, tokens, RelaySettings::default())
    }

    pub fn with_settings(drive: MockDrive, tokens: MockTokens, settings: RelaySettings) -> Self {
        let drive = Arc::new(drive);
        let tokens = Arc::new(tokens);
        let state = Arc::new(AppState::new(
            Arc::clone(&tokens) as Arc<dyn TokenExchange>,
            Arc::clone(&drive) as Arc<dyn DriveApi>,
            settings,
        ));
        Self {
            router: create_router(Arc::clone(&state)),
            state,
            drive,
            tokens,
        }
    }

    /// Seed a signed-in session and return its cookie header value
    pub fn sign_in(&self, token: TokenInfo) -> String {
        let handle = self.state.sessions.create();
        handle.update(|s| s.establish(token));
        format!("{COOKIE}={}", handle.id())
    }

    /// Access token currently held by the session behind `cookie`
    pub fn session_token(&self, cookie: &str) -> Option<String> {
        let id = cookie.split_once('=').map(|(_, v)| v)?;
        let handle = self.state.sessions.get(id)?;
        handle.read(|s| s.access_token().map(String::from))
    }

    pub async fn get(&self, uri: &str, cookie: Option<&str>) -> Response<Body> {
        self.send(get(uri, cookie)).await
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }
}

pub fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::empty()).unwrap()
}

/// `name=value` of the session cookie set by a response
pub fn session_cookie(response: &Response<Body>) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with(&format!("{COOKIE}=")))
        .and_then(|v| v.split(';').next())
        .map(String::from)
}

pub fn header_str<'a>(response: &'a Response<Body>, name: header::HeaderName) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

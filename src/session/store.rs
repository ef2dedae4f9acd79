//! In-memory session table

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::Session;

#[derive(Debug)]
struct SessionEntry {
    session: RwLock<Session>,
    last_seen: Mutex<Instant>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            session: RwLock::new(Session::default()),
            last_seen: Mutex::new(Instant::now()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }
}

/// Handle to one session, shared by the requests carrying its cookie.
///
/// Locks are only held inside the closures passed to [`read`](Self::read)
/// and [`update`](Self::update), never across an await point.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Arc<str>,
    entry: Arc<SessionEntry>,
}

impl SessionHandle {
    /// Opaque session id (the cookie value)
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Read the session
    pub fn read<R>(&self, f: impl FnOnce(&Session) -> R) -> R {
        f(&*self.entry.session.read())
    }

    /// Modify the session
    pub fn update<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut *self.entry.session.write())
    }

    /// Serialize token refreshes for this session.
    ///
    /// Held across the refresh round trip so concurrent requests do not
    /// spend the same refresh token twice.
    pub async fn lock_refresh(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.entry.refresh_lock.lock().await
    }

    /// Copy of the current session state
    #[must_use]
    pub fn snapshot(&self) -> Session {
        self.read(Session::clone)
    }
}

/// Process-wide session table.
///
/// Sessions are created on first contact, looked up by the id in the
/// session cookie, and evicted once idle for longer than `idle_timeout`.
/// Ids presented by a client but unknown to the store are never adopted.
#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<SessionEntry>>,
    idle_timeout: Duration,
}

impl SessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
        }
    }

    /// Find the session for a cookie value, or start a new one.
    ///
    /// Returns the handle and whether a new session was created (the caller
    /// must then set the cookie).
    pub fn resolve(&self, cookie_id: Option<&str>) -> (SessionHandle, bool) {
        if let Some(handle) = cookie_id.and_then(|id| self.get(id)) {
            return (handle, false);
        }
        (self.create(), true)
    }

    /// Look up a live session and mark it as seen
    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        let (key, entry) = {
            let found = self.sessions.get(id)?;
            (Arc::clone(found.key()), Arc::clone(found.value()))
        };

        if entry.idle_for() > self.idle_timeout {
            self.sessions.remove(id);
            debug!("Dropped idle session on lookup");
            return None;
        }

        entry.touch();
        Some(SessionHandle { id: key, entry })
    }

    /// Start a new, empty session
    pub fn create(&self) -> SessionHandle {
        let id: Arc<str> = generate_session_id().into();
        let entry = Arc::new(SessionEntry::new());
        self.sessions.insert(Arc::clone(&id), Arc::clone(&entry));
        SessionHandle { id, entry }
    }

    /// Move a session's state under a fresh id and retire the old id.
    ///
    /// Used on sign-in so an id known before authentication never carries
    /// the signed-in session.
    pub fn rotate(&self, old: &SessionHandle) -> SessionHandle {
        self.sessions.remove(old.id());
        let state = old.update(std::mem::take);
        let fresh = self.create();
        fresh.update(|s| *s = state);
        debug!("Rotated session id");
        fresh
    }

    /// Whether `id` names a live session
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Evict idle sessions, returning how many were removed
    pub fn sweep(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, entry| entry.idle_for() <= self.idle_timeout);
        before.saturating_sub(self.sessions.len())
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store holds no sessions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Generate an opaque session id (32 random bytes, base64url)
fn generate_session_id() -> String {
    let id_bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(id_bytes)
}

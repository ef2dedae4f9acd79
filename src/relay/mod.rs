//! Relay HTTP server
//!
//! Browser-facing endpoints (sign-in, listing, download, permissions,
//! polling), the provider-facing webhook, and the static UI.

mod poll;
mod router;
mod server;
mod session;
mod webhooks;

pub use poll::{PollGuard, PollTicket, RETRY_AFTER_SECS, UpdateRecord, collect_updates};
pub use router::{AppState, RelaySettings, create_router};
pub use server::RelayServer;
pub use session::{AuthenticatedSession, CurrentSession, session_middleware};
pub use webhooks::{ChangeFeed, ChangeNotification, ChangeSink, WebhookReceiver};

//! Permission polling
//!
//! `/check-updates` lists the drive root and looks up the permissions of
//! every file in it. Lookups run concurrently up to a bound, results come
//! back in listing order, and a failed lookup marks its own record without
//! failing the poll.

use std::sync::Arc;

use dashmap::DashSet;
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::drive::{DriveApi, DriveItem, PermissionEntry};

/// Seconds a browser should wait before retrying an overlapping poll
pub const RETRY_AFTER_SECS: u64 = 10;

/// Permission snapshot of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRecord {
    /// Drive item id
    pub file_id: String,
    /// Principals with access, in API order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<PermissionEntry>>,
    /// Why the lookup failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UpdateRecord {
    fn users(file_id: &str, users: Vec<PermissionEntry>) -> Self {
        Self {
            file_id: file_id.to_string(),
            users: Some(users),
            error: None,
        }
    }

    fn failed(file_id: &str, error: String) -> Self {
        Self {
            file_id: file_id.to_string(),
            users: None,
            error: Some(error),
        }
    }

    /// Whether the lookup for this file failed
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Look up permissions for every non-folder item.
///
/// At most `concurrency` lookups are in flight; output order matches `items`.
pub async fn collect_updates(
    drive: &dyn DriveApi,
    token: &str,
    items: &[DriveItem],
    concurrency: usize,
) -> Vec<UpdateRecord> {
    let file_ids: Vec<String> = items
        .iter()
        .filter(|item| !item.is_folder())
        .map(|item| item.id.clone())
        .collect();

    let records: Vec<UpdateRecord> = stream::iter(file_ids)
        .map(|file_id| async move {
            match drive.list_permissions(token, &file_id).await {
                Ok(users) => UpdateRecord::users(&file_id, users),
                Err(e) => {
                    warn!(file_id = %file_id, error = %e, "Permission lookup failed");
                    UpdateRecord::failed(&file_id, e.to_string())
                }
            }
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    debug!(
        files = records.len(),
        failed = records.iter().filter(|r| r.is_error()).count(),
        "Collected permission updates"
    );
    records
}

/// Tracks which sessions have a poll in flight
#[derive(Debug, Clone, Default)]
pub struct PollGuard {
    in_flight: Arc<DashSet<String>>,
}

impl PollGuard {
    /// Claim the poll slot for a session.
    ///
    /// Returns `None` while another poll for the same session is running.
    #[must_use]
    pub fn try_begin(&self, session_id: &str) -> Option<PollTicket> {
        self.in_flight
            .insert(session_id.to_string())
            .then(|| PollTicket {
                in_flight: Arc::clone(&self.in_flight),
                session_id: session_id.to_string(),
            })
    }

    /// Number of polls currently running
    #[must_use]
    pub fn active(&self) -> usize {
        self.in_flight.len()
    }
}

/// Poll slot; released on drop
#[derive(Debug)]
pub struct PollTicket {
    in_flight: Arc<DashSet<String>>,
    session_id: String,
}

impl Drop for PollTicket {
    fn drop(&mut self) {
        self.in_flight.remove(&self.session_id);
    }
}

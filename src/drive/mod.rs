//! Drive resource client
//!
//! Read-only access to the signed-in user's drive: list the root, stream a
//! file, list who a file is shared with. Every call takes the session's
//! bearer token; none of them retry.

mod graph;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::Result;

pub use graph::GraphClient;

/// Live file content, read once while it is piped to the browser
pub type ContentStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Folder facet; its presence marks an item as a directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderFacet {
    /// Number of direct children
    #[serde(default)]
    pub child_count: Option<u64>,
}

/// One file or folder in the drive root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    /// Stable item id
    pub id: String,
    /// Display name
    pub name: String,
    /// Present for folders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<FolderFacet>,
    /// Size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Last modification time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_date_time: Option<DateTime<Utc>>,
    /// Link to the item in the provider's web UI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
}

impl DriveItem {
    /// Whether this item is a folder
    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.folder.is_some()
    }
}

/// One principal with access to an item.
///
/// Sequences of entries keep the order the drive API returned them in. The
/// browser UI renders the first entry as "you" (owner-first); nothing in the
/// relay may reorder them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionEntry {
    /// Permission id
    pub id: String,
    /// Name of the user, group, application or link audience
    pub display_name: String,
    /// Granted roles ("owner", "read", "write", ...)
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Content of a file, with the upstream headers worth passing on
pub struct Download {
    /// Upstream `Content-Type`
    pub content_type: Option<String>,
    /// Upstream `Content-Length`
    pub content_length: Option<u64>,
    /// The bytes
    pub body: ContentStream,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Remote drive operations, all authenticated with a bearer token
#[async_trait]
pub trait DriveApi: Send + Sync {
    /// Immediate children of the drive root (first page only)
    async fn list_children(&self, token: &str) -> Result<Vec<DriveItem>>;

    /// Stream a file's content without buffering it
    async fn stream_content(&self, token: &str, file_id: &str) -> Result<Download>;

    /// Principals with access to an item, in API order
    async fn list_permissions(&self, token: &str, file_id: &str) -> Result<Vec<PermissionEntry>>;
}

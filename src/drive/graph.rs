//! Microsoft Graph drive client

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use super::{DriveApi, DriveItem, Download, PermissionEntry};
use crate::config::DriveConfig;
use crate::{Error, Result};

/// Graph collection envelope
#[derive(Debug, Deserialize)]
struct Collection<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

/// Graph permission resource, reduced to what the UI needs
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPermission {
    id: String,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    granted_to_v2: Option<IdentitySet>,
    #[serde(default)]
    granted_to: Option<IdentitySet>,
    #[serde(default)]
    granted_to_identities_v2: Vec<IdentitySet>,
    #[serde(default)]
    granted_to_identities: Vec<IdentitySet>,
    #[serde(default)]
    link: Option<SharingLink>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentitySet {
    #[serde(default)]
    user: Option<Identity>,
    #[serde(default)]
    group: Option<Identity>,
    #[serde(default)]
    application: Option<Identity>,
    #[serde(default)]
    site_user: Option<Identity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Identity {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SharingLink {
    #[serde(default)]
    scope: Option<String>,
}

impl Identity {
    fn label(&self) -> Option<&str> {
        self.display_name
            .as_deref()
            .or(self.email.as_deref())
            .filter(|s| !s.is_empty())
    }
}

impl IdentitySet {
    fn label(&self) -> Option<&str> {
        [&self.user, &self.group, &self.application, &self.site_user]
            .into_iter()
            .flatten()
            .find_map(Identity::label)
    }
}

impl RawPermission {
    fn display_name(&self) -> String {
        let direct = [&self.granted_to_v2, &self.granted_to]
            .into_iter()
            .flatten()
            .find_map(IdentitySet::label);
        let listed = || {
            self.granted_to_identities_v2
                .first()
                .or_else(|| self.granted_to_identities.first())
                .and_then(IdentitySet::label)
        };

        if let Some(name) = direct.or_else(listed) {
            return name.to_string();
        }
        match self.link.as_ref().and_then(|l| l.scope.as_deref()) {
            Some("anonymous") => "Anyone with the link".to_string(),
            Some("organization") => "People in your organization with the link".to_string(),
            Some("users") => "Specific people with the link".to_string(),
            Some(other) => format!("{other} link"),
            None => "Unknown".to_string(),
        }
    }
}

impl From<RawPermission> for PermissionEntry {
    fn from(raw: RawPermission) -> Self {
        Self {
            display_name: raw.display_name(),
            id: raw.id,
            roles: raw.roles,
        }
    }
}

/// Drive client for Microsoft Graph (`/me/drive/...`)
#[derive(Debug, Clone)]
pub struct GraphClient {
    http_client: Client,
    api_base: Url,
    request_timeout: Duration,
}

impl GraphClient {
    /// Create a client rooted at `api_base` (e.g. `https://graph.microsoft.com/v1.0`)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `api_base` is not an absolute http(s) URL.
    pub fn new(http_client: Client, api_base: &str, request_timeout: Duration) -> Result<Self> {
        let api_base = Url::parse(api_base)
            .map_err(|e| Error::Config(format!("drive.api_base is not a valid URL ({api_base}): {e}")))?;
        if api_base.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "drive.api_base cannot be used as a base URL: {api_base}"
            )));
        }
        Ok(Self {
            http_client,
            api_base,
            request_timeout,
        })
    }

    /// Client for the configured drive API.
    ///
    /// `drive.request_timeout` bounds every JSON call. Downloads are only
    /// bounded per read, so a stalled transfer fails while a slow one runs on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unusable `api_base`.
    pub fn from_config(config: &DriveConfig) -> Result<Self> {
        let http_client = Client::builder()
            .read_timeout(config.request_timeout)
            .build()?;
        Self::new(http_client, &config.api_base, config.request_timeout)
    }

    /// Build `{api_base}/me/drive/{segments...}`, percent-encoding each segment
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|()| Error::Internal(format!("Bad drive API base: {}", self.api_base)))?
            .pop_if_empty()
            .extend(["me", "drive"])
            .extend(segments);
        Ok(url)
    }

    fn get(&self, url: Url, token: &str) -> RequestBuilder {
        self.http_client.get(url).bearer_auth(token)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, token: &str) -> Result<T> {
        let response = self
            .get(url, token)
            .header(header::ACCEPT, "application/json")
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(transport_error)?;
        let response = ensure_success(response).await?;
        response.json().await.map_err(|e| Error::RemoteApi {
            status: None,
            body: format!("Failed to parse response: {e}"),
        })
    }
}

#[async_trait]
impl DriveApi for GraphClient {
    async fn list_children(&self, token: &str) -> Result<Vec<DriveItem>> {
        let url = self.endpoint(&["root", "children"])?;
        let page: Collection<DriveItem> = self.get_json(url, token).await?;

        if let Some(next) = page.next_link {
            // Only the first page is surfaced
            debug!(next_link = %next, returned = page.value.len(), "Ignoring further pages of drive root");
        }
        Ok(page.value)
    }

    async fn stream_content(&self, token: &str, file_id: &str) -> Result<Download> {
        let url = self.endpoint(&["items", file_id, "content"])?;
        let response = self.get(url, token).send().await.map_err(transport_error)?;
        let response = ensure_success(response).await?;

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let content_length = response.content_length();

        let body = response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| {
                warn!(error = %e, "Download stream interrupted");
                Error::RemoteApi {
                    status: None,
                    body: format!("Stream read error: {e}"),
                }
            })
        });

        Ok(Download {
            content_type,
            content_length,
            body: Box::pin(body),
        })
    }

    async fn list_permissions(&self, token: &str, file_id: &str) -> Result<Vec<PermissionEntry>> {
        let url = self.endpoint(&["items", file_id, "permissions"])?;
        let page: Collection<RawPermission> = self.get_json(url, token).await?;
        Ok(page.value.into_iter().map(PermissionEntry::from).collect())
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    Error::RemoteApi {
        status: None,
        body: e.to_string(),
    }
}

/// Turn a non-2xx response into [`Error::RemoteApi`] carrying status and body
async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    debug!(status = status.as_u16(), "Drive API returned an error");
    Err(Error::remote(status.as_u16(), body))
}

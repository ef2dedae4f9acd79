//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::session::AuthPredicate;
use crate::{Error, Result};

/// Scopes requested from the identity provider unless overridden
pub const DEFAULT_SCOPES: [&str; 3] = ["Files.Read", "Files.Read.All", "User.Read"];

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving credentials.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Identity provider (OAuth client) configuration
    pub identity: IdentityConfig,
    /// Drive API configuration
    pub drive: DriveConfig,
    /// Browser session configuration
    pub session: SessionConfig,
    /// Change-notification webhook configuration
    pub webhook: WebhookConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // DRIVE_RELAY_IDENTITY__CLIENT_ID -> identity.client_id
        figment = figment.merge(Env::prefixed("DRIVE_RELAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files first, so ${VAR} and env:VAR can see their contents
        config.load_env_files();
        config.expand_env_vars();

        Ok(config)
    }

    /// Resolve and validate the OAuth client credentials.
    ///
    /// Called once at startup: a relay without credentials must not start.
    pub fn resolve_identity(&self) -> Result<ResolvedIdentity> {
        self.identity.resolve()
    }

    /// Reject settings that load fine but cannot run
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first unusable setting.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("session.idle_timeout", self.session.idle_timeout),
            ("session.sweep_interval", self.session.sweep_interval),
            ("drive.request_timeout", self.drive.request_timeout),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(Error::Config(format!("{field} must be greater than zero")));
            }
        }
        Ok(())
    }

    /// Copy safe to print: literal secrets are masked, `env:` references kept
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mask = |value: &str| {
            if value.starts_with("env:") || value == "auto" {
                value.to_string()
            } else {
                "<redacted>".to_string()
            }
        };
        let mut copy = self.clone();
        copy.identity.client_secret = copy.identity.client_secret.as_deref().map(mask);
        copy.webhook.client_state = mask(&copy.webhook.client_state);
        copy
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in string settings
    fn expand_env_vars(&mut self) {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();

        let identity = &mut self.identity;
        for value in [
            &mut identity.authority,
            &mut identity.redirect_uri,
            &mut self.drive.api_base,
            &mut self.server.static_dir,
        ] {
            *value = expand_string(&re, value);
        }
        for value in [
            &mut identity.client_id,
            &mut identity.client_secret,
            &mut identity.authorize_url,
            &mut identity.token_url,
        ]
        .into_iter()
        .flatten()
        {
            *value = expand_string(&re, value);
        }
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Resolve a credential value: `env:VAR_NAME` reads the environment, anything
/// else is taken literally. Empty values count as missing.
fn resolve_value(raw: Option<&str>) -> Option<String> {
    let raw = raw?;
    let value = match raw.strip_prefix("env:") {
        Some(var_name) => env::var(var_name).ok()?,
        None => raw.to_string(),
    };
    let value = value.trim().to_string();
    (!value.is_empty()).then_some(value)
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Directory holding the browser UI
    pub static_dir: String,
    /// Timeout for non-streaming requests
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            static_dir: "public".to_string(),
            request_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// OAuth client configuration for the identity provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Client (application) ID. Supports `env:VAR_NAME`.
    pub client_id: Option<String>,
    /// Client secret. Supports `env:VAR_NAME`.
    pub client_secret: Option<String>,
    /// Authority base URL; endpoints are derived as `{authority}/oauth2/v2.0/...`
    pub authority: String,
    /// Explicit authorization endpoint (overrides the authority-derived one)
    pub authorize_url: Option<String>,
    /// Explicit token endpoint (overrides the authority-derived one)
    pub token_url: Option<String>,
    /// Where the provider sends the browser back to
    pub redirect_uri: String,
    /// Resource scopes
    pub scopes: Vec<String>,
    /// Request `offline_access` so the provider issues refresh tokens.
    /// When false, the refresh transition is unreachable and an expired
    /// token always drops the session back to unauthenticated.
    pub offline_access: bool,
    /// Send a PKCE challenge with the authorization request
    pub pkce: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            client_id: Some("env:CLIENT_ID".to_string()),
            client_secret: Some("env:CLIENT_SECRET".to_string()),
            authority: "https://login.microsoftonline.com/common".to_string(),
            authorize_url: None,
            token_url: None,
            redirect_uri: "http://localhost:3000/callback".to_string(),
            scopes: DEFAULT_SCOPES.iter().map(ToString::to_string).collect(),
            offline_access: true,
            pkce: true,
        }
    }
}

impl IdentityConfig {
    /// Resolve credentials and endpoints
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the client id, client secret or authority
    /// is missing, or when an endpoint is not a valid URL.
    pub fn resolve(&self) -> Result<ResolvedIdentity> {
        let client_id = resolve_value(self.client_id.as_deref()).ok_or_else(|| {
            Error::Config(format!(
                "identity.client_id is not set ({})",
                self.client_id.as_deref().unwrap_or("no value")
            ))
        })?;
        let client_secret = resolve_value(self.client_secret.as_deref()).ok_or_else(|| {
            Error::Config(format!(
                "identity.client_secret is not set ({})",
                self.client_secret.as_deref().unwrap_or("no value")
            ))
        })?;

        let authority = self.authority.trim_end_matches('/');
        if authority.is_empty() {
            return Err(Error::Config("identity.authority is not set".to_string()));
        }

        let authorize_url = parse_url(
            "identity.authorize_url",
            self.authorize_url
                .clone()
                .unwrap_or_else(|| format!("{authority}/oauth2/v2.0/authorize")),
        )?;
        let token_url = parse_url(
            "identity.token_url",
            self.token_url
                .clone()
                .unwrap_or_else(|| format!("{authority}/oauth2/v2.0/token")),
        )?;
        let redirect_uri = parse_url("identity.redirect_uri", self.redirect_uri.clone())?;

        if self.scopes.is_empty() {
            return Err(Error::Config("identity.scopes must not be empty".to_string()));
        }

        Ok(ResolvedIdentity {
            client_id,
            client_secret,
            authorize_url,
            token_url,
            redirect_uri,
            scopes: self.scopes.clone(),
            offline_access: self.offline_access,
            pkce: self.pkce,
        })
    }
}

fn parse_url(field: &str, value: String) -> Result<Url> {
    Url::parse(&value).map_err(|e| Error::Config(format!("{field} is not a valid URL ({value}): {e}")))
}

/// Identity configuration with credentials resolved and endpoints parsed
#[derive(Clone)]
pub struct ResolvedIdentity {
    /// Client ID
    pub client_id: String,
    /// Client secret
    pub client_secret: String,
    /// Authorization endpoint
    pub authorize_url: Url,
    /// Token endpoint
    pub token_url: Url,
    /// Redirect URI registered with the provider
    pub redirect_uri: Url,
    /// Resource scopes
    pub scopes: Vec<String>,
    /// Whether refresh tokens are requested
    pub offline_access: bool,
    /// Whether PKCE is used
    pub pkce: bool,
}

impl std::fmt::Debug for ResolvedIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedIdentity")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("authorize_url", &self.authorize_url.as_str())
            .field("token_url", &self.token_url.as_str())
            .field("redirect_uri", &self.redirect_uri.as_str())
            .field("scopes", &self.scopes)
            .field("offline_access", &self.offline_access)
            .field("pkce", &self.pkce)
            .finish()
    }
}

/// Drive API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Graph API base URL
    pub api_base: String,
    /// Maximum permission lookups in flight for one poll
    pub permission_concurrency: usize,
    /// Timeout for JSON calls; downloads use it as an idle-read bound
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            api_base: "https://graph.microsoft.com/v1.0".to_string(),
            permission_concurrency: 8,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Browser session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name of the session cookie
    pub cookie_name: String,
    /// Mark the cookie `Secure` (enable behind HTTPS)
    pub secure_cookie: bool,
    /// Sessions idle for longer than this are evicted
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// How often the sweeper looks for idle sessions
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// What makes a session count as authenticated
    pub auth_predicate: AuthPredicate,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "drive_relay_sid".to_string(),
            secure_cookie: false,
            idle_timeout: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
            auth_predicate: AuthPredicate::default(),
        }
    }
}

/// Change-notification webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Mount POST /webhook
    pub enabled: bool,
    /// Shared secret compared against `clientState`.
    /// Supports a literal value, `env:VAR_NAME`, or `auto` (random per process).
    pub client_state: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            client_state: "auto".to_string(),
        }
    }
}

impl WebhookConfig {
    /// Resolve the shared secret (expand env vars, generate if `auto`)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the secret resolves to an empty value.
    pub fn resolve_client_state(&self) -> Result<String> {
        if self.client_state == "auto" {
            let random_bytes: [u8; 32] = rand::random();
            return Ok(hex::encode(random_bytes));
        }
        resolve_value(Some(&self.client_state)).ok_or_else(|| {
            Error::Config(format!(
                "webhook.client_state is empty ({})",
                self.client_state
            ))
        })
    }
}

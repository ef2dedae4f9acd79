//! Change-notification receiver
//!
//! The drive provider calls `POST /webhook` in two ways:
//! - subscription validation: `?validationToken=...` must be echoed back as
//!   `text/plain` within a few seconds
//! - change notifications: a JSON body whose `clientState` proves it came
//!   from a subscription this relay created
//!
//! Accepted notifications are published to a [`ChangeSink`]. Nothing pushes
//! them on to browsers; the polling endpoint stays the source of truth.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Buffered notifications per subscriber before the oldest are dropped
const FEED_CAPACITY: usize = 64;

/// One accepted change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    /// Subscription that produced the notification
    #[serde(default)]
    pub subscription_id: Option<String>,
    /// Kind of change ("updated", ...)
    #[serde(default)]
    pub change_type: Option<String>,
    /// Resource path that changed
    #[serde(default)]
    pub resource: Option<String>,
    /// Full notification as received
    #[serde(skip)]
    pub payload: Value,
}

impl ChangeNotification {
    fn from_value(payload: Value) -> Self {
        let field = |name: &str| payload.get(name).and_then(Value::as_str).map(String::from);
        Self {
            subscription_id: field("subscriptionId"),
            change_type: field("changeType"),
            resource: field("resource"),
            payload,
        }
    }
}

/// Destination for accepted change notifications
pub trait ChangeSink: Send + Sync {
    /// Hand over one notification; must not block
    fn publish(&self, notification: ChangeNotification);
}

/// In-process broadcast of change notifications
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<ChangeNotification>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(FEED_CAPACITY);
        Self { sender }
    }
}

impl ChangeFeed {
    /// Receive notifications published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.sender.subscribe()
    }
}

impl ChangeSink for ChangeFeed {
    fn publish(&self, notification: ChangeNotification) {
        // No subscribers is not an error
        let delivered = self.sender.send(notification).unwrap_or(0);
        debug!(subscribers = delivered, "Published change notification");
    }
}

/// Query parameters of a webhook call
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookQuery {
    /// Present only on subscription validation
    #[serde(default)]
    pub validation_token: Option<String>,
}

/// State of the `/webhook` route; only built when a secret is configured
#[derive(Clone)]
pub struct WebhookReceiver {
    client_state: Arc<str>,
    changes: Arc<dyn ChangeSink>,
}

impl WebhookReceiver {
    /// Receiver checking notifications against `client_state`
    #[must_use]
    pub fn new(client_state: &str, changes: Arc<dyn ChangeSink>) -> Self {
        Self {
            client_state: client_state.into(),
            changes,
        }
    }
}

/// `POST /webhook`
pub async fn webhook_handler(
    State(receiver): State<WebhookReceiver>,
    Query(query): Query<WebhookQuery>,
    body: Bytes,
) -> Response {
    if let Some(token) = query.validation_token {
        info!("Answering webhook subscription validation");
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            token,
        )
            .into_response();
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, body_len = body.len(), "Webhook body is not valid JSON");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("Invalid JSON: {e}") })),
            )
                .into_response();
        }
    };

    let notifications = split_notifications(payload);
    let authentic = !notifications.is_empty()
        && notifications
            .iter()
            .all(|n| client_state_matches(n, &receiver.client_state));
    if !authentic {
        warn!(
            notifications = notifications.len(),
            "Webhook clientState mismatch, rejecting"
        );
        return StatusCode::UNAUTHORIZED.into_response();
    }

    info!(notifications = notifications.len(), "Change notification received");
    for payload in notifications {
        let notification = ChangeNotification::from_value(payload);
        debug!(
            subscription = ?notification.subscription_id,
            change_type = ?notification.change_type,
            resource = ?notification.resource,
            "Change detected"
        );
        receiver.changes.publish(notification);
    }

    StatusCode::ACCEPTED.into_response()
}

/// A delivery is either a `{"value": [...]}` batch or a single notification
fn split_notifications(payload: Value) -> Vec<Value> {
    match payload {
        Value::Object(mut map) => match map.remove("value") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                map.insert("value".to_string(), other);
                vec![Value::Object(map)]
            }
            None => vec![Value::Object(map)],
        },
        _ => Vec::new(),
    }
}

fn client_state_matches(notification: &Value, expected: &str) -> bool {
    notification
        .get("clientState")
        .and_then(Value::as_str)
        .is_some_and(|got| got.as_bytes().ct_eq(expected.as_bytes()).into())
}

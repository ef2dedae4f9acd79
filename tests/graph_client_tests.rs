//! Graph drive client against a local mock of the Graph API

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use futures::StreamExt;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::net::TcpListener;

use drive_relay::Error;
use drive_relay::config::DriveConfig;
use drive_relay::drive::{DriveApi, GraphClient};

#[derive(Default)]
struct Seen {
    authorization: Mutex<Vec<String>>,
    item_ids: Mutex<Vec<String>>,
}

fn record(seen: &Seen, headers: &HeaderMap) {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    seen.authorization.lock().push(value);
}

fn rejected(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .is_some_and(|v| v.as_bytes() == b"Bearer expired")
}

async fn children(State(seen): State<Arc<Seen>>, headers: HeaderMap) -> Response {
    record(&seen, &headers);
    if rejected(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": {"code": "InvalidAuthenticationToken"}})),
        )
            .into_response();
    }
    Json(json!({
        "value": [
            {"id": "f1", "name": "notes.txt", "size": 12, "lastModifiedDateTime": "2024-05-01T10:00:00Z"},
            {"id": "d1", "name": "Photos", "folder": {"childCount": 3}},
        ],
        "@odata.nextLink": "https://graph.example/next",
    }))
    .into_response()
}

async fn permissions(
    State(seen): State<Arc<Seen>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    record(&seen, &headers);
    seen.item_ids.lock().push(id.clone());
    if id == "missing" {
        return (StatusCode::NOT_FOUND, r#"{"error":{"code":"itemNotFound"}}"#).into_response();
    }
    Json(json!({
        "value": [
            {"id": "p0", "roles": ["owner"], "grantedToV2": {"user": {"displayName": "Me"}}},
            {"id": "p1", "roles": ["read"], "grantedToIdentitiesV2": [{"user": {"email": "bob@example.com"}}]},
            {"id": "p2", "roles": ["read"], "link": {"scope": "anonymous"}},
        ]
    }))
    .into_response()
}

async fn content(State(seen): State<Arc<Seen>>, Path(id): Path<String>, headers: HeaderMap) -> Response {
    record(&seen, &headers);
    seen.item_ids.lock().push(id);
    Redirect::to("/blob").into_response()
}

async fn blob() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain")], "hello from the drive")
}

async fn mock_graph() -> (String, Arc<Seen>) {
    let seen = Arc::new(Seen::default());
    let app = Router::new()
        .route("/v1.0/me/drive/root/children", get(children))
        .route("/v1.0/me/drive/items/{id}/permissions", get(permissions))
        .route("/v1.0/me/drive/items/{id}/content", get(content))
        .route("/blob", get(blob))
        .with_state(Arc::clone(&seen));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/v1.0"), seen)
}

fn client(base: &str) -> GraphClient {
    GraphClient::new(reqwest::Client::new(), base, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn lists_root_with_bearer_token() {
    let (base, seen) = mock_graph().await;

    let items = client(&base).list_children("T").await.unwrap();

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].name, "notes.txt");
    assert!(!items[0].is_folder());
    assert!(items[0].last_modified_date_time.is_some());
    assert!(items[1].is_folder());
    assert_eq!(*seen.authorization.lock(), vec!["Bearer T"]);
}

#[tokio::test]
async fn trailing_slash_on_base_is_tolerated() {
    let (base, _) = mock_graph().await;

    let items = client(&format!("{base}/")).list_children("T").await.unwrap();

    assert_eq!(items.len(), 2);
}

#[tokio::test]
async fn rejected_token_surfaces_as_unauthorized() {
    let (base, _) = mock_graph().await;

    let err = client(&base).list_children("expired").await.unwrap_err();

    assert!(err.is_unauthorized());
    assert!(matches!(err, Error::RemoteApi { ref body, .. } if body.contains("InvalidAuthenticationToken")));
}

#[tokio::test]
async fn permissions_keep_order_and_resolve_names() {
    let (base, seen) = mock_graph().await;

    let entries = client(&base).list_permissions("T", "a b/c").await.unwrap();

    let names: Vec<&str> = entries.iter().map(|e| e.display_name.as_str()).collect();
    assert_eq!(names, vec!["Me", "bob@example.com", "Anyone with the link"]);
    assert_eq!(entries[0].roles, vec!["owner"]);
    assert_eq!(*seen.item_ids.lock(), vec!["a b/c"]);
}

#[tokio::test]
async fn missing_item_carries_status_and_body() {
    let (base, _) = mock_graph().await;

    let err = client(&base).list_permissions("T", "missing").await.unwrap_err();

    match err {
        Error::RemoteApi { status, body } => {
            assert_eq!(status, Some(404));
            assert!(body.contains("itemNotFound"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn content_follows_redirect_and_streams() {
    let (base, seen) = mock_graph().await;

    let download = client(&base).stream_content("T", "f1").await.unwrap();

    assert_eq!(download.content_type.as_deref(), Some("text/plain"));
    assert_eq!(download.content_length, Some(20));
    let chunks: Vec<_> = download.body.collect().await;
    let bytes: Vec<u8> = chunks
        .into_iter()
        .flat_map(|c| c.unwrap().to_vec())
        .collect();
    assert_eq!(bytes, b"hello from the drive");
    assert_eq!(*seen.item_ids.lock(), vec!["f1"]);
}

#[tokio::test]
async fn unreachable_api_is_a_remote_error_without_status() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client(&format!("http://{addr}/v1.0"))
        .list_children("T")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RemoteApi { status: None, .. }));
}

/// Accepts connections, optionally sends `preamble`, then never writes again
async fn stalling_upstream(preamble: &'static [u8]) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            let _ = socket.write_all(preamble).await;
            held.push(socket);
        }
    });
    format!("http://{addr}/v1.0")
}

fn stall_config(api_base: String) -> DriveConfig {
    DriveConfig {
        api_base,
        request_timeout: Duration::from_millis(200),
        ..DriveConfig::default()
    }
}

#[tokio::test]
async fn silent_upstream_fails_the_download() {
    let base = stalling_upstream(b"").await;
    let client = GraphClient::from_config(&stall_config(base)).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), client.stream_content("T", "f1"))
        .await
        .expect("download should give up on a silent upstream");

    assert!(matches!(result, Err(Error::RemoteApi { status: None, .. })));
}

#[tokio::test]
async fn upstream_stalling_mid_body_ends_the_stream_with_an_error() {
    let base = stalling_upstream(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 100\r\n\r\nhello",
    )
    .await;
    let client = GraphClient::from_config(&stall_config(base)).unwrap();

    let download = client.stream_content("T", "f1").await.unwrap();
    let chunks: Vec<_> = tokio::time::timeout(Duration::from_secs(5), download.body.collect())
        .await
        .expect("stream should end once the upstream stalls");

    assert!(chunks.last().is_some_and(Result::is_err));
}

#[tokio::test]
async fn silent_upstream_fails_json_calls() {
    let base = stalling_upstream(b"").await;
    let client = GraphClient::from_config(&stall_config(base)).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), client.list_permissions("T", "f1"))
        .await
        .expect("lookup should time out");

    assert!(result.is_err());
}

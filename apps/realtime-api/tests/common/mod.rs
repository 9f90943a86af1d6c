#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use realtime_api::config::Config;
use realtime_api::AppState;

pub const TEST_SECRET: &str = "test-secret-do-not-use-in-production";

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Config with short timeouts suitable for tests.
pub fn test_config() -> Config {
    Config {
        hub_secret: TEST_SECRET.to_string(),
        port: 0,
        queue_capacity: 16,
        heartbeat_interval: Duration::from_secs(30),
        heartbeat_timeout: Duration::from_secs(60),
        invite_timeout: Duration::from_secs(45),
        shutdown_grace: Duration::from_millis(200),
    }
}

pub fn test_state() -> AppState {
    test_state_with(test_config())
}

pub fn test_state_with(config: Config) -> AppState {
    AppState::build(config).expect("build test state")
}

/// Build the full application router wired to the given state.
pub fn test_app(state: &AppState) -> Router {
    realtime_api::routes::router().with_state(state.clone())
}

/// Start a real TCP server for WebSocket testing. Runs in the background.
pub async fn start_ws_server(state: &AppState) -> SocketAddr {
    let app = test_app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// HS256-sign arbitrary claims.
pub fn sign_token(secret: &str, claims: serde_json::Value) -> String {
    let key = jsonwebtoken::EncodingKey::from_secret(secret.as_bytes());
    let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256);
    jsonwebtoken::encode(&header, &claims, &key).expect("sign token")
}

/// A short-lived link token for `user_id`.
pub fn token_for(user_id: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    sign_token(
        TEST_SECRET,
        serde_json::json!({ "sub": user_id, "iat": now, "exp": now + 300 }),
    )
}

/// A token shaped like the REST layer's: numeric `user_id`, no expiry.
pub fn rest_token(user_id: u64) -> String {
    sign_token(TEST_SECRET, serde_json::json!({ "user_id": user_id, "admin": false }))
}

/// Connect `user_id` to `hub`, passing the token as a query parameter.
pub async fn connect(addr: SocketAddr, user_id: &str, hub: &str) -> Client {
    let url = format!(
        "ws://{addr}/ws/{user_id}?hub={hub}&token={}",
        token_for(user_id)
    );
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("ws connect");
    ws
}

/// Connect `user_id` to the default hub, passing `token` in the `jwt` header.
pub async fn connect_with_header(addr: SocketAddr, user_id: &str, token: &str) -> Client {
    let mut request = format!("ws://{addr}/ws/{user_id}")
        .into_client_request()
        .expect("request");
    request
        .headers_mut()
        .insert("jwt", token.parse().expect("header value"));
    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("ws connect");
    ws
}

/// Poll until `check` passes or the timeout elapses.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    time::timeout(timeout, async {
        while !check() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// Wait until `count` links are registered across all hubs.
pub async fn wait_for_links(state: &AppState, count: usize) {
    let supervisor = state.supervisor.clone();
    assert!(
        wait_until(Duration::from_secs(5), || supervisor.list_links().len() == count).await,
        "expected {count} links, found {}",
        supervisor.list_links().len()
    );
}

/// Next non-control frame from the server.
pub async fn next_frame(ws: &mut Client) -> Message {
    with_timeout(async {
        loop {
            let msg = ws
                .next()
                .await
                .expect("stream ended")
                .expect("ws read error");
            match msg {
                Message::Ping(_) | Message::Pong(_) => continue,
                other => return other,
            }
        }
    })
    .await
}

/// Next JSON text frame from the server.
pub async fn next_json(ws: &mut Client) -> serde_json::Value {
    match next_frame(ws).await {
        Message::Text(text) => serde_json::from_str(&text).expect("parse frame"),
        other => panic!("expected text frame, got {other:?}"),
    }
}

/// Next frame, which must be a close frame; returns its code.
pub async fn next_close_code(ws: &mut Client) -> u16 {
    match next_frame(ws).await {
        Message::Close(Some(frame)) => u16::from(frame.code),
        other => panic!("expected close frame, got {other:?}"),
    }
}

pub async fn send_json(ws: &mut Client, value: serde_json::Value) {
    use futures_util::SinkExt;
    ws.send(tungstenite::Message::Text(value.to_string().into()))
        .await
        .expect("send frame");
}

async fn with_timeout<T>(fut: impl Future<Output = T>) -> T {
    time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out waiting for server")
}

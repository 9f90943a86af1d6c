mod common;

use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::Value;

use realtime_api::hub::{Session, NOTIFICATIONS_HUB};

fn server(state: &realtime_api::AppState) -> TestServer {
    TestServer::new(common::test_app(state)).unwrap()
}

#[tokio::test]
async fn health_returns_ok() {
    let state = common::test_state();
    let server = server(&state);

    let resp = server.get("/health").await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["hubs"], serde_json::json!(["calls", "notifications"]));
}

#[tokio::test]
async fn healthz_flips_to_unavailable_on_shutdown() {
    let state = common::test_state();
    let server = server(&state);

    server.get("/_hub/healthz").await.assert_status_ok();

    state.supervisor.shutdown_all(Duration::from_millis(50)).await;

    let resp = server.get("/_hub/healthz").await;
    assert_eq!(resp.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = resp.json();
    assert_eq!(body["status"], "shutting_down");
}

#[tokio::test]
async fn links_lists_registered_sessions() {
    let state = common::test_state();
    let server = server(&state);

    let body: Value = server.get("/_hub/links").await.json();
    assert_eq!(body, serde_json::json!([]));

    let hub = state.supervisor.hub(NOTIFICATIONS_HUB).unwrap();
    let (session, _rx) = Session::new(hub.name(), "u1", 8);
    session.activate();
    assert!(hub.register(&session));

    let body: Value = server.get("/_hub/links").await.json();
    let links = body.as_array().unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0]["hub"], NOTIFICATIONS_HUB);
    assert_eq!(links[0]["user_id"], "u1");
    assert_eq!(links[0]["session_id"], session.session_id.as_str());
    assert!(links[0]["connected_at"].is_string());
}

#[tokio::test]
async fn kick_requires_a_target() {
    let state = common::test_state();
    let server = server(&state);

    let resp = server.get("/_hub/kick").await;
    assert_eq!(resp.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json();
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn kick_closes_user_links_and_is_idempotent() {
    let state = common::test_state();
    let server = server(&state);

    let hub = state.supervisor.hub(NOTIFICATIONS_HUB).unwrap();
    let (phone, _phone_rx) = Session::new(hub.name(), "u1", 8);
    let (laptop, _laptop_rx) = Session::new(hub.name(), "u1", 8);
    for session in [&phone, &laptop] {
        session.activate();
        assert!(hub.register(session));
    }

    let body: Value = server.get("/_hub/kick?user_id=u1").await.json();
    assert_eq!(body["kicked"], 2);
    assert!(phone.is_closed());
    assert!(laptop.is_closed());
    assert!(state.supervisor.list_links().is_empty());

    let body: Value = server.get("/_hub/kick?user_id=u1").await.json();
    assert_eq!(body["kicked"], 0);
}

#[tokio::test]
async fn kick_single_session_leaves_siblings() {
    let state = common::test_state();
    let server = server(&state);

    let hub = state.supervisor.hub(NOTIFICATIONS_HUB).unwrap();
    let (phone, _phone_rx) = Session::new(hub.name(), "u1", 8);
    let (laptop, _laptop_rx) = Session::new(hub.name(), "u1", 8);
    for session in [&phone, &laptop] {
        session.activate();
        assert!(hub.register(session));
    }

    let path = format!(
        "/_hub/kick?hub={NOTIFICATIONS_HUB}&session_id={}",
        phone.session_id
    );
    let body: Value = server.get(&path).await.json();
    assert_eq!(body["kicked"], 1);
    assert!(phone.is_closed());
    assert!(!laptop.is_closed());
    assert_eq!(hub.user_session_count("u1"), 1);
}

#[tokio::test]
async fn kick_unknown_hub_is_not_found() {
    let state = common::test_state();
    let server = server(&state);

    let resp = server.get("/_hub/kick?hub=nope&user_id=u1").await;
    assert_eq!(resp.status_code(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Upgrade handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upgrade_without_token_is_unauthorized() {
    let state = common::test_state();
    let server = server(&state);

    let resp = server.get("/ws/u1").await;
    assert_eq!(resp.status_code(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json();
    assert_eq!(body["error"]["code"], "MISSING_TOKEN");
}

#[tokio::test]
async fn upgrade_with_forged_token_is_unauthorized() {
    let state = common::test_state();
    let server = server(&state);

    let forged = common::sign_token("other-secret", serde_json::json!({ "sub": "u1" }));
    let resp = server.get(&format!("/ws/u1?token={forged}")).await;
    assert_eq!(resp.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn upgrade_with_someone_elses_token_is_unauthorized() {
    let state = common::test_state();
    let server = server(&state);

    let token = common::token_for("u2");
    let resp = server.get(&format!("/ws/u1?token={token}")).await;
    assert_eq!(resp.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn upgrade_to_unknown_hub_is_not_found() {
    let state = common::test_state();
    let server = server(&state);

    let token = common::token_for("u1");
    let resp = server.get(&format!("/ws/u1?hub=nope&token={token}")).await;
    assert_eq!(resp.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn upgrade_after_shutdown_is_unavailable() {
    let state = common::test_state();
    let server = server(&state);
    state.supervisor.shutdown_all(Duration::from_millis(50)).await;

    let token = common::token_for("u1");
    let resp = server.get(&format!("/ws/u1?token={token}")).await;
    assert_eq!(resp.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(state.supervisor.list_links().is_empty());
}

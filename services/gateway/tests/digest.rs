//! Offline buffering: messages published while a subscriber is away are
//! rolled into a digest that is pushed once, right after reconnect auth.

use chan_protocol::ServerFrame;
use chan_test_utils::{mint_token, MockWsClient};
use gateway::config::GatewayConfig;
use gateway::repo::profiles;
use gateway::AppState;
use serde_json::json;
use std::time::Duration;

const SECRET: &str = "digest-secret";

async fn start_gateway(config: GatewayConfig) -> (std::net::SocketAddr, AppState) {
    let pool = gateway::db::create_test_pool().await;
    let state = AppState::new(config, pool, gateway::handlers::builtin().unwrap());
    gateway::spawn_background(&state).await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = gateway::build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, state)
}

async fn connect_authed(addr: std::net::SocketAddr, account_id: i64) -> MockWsClient {
    let url = format!("ws://{addr}/ws/v1/clients");
    let mut client = MockWsClient::connect(&url).await.unwrap();
    client.recv_frame().await.unwrap();
    let token = mint_token(SECRET, account_id, None, "dev");
    client
        .send_json(&json!({ "type": "auth", "token": token }))
        .await
        .unwrap();
    match client.recv_frame().await.unwrap() {
        ServerFrame::Auth(r) if r.success => {}
        other => panic!("auth failed: {other:?}"),
    }
    client
}

#[tokio::test]
async fn offline_subscriber_gets_a_digest_on_reconnect() {
    let (addr, state) = start_gateway(GatewayConfig::for_tests(SECRET)).await;
    profiles::insert_profile(&state.pool, 42, 9, None, "C").await.unwrap();
    profiles::insert_profile(&state.pool, 71, 7, None, "Pub").await.unwrap();

    // C subscribes to alerts, then drops.
    let mut c = connect_authed(addr, 9).await;
    c.send_json(&json!({ "type": "subscribe", "channel": "alerts" }))
        .await
        .unwrap();
    c.recv_frame().await.unwrap();
    c.close().await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !state.tables.sessions.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "close did not clean up");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Three messages land while C is offline.
    let mut publisher = connect_authed(addr, 7).await;
    for i in 1..=3 {
        publisher
            .send_json(&json!({
                "type": "publish", "channel": "alerts",
                "message": { "text": format!("alert {i}") }
            }))
            .await
            .unwrap();
        match publisher.recv_frame().await.unwrap() {
            ServerFrame::Publish(r) => {
                assert!(r.success);
                assert_eq!(r.sent_to, 0);
            }
            other => panic!("expected publish response, got {other:?}"),
        }
    }

    // C reconnects: auth response, then one digest frame.
    let mut c = connect_authed(addr, 9).await;
    match c.recv_frame_timeout(Duration::from_secs(2)).await.unwrap() {
        ServerFrame::Digest(digest) => {
            assert_eq!(digest.total, 3);
            assert_eq!(digest.channels.len(), 1);
            assert_eq!(digest.channels[0].channel, "alerts");
            assert_eq!(digest.channels[0].count, 3);
            let preview = digest.channels[0].preview.as_deref().unwrap();
            assert!(preview.contains("alert 3"), "latest preview wins: {preview}");
        }
        other => panic!("expected digest, got {other:?}"),
    }

    // Live membership was restored from the durable mirror: a new publish
    // reaches C directly.
    publisher
        .send_json(&json!({
            "type": "publish", "channel": "alerts", "message": { "text": "live again" }
        }))
        .await
        .unwrap();
    match publisher.recv_frame().await.unwrap() {
        ServerFrame::Publish(r) => assert_eq!(r.sent_to, 1),
        other => panic!("expected publish response, got {other:?}"),
    }
    match c.recv_frame().await.unwrap() {
        ServerFrame::Message(m) => assert_eq!(m.message, json!({ "text": "live again" })),
        other => panic!("expected message, got {other:?}"),
    }
}

#[tokio::test]
async fn digests_are_delivered_once() {
    let (addr, state) = start_gateway(GatewayConfig::for_tests(SECRET)).await;
    profiles::insert_profile(&state.pool, 42, 9, None, "C").await.unwrap();
    profiles::insert_profile(&state.pool, 71, 7, None, "Pub").await.unwrap();

    let mut c = connect_authed(addr, 9).await;
    c.send_json(&json!({ "type": "subscribe", "channel": "alerts" }))
        .await
        .unwrap();
    c.recv_frame().await.unwrap();
    c.close().await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !state.tables.sessions.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "close did not clean up");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut publisher = connect_authed(addr, 7).await;
    publisher
        .send_json(&json!({
            "type": "publish", "channel": "alerts", "message": { "text": "missed" }
        }))
        .await
        .unwrap();
    publisher.recv_frame().await.unwrap();

    // First reconnect drains the digest.
    let mut c = connect_authed(addr, 9).await;
    assert!(matches!(
        c.recv_frame_timeout(Duration::from_secs(2)).await.unwrap(),
        ServerFrame::Digest(d) if d.total == 1
    ));
    c.close().await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !state.tables.sessions.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "close did not clean up");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Second reconnect: nothing buffered, no digest frame.
    let mut c = connect_authed(addr, 9).await;
    c.send_json(&json!({ "type": "ping" })).await.unwrap();
    match c.recv_frame().await.unwrap() {
        ServerFrame::Pong(_) => {}
        ServerFrame::Digest(d) => panic!("digest should have been cleared: {d:?}"),
        other => panic!("unexpected frame: {other:?}"),
    }
}

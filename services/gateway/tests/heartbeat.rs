//! Heartbeat and idle-timeout behavior at the transport layer.

use chan_protocol::ServerFrame;
use chan_test_utils::MockWsClient;
use gateway::config::GatewayConfig;
use gateway::AppState;
use serde_json::json;
use std::time::Duration;

const SECRET: &str = "heartbeat-secret";

async fn start_gateway(config: GatewayConfig) -> std::net::SocketAddr {
    let pool = gateway::db::create_test_pool().await;
    let state = AppState::new(config, pool, gateway::handlers::builtin().unwrap());
    gateway::spawn_background(&state).await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = gateway::build_router(state);
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    addr
}

#[tokio::test]
async fn idle_connections_are_closed_after_the_timeout() {
    let mut config = GatewayConfig::for_tests(SECRET);
    config.server.heartbeat_idle_secs = 1;
    // Keep the server ping far away so only the idle timer fires.
    config.server.heartbeat_interval_secs = 3600;
    let addr = start_gateway(config).await;

    let url = format!("ws://{addr}/ws/v1/clients");
    let mut client = MockWsClient::connect(&url).await.unwrap();
    client.recv_frame().await.unwrap();

    // Say nothing; the server must drop us shortly after one idle window.
    let start = tokio::time::Instant::now();
    let result = client.recv_frame_timeout(Duration::from_secs(5)).await;
    assert!(result.is_err(), "expected closure, got {result:?}");
    assert!(start.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn application_pings_are_answered_and_keep_the_connection_alive() {
    let mut config = GatewayConfig::for_tests(SECRET);
    config.server.heartbeat_idle_secs = 1;
    config.server.heartbeat_interval_secs = 3600;
    let addr = start_gateway(config).await;

    let url = format!("ws://{addr}/ws/v1/clients");
    let mut client = MockWsClient::connect(&url).await.unwrap();
    client.recv_frame().await.unwrap();

    // Ping every 400 ms for ~2 s: each inbound frame resets the idle timer,
    // so the connection outlives several idle windows.
    for _ in 0..5 {
        client.send_json(&json!({ "type": "ping" })).await.unwrap();
        match client.recv_frame().await.unwrap() {
            ServerFrame::Pong(pong) => assert!(pong.timestamp > 0),
            other => panic!("expected pong, got {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
    }
}

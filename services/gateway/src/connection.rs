//! Connection supervisor: owns the WebSocket accept path and one select
//! loop per live connection.
//!
//! The loop multiplexes three sources: inbound frames (guarded by the idle
//! timeout), the connection's outbound queue (fan-out deliveries and task
//! responses), and the server heartbeat.  Handler execution is sequential
//! per connection; a frame completes before the next one on the same fd is
//! processed.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use chan_protocol::{error_codes, DigestFrame, ServerFrame, SystemEnvelope};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

use crate::auth;
use crate::repo;
use crate::router;
use crate::state::AppState;
use crate::util::now_millis;

/// Protocol violations tolerated before the connection is closed with a
/// neutral reason.
const MAX_PROTOCOL_VIOLATIONS: u32 = 10;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!(error = %e, "outbound frame failed to serialize");
            Ok(())
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState, addr: SocketAddr) {
    let fd = state.next_fd();
    let remote_addr = addr.to_string();
    let mut outbound = state.connections.register(fd);
    info!(fd, remote_addr = %remote_addr, "connection opened");

    let greeting = ServerFrame::System(SystemEnvelope {
        event: "connected".to_owned(),
        message: None,
        fd,
        timestamp: now_millis(),
    });
    if send_frame(&mut socket, &greeting).await.is_err() {
        cleanup(&state, fd);
        return;
    }

    let idle = Duration::from_secs(state.config.server.heartbeat_idle_secs);
    let mut heartbeat = tokio::time::interval(Duration::from_secs(
        state.config.server.heartbeat_interval_secs,
    ));
    heartbeat.tick().await;
    // Tracked as a deadline rather than wrapping recv() in a timeout: other
    // select branches must not re-arm the idle window.
    let mut idle_deadline = tokio::time::Instant::now() + idle;

    let mut auth_failures: u32 = 0;
    let mut protocol_violations: u32 = 0;

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        if send_frame(&mut socket, &frame).await.is_err() { break; }
                    }
                    None => break,
                }
            }
            msg = socket.recv() => {
                idle_deadline = tokio::time::Instant::now() + idle;
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_text(&state, fd, &remote_addr, &mut socket, &mut auth_failures, &mut protocol_violations, &text).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        // Binary frames are accepted when they decode as
                        // UTF-8 JSON; anything else is a violation.
                        match String::from_utf8(data.to_vec()) {
                            Ok(text) => {
                                if !handle_text(&state, fd, &remote_addr, &mut socket, &mut auth_failures, &mut protocol_violations, &text).await {
                                    break;
                                }
                            }
                            Err(_) => {
                                protocol_violations += 1;
                                let envelope = ServerFrame::Error(chan_protocol::ErrorEnvelope {
                                    code: error_codes::PROTOCOL_VIOLATION.to_owned(),
                                    message: "binary frame is not UTF-8".to_owned(),
                                    status: None,
                                    timestamp: now_millis(),
                                });
                                if send_frame(&mut socket, &envelope).await.is_err()
                                    || protocol_violations >= MAX_PROTOCOL_VIOLATIONS
                                {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => { let _ = socket.send(Message::Pong(data)).await; }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => { info!(fd, "connection closed by peer"); break; }
                    Some(Err(e)) => { warn!(fd, error = %e, "WS error"); break; }
                }
            }
            () = tokio::time::sleep_until(idle_deadline) => {
                info!(fd, "idle timeout; closing");
                break;
            }
            _ = heartbeat.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() { break; }
            }
        }
    }

    cleanup(&state, fd);
}

/// Route one inbound text frame and ship its response.  Returns false when
/// the connection should close.
#[allow(clippy::too_many_arguments)]
async fn handle_text(
    state: &AppState,
    fd: u64,
    remote_addr: &str,
    socket: &mut WebSocket,
    auth_failures: &mut u32,
    protocol_violations: &mut u32,
    text: &str,
) -> bool {
    let Some(response) = router::handle_frame(state, fd, remote_addr, auth_failures, text).await
    else {
        return true;
    };

    let authenticated = matches!(&response, ServerFrame::Auth(r) if r.success);
    let violation =
        matches!(&response, ServerFrame::Error(e) if e.code == error_codes::PROTOCOL_VIOLATION);

    if send_frame(socket, &response).await.is_err() {
        return false;
    }

    if authenticated {
        restore_subscriptions(state, fd).await;
        push_digest(state, fd, socket).await;
    }

    if violation {
        *protocol_violations += 1;
        if *protocol_violations >= MAX_PROTOCOL_VIOLATIONS {
            warn!(fd, "repeated protocol violations; closing");
            return false;
        }
    }
    true
}

/// Rebuild live memberships from the durable mirror after a reconnect
/// authenticates.
async fn restore_subscriptions(state: &AppState, fd: u64) {
    let Some(session) = auth::session_for(&state.tables, fd) else {
        return;
    };
    match repo::subscriptions::channels_of(&state.pool, session.profile_id).await {
        Ok(channels) => {
            for channel in channels {
                if state.tables.channels.insert(&channel, fd).is_err() {
                    warn!(fd, channel = %channel, "CapacityExhausted restoring subscription");
                }
            }
        }
        Err(e) => warn!(fd, error = %e, "failed to load durable subscriptions"),
    }
}

/// Push the offline digest, if any, immediately after the auth response and
/// before normal traffic resumes.  Delivered digests are cleared.
async fn push_digest(state: &AppState, fd: u64, socket: &mut WebSocket) {
    let Some(session) = auth::session_for(&state.tables, fd) else {
        return;
    };
    match repo::digests::build_digest(&state.pool, session.profile_id).await {
        Ok(rollup) if !rollup.is_empty() => {
            let frame = ServerFrame::Digest(DigestFrame {
                total: rollup.total,
                channels: rollup
                    .channels
                    .into_iter()
                    .map(|c| chan_protocol::DigestChannel {
                        channel: c.channel,
                        count: c.count,
                        preview: c.preview,
                    })
                    .collect(),
                timestamp: now_millis(),
            });
            if send_frame(socket, &frame).await.is_ok() {
                if let Err(e) =
                    repo::digests::clear_digests(&state.pool, session.profile_id).await
                {
                    warn!(fd, error = %e, "failed to clear delivered digest");
                }
            }
        }
        Ok(_) => {}
        Err(e) => warn!(fd, error = %e, "digest build failed"),
    }
}

/// Close-time invariant: no subscription or session keyed by `fd` survives.
fn cleanup(state: &AppState, fd: u64) {
    state.connections.unregister(fd);
    let channels = state.tables.channels.remove_fd(fd);
    if let Some(session) = auth::clear(&state.tables, fd) {
        info!(
            fd,
            account_id = session.account_id,
            profile_id = session.profile_id,
            channels = channels.len(),
            "session closed"
        );
    } else {
        info!(fd, "connection closed");
    }
}

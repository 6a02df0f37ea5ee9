//! Frame router: classifies every inbound frame and routes it to a native
//! handler or the task dispatch bus.
//!
//! Handlers never throw out of the router: every inbound frame yields at
//! most one outbound envelope here (fan-out deliveries arrive separately
//! through the outbound queue).

use chan_protocol::{
    ApiError, ClientFrame, EndpointQueued, EndpointRequest, ErrorEnvelope, InjectedIdentity,
    ServerFrame,
};
use uuid::Uuid;

use crate::auth;
use crate::error::GatewayError;
use crate::registry::{check_scope, NativeContext};
use crate::state::AppState;
use crate::tables::Session;
use crate::tasks;
use crate::util::now_millis;

/// Failed `auth` frames tolerated per connection before further attempts
/// are rejected outright.
pub const MAX_AUTH_FAILURES: u32 = 5;

fn protocol_error(message: String) -> ServerFrame {
    ServerFrame::Error(ErrorEnvelope {
        code: chan_protocol::error_codes::PROTOCOL_VIOLATION.to_owned(),
        message,
        status: None,
        timestamp: now_millis(),
    })
}

fn api_error(correlation_id: String, status: u16, message: String) -> ServerFrame {
    ServerFrame::ApiError(ApiError {
        correlation_id,
        status,
        message,
        timestamp: now_millis(),
    })
}

/// Handle one inbound text frame for `fd`.  Yields at most one response
/// envelope; a handler that completes with no value sends nothing.
pub async fn handle_frame(
    state: &AppState,
    fd: u64,
    remote_addr: &str,
    auth_failures: &mut u32,
    text: &str,
) -> Option<ServerFrame> {
    let frame = match ClientFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => return Some(protocol_error(e.to_string())),
    };
    let session = auth::session_for(&state.tables, fd);
    let trace_id = Uuid::new_v4().to_string();

    match frame {
        ClientFrame::Endpoint(request) => {
            Some(route_endpoint(state, fd, session, request, trace_id))
        }
        native => run_native(state, fd, remote_addr, session, native, trace_id, auth_failures).await,
    }
}

async fn run_native(
    state: &AppState,
    fd: u64,
    remote_addr: &str,
    session: Option<Session>,
    frame: ClientFrame,
    trace_id: String,
    auth_failures: &mut u32,
) -> Option<ServerFrame> {
    let is_auth = matches!(frame, ClientFrame::Auth(_));
    if is_auth && *auth_failures >= MAX_AUTH_FAILURES {
        return Some(ServerFrame::Error(
            GatewayError::Unauthorized.envelope(now_millis()),
        ));
    }

    let Some(entry) = state.registry.native_entry(frame.type_name()) else {
        return Some(protocol_error(format!(
            "unregistered frame type '{}'",
            frame.type_name()
        )));
    };
    if let Err(e) = check_scope(entry.scope, session.is_some(), false) {
        return Some(ServerFrame::Error(e.envelope(now_millis())));
    }

    let ctx = NativeContext {
        state: state.clone(),
        fd,
        remote_addr: remote_addr.to_owned(),
        trace_id,
        session,
        frame,
    };
    match (entry.handler)(ctx).await {
        // A handler may complete with nothing to say (work persisted
        // out-of-band); no envelope goes out.
        Ok(response) => response,
        Err(e) => {
            if is_auth {
                *auth_failures += 1;
            }
            Some(ServerFrame::Error(e.envelope(now_millis())))
        }
    }
}

fn route_endpoint(
    state: &AppState,
    fd: u64,
    session: Option<Session>,
    request: EndpointRequest,
    trace_id: String,
) -> ServerFrame {
    let correlation_id = request
        .correlation_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Pre-flight: unknown routes and scope mismatches are rejected before a
    // task is ever queued.  The worker re-checks both when it executes.
    let Some((entry, _params)) = state.registry.match_endpoint(request.method, &request.route)
    else {
        return api_error(
            correlation_id,
            404,
            format!("no route matches {}", request.route),
        );
    };
    if let Err(e) = check_scope(entry.scope, session.is_some(), false) {
        return api_error(correlation_id, e.status().unwrap_or(500), e.to_string());
    }

    let identity = session.map(|s| InjectedIdentity {
        account_id: s.account_id,
        profile_id: s.profile_id,
        client_fd: fd,
        trace_id: trace_id.clone(),
    });

    match tasks::dispatch(state, fd, request, correlation_id.clone(), identity, trace_id) {
        Ok(task_id) => ServerFrame::EndpointQueued(EndpointQueued {
            correlation_id,
            task_id,
            timestamp: now_millis(),
        }),
        Err(e) => api_error(correlation_id, 500, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::handlers;
    use chan_protocol::error_codes;

    async fn test_state() -> AppState {
        let pool = crate::db::create_test_pool().await;
        AppState::new(
            GatewayConfig::for_tests("router-test-secret"),
            pool,
            handlers::builtin().unwrap(),
        )
    }

    async fn one(state: &AppState, fd: u64, failures: &mut u32, text: &str) -> ServerFrame {
        handle_frame(state, fd, "127.0.0.1:9", failures, text)
            .await
            .expect("builtin handlers always respond")
    }

    fn error_code(frame: &ServerFrame) -> &str {
        match frame {
            ServerFrame::Error(e) => &e.code,
            other => panic!("expected error envelope, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_yield_protocol_violations() {
        let state = test_state().await;
        let mut failures = 0;

        let resp = one(&state, 1, &mut failures, "{not-json").await;
        assert_eq!(error_code(&resp), error_codes::PROTOCOL_VIOLATION);

        let resp = one(&state, 1, &mut failures, r#"{"type":"shout"}"#).await;
        assert_eq!(error_code(&resp), error_codes::PROTOCOL_VIOLATION);

        let resp = one(&state, 1, &mut failures, r#"{"channel":"c"}"#).await;
        assert_eq!(error_code(&resp), error_codes::PROTOCOL_VIOLATION);
    }

    #[tokio::test]
    async fn unauthenticated_connections_cannot_subscribe_or_publish() {
        let state = test_state().await;
        let mut failures = 0;

        let resp = one(
            &state,
            1,
            &mut failures,
            r#"{"type":"subscribe","channel":"room.1"}"#,
        )
        .await;
        let ServerFrame::Error(e) = resp else {
            panic!("expected error");
        };
        assert_eq!(e.code, error_codes::UNAUTHENTICATED);
        assert_eq!(e.status, Some(401));

        let resp = one(
            &state,
            1,
            &mut failures,
            r#"{"type":"publish","channel":"room.1","message":{}}"#,
        )
        .await;
        assert_eq!(error_code(&resp), error_codes::UNAUTHENTICATED);
    }

    #[tokio::test]
    async fn ping_needs_no_session() {
        let state = test_state().await;
        let mut failures = 0;
        let resp = one(&state, 1, &mut failures, r#"{"type":"ping"}"#).await;
        assert!(matches!(resp, ServerFrame::Pong(_)));
    }

    #[tokio::test]
    async fn failed_auths_are_counted_and_eventually_refused() {
        let state = test_state().await;
        let mut failures = 0;
        for _ in 0..MAX_AUTH_FAILURES {
            let resp = one(
                &state,
                1,
                &mut failures,
                r#"{"type":"auth","token":"garbage"}"#,
            )
            .await;
            assert_eq!(error_code(&resp), error_codes::AUTH_MALFORMED);
        }
        assert_eq!(failures, MAX_AUTH_FAILURES);

        // The gate now rejects before validation runs.
        let resp = one(
            &state,
            1,
            &mut failures,
            r#"{"type":"auth","token":"garbage"}"#,
        )
        .await;
        assert_eq!(error_code(&resp), error_codes::UNAUTHORIZED);
        assert_eq!(failures, MAX_AUTH_FAILURES);
    }

    #[tokio::test]
    async fn system_endpoints_are_unreachable_from_client_frames() {
        let state = test_state().await;
        let mut failures = 0;

        // Even an authenticated session is refused System scope.
        crate::repo::profiles::insert_profile(&state.pool, 42, 7, None, "p")
            .await
            .unwrap();
        state
            .tables
            .sessions
            .insert(crate::tables::Session {
                fd: 1,
                account_id: 7,
                profile_id: 42,
                entity_id: None,
                token: String::new(),
                device_hash: "d".to_owned(),
            })
            .unwrap();

        let resp = one(
            &state,
            1,
            &mut failures,
            r#"{"type":"endpoint","route":"/_internal/cache/get","method":"GET","correlation_id":"c1","query":{"key":"global:a:b"}}"#,
        )
        .await;
        match resp {
            ServerFrame::ApiError(e) => {
                assert_eq!(e.correlation_id, "c1");
                assert_eq!(e.status, 403);
            }
            other => panic!("expected api_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_virtual_routes_get_404_with_correlation() {
        let state = test_state().await;
        let mut failures = 0;
        let resp = one(
            &state,
            1,
            &mut failures,
            r#"{"route":"/missing/route","correlation_id":"x9"}"#,
        )
        .await;
        match resp {
            ServerFrame::ApiError(e) => {
                assert_eq!(e.correlation_id, "x9");
                assert_eq!(e.status, 404);
            }
            other => panic!("expected api_error, got {other:?}"),
        }
    }
}

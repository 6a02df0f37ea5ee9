//! Task dispatch bus: hands virtual-HTTP work to the task worker pool and
//! routes responses back to the originating connection by correlation id.
//!
//! Request workers never execute endpoint handlers inline; they enqueue an
//! envelope and answer immediately with `endpoint_queued`.  Task workers
//! build a fresh [`EndpointContext`] per envelope, run the matched handler,
//! and push `api_response`/`api_error` to the origin.  Responses to
//! distinct tasks may arrive in any order; clients disambiguate by
//! `correlation_id`.  There is no cancellation: if the origin closed, the
//! completed response is dropped with a warning.

use chan_protocol::{
    ApiError, ApiResponse, ApiStatus, EndpointRequest, InjectedIdentity, ServerFrame,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::cache::CachePlane;
use crate::error::GatewayError;
use crate::registry::{check_scope, EndpointContext};
use crate::state::AppState;
use crate::util::now_millis;

/// One unit of work queued for the task workers.
#[derive(Debug)]
pub struct TaskEnvelope {
    pub task_id: u64,
    pub correlation_id: String,
    pub origin_fd: u64,
    pub request: EndpointRequest,
    pub identity: Option<InjectedIdentity>,
    pub internal: bool,
    pub trace_id: String,
}

/// Enqueue a task.  Returns the assigned `task_id` without waiting for
/// execution.
pub fn dispatch(
    state: &AppState,
    origin_fd: u64,
    request: EndpointRequest,
    correlation_id: String,
    identity: Option<InjectedIdentity>,
    trace_id: String,
) -> Result<u64, GatewayError> {
    let task_id = state.next_task_id();
    let envelope = TaskEnvelope {
        task_id,
        correlation_id,
        origin_fd,
        request,
        identity,
        internal: false,
        trace_id,
    };
    state
        .task_sender()
        .try_send(envelope)
        .map_err(|_| GatewayError::Task("task queue full".to_owned()))?;
    Ok(task_id)
}

/// Spawn the task worker pool.  Workers share one queue receiver; each
/// worker owns its own cache plane over the shared L2.
pub async fn spawn_workers(state: &AppState) {
    let Some(rx) = state.take_task_receiver().await else {
        return;
    };
    let rx = Arc::new(Mutex::new(rx));
    for worker in 0..state.config.server.task_worker_num {
        let state = state.clone();
        let rx = rx.clone();
        tokio::spawn(async move {
            run_worker(state, rx, worker).await;
        });
    }
}

async fn run_worker(state: AppState, rx: Arc<Mutex<mpsc::Receiver<TaskEnvelope>>>, worker: usize) {
    let cache = CachePlane::new(
        &state.config.cache,
        state.cache_l2.clone(),
        state.invalidation_bus.clone(),
    );
    loop {
        let envelope = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(envelope) = envelope else {
            debug!(worker, "task queue closed; worker exiting");
            break;
        };
        let origin_fd = envelope.origin_fd;
        let frame = execute(&state, &cache, envelope).await;
        if !state.connections.push(origin_fd, frame) {
            warn!(fd = origin_fd, "origin connection gone; dropping task response");
        }
    }
}

/// Run one envelope to completion and shape the response frame.
async fn execute(state: &AppState, cache: &CachePlane, envelope: TaskEnvelope) -> ServerFrame {
    let correlation_id = envelope.correlation_id.clone();
    match run_handler(state, cache, envelope).await {
        Ok(data) => ServerFrame::ApiResponse(ApiResponse {
            correlation_id,
            status: ApiStatus::Success,
            data,
            timestamp: now_millis(),
        }),
        Err(e) => ServerFrame::ApiError(ApiError {
            correlation_id,
            status: e.status().unwrap_or(500),
            message: e.to_string(),
            timestamp: now_millis(),
        }),
    }
}

async fn run_handler(
    state: &AppState,
    cache: &CachePlane,
    envelope: TaskEnvelope,
) -> Result<serde_json::Value, GatewayError> {
    let registry = state.registry.clone();
    let (entry, params) = registry
        .match_endpoint(envelope.request.method, &envelope.request.route)
        .ok_or_else(|| GatewayError::NotFound(envelope.request.route.clone()))?;
    check_scope(entry.scope, envelope.identity.is_some(), envelope.internal)?;

    // Fresh context per task: request-global state is rebuilt from the
    // envelope and dies with it.
    let ctx = EndpointContext {
        state: state.clone(),
        cache: cache.clone(),
        request: envelope.request,
        params,
        identity: envelope.identity,
        internal: envelope.internal,
        trace_id: envelope.trace_id,
    };
    (entry.handler)(ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::registry::HandlerRegistry;
    use chan_protocol::{HttpMethod, Scope};
    use serde_json::json;
    use std::time::Duration;

    fn echo_registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                &[HttpMethod::Get],
                r"/echo/(?P<word>[a-z]+)",
                Scope::Public,
                Arc::new(|ctx: EndpointContext| {
                    Box::pin(async move {
                        Ok(json!({
                            "word": ctx.params.get("word"),
                            "trace_id": ctx.trace_id,
                        }))
                    })
                }),
            )
            .unwrap();
        registry
            .register(
                &[HttpMethod::Get],
                "/boom",
                Scope::Public,
                Arc::new(|_ctx| {
                    Box::pin(async move { Err(GatewayError::Task("handler exploded".to_owned())) })
                }),
            )
            .unwrap();
        registry
    }

    async fn test_state() -> AppState {
        let pool = crate::db::create_test_pool().await;
        AppState::new(
            GatewayConfig::for_tests("task-test-secret"),
            pool,
            echo_registry(),
        )
    }

    fn request(route: &str) -> EndpointRequest {
        EndpointRequest {
            route: route.to_owned(),
            method: HttpMethod::Get,
            body: None,
            query: None,
            headers: None,
            correlation_id: Some("x1".to_owned()),
        }
    }

    #[tokio::test]
    async fn dispatched_tasks_route_their_response_back_to_the_origin() {
        let state = test_state().await;
        spawn_workers(&state).await;
        let mut rx = state.connections.register(7);

        let task_id = dispatch(
            &state,
            7,
            request("/echo/hello"),
            "x1".to_owned(),
            None,
            "trace-1".to_owned(),
        )
        .unwrap();
        assert!(task_id > 0);

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("response within deadline")
            .expect("frame");
        match frame {
            ServerFrame::ApiResponse(resp) => {
                assert_eq!(resp.correlation_id, "x1");
                assert_eq!(resp.status, ApiStatus::Success);
                assert_eq!(resp.data["word"], "hello");
            }
            other => panic!("expected api_response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_errors_surface_as_api_error_with_correlation() {
        let state = test_state().await;
        spawn_workers(&state).await;
        let mut rx = state.connections.register(9);

        dispatch(&state, 9, request("/boom"), "c9".to_owned(), None, "t".to_owned()).unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match frame {
            ServerFrame::ApiError(err) => {
                assert_eq!(err.correlation_id, "c9");
                assert_eq!(err.status, 500);
                assert!(err.message.contains("handler exploded"));
            }
            other => panic!("expected api_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_routes_become_404_api_errors() {
        let state = test_state().await;
        spawn_workers(&state).await;
        let mut rx = state.connections.register(3);

        dispatch(&state, 3, request("/nope"), "c3".to_owned(), None, "t".to_owned()).unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match frame {
            ServerFrame::ApiError(err) => assert_eq!(err.status, 404),
            other => panic!("expected api_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn responses_to_a_dead_origin_are_dropped_without_panic() {
        let state = test_state().await;
        spawn_workers(&state).await;
        // fd 11 never registers a connection.
        dispatch(&state, 11, request("/echo/bye"), "c".to_owned(), None, "t".to_owned()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

//! `/_internal` system endpoints: the L2 access path for cache planes on
//! other workers and trusted server-to-server callers.  All are registered
//! under `Scope::System` and are unreachable from client connections.

use chan_protocol::{MessageDelivery, ServerFrame, UserIdentity};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::cache::{namespace_of, INVALIDATION_CHANNEL_PREFIX};
use crate::error::GatewayError;
use crate::registry::{EndpointContext, EndpointResult};
use crate::state::AppState;
use crate::subscriptions;
use crate::util::now_millis;

/// Pull a required string field from the query object, falling back to the
/// body.
fn required_str(ctx: &EndpointContext, field: &'static str) -> Result<String, GatewayError> {
    ctx.request
        .query
        .as_ref()
        .and_then(|q| q.get(field))
        .or_else(|| ctx.request.body.as_ref().and_then(|b| b.get(field)))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| GatewayError::Protocol(format!("missing '{field}' field")))
}

/// Broadcast an invalidation notification on the reserved channel so cache
/// planes on other nodes evict their L1 entries.  Best-effort: a partition
/// may leave stale readers, which is acceptable for the values cached here.
async fn publish_wire_invalidation(state: &AppState, namespace: &str, payload: Value) {
    let channel = format!("{INVALIDATION_CHANNEL_PREFIX}{namespace}");
    let frame = ServerFrame::Message(MessageDelivery {
        channel: channel.clone(),
        message: payload,
        message_id: state.ids.next(),
        message_type: Some("cache_invalidation".to_owned()),
        from: UserIdentity {
            account_id: 0,
            profile_id: 0,
            entity_id: None,
        },
        timestamp: now_millis(),
    });
    if let Err(e) = subscriptions::fanout(state, &channel, &frame, None).await {
        debug!(channel = %channel, error = %e, "invalidation fan-out failed");
    }
}

/// `GET /_internal/cache/get` — authoritative read: `{exists, value}` in
/// one round-trip.
pub async fn cache_get(ctx: EndpointContext) -> EndpointResult {
    let key = required_str(&ctx, "key")?;
    let value = ctx.state.cache_l2.get(&key);
    Ok(json!({ "exists": value.is_some(), "value": value }))
}

/// `POST /_internal/cache/set` — write-through with invalidation published
/// before success is reported.
pub async fn cache_set(ctx: EndpointContext) -> EndpointResult {
    let key = required_str(&ctx, "key")?;
    let value = ctx
        .request
        .body
        .as_ref()
        .and_then(|b| b.get("value"))
        .cloned()
        .ok_or_else(|| GatewayError::Protocol("missing 'value' field".to_owned()))?;
    let ttl = ctx
        .request
        .body
        .as_ref()
        .and_then(|b| b.get("ttl_secs"))
        .and_then(Value::as_u64)
        .map(Duration::from_secs);

    ctx.cache.set(&key, value, ttl);
    publish_wire_invalidation(&ctx.state, namespace_of(&key), json!({ "key": key })).await;
    Ok(json!({ "ok": true }))
}

/// `POST|DELETE /_internal/cache/delete`.
pub async fn cache_delete(ctx: EndpointContext) -> EndpointResult {
    let key = required_str(&ctx, "key")?;
    let deleted = ctx.cache.delete(&key);
    publish_wire_invalidation(&ctx.state, namespace_of(&key), json!({ "key": key })).await;
    Ok(json!({ "deleted": deleted }))
}

/// `POST /_internal/flush` — namespace or prefix wipe.  Accepts either a
/// raw `prefix` or a `namespace` (optionally tenant-scoped via
/// `scope_entity_id`).
pub async fn flush(ctx: EndpointContext) -> EndpointResult {
    let body = ctx.request.body.as_ref();
    let prefix = match body.and_then(|b| b.get("prefix")).and_then(Value::as_str) {
        Some(prefix) => prefix.to_owned(),
        None => {
            let namespace = required_str(&ctx, "namespace")?;
            match body.and_then(|b| b.get("scope_entity_id")).and_then(Value::as_i64) {
                Some(entity) => format!("{entity}:{namespace}:"),
                None => format!("global:{namespace}:"),
            }
        }
    };

    let flushed = ctx.cache.flush_prefix(&prefix);
    publish_wire_invalidation(
        &ctx.state,
        namespace_of(&prefix),
        json!({ "prefix": prefix }),
    )
    .await;
    Ok(json!({ "flushed": flushed }))
}

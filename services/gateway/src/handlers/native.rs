//! Native frame handlers.  Each runs on the request worker owning the
//! connection; long work belongs in the task dispatch bus instead.

use chan_protocol::{
    AckResponse, AuthResponse, ClientFrame, FingerprintResponse, MessageDelivery, PendingDelivery,
    PendingResponse, PongEnvelope, PublishResponse, ServerFrame, SubscribeResponse,
    UnsubscribeResponse, UserIdentity,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::auth::AuthenticateError;
use crate::cache::{InvalidationNote, INVALIDATION_CHANNEL_PREFIX};
use crate::error::GatewayError;
use crate::registry::{NativeContext, NativeResult};
use crate::repo;
use crate::subscriptions;
use crate::tables::Session;
use crate::util::now_millis;

fn mismatch() -> GatewayError {
    GatewayError::Internal("frame type does not match registered handler".to_owned())
}

fn require_session(ctx: &NativeContext) -> Result<Session, GatewayError> {
    ctx.session.clone().ok_or(GatewayError::Unauthenticated)
}

pub async fn auth(ctx: NativeContext) -> NativeResult {
    let ClientFrame::Auth(frame) = ctx.frame else {
        return Err(mismatch());
    };
    let identity = crate::auth::authenticate(
        &ctx.state.verifier,
        &ctx.state.pool,
        &ctx.state.tables,
        ctx.fd,
        &frame.token,
    )
    .await
    .map_err(|e| match e {
        AuthenticateError::Token(e) => GatewayError::Auth(e),
        AuthenticateError::Table(e) => e.into(),
        AuthenticateError::Store(e) => e.into(),
    })?;

    info!(
        fd = ctx.fd,
        account_id = identity.account_id,
        profile_id = identity.profile_id,
        "session authenticated"
    );
    Ok(Some(ServerFrame::Auth(AuthResponse {
        success: true,
        user: Some(identity),
        timestamp: now_millis(),
    })))
}

pub async fn ping(_ctx: NativeContext) -> NativeResult {
    Ok(Some(ServerFrame::Pong(PongEnvelope {
        timestamp: now_millis(),
    })))
}

pub async fn subscribe(ctx: NativeContext) -> NativeResult {
    let session = require_session(&ctx)?;
    let ClientFrame::Subscribe(frame) = ctx.frame else {
        return Err(mismatch());
    };
    subscriptions::subscribe(&ctx.state, ctx.fd, &session, &frame.channel).await?;
    Ok(Some(ServerFrame::Subscribe(SubscribeResponse {
        success: true,
        channel: frame.channel,
        timestamp: now_millis(),
    })))
}

pub async fn unsubscribe(ctx: NativeContext) -> NativeResult {
    let session = require_session(&ctx)?;
    let ClientFrame::Unsubscribe(frame) = ctx.frame else {
        return Err(mismatch());
    };
    subscriptions::unsubscribe(&ctx.state, ctx.fd, &session, &frame.channel).await?;
    Ok(Some(ServerFrame::Unsubscribe(UnsubscribeResponse {
        success: true,
        channel: frame.channel,
        timestamp: now_millis(),
    })))
}

/// Short textual preview of a message body for digest rollups.
fn preview_of(body: &Value) -> String {
    match body {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub async fn publish(ctx: NativeContext) -> NativeResult {
    let session = require_session(&ctx)?;
    let ClientFrame::Publish(frame) = ctx.frame else {
        return Err(mismatch());
    };
    let state = &ctx.state;
    let message_id = frame
        .message_id
        .clone()
        .unwrap_or_else(|| state.ids.next());
    let created_at = now_millis();
    let priority = frame.priority.unwrap_or(0);

    // Durable rows first; the fan-out only counts once the message and its
    // pending deliveries exist.
    let recipients =
        repo::subscriptions::subscribers_of(&state.pool, &frame.channel).await?;
    let inserted = repo::messages::persist(
        &state.pool,
        &repo::messages::NewMessage {
            message_id: message_id.clone(),
            channel: frame.channel.clone(),
            body: frame.message.clone(),
            message_type: frame.message_type.clone(),
            priority,
            sender_account_id: session.account_id,
            sender_profile_id: session.profile_id,
            created_at,
        },
        &recipients,
    )
    .await?;

    // Republish of an already-persisted id: one message row, one set of
    // deliveries, one fan-out.
    if !inserted {
        return Ok(Some(ServerFrame::Publish(PublishResponse {
            success: true,
            message_id,
            sent_to: 0,
            timestamp: now_millis(),
        })));
    }

    let delivery = ServerFrame::Message(MessageDelivery {
        channel: frame.channel.clone(),
        message: frame.message.clone(),
        message_id: message_id.clone(),
        message_type: frame.message_type.clone(),
        from: UserIdentity {
            account_id: session.account_id,
            profile_id: session.profile_id,
            entity_id: session.entity_id,
        },
        timestamp: created_at,
    });
    let outcome = subscriptions::fanout(state, &frame.channel, &delivery, None).await?;

    for (_fd, profile_id) in &outcome.delivered {
        repo::messages::mark_delivered(&state.pool, &message_id, *profile_id, now_millis()).await?;
    }

    let preview = preview_of(&frame.message);
    for profile_id in &outcome.offline_profiles {
        // Digest upsert failures are non-fatal to the publish.
        if let Err(e) = repo::digests::upsert_digest(
            &state.pool,
            *profile_id,
            &frame.channel,
            &preview,
            priority,
            created_at,
        )
        .await
        {
            warn!(profile_id, error = %e, "digest upsert failed");
        }
    }

    // Publishes on the reserved invalidation channels also evict local L1s.
    if frame.channel.starts_with(INVALIDATION_CHANNEL_PREFIX) {
        forward_invalidation(state, &frame.message);
    }

    Ok(Some(ServerFrame::Publish(PublishResponse {
        success: true,
        message_id,
        sent_to: outcome.delivered.len() as u64,
        timestamp: now_millis(),
    })))
}

/// Feed a wire invalidation notification into the local bus.
pub(crate) fn forward_invalidation(state: &crate::state::AppState, payload: &Value) {
    if let Some(key) = payload.get("key").and_then(Value::as_str) {
        state
            .invalidation_bus
            .publish(InvalidationNote::Key(key.to_owned()));
    } else if let Some(prefix) = payload.get("prefix").and_then(Value::as_str) {
        state
            .invalidation_bus
            .publish(InvalidationNote::Prefix(prefix.to_owned()));
    }
}

pub async fn ack(ctx: NativeContext) -> NativeResult {
    let session = require_session(&ctx)?;
    let ClientFrame::Ack(frame) = ctx.frame else {
        return Err(mismatch());
    };
    // Forward-only in the store; a late or duplicate ACK is a no-op success.
    repo::messages::record_ack(
        &ctx.state.pool,
        &frame.message_id,
        session.profile_id,
        frame.level,
        frame.data.as_ref(),
        now_millis(),
    )
    .await?;
    Ok(Some(ServerFrame::Ack(AckResponse {
        success: true,
        message_id: frame.message_id,
        level: frame.level,
        timestamp: now_millis(),
    })))
}

pub async fn pending(ctx: NativeContext) -> NativeResult {
    let session = require_session(&ctx)?;
    let ClientFrame::Pending(frame) = ctx.frame else {
        return Err(mismatch());
    };
    let rows = repo::messages::get_pending(
        &ctx.state.pool,
        session.profile_id,
        frame.channel.as_deref(),
    )
    .await?;
    let deliveries = rows
        .into_iter()
        .map(|r| PendingDelivery {
            message_id: r.message_id,
            channel: r.channel,
            message: r.body,
            message_type: r.message_type,
            priority: r.priority,
            state: r.state,
            created_at: r.created_at,
        })
        .collect();
    Ok(Some(ServerFrame::Pending(PendingResponse {
        deliveries,
        timestamp: now_millis(),
    })))
}

pub async fn fingerprint(ctx: NativeContext) -> NativeResult {
    let session = require_session(&ctx)?;
    let digest = Sha256::digest(format!("{}{}", session.device_hash, ctx.fd).as_bytes());
    Ok(Some(ServerFrame::Fingerprint(FingerprintResponse {
        device_hash: session.device_hash,
        fingerprint: hex::encode(digest),
        timestamp: now_millis(),
    })))
}

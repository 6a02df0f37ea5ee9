//! Message and delivery persistence.
//!
//! Delivery state moves forward only:
//!
//! ```text
//! pending --deliver--> delivered --client_ack--> ack_client --app_ack--> ack_app
//!    |                     |                          |
//!    +-------------------expire----------------------+--> expired
//! ```
//!
//! Every transition is guarded by the set of states it may leave from, so a
//! late or duplicate call affects zero rows and reports a no-op success.

use chan_protocol::AckLevel;
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use super::StoreResult;

/// A message as handed to `persist`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub message_id: String,
    pub channel: String,
    pub body: Value,
    pub message_type: Option<String>,
    pub priority: i64,
    pub sender_account_id: i64,
    pub sender_profile_id: i64,
    pub created_at: i64,
}

/// One pending/delivered row for a recipient, joined with its message.
#[derive(Debug, Clone)]
pub struct PendingRow {
    pub message_id: String,
    pub channel: String,
    pub body: Value,
    pub message_type: Option<String>,
    pub priority: i64,
    pub state: String,
    pub created_at: i64,
}

/// Persist one message plus a `pending` delivery per recipient, atomically.
/// Idempotent by `message_id`: a repeat call is a no-op success and returns
/// `false`.
pub async fn persist(
    pool: &SqlitePool,
    message: &NewMessage,
    recipients: &[i64],
) -> StoreResult<bool> {
    let body = serde_json::to_string(&message.body)?;
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        r#"INSERT OR IGNORE INTO messages
           (message_id, channel, body, message_type, priority,
            sender_account_id, sender_profile_id, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
    )
    .bind(&message.message_id)
    .bind(&message.channel)
    .bind(&body)
    .bind(&message.message_type)
    .bind(message.priority)
    .bind(message.sender_account_id)
    .bind(message.sender_profile_id)
    .bind(message.created_at)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if inserted == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    for recipient in recipients {
        sqlx::query(
            r#"INSERT OR IGNORE INTO deliveries
               (message_id, recipient_profile_id, state, created_at)
               VALUES (?1, ?2, 'pending', ?3)"#,
        )
        .bind(&message.message_id)
        .bind(recipient)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(true)
}

/// `pending -> delivered`.  Refuses to regress from higher states; returns
/// whether a row actually moved.
pub async fn mark_delivered(
    pool: &SqlitePool,
    message_id: &str,
    recipient_profile_id: i64,
    at: i64,
) -> StoreResult<bool> {
    let affected = sqlx::query(
        r#"UPDATE deliveries SET state = 'delivered', delivered_at = ?1
           WHERE message_id = ?2 AND recipient_profile_id = ?3 AND state = 'pending'"#,
    )
    .bind(at)
    .bind(message_id)
    .bind(recipient_profile_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(affected > 0)
}

/// Record a client- or app-level acknowledgement.  `ack_app` is reachable
/// from `delivered` directly; once terminal, further ACKs are no-op success.
pub async fn record_ack(
    pool: &SqlitePool,
    message_id: &str,
    recipient_profile_id: i64,
    level: AckLevel,
    data: Option<&Value>,
    at: i64,
) -> StoreResult<bool> {
    let ack_data = data.map(serde_json::to_string).transpose()?;
    let query = match level {
        AckLevel::Client => {
            r#"UPDATE deliveries SET state = 'ack_client', acked_at = ?1, ack_data = ?2
               WHERE message_id = ?3 AND recipient_profile_id = ?4
                 AND state IN ('pending', 'delivered')"#
        }
        AckLevel::App => {
            r#"UPDATE deliveries SET state = 'ack_app', acked_at = ?1, ack_data = ?2
               WHERE message_id = ?3 AND recipient_profile_id = ?4
                 AND state IN ('pending', 'delivered', 'ack_client')"#
        }
    };
    let affected = sqlx::query(query)
        .bind(at)
        .bind(ack_data)
        .bind(message_id)
        .bind(recipient_profile_id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(affected > 0)
}

/// Deliveries in `{pending, delivered}` for a recipient, optionally filtered
/// by channel, ordered `priority desc, created_at asc`.
pub async fn get_pending(
    pool: &SqlitePool,
    recipient_profile_id: i64,
    channel: Option<&str>,
) -> StoreResult<Vec<PendingRow>> {
    let rows = match channel {
        Some(chan) => {
            sqlx::query(
                r#"SELECT m.message_id, m.channel, m.body, m.message_type, m.priority,
                          d.state, m.created_at
                   FROM deliveries d
                   JOIN messages m ON m.message_id = d.message_id
                   WHERE d.recipient_profile_id = ?1
                     AND d.state IN ('pending', 'delivered')
                     AND m.channel = ?2
                   ORDER BY m.priority DESC, m.created_at ASC"#,
            )
            .bind(recipient_profile_id)
            .bind(chan)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                r#"SELECT m.message_id, m.channel, m.body, m.message_type, m.priority,
                          d.state, m.created_at
                   FROM deliveries d
                   JOIN messages m ON m.message_id = d.message_id
                   WHERE d.recipient_profile_id = ?1
                     AND d.state IN ('pending', 'delivered')
                   ORDER BY m.priority DESC, m.created_at ASC"#,
            )
            .bind(recipient_profile_id)
            .fetch_all(pool)
            .await?
        }
    };

    rows.into_iter()
        .map(|r| {
            let body: String = r.get("body");
            Ok(PendingRow {
                message_id: r.get("message_id"),
                channel: r.get("channel"),
                body: serde_json::from_str(&body)?,
                message_type: r.get("message_type"),
                priority: r.get("priority"),
                state: r.get("state"),
                created_at: r.get("created_at"),
            })
        })
        .collect()
}

/// Current state of one delivery; None when it does not exist.
pub async fn delivery_state(
    pool: &SqlitePool,
    message_id: &str,
    recipient_profile_id: i64,
) -> StoreResult<Option<String>> {
    let row = sqlx::query(
        r#"SELECT state FROM deliveries
           WHERE message_id = ?1 AND recipient_profile_id = ?2"#,
    )
    .bind(message_id)
    .bind(recipient_profile_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get("state")))
}

/// Bulk-expire unacknowledged deliveries created before `before_ts`.
/// Returns the number of rows transitioned.
pub async fn expire(pool: &SqlitePool, before_ts: i64) -> StoreResult<u64> {
    let affected = sqlx::query(
        r#"UPDATE deliveries SET state = 'expired'
           WHERE state IN ('pending', 'delivered') AND created_at < ?1"#,
    )
    .bind(before_ts)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(affected)
}

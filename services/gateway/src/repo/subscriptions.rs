//! Durable subscription mirror.
//!
//! The Channels Table holds live (fd-keyed) memberships; this mirror holds
//! profile-keyed subscriptions so a publish can find recipients that are
//! currently offline.

use sqlx::{Row, SqlitePool};

use super::StoreResult;

/// Returns true when a new row was written, false when the subscription
/// already existed.
pub async fn persist_subscription(
    pool: &SqlitePool,
    profile_id: i64,
    channel: &str,
    at: i64,
) -> StoreResult<bool> {
    let affected = sqlx::query(
        r#"INSERT OR IGNORE INTO channel_subscriptions (profile_id, channel, created_at)
           VALUES (?1, ?2, ?3)"#,
    )
    .bind(profile_id)
    .bind(channel)
    .bind(at)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(affected > 0)
}

pub async fn remove_subscription(
    pool: &SqlitePool,
    profile_id: i64,
    channel: &str,
) -> StoreResult<()> {
    sqlx::query("DELETE FROM channel_subscriptions WHERE profile_id = ?1 AND channel = ?2")
        .bind(profile_id)
        .bind(channel)
        .execute(pool)
        .await?;
    Ok(())
}

/// Every profile with a durable subscription to `channel`.
pub async fn subscribers_of(pool: &SqlitePool, channel: &str) -> StoreResult<Vec<i64>> {
    let rows = sqlx::query(
        "SELECT profile_id FROM channel_subscriptions WHERE channel = ?1 ORDER BY profile_id",
    )
    .bind(channel)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.get("profile_id")).collect())
}

/// Channels a profile is durably subscribed to.
pub async fn channels_of(pool: &SqlitePool, profile_id: i64) -> StoreResult<Vec<String>> {
    let rows = sqlx::query(
        "SELECT channel FROM channel_subscriptions WHERE profile_id = ?1 ORDER BY channel",
    )
    .bind(profile_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.get("channel")).collect())
}

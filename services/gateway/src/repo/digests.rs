//! Offline notification digests.
//!
//! One row per (recipient, channel).  Upserted on every publish that found
//! the recipient offline; read back and cleared when the recipient
//! reconnects and authenticates.

use sqlx::{Row, SqlitePool};

use super::StoreResult;

/// Longest preview stored per channel rollup.
pub const PREVIEW_MAX_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChannelRow {
    pub channel: String,
    pub count: u64,
    pub preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestRollup {
    pub total: u64,
    pub channels: Vec<DigestChannelRow>,
}

impl DigestRollup {
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

fn bound_preview(preview: &str) -> String {
    preview.chars().take(PREVIEW_MAX_CHARS).collect()
}

/// Increment the rollup for an offline recipient, keeping the most-recent
/// preview and the highest priority seen.
pub async fn upsert_digest(
    pool: &SqlitePool,
    recipient_profile_id: i64,
    channel: &str,
    message_preview: &str,
    priority: i64,
    at: i64,
) -> StoreResult<()> {
    sqlx::query(
        r#"INSERT INTO digests (recipient_profile_id, channel, count, preview, priority, updated_at)
           VALUES (?1, ?2, 1, ?3, ?4, ?5)
           ON CONFLICT (recipient_profile_id, channel) DO UPDATE SET
               count = count + 1,
               preview = excluded.preview,
               priority = MAX(priority, excluded.priority),
               updated_at = excluded.updated_at"#,
    )
    .bind(recipient_profile_id)
    .bind(channel)
    .bind(bound_preview(message_preview))
    .bind(priority)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Per-channel rollup for every channel with buffered messages, ordered
/// `priority desc, updated_at asc`.
pub async fn build_digest(pool: &SqlitePool, recipient_profile_id: i64) -> StoreResult<DigestRollup> {
    let rows = sqlx::query(
        r#"SELECT channel, count, preview FROM digests
           WHERE recipient_profile_id = ?1 AND count > 0
           ORDER BY priority DESC, updated_at ASC"#,
    )
    .bind(recipient_profile_id)
    .fetch_all(pool)
    .await?;

    let channels: Vec<DigestChannelRow> = rows
        .into_iter()
        .map(|r| DigestChannelRow {
            channel: r.get("channel"),
            count: r.get::<i64, _>("count").max(0) as u64,
            preview: r.get("preview"),
        })
        .collect();
    let total = channels.iter().map(|c| c.count).sum();
    Ok(DigestRollup { total, channels })
}

/// Drop every rollup for a recipient, after the digest frame was delivered.
pub async fn clear_digests(pool: &SqlitePool, recipient_profile_id: i64) -> StoreResult<()> {
    sqlx::query("DELETE FROM digests WHERE recipient_profile_id = ?1")
        .bind(recipient_profile_id)
        .execute(pool)
        .await?;
    Ok(())
}

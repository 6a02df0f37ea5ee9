//! Profile metadata, loaded during authentication.

use sqlx::{Row, SqlitePool};

use super::StoreResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRow {
    pub profile_id: i64,
    pub account_id: i64,
    pub entity_id: Option<i64>,
    pub display_name: String,
}

fn map_row(r: &sqlx::sqlite::SqliteRow) -> ProfileRow {
    ProfileRow {
        profile_id: r.get("profile_id"),
        account_id: r.get("account_id"),
        entity_id: r.get("entity_id"),
        display_name: r.get("display_name"),
    }
}

pub async fn profile_by_id(pool: &SqlitePool, profile_id: i64) -> StoreResult<Option<ProfileRow>> {
    let row = sqlx::query(
        "SELECT profile_id, account_id, entity_id, display_name FROM profiles WHERE profile_id = ?1",
    )
    .bind(profile_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(map_row))
}

/// Primary profile for an account: the lowest profile_id wins.
pub async fn profile_by_account(pool: &SqlitePool, account_id: i64) -> StoreResult<Option<ProfileRow>> {
    let row = sqlx::query(
        r#"SELECT profile_id, account_id, entity_id, display_name FROM profiles
           WHERE account_id = ?1 ORDER BY profile_id ASC LIMIT 1"#,
    )
    .bind(account_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(map_row))
}

/// Seed helper used by tests and provisioning tools.
pub async fn insert_profile(
    pool: &SqlitePool,
    profile_id: i64,
    account_id: i64,
    entity_id: Option<i64>,
    display_name: &str,
) -> StoreResult<()> {
    sqlx::query(
        r#"INSERT OR REPLACE INTO profiles (profile_id, account_id, entity_id, display_name)
           VALUES (?1, ?2, ?3, ?4)"#,
    )
    .bind(profile_id)
    .bind(account_id)
    .bind(entity_id)
    .bind(display_name)
    .execute(pool)
    .await?;
    Ok(())
}

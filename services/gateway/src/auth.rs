//! Token validation and session binding.
//!
//! Tokens are compact three-part JWTs signed HS256 with the configured
//! secret.  When `jwt_xor_key` is configured the wire form is additionally
//! obfuscated: `base64(jwt XOR cycled-key)`; de-obfuscation happens before
//! JWT validation and any decode failure is reported as `Malformed`.
//!
//! The payload carries `account_id` and `device_hash` at minimum;
//! `profile_id`, when present, is preferred over deriving the profile from
//! the account.

use base64::Engine;
use chan_protocol::{error_codes, UserIdentity};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::repo::{profiles, StoreError};
use crate::tables::{Session, SharedTables, TableError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature is invalid")]
    BadSignature,
    #[error("token has expired")]
    Expired,
    #[error("profile not found for token identity")]
    ProfileNotFound,
}

impl AuthError {
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::Malformed => error_codes::AUTH_MALFORMED,
            Self::BadSignature => error_codes::AUTH_BAD_SIGNATURE,
            Self::Expired => error_codes::AUTH_EXPIRED,
            Self::ProfileNotFound => error_codes::AUTH_PROFILE_NOT_FOUND,
        }
    }
}

/// Everything that can go wrong binding a session, beyond the token itself.
#[derive(Debug, Error)]
pub enum AuthenticateError {
    #[error(transparent)]
    Token(#[from] AuthError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Claims embedded in the token payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub account_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<i64>,
    pub device_hash: String,
    pub exp: i64,
}

/// Verifies wire tokens against the configured secret and optional XOR key.
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    xor_key: Option<Vec<u8>>,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str, xor_key: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp"]);
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            xor_key: xor_key.map(|k| k.as_bytes().to_vec()),
            validation,
        }
    }

    /// Validate one wire token and extract its claims.
    pub fn verify(&self, wire_token: &str) -> Result<TokenClaims, AuthError> {
        let compact = match &self.xor_key {
            Some(key) => deobfuscate(wire_token, key)?,
            None => wire_token.to_owned(),
        };
        decode::<TokenClaims>(&compact, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::BadSignature,
                _ => AuthError::Malformed,
            })
    }
}

fn deobfuscate(wire_token: &str, key: &[u8]) -> Result<String, AuthError> {
    let mut bytes = base64::engine::general_purpose::STANDARD
        .decode(wire_token)
        .map_err(|_| AuthError::Malformed)?;
    for (i, b) in bytes.iter_mut().enumerate() {
        *b ^= key[i % key.len()];
    }
    String::from_utf8(bytes).map_err(|_| AuthError::Malformed)
}

/// Validate `token`, resolve the profile, and bind a Session to `fd`.
///
/// On any failure nothing is written to the Auth Table and the connection
/// stays unauthenticated.  Re-authenticating an already-authenticated fd is
/// last-writer-wins (same valid token: a successful no-op).
pub async fn authenticate(
    verifier: &TokenVerifier,
    pool: &SqlitePool,
    tables: &SharedTables,
    fd: u64,
    wire_token: &str,
) -> Result<UserIdentity, AuthenticateError> {
    let claims = verifier.verify(wire_token)?;

    let profile = match claims.profile_id {
        Some(profile_id) => profiles::profile_by_id(pool, profile_id)
            .await?
            .filter(|p| p.account_id == claims.account_id),
        None => profiles::profile_by_account(pool, claims.account_id).await?,
    }
    .ok_or(AuthError::ProfileNotFound)?;

    tables.sessions.insert(Session {
        fd,
        account_id: claims.account_id,
        profile_id: profile.profile_id,
        entity_id: profile.entity_id,
        token: wire_token.to_owned(),
        device_hash: claims.device_hash,
    })?;

    Ok(UserIdentity {
        account_id: claims.account_id,
        profile_id: profile.profile_id,
        entity_id: profile.entity_id,
    })
}

/// Read-through from the Auth Table.
pub fn session_for(tables: &SharedTables, fd: u64) -> Option<Session> {
    tables.sessions.get(fd)
}

/// Remove the Session on disconnect; idempotent.
pub fn clear(tables: &SharedTables, fd: u64) -> Option<Session> {
    tables.sessions.remove(fd)
}

//! Bearer-token minting for tests: compact HS256 JWTs matching the claims
//! shape the gateway validates, plus the optional XOR wire obfuscation.

use base64::Engine;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct TestClaims {
    pub account_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<i64>,
    pub device_hash: String,
    pub exp: i64,
}

/// Mint a token valid for one hour.
pub fn mint_token(secret: &str, account_id: i64, profile_id: Option<i64>, device_hash: &str) -> String {
    mint_token_with_exp(
        secret,
        account_id,
        profile_id,
        device_hash,
        chrono::Utc::now().timestamp() + 3600,
    )
}

pub fn mint_token_with_exp(
    secret: &str,
    account_id: i64,
    profile_id: Option<i64>,
    device_hash: &str,
    exp: i64,
) -> String {
    let claims = TestClaims {
        account_id,
        profile_id,
        device_hash: device_hash.to_owned(),
        exp,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("failed to mint test token")
}

/// Apply the wire obfuscation a gateway configured with `jwt_xor_key`
/// expects: `base64(jwt XOR cycled-key)`.
pub fn obfuscate_token(jwt: &str, xor_key: &str) -> String {
    let key = xor_key.as_bytes();
    let mut bytes = jwt.as_bytes().to_vec();
    for (i, b) in bytes.iter_mut().enumerate() {
        *b ^= key[i % key.len()];
    }
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

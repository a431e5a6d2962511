//! Request authentication
//!
//! User auth is a bearer token resolved to an owner row; admin
//! endpoints check a shared operator token. Tokens are compared by
//! digest in constant time, and only peppered hashes are stored.

use super::{ApiError, AppState};
use crate::db::User;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Constant-time token comparison via SHA-256 digest.
/// Hashing normalizes lengths so ct_eq always compares 32 bytes.
pub fn token_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

/// Peppered hash for stored tokens (API tokens, enrollment tokens,
/// runner secrets)
pub fn hash_token(pepper: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pepper.as_bytes());
    hasher.update(b":");
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Opaque printable token, 43 chars of url-safe base64
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Authenticated request owner
pub struct OwnerUser(pub User);

#[axum::async_trait]
impl FromRequestParts<AppState> for OwnerUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;
        let hash = hash_token(&state.config.token_pepper, token);
        match state.db.get_user_by_token_hash(&hash) {
            Ok(Some(user)) => Ok(OwnerUser(user)),
            Ok(None) => Err(ApiError::Unauthorized("invalid token".to_string())),
            Err(e) => Err(ApiError::Internal(e.to_string())),
        }
    }
}

/// Operator gate for deployment and runner administration
pub struct AdminGate;

#[axum::async_trait]
impl FromRequestParts<AppState> for AdminGate {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config.admin_token.as_deref() else {
            return Err(ApiError::Unauthorized(
                "admin endpoints disabled: no admin token configured".to_string(),
            ));
        };
        let provided = parts
            .headers
            .get("x-admin-token")
            .and_then(|v| v.to_str().ok())
            .or_else(|| bearer_token(parts));
        match provided {
            Some(token) if token_eq(token, expected) => Ok(AdminGate),
            _ => Err(ApiError::Unauthorized("invalid admin token".to_string())),
        }
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_eq() {
        assert!(token_eq("secret", "secret"));
        assert!(!token_eq("secret", "Secret"));
        assert!(!token_eq("secret", "secret2"));
    }

    #[test]
    fn test_generated_tokens_are_long_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert!(a.len() >= 30);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_graphic()));
    }

    #[test]
    fn test_hash_depends_on_pepper() {
        assert_ne!(hash_token("p1", "tok"), hash_token("p2", "tok"));
        assert_eq!(hash_token("p1", "tok"), hash_token("p1", "tok"));
    }
}

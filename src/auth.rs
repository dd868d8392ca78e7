use axum::http::HeaderMap;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::Row;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Resolves the request's bearer token to a user id.
///
/// Tokens are opaque; only their SHA-256 digest is stored in
/// `user_sessions`, so a leaked database dump cannot be replayed.
pub async fn require_user_id(state: &AppState, headers: &HeaderMap) -> AppResult<String> {
    if state.config.auth_dev_overrides_enabled() {
        if let Some(user_id) = header_value(headers, "x-user-id") {
            return Ok(user_id);
        }
    }

    let token = bearer_token(headers).ok_or_else(|| {
        AppError::Unauthorized("Unauthorized: missing bearer token.".to_string())
    })?;
    let digest = token_digest(&token);

    if let Some(user_id) = state.session_cache.get(&digest).await {
        return Ok(user_id);
    }

    let pool = state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })?;

    let row = sqlx::query(
        "SELECT user_id::text AS user_id, expires_at
         FROM user_sessions
         WHERE token_digest = $1
         LIMIT 1",
    )
    .bind(&digest)
    .fetch_optional(pool)
    .await
    .map_err(|error| AppError::Dependency(format!("Session lookup failed: {error}")))?;

    let row = row.ok_or_else(|| {
        AppError::Unauthorized("Unauthorized: unknown bearer token.".to_string())
    })?;

    let expires_at: Option<chrono::DateTime<Utc>> = row.try_get("expires_at").ok();
    if expires_at.is_some_and(|deadline| deadline <= Utc::now()) {
        return Err(AppError::Unauthorized(
            "Unauthorized: session has expired.".to_string(),
        ));
    }

    let user_id: String = row
        .try_get("user_id")
        .map_err(|_| AppError::Unauthorized("Unauthorized: invalid session.".to_string()))?;

    state.session_cache.insert(digest, user_id.clone()).await;
    Ok(user_id)
}

pub fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.trim().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let rest = raw.strip_prefix("Bearer ").or_else(|| raw.strip_prefix("bearer "))?;
    let trimmed = rest.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use super::{bearer_token, token_digest};
    use axum::http::{HeaderMap, HeaderValue};

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc123 "),
        );
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc123"));

        let mut empty = HeaderMap::new();
        empty.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer "),
        );
        assert_eq!(bearer_token(&empty), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn digest_is_stable_and_hex() {
        let digest = token_digest("secret-token");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, token_digest(" secret-token "));
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

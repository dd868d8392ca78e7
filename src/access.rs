use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

fn db_pool(state: &AppState) -> AppResult<&PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

pub async fn get_user(state: &AppState, user_id: &str) -> AppResult<Option<Value>> {
    // A non-UUID caller id (e.g. a garbage dev override) is simply an
    // unknown user, not a database error.
    let Ok(id) = uuid::Uuid::parse_str(user_id.trim()) else {
        return Ok(None);
    };

    let pool = db_pool(state)?;
    let row = sqlx::query(
        "SELECT row_to_json(t) AS row
         FROM users t
         WHERE id = $1
         LIMIT 1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(|error| AppError::Dependency(format!("User lookup failed: {error}")))?;

    Ok(row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten()))
}

/// Returns the user row when the account exists and is still active.
pub async fn assert_active_user(state: &AppState, user_id: &str) -> AppResult<Value> {
    let user = get_user(state, user_id)
        .await?
        .ok_or_else(|| AppError::Unauthorized("Unauthorized: unknown user.".to_string()))?;

    let active = user
        .get("is_active")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !active {
        return Err(AppError::Forbidden(
            "Forbidden: this account has been deactivated.".to_string(),
        ));
    }
    Ok(user)
}

pub async fn assert_role(
    state: &AppState,
    user_id: &str,
    allowed_roles: &[&str],
) -> AppResult<Value> {
    let user = assert_active_user(state, user_id).await?;
    let role = user.get("role").and_then(Value::as_str).unwrap_or("unknown");

    if allowed_roles.contains(&role) {
        return Ok(user);
    }

    Err(AppError::Forbidden(format!(
        "Forbidden: role '{role}' is not allowed for this action."
    )))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::{assert_active_user, get_user};
    use crate::config::AppConfig;
    use crate::state::AppState;

    fn state_without_db() -> AppState {
        let config = AppConfig {
            app_name: "test".to_string(),
            environment: "test".to_string(),
            api_prefix: "/v1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            cors_origins: vec![],
            trusted_hosts: vec!["*".to_string()],
            dev_auth_overrides_enabled: false,
            rate_limit_per_second: 10,
            rate_limit_burst_size: 100,
            database_url: None,
            db_pool_max_connections: 1,
            db_pool_min_connections: 0,
            db_pool_acquire_timeout_seconds: 1,
            db_pool_idle_timeout_seconds: 1,
            session_cache_ttl_seconds: 1,
            session_cache_max_entries: 10,
            agency_timezone: "Europe/Madrid".to_string(),
        };
        AppState::build(config).expect("state")
    }

    #[tokio::test]
    async fn non_uuid_caller_id_is_unknown_not_a_db_error() {
        let state = state_without_db();

        let user = get_user(&state, "not-a-uuid").await.expect("no db error");
        assert!(user.is_none());

        let error = assert_active_user(&state, "not-a-uuid")
            .await
            .expect_err("unknown user");
        assert_eq!(error.status_code(), StatusCode::UNAUTHORIZED);
    }
}

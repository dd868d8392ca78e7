use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::NaiveDate;
use serde_json::{Map, Value};

use crate::{
    access::{assert_active_user, assert_role},
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit, envelope, envelope_with_message, remove_nulls, serialize_to_map,
        validate_input, CreateUserInput, UpdateUserInput, UserPath, UsersQuery,
    },
    services::audit::write_audit_log,
    state::AppState,
};

const USER_ROLES: &[&str] = &["admin", "manager", "agent"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/users", axum::routing::get(list_users).post(create_user))
        .route(
            "/users/{user_id}",
            axum::routing::get(get_user)
                .patch(update_user)
                .delete(delete_user),
        )
        .route(
            "/users/{user_id}/deactivate",
            axum::routing::post(deactivate_user),
        )
}

async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<UsersQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(role) = non_empty(query.role.as_deref()) {
        validate_role(&role)?;
        filters.insert("role".to_string(), Value::String(role));
    }
    if let Some(is_active) = query.is_active {
        filters.insert("is_active".to_string(), Value::Bool(is_active));
    }

    let rows = list_rows(
        pool,
        "users",
        Some(&filters),
        clamp_limit(query.limit),
        0,
        "full_name",
        true,
    )
    .await?;
    Ok(Json(envelope(Value::Array(rows))))
}

async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateUserInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, &["admin"]).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    validate_role(&payload.role)?;
    if let Some(hired_on) = payload.hired_on.as_deref() {
        parse_date(hired_on)?;
    }

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert(
        "email".to_string(),
        Value::String(payload.email.trim().to_ascii_lowercase()),
    );
    record.insert("is_active".to_string(), Value::Bool(true));

    let created = create_row(pool, "users", &record).await?;
    let entity_id = value_str(&created, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "create",
        "users",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;
    Ok((axum::http::StatusCode::CREATED, Json(envelope(created))))
}

async fn get_user(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let caller_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &caller_id).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "users", &path.user_id, "id").await?;
    Ok(Json(envelope(record)))
}

async fn update_user(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateUserInput>,
) -> AppResult<Json<Value>> {
    let caller_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &caller_id, &["admin"]).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    if let Some(role) = payload.role.as_deref() {
        validate_role(role)?;
    }
    if let Some(hired_on) = payload.hired_on.as_deref() {
        parse_date(hired_on)?;
    }

    let record = get_row(pool, "users", &path.user_id, "id").await?;
    let mut patch = remove_nulls(serialize_to_map(&payload));
    if let Some(email) = patch.get("email").and_then(Value::as_str) {
        let normalized = email.trim().to_ascii_lowercase();
        patch.insert("email".to_string(), Value::String(normalized));
    }
    let updated = update_row(pool, "users", &path.user_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&caller_id),
        "update",
        "users",
        Some(&path.user_id),
        Some(record),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(envelope(updated)))
}

/// Hard delete, for rows created by mistake. Offboarding a real employee
/// goes through deactivate so history and reports keep their agent.
async fn delete_user(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let caller_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &caller_id, &["admin"]).await?;
    let pool = db_pool(&state)?;

    if caller_id == path.user_id {
        return Err(AppError::BadRequest(
            "You cannot delete your own account.".to_string(),
        ));
    }

    let deleted = delete_row(pool, "users", &path.user_id, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&caller_id),
        "delete",
        "users",
        Some(&path.user_id),
        Some(deleted.clone()),
        None,
    )
    .await;
    Ok(Json(envelope(deleted)))
}

/// Offboards a user. The row stays for history and commission reports; only
/// the active flag flips and the termination date is stamped.
async fn deactivate_user(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let caller_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &caller_id, &["admin"]).await?;
    let pool = db_pool(&state)?;

    if caller_id == path.user_id {
        return Err(AppError::BadRequest(
            "You cannot deactivate your own account.".to_string(),
        ));
    }

    let record = get_row(pool, "users", &path.user_id, "id").await?;
    let already_inactive = record
        .get("is_active")
        .and_then(Value::as_bool)
        .map(|active| !active)
        .unwrap_or(false);
    if already_inactive {
        return Err(AppError::Conflict(
            "This user is already deactivated.".to_string(),
        ));
    }

    let mut patch = Map::new();
    patch.insert("is_active".to_string(), Value::Bool(false));
    patch.insert(
        "terminated_on".to_string(),
        Value::String(state.config.agency_today().to_string()),
    );
    let updated = update_row(pool, "users", &path.user_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&caller_id),
        "deactivate",
        "users",
        Some(&path.user_id),
        Some(record),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(envelope_with_message(updated, "User deactivated.")))
}

fn validate_role(role: &str) -> AppResult<()> {
    if USER_ROLES.contains(&role) {
        return Ok(());
    }
    Err(AppError::BadRequest(format!(
        "Invalid role '{role}'. Allowed: {}",
        USER_ROLES.join(", ")
    )))
}

fn parse_date(value: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::BadRequest("Invalid ISO date.".to_string()))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

fn value_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use super::{parse_date, validate_role};

    #[test]
    fn accepts_known_roles_only() {
        assert!(validate_role("admin").is_ok());
        assert!(validate_role("agent").is_ok());
        assert!(validate_role("owner").is_err());
    }

    #[test]
    fn validates_hire_dates() {
        assert!(parse_date("2024-06-15").is_ok());
        assert!(parse_date("15/06/2024").is_err());
    }
}

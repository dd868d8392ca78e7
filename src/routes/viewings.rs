use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Duration, NaiveDate};
use serde_json::{Map, Value};

use crate::{
    access::{assert_active_user, assert_role},
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit, envelope, envelope_with_message, remove_nulls, serialize_to_map,
        validate_input, CreateViewingInput, UpdateViewingInput, ViewingPath, ViewingsQuery,
    },
    services::audit::write_audit_log,
    state::AppState,
};

const VIEWING_STATUSES: &[&str] = &["scheduled", "completed", "cancelled", "no_show"];
const FINAL_VIEWING_STATUSES: &[&str] = &["completed", "cancelled", "no_show"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/viewings",
            axum::routing::get(list_viewings).post(create_viewing),
        )
        .route(
            "/viewings/{viewing_id}",
            axum::routing::get(get_viewing)
                .patch(update_viewing)
                .delete(delete_viewing),
        )
        .route(
            "/viewings/{viewing_id}/complete",
            axum::routing::post(complete_viewing),
        )
        .route(
            "/viewings/{viewing_id}/cancel",
            axum::routing::post(cancel_viewing),
        )
}

async fn list_viewings(
    State(state): State<AppState>,
    Query(query): Query<ViewingsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(property_id) = non_empty(query.property_id.as_deref()) {
        filters.insert("property_id".to_string(), Value::String(property_id));
    }
    if let Some(lead_id) = non_empty(query.lead_id.as_deref()) {
        filters.insert("lead_id".to_string(), Value::String(lead_id));
    }
    if let Some(agent_id) = non_empty(query.agent_id.as_deref()) {
        filters.insert("agent_id".to_string(), Value::String(agent_id));
    }
    if let Some(status) = non_empty(query.status.as_deref()) {
        validate_viewing_status(&status)?;
        filters.insert("status".to_string(), Value::String(status));
    }
    if let Some(from_date) = non_empty(query.from_date.as_deref()) {
        let from = parse_date(&from_date)?;
        filters.insert(
            "scheduled_at__gte".to_string(),
            Value::String(format!("{from}T00:00:00+00:00")),
        );
    }
    if let Some(to_date) = non_empty(query.to_date.as_deref()) {
        let next_day = parse_date(&to_date)? + Duration::days(1);
        filters.insert(
            "scheduled_at__lt".to_string(),
            Value::String(format!("{next_day}T00:00:00+00:00")),
        );
    }

    let rows = list_rows(
        pool,
        "viewings",
        Some(&filters),
        clamp_limit(query.limit),
        0,
        "scheduled_at",
        true,
    )
    .await?;
    Ok(Json(envelope(Value::Array(rows))))
}

async fn create_viewing(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateViewingInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    parse_timestamp(&payload.scheduled_at)?;
    // The property must exist before a visit can be booked against it.
    get_row(pool, "properties", &payload.property_id, "id").await?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert(
        "status".to_string(),
        Value::String("scheduled".to_string()),
    );

    let created = create_row(pool, "viewings", &record).await?;
    let entity_id = value_str(&created, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "create",
        "viewings",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;
    Ok((axum::http::StatusCode::CREATED, Json(envelope(created))))
}

async fn get_viewing(
    State(state): State<AppState>,
    Path(path): Path<ViewingPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "viewings", &path.viewing_id, "id").await?;
    Ok(Json(envelope(record)))
}

async fn update_viewing(
    State(state): State<AppState>,
    Path(path): Path<ViewingPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateViewingInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    if let Some(scheduled_at) = payload.scheduled_at.as_deref() {
        parse_timestamp(scheduled_at)?;
    }

    let record = get_row(pool, "viewings", &path.viewing_id, "id").await?;
    if FINAL_VIEWING_STATUSES.contains(&value_str(&record, "status").as_str()) {
        return Err(AppError::Conflict(
            "A finished viewing can no longer be rescheduled.".to_string(),
        ));
    }

    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "viewings", &path.viewing_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "update",
        "viewings",
        Some(&path.viewing_id),
        Some(record),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(envelope(updated)))
}

async fn delete_viewing(
    State(state): State<AppState>,
    Path(path): Path<ViewingPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, &["admin", "manager"]).await?;
    let pool = db_pool(&state)?;
    let deleted = delete_row(pool, "viewings", &path.viewing_id, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "delete",
        "viewings",
        Some(&path.viewing_id),
        Some(deleted.clone()),
        None,
    )
    .await;
    Ok(Json(envelope(deleted)))
}

async fn complete_viewing(
    State(state): State<AppState>,
    Path(path): Path<ViewingPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    transition_viewing(state, path, headers, "completed").await
}

async fn cancel_viewing(
    State(state): State<AppState>,
    Path(path): Path<ViewingPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    transition_viewing(state, path, headers, "cancelled").await
}

async fn transition_viewing(
    state: AppState,
    path: ViewingPath,
    headers: HeaderMap,
    target_status: &str,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let record = get_row(pool, "viewings", &path.viewing_id, "id").await?;
    let current = value_str(&record, "status");
    if current != "scheduled" {
        return Err(AppError::Conflict(format!(
            "Viewing is '{current}' and cannot become '{target_status}'."
        )));
    }

    let mut patch = Map::new();
    patch.insert(
        "status".to_string(),
        Value::String(target_status.to_string()),
    );
    let updated = update_row(pool, "viewings", &path.viewing_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        target_status,
        "viewings",
        Some(&path.viewing_id),
        Some(record),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(envelope_with_message(
        updated,
        &format!("Viewing marked {target_status}."),
    )))
}

fn validate_viewing_status(status: &str) -> AppResult<()> {
    if VIEWING_STATUSES.contains(&status) {
        return Ok(());
    }
    Err(AppError::BadRequest(format!(
        "Invalid status '{status}'. Allowed: {}",
        VIEWING_STATUSES.join(", ")
    )))
}

fn parse_date(value: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::BadRequest("Invalid ISO date.".to_string()))
}

fn parse_timestamp(value: &str) -> AppResult<DateTime<chrono::FixedOffset>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map_err(|_| AppError::BadRequest("Invalid RFC 3339 timestamp.".to_string()))
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
    use super::{parse_date, parse_timestamp, validate_viewing_status};

    #[test]
    fn accepts_known_statuses_only() {
        assert!(validate_viewing_status("scheduled").is_ok());
        assert!(validate_viewing_status("no_show").is_ok());
        assert!(validate_viewing_status("done").is_err());
    }

    #[test]
    fn rejects_malformed_dates_and_timestamps() {
        assert!(parse_date("2026-03-01").is_ok());
        assert!(parse_date("03/01/2026").is_err());
        assert!(parse_timestamp("2026-03-01T10:00:00+00:00").is_ok());
        assert!(parse_timestamp("2026-03-01").is_err());
    }
}

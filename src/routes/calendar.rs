use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, FixedOffset};
use serde_json::{Map, Value};

use crate::{
    access::assert_active_user,
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit, envelope, remove_nulls, serialize_to_map, validate_input,
        CalendarRangeQuery, CreateCalendarEventInput, EventPath, UpdateCalendarEventInput,
    },
    services::audit::write_audit_log,
    state::AppState,
};

const EVENT_KINDS: &[&str] = &["viewing", "meeting", "task", "other"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/calendar/events",
            axum::routing::get(list_events).post(create_event),
        )
        .route(
            "/calendar/events/{event_id}",
            axum::routing::get(get_event)
                .patch(update_event)
                .delete(delete_event),
        )
}

/// Lists events inside an explicit [from, to) window. The window is required
/// so a calendar client never pages through the full history by accident.
async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<CalendarRangeQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let from = parse_timestamp(&query.from)?;
    let to = parse_timestamp(&query.to)?;
    if to <= from {
        return Err(AppError::BadRequest(
            "'to' must be after 'from'.".to_string(),
        ));
    }

    let mut filters = Map::new();
    filters.insert(
        "starts_at__gte".to_string(),
        Value::String(from.to_rfc3339()),
    );
    filters.insert("starts_at__lt".to_string(), Value::String(to.to_rfc3339()));
    if let Some(agent_id) = non_empty(query.agent_id.as_deref()) {
        filters.insert("agent_id".to_string(), Value::String(agent_id));
    }
    if let Some(kind) = non_empty(query.kind.as_deref()) {
        validate_event_kind(&kind)?;
        filters.insert("kind".to_string(), Value::String(kind));
    }

    let rows = list_rows(
        pool,
        "calendar_events",
        Some(&filters),
        clamp_limit(query.limit),
        0,
        "starts_at",
        true,
    )
    .await?;
    Ok(Json(envelope(Value::Array(rows))))
}

async fn create_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateCalendarEventInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    validate_event_kind(&payload.kind)?;
    let starts_at = parse_timestamp(&payload.starts_at)?;
    let ends_at = parse_timestamp(&payload.ends_at)?;
    if ends_at <= starts_at {
        return Err(AppError::BadRequest(
            "Event must end after it starts.".to_string(),
        ));
    }
    assert_agent_is_free(pool, &payload.agent_id, starts_at, ends_at, None).await?;

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "calendar_events", &record).await?;
    let entity_id = value_str(&created, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "create",
        "calendar_events",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;
    Ok((axum::http::StatusCode::CREATED, Json(envelope(created))))
}

async fn get_event(
    State(state): State<AppState>,
    Path(path): Path<EventPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "calendar_events", &path.event_id, "id").await?;
    Ok(Json(envelope(record)))
}

async fn update_event(
    State(state): State<AppState>,
    Path(path): Path<EventPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateCalendarEventInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    if let Some(kind) = payload.kind.as_deref() {
        validate_event_kind(kind)?;
    }

    let record = get_row(pool, "calendar_events", &path.event_id, "id").await?;

    // Re-check the agent's availability whenever the window or owner moves.
    let starts_at = match payload.starts_at.as_deref() {
        Some(raw) => parse_timestamp(raw)?,
        None => parse_timestamp(&value_str(&record, "starts_at"))?,
    };
    let ends_at = match payload.ends_at.as_deref() {
        Some(raw) => parse_timestamp(raw)?,
        None => parse_timestamp(&value_str(&record, "ends_at"))?,
    };
    if ends_at <= starts_at {
        return Err(AppError::BadRequest(
            "Event must end after it starts.".to_string(),
        ));
    }
    let agent_id = non_empty(payload.agent_id.as_deref())
        .unwrap_or_else(|| value_str(&record, "agent_id"));
    if payload.starts_at.is_some() || payload.ends_at.is_some() || payload.agent_id.is_some() {
        assert_agent_is_free(pool, &agent_id, starts_at, ends_at, Some(&path.event_id)).await?;
    }

    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "calendar_events", &path.event_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "update",
        "calendar_events",
        Some(&path.event_id),
        Some(record),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(envelope(updated)))
}

async fn delete_event(
    State(state): State<AppState>,
    Path(path): Path<EventPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;
    let deleted = delete_row(pool, "calendar_events", &path.event_id, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "delete",
        "calendar_events",
        Some(&path.event_id),
        Some(deleted.clone()),
        None,
    )
    .await;
    Ok(Json(envelope(deleted)))
}

/// Rejects the booking with a conflict when the agent already has an event
/// overlapping [starts_at, ends_at). Two events overlap when each one starts
/// before the other ends.
async fn assert_agent_is_free(
    pool: &sqlx::PgPool,
    agent_id: &str,
    starts_at: DateTime<FixedOffset>,
    ends_at: DateTime<FixedOffset>,
    exclude_event_id: Option<&str>,
) -> AppResult<()> {
    let mut filters = Map::new();
    filters.insert("agent_id".to_string(), Value::String(agent_id.to_string()));
    filters.insert(
        "starts_at__lt".to_string(),
        Value::String(ends_at.to_rfc3339()),
    );
    filters.insert(
        "ends_at__gt".to_string(),
        Value::String(starts_at.to_rfc3339()),
    );

    let clashes = list_rows(pool, "calendar_events", Some(&filters), 5, 0, "starts_at", true)
        .await?;
    let clash = clashes.iter().find(|row| {
        exclude_event_id
            .map(|excluded| value_str(row, "id") != excluded)
            .unwrap_or(true)
    });
    if let Some(existing) = clash {
        return Err(AppError::Conflict(format!(
            "Agent already has '{}' from {} to {}.",
            value_str(existing, "title"),
            value_str(existing, "starts_at"),
            value_str(existing, "ends_at"),
        )));
    }
    Ok(())
}

fn validate_event_kind(kind: &str) -> AppResult<()> {
    if EVENT_KINDS.contains(&kind) {
        return Ok(());
    }
    Err(AppError::BadRequest(format!(
        "Invalid kind '{kind}'. Allowed: {}",
        EVENT_KINDS.join(", ")
    )))
}

fn parse_timestamp(value: &str) -> AppResult<DateTime<FixedOffset>> {
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
    use super::{parse_timestamp, validate_event_kind};

    #[test]
    fn accepts_known_kinds_only() {
        assert!(validate_event_kind("viewing").is_ok());
        assert!(validate_event_kind("task").is_ok());
        assert!(validate_event_kind("other").is_ok());
        assert!(validate_event_kind("signing").is_err());
        assert!(validate_event_kind("party").is_err());
    }

    #[test]
    fn rejects_inverted_windows() {
        let from = parse_timestamp("2026-03-01T10:00:00+00:00").unwrap();
        let to = parse_timestamp("2026-03-01T09:00:00+00:00").unwrap();
        assert!(to <= from);
    }
}

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::NaiveDate;
use serde_json::{json, Map, Value};

use crate::{
    access::{assert_active_user, assert_role},
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{count_rows, create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit, envelope, envelope_with_message, remove_nulls, serialize_to_map,
        validate_input, ClosePropertyInput, CreatePropertyInput, CreatePropertyReferralInput,
        PropertiesQuery, PropertyPath, UpdatePropertyInput,
    },
    services::audit::write_audit_log,
    state::AppState,
};

const PROPERTY_STATUSES: &[&str] = &["draft", "listed", "under_offer", "closed", "withdrawn"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/properties",
            axum::routing::get(list_properties).post(create_property),
        )
        .route(
            "/properties/{property_id}",
            axum::routing::get(get_property)
                .patch(update_property)
                .delete(delete_property),
        )
        .route(
            "/properties/{property_id}/close",
            axum::routing::post(close_property),
        )
        .route(
            "/properties/{property_id}/referrals",
            axum::routing::get(list_property_referrals).post(create_property_referral),
        )
}

async fn list_properties(
    State(state): State<AppState>,
    Query(query): Query<PropertiesQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(status) = non_empty(query.status.as_deref()) {
        validate_property_status(&status)?;
        filters.insert("status".to_string(), Value::String(status));
    }
    if let Some(agent_id) = non_empty(query.agent_id.as_deref()) {
        filters.insert("agent_id".to_string(), Value::String(agent_id));
    }
    if let Some(property_type) = non_empty(query.property_type.as_deref()) {
        filters.insert(
            "property_type".to_string(),
            Value::String(property_type.to_ascii_lowercase()),
        );
    }
    if let Some(city) = non_empty(query.city.as_deref()) {
        filters.insert("city".to_string(), Value::String(city));
    }
    if let Some(is_referral) = query.is_referral {
        filters.insert("is_referral".to_string(), Value::Bool(is_referral));
    }

    let rows = list_rows(
        pool,
        "properties",
        Some(&filters),
        clamp_limit(query.limit),
        0,
        "created_at",
        false,
    )
    .await?;
    Ok(Json(envelope(Value::Array(rows))))
}

async fn create_property(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreatePropertyInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, &["admin", "manager", "agent"]).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    validate_property_status(&payload.status)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    normalize_property_payload(&mut record);
    if !record.contains_key("agent_id") {
        record.insert("agent_id".to_string(), Value::String(user_id.clone()));
    }

    let created = create_row(pool, "properties", &record).await?;
    let entity_id = value_str(&created, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "create",
        "properties",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;
    Ok((axum::http::StatusCode::CREATED, Json(envelope(created))))
}

async fn get_property(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "properties", &path.property_id, "id").await?;
    Ok(Json(envelope(record)))
}

async fn update_property(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdatePropertyInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, &["admin", "manager", "agent"]).await?;
    let pool = db_pool(&state)?;

    if let Some(status) = payload.status.as_deref() {
        validate_property_status(status)?;
    }

    let record = get_row(pool, "properties", &path.property_id, "id").await?;
    let mut patch = remove_nulls(serialize_to_map(&payload));
    normalize_property_payload(&mut patch);
    enforce_referral_consistency(&mut patch, &record);
    let updated = update_row(pool, "properties", &path.property_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "update",
        "properties",
        Some(&path.property_id),
        Some(record),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(envelope(updated)))
}

async fn delete_property(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, &["admin", "manager"]).await?;
    let pool = db_pool(&state)?;

    // Pending viewings block deletion; cancel or complete them first.
    let mut viewing_filters = Map::new();
    viewing_filters.insert(
        "property_id".to_string(),
        Value::String(path.property_id.clone()),
    );
    viewing_filters.insert(
        "status".to_string(),
        Value::String("scheduled".to_string()),
    );
    let pending = count_rows(pool, "viewings", Some(&viewing_filters)).await?;
    if pending > 0 {
        return Err(AppError::Conflict(format!(
            "Property has {pending} scheduled viewing(s); cancel them first."
        )));
    }

    let deleted = delete_row(pool, "properties", &path.property_id, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "delete",
        "properties",
        Some(&path.property_id),
        Some(deleted.clone()),
        None,
    )
    .await;
    Ok(Json(envelope(deleted)))
}

/// Records a closing: status becomes `closed` with the final price and date.
async fn close_property(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    headers: HeaderMap,
    Json(payload): Json<ClosePropertyInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, &["admin", "manager", "agent"]).await?;
    let pool = db_pool(&state)?;

    let record = get_row(pool, "properties", &path.property_id, "id").await?;
    if value_str(&record, "status") == "closed" {
        return Err(AppError::Conflict(
            "This property has already been closed.".to_string(),
        ));
    }

    let closed_on = match payload.closed_on.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| AppError::BadRequest("closed_on must be an ISO date.".to_string()))?,
        _ => state.config.agency_today(),
    };

    let closed_price = payload
        .closed_price
        .filter(|value| *value > 0.0)
        .or_else(|| {
            record
                .get("price")
                .and_then(Value::as_f64)
                .filter(|value| *value > 0.0)
        })
        .ok_or_else(|| {
            AppError::BadRequest("closed_price is required for properties without a price.".to_string())
        })?;

    let mut patch = Map::new();
    patch.insert("status".to_string(), Value::String("closed".to_string()));
    patch.insert("closed_price".to_string(), json!(closed_price));
    patch.insert(
        "closed_at".to_string(),
        Value::String(format!("{closed_on}T00:00:00+00:00")),
    );

    let updated = update_row(pool, "properties", &path.property_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "close",
        "properties",
        Some(&path.property_id),
        Some(record),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(envelope_with_message(updated, "Property closed.")))
}

async fn list_property_referrals(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    // 404 before listing when the property itself is gone.
    get_row(pool, "properties", &path.property_id, "id").await?;

    let mut filters = Map::new();
    filters.insert(
        "property_id".to_string(),
        Value::String(path.property_id.clone()),
    );
    let rows = list_rows(
        pool,
        "property_referrals",
        Some(&filters),
        500,
        0,
        "occurred_on",
        false,
    )
    .await?;
    Ok(Json(envelope(Value::Array(rows))))
}

async fn create_property_referral(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    headers: HeaderMap,
    Json(payload): Json<CreatePropertyReferralInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, &["admin", "manager", "agent"]).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    get_row(pool, "properties", &path.property_id, "id").await?;

    let occurred_on = match payload.occurred_on.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| AppError::BadRequest("occurred_on must be an ISO date.".to_string()))?
            .to_string(),
        _ => state.config.agency_today().to_string(),
    };

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert(
        "property_id".to_string(),
        Value::String(path.property_id.clone()),
    );
    record.insert("occurred_on".to_string(), Value::String(occurred_on));

    let created = create_row(pool, "property_referrals", &record).await?;
    let entity_id = value_str(&created, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "create",
        "property_referrals",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;
    Ok((axum::http::StatusCode::CREATED, Json(envelope(created))))
}

fn validate_property_status(status: &str) -> AppResult<()> {
    if PROPERTY_STATUSES.contains(&status) {
        return Ok(());
    }
    Err(AppError::BadRequest(format!(
        "Invalid status '{status}'. Allowed: {}",
        PROPERTY_STATUSES.join(", ")
    )))
}

fn normalize_property_payload(payload: &mut Map<String, Value>) {
    let property_type = payload
        .get("property_type")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_ascii_lowercase);
    if let Some(value) = property_type {
        payload.insert("property_type".to_string(), Value::String(value));
    }

    let currency = payload
        .get("currency")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_ascii_uppercase);
    if let Some(value) = currency {
        payload.insert("currency".to_string(), Value::String(value));
    }

    // A property that is not referral-sourced cannot carry an external flag.
    let is_referral = payload
        .get("is_referral")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if payload.contains_key("is_referral") && !is_referral {
        payload.insert("referral_external".to_string(), Value::Bool(false));
    }
}

/// The merged row must never carry `referral_external` without
/// `is_referral`; patched values win over stored ones.
fn enforce_referral_consistency(patch: &mut Map<String, Value>, existing: &Value) {
    let is_referral = patch
        .get("is_referral")
        .and_then(Value::as_bool)
        .or_else(|| existing.get("is_referral").and_then(Value::as_bool))
        .unwrap_or(false);
    let external = patch
        .get("referral_external")
        .and_then(Value::as_bool)
        .or_else(|| existing.get("referral_external").and_then(Value::as_bool))
        .unwrap_or(false);
    if !is_referral && external {
        patch.insert("referral_external".to_string(), Value::Bool(false));
    }
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
    use serde_json::{Map, Value};

    use serde_json::json;

    use super::{
        enforce_referral_consistency, normalize_property_payload, validate_property_status,
    };

    #[test]
    fn accepts_known_statuses_only() {
        assert!(validate_property_status("listed").is_ok());
        assert!(validate_property_status("closed").is_ok());
        assert!(validate_property_status("sold").is_err());
    }

    #[test]
    fn normalizes_type_and_currency() {
        let mut payload = Map::new();
        payload.insert(
            "property_type".to_string(),
            Value::String(" Apartment ".to_string()),
        );
        payload.insert("currency".to_string(), Value::String("eur".to_string()));

        normalize_property_payload(&mut payload);

        assert_eq!(
            payload.get("property_type").and_then(Value::as_str),
            Some("apartment")
        );
        assert_eq!(payload.get("currency").and_then(Value::as_str), Some("EUR"));
    }

    #[test]
    fn clears_external_flag_for_non_referrals() {
        let mut payload = Map::new();
        payload.insert("is_referral".to_string(), Value::Bool(false));
        payload.insert("referral_external".to_string(), Value::Bool(true));

        normalize_property_payload(&mut payload);

        assert_eq!(
            payload.get("referral_external").and_then(Value::as_bool),
            Some(false)
        );
    }

    #[test]
    fn patch_cannot_leave_external_flag_on_a_non_referral() {
        // Patch flips the external flag while the stored row is not a referral.
        let mut patch = Map::new();
        patch.insert("referral_external".to_string(), Value::Bool(true));
        enforce_referral_consistency(&mut patch, &json!({ "is_referral": false }));
        assert_eq!(
            patch.get("referral_external").and_then(Value::as_bool),
            Some(false)
        );

        // Patch turns the referral off; the stored external flag must go too.
        let mut patch = Map::new();
        patch.insert("is_referral".to_string(), Value::Bool(false));
        enforce_referral_consistency(&mut patch, &json!({ "referral_external": true }));
        assert_eq!(
            patch.get("referral_external").and_then(Value::as_bool),
            Some(false)
        );

        // A genuine referral keeps its external flag.
        let mut patch = Map::new();
        patch.insert("referral_external".to_string(), Value::Bool(true));
        enforce_referral_consistency(&mut patch, &json!({ "is_referral": true }));
        assert_eq!(
            patch.get("referral_external").and_then(Value::as_bool),
            Some(true)
        );
    }
}

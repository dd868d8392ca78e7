use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::{
    access::{assert_active_user, assert_role},
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit, envelope, envelope_with_message, remove_nulls, serialize_to_map,
        validate_input, ConvertLeadInput, CreateLeadInput, LeadPath, LeadsQuery, UpdateLeadInput,
    },
    services::audit::write_audit_log,
    state::AppState,
};

const LEAD_STATUSES: &[&str] = &["new", "contacted", "qualified", "converted", "lost"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/leads", axum::routing::get(list_leads).post(create_lead))
        .route(
            "/leads/{lead_id}",
            axum::routing::get(get_lead)
                .patch(update_lead)
                .delete(delete_lead),
        )
        .route("/leads/{lead_id}/convert", axum::routing::post(convert_lead))
}

async fn list_leads(
    State(state): State<AppState>,
    Query(query): Query<LeadsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(status) = non_empty(query.status.as_deref()) {
        validate_lead_status(&status)?;
        filters.insert("status".to_string(), Value::String(status));
    }
    if let Some(agent_id) = non_empty(query.agent_id.as_deref()) {
        filters.insert("agent_id".to_string(), Value::String(agent_id));
    }
    if let Some(source) = non_empty(query.source.as_deref()) {
        filters.insert("source".to_string(), Value::String(source));
    }

    let rows = list_rows(
        pool,
        "leads",
        Some(&filters),
        clamp_limit(query.limit),
        0,
        "created_at",
        false,
    )
    .await?;
    Ok(Json(envelope(Value::Array(rows))))
}

async fn create_lead(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateLeadInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    validate_lead_status(&payload.status)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    if !record.contains_key("agent_id") {
        record.insert("agent_id".to_string(), Value::String(user_id.clone()));
    }
    if !payload.is_referral {
        record.insert("referral_external".to_string(), Value::Bool(false));
    }

    let created = create_row(pool, "leads", &record).await?;
    let entity_id = value_str(&created, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "create",
        "leads",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;
    Ok((axum::http::StatusCode::CREATED, Json(envelope(created))))
}

async fn get_lead(
    State(state): State<AppState>,
    Path(path): Path<LeadPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "leads", &path.lead_id, "id").await?;
    Ok(Json(envelope(record)))
}

async fn update_lead(
    State(state): State<AppState>,
    Path(path): Path<LeadPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateLeadInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    if let Some(status) = payload.status.as_deref() {
        validate_lead_status(status)?;
        if status == "converted" {
            return Err(AppError::BadRequest(
                "Use the convert endpoint to convert a lead.".to_string(),
            ));
        }
    }

    let record = get_row(pool, "leads", &path.lead_id, "id").await?;
    let mut patch = remove_nulls(serialize_to_map(&payload));
    enforce_referral_consistency(&mut patch, &record);
    let updated = update_row(pool, "leads", &path.lead_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "update",
        "leads",
        Some(&path.lead_id),
        Some(record),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(envelope(updated)))
}

async fn delete_lead(
    State(state): State<AppState>,
    Path(path): Path<LeadPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, &["admin", "manager"]).await?;
    let pool = db_pool(&state)?;
    let deleted = delete_row(pool, "leads", &path.lead_id, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "delete",
        "leads",
        Some(&path.lead_id),
        Some(deleted.clone()),
        None,
    )
    .await;
    Ok(Json(envelope(deleted)))
}

/// Converts a lead into a property listing. The lead's referral flags carry
/// over so referral commission is attributed the same way on both sides.
async fn convert_lead(
    State(state): State<AppState>,
    Path(path): Path<LeadPath>,
    headers: HeaderMap,
    Json(payload): Json<ConvertLeadInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let lead = get_row(pool, "leads", &path.lead_id, "id").await?;
    if value_str(&lead, "status") == "converted" {
        return Err(AppError::Conflict(
            "This lead has already been converted.".to_string(),
        ));
    }

    let price = payload
        .price
        .filter(|value| *value > 0.0)
        .or_else(|| lead.get("price").and_then(Value::as_f64))
        .filter(|value| *value > 0.0)
        .ok_or_else(|| {
            AppError::BadRequest("A positive price is required to convert a lead.".to_string())
        })?;

    let title = non_empty(payload.title.as_deref())
        .or_else(|| non_empty(Some(&format!("Listing for {}", value_str(&lead, "full_name")))))
        .unwrap_or_else(|| "Converted lead".to_string());

    let mut property = Map::new();
    property.insert("title".to_string(), Value::String(title));
    property.insert("status".to_string(), Value::String("listed".to_string()));
    property.insert("price".to_string(), json!(price));
    if let Some(address) = non_empty(payload.address_line1.as_deref()) {
        property.insert("address_line1".to_string(), Value::String(address));
    }
    if let Some(city) = non_empty(payload.city.as_deref()) {
        property.insert("city".to_string(), Value::String(city));
    }
    let agent_id = value_str(&lead, "agent_id");
    if !agent_id.is_empty() {
        property.insert("agent_id".to_string(), Value::String(agent_id));
    }
    property.insert(
        "is_referral".to_string(),
        Value::Bool(bool_of(&lead, "is_referral")),
    );
    property.insert(
        "referral_external".to_string(),
        Value::Bool(bool_of(&lead, "is_referral") && bool_of(&lead, "referral_external")),
    );

    let created_property = create_row(pool, "properties", &property).await?;
    let property_id = value_str(&created_property, "id");

    let mut patch = Map::new();
    patch.insert("status".to_string(), Value::String("converted".to_string()));
    patch.insert(
        "converted_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    patch.insert(
        "converted_property_id".to_string(),
        Value::String(property_id.clone()),
    );
    let updated_lead = update_row(pool, "leads", &path.lead_id, &patch, "id").await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "convert",
        "leads",
        Some(&path.lead_id),
        Some(lead),
        Some(updated_lead.clone()),
    )
    .await;

    Ok((
        axum::http::StatusCode::CREATED,
        Json(envelope_with_message(
            json!({ "lead": updated_lead, "property": created_property }),
            "Lead converted into a property listing.",
        )),
    ))
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

fn validate_lead_status(status: &str) -> AppResult<()> {
    if LEAD_STATUSES.contains(&status) {
        return Ok(());
    }
    Err(AppError::BadRequest(format!(
        "Invalid status '{status}'. Allowed: {}",
        LEAD_STATUSES.join(", ")
    )))
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

fn bool_of(row: &Value, key: &str) -> bool {
    row.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{enforce_referral_consistency, validate_lead_status};

    #[test]
    fn accepts_known_statuses_only() {
        assert!(validate_lead_status("new").is_ok());
        assert!(validate_lead_status("converted").is_ok());
        assert!(validate_lead_status("won").is_err());
    }

    #[test]
    fn patch_cannot_leave_external_flag_on_a_non_referral() {
        let mut patch = Map::new();
        patch.insert("referral_external".to_string(), Value::Bool(true));
        enforce_referral_consistency(&mut patch, &json!({ "is_referral": false }));
        assert_eq!(
            patch.get("referral_external").and_then(Value::as_bool),
            Some(false)
        );

        let mut patch = Map::new();
        patch.insert("is_referral".to_string(), Value::Bool(false));
        enforce_referral_consistency(&mut patch, &json!({ "referral_external": true }));
        assert_eq!(
            patch.get("referral_external").and_then(Value::as_bool),
            Some(false)
        );
    }
}

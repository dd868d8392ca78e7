use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    access::{assert_active_user, assert_role},
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{create_row, list_rows, update_row},
    schemas::{envelope, validate_input, SettingPath, UpsertSettingInput},
    services::audit::write_audit_log,
    services::commission::{
        commission_short_key, external_rate, internal_rate, load_commission_settings,
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/settings", axum::routing::get(list_settings))
        .route(
            "/settings/commission",
            axum::routing::get(get_commission_settings),
        )
        .route("/settings/{key}", axum::routing::put(upsert_setting))
}

async fn list_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;
    let rows = list_rows(pool, "system_settings", None, 500, 0, "key", true).await?;
    Ok(Json(envelope(Value::Array(rows))))
}

/// Exposes both the raw stored overrides and the rates the calculator will
/// actually apply, so the UI shows defaults without duplicating them.
async fn get_commission_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let settings = load_commission_settings(pool).await?;
    let overrides: Map<String, Value> = settings
        .iter()
        .map(|(key, value)| (key.clone(), json!(value)))
        .collect();

    Ok(Json(envelope(json!({
        "overrides": overrides,
        "applied": {
            "referral_external": external_rate(&settings),
            "referral_internal": internal_rate(&settings),
        },
    }))))
}

async fn upsert_setting(
    State(state): State<AppState>,
    Path(path): Path<SettingPath>,
    headers: HeaderMap,
    Json(payload): Json<UpsertSettingInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, &["admin"]).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let key = path.key.trim().to_ascii_lowercase();
    validate_setting(&key, &payload.value)?;

    let mut filters = Map::new();
    filters.insert("key".to_string(), Value::String(key.clone()));
    let existing = list_rows(pool, "system_settings", Some(&filters), 1, 0, "key", true).await?;

    let mut record = Map::new();
    record.insert("key".to_string(), Value::String(key.clone()));
    record.insert(
        "value".to_string(),
        Value::String(payload.value.trim().to_string()),
    );

    let (action, before, saved) = match existing.into_iter().next() {
        Some(current) => {
            let updated = update_row(pool, "system_settings", &key, &record, "key").await?;
            ("update", Some(current), updated)
        }
        None => {
            let created = create_row(pool, "system_settings", &record).await?;
            ("create", None, created)
        }
    };

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        action,
        "system_settings",
        Some(&key),
        before,
        Some(saved.clone()),
    )
    .await;
    Ok(Json(envelope(saved)))
}

/// Commission keys follow `commission_<name>_percentage` and must hold a
/// number between 0 and 100. Other keys are stored as free-form strings.
fn validate_setting(key: &str, value: &str) -> AppResult<()> {
    if key.is_empty() {
        return Err(AppError::BadRequest("Setting key is required.".to_string()));
    }
    if key.starts_with("commission_") {
        if commission_short_key(key).is_none() {
            return Err(AppError::BadRequest(
                "Commission keys must look like commission_<name>_percentage.".to_string(),
            ));
        }
        let rate: f64 = value.trim().parse().map_err(|_| {
            AppError::BadRequest("Commission percentages must be numeric.".to_string())
        })?;
        if !(0.0..=100.0).contains(&rate) {
            return Err(AppError::BadRequest(
                "Commission percentages must be between 0 and 100.".to_string(),
            ));
        }
    }
    Ok(())
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::validate_setting;

    #[test]
    fn enforces_commission_key_shape() {
        assert!(validate_setting("commission_referral_external_percentage", "2.5").is_ok());
        assert!(validate_setting("commission_referral_external", "2.5").is_err());
        assert!(validate_setting("commission__percentage", "2.5").is_err());
    }

    #[test]
    fn enforces_commission_value_range() {
        assert!(validate_setting("commission_referral_internal_percentage", "0.5").is_ok());
        assert!(validate_setting("commission_referral_internal_percentage", "abc").is_err());
        assert!(validate_setting("commission_referral_internal_percentage", "250").is_err());
    }

    #[test]
    fn leaves_other_keys_free_form() {
        assert!(validate_setting("default_listing_currency", "EUR").is_ok());
    }
}

use serde_json::{json, Map, Value};
use sqlx::PgPool;

use crate::repository::table_service::create_row;

/// Best-effort audit trail: failures are logged and swallowed so an audit
/// problem never fails the request that triggered it.
#[allow(clippy::too_many_arguments)]
pub async fn write_audit_log(
    pool: Option<&PgPool>,
    user_id: Option<&str>,
    action: &str,
    entity_type: &str,
    entity_id: Option<&str>,
    before: Option<Value>,
    after: Option<Value>,
) {
    let Some(pool) = pool else {
        return;
    };

    let mut record = Map::new();
    record.insert("action".to_string(), Value::String(action.to_string()));
    record.insert(
        "entity_type".to_string(),
        Value::String(entity_type.to_string()),
    );
    if let Some(user_id) = user_id.map(str::trim).filter(|value| !value.is_empty()) {
        record.insert("user_id".to_string(), Value::String(user_id.to_string()));
    }
    if let Some(entity_id) = entity_id.map(str::trim).filter(|value| !value.is_empty()) {
        record.insert("entity_id".to_string(), Value::String(entity_id.to_string()));
    }
    if before.is_some() || after.is_some() {
        record.insert(
            "changes".to_string(),
            json!({ "before": before, "after": after }),
        );
    }

    if let Err(error) = create_row(pool, "audit_logs", &record).await {
        tracing::warn!(error = %error, action, entity_type, "Failed to write audit log");
    }
}

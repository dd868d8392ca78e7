use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::{NaiveDate, Utc};
use serde_json::{json, Map, Value};

use crate::{
    access::{assert_active_user, assert_role},
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{create_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit, envelope, envelope_with_message, CommissionSummaryQuery, GenerateReportInput,
        ReportPath, ReportsQuery,
    },
    services::audit::write_audit_log,
    services::commission::{
        aggregate_agent_commission, external_rate, internal_rate, load_commission_settings,
        CommissionAggregate, SettingsMap,
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/reports", axum::routing::get(list_reports))
        .route("/reports/generate", axum::routing::post(generate_reports))
        .route(
            "/reports/commission-summary",
            axum::routing::get(commission_summary),
        )
        .route("/reports/{report_id}", axum::routing::get(get_report))
        .route(
            "/reports/{report_id}/recalculate",
            axum::routing::post(recalculate_report),
        )
}

async fn list_reports(
    State(state): State<AppState>,
    Query(query): Query<ReportsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(agent_id) = non_empty(query.agent_id.as_deref()) {
        filters.insert("agent_id".to_string(), Value::String(agent_id));
    }

    let rows = list_rows(
        pool,
        "reports",
        Some(&filters),
        clamp_limit(query.limit),
        0,
        "generated_at",
        false,
    )
    .await?;
    Ok(Json(envelope(Value::Array(rows))))
}

async fn get_report(
    State(state): State<AppState>,
    Path(path): Path<ReportPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "reports", &path.report_id, "id").await?;
    Ok(Json(envelope(record)))
}

/// Builds commission snapshots for the period. With an `agent_id` a single
/// snapshot is produced; without one, every active agent and manager gets
/// one. Existing snapshots for the same agent and period are overwritten so
/// a re-run never duplicates rows.
async fn generate_reports(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<GenerateReportInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, &["admin", "manager"]).await?;
    let pool = db_pool(&state)?;

    let period_start = parse_date(&payload.period_start)?;
    let period_end = parse_date(&payload.period_end)?;

    let agent_ids = match non_empty(payload.agent_id.as_deref()) {
        Some(agent_id) => {
            get_row(pool, "users", &agent_id, "id").await?;
            vec![agent_id]
        }
        None => commission_earning_agents(pool).await?,
    };

    let settings = load_commission_settings(pool).await?;
    let mut snapshots = Vec::with_capacity(agent_ids.len());
    for agent_id in &agent_ids {
        let aggregate =
            aggregate_agent_commission(pool, agent_id, period_start, period_end, &settings)
                .await?;
        let snapshot = upsert_snapshot(
            pool,
            agent_id,
            period_start,
            period_end,
            &aggregate,
            &settings,
        )
        .await?;
        snapshots.push(snapshot);
    }

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "generate",
        "reports",
        None,
        None,
        Some(json!({
            "agents": agent_ids.len(),
            "period_start": period_start.to_string(),
            "period_end": period_end.to_string(),
        })),
    )
    .await;

    Ok((
        axum::http::StatusCode::CREATED,
        Json(envelope_with_message(
            Value::Array(snapshots),
            &format!("Generated {} report(s).", agent_ids.len()),
        )),
    ))
}

/// Recomputes a stored snapshot from current data and settings, keeping the
/// agent and period. Figures only move when explicitly asked to.
async fn recalculate_report(
    State(state): State<AppState>,
    Path(path): Path<ReportPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, &["admin", "manager"]).await?;
    let pool = db_pool(&state)?;

    let record = get_row(pool, "reports", &path.report_id, "id").await?;
    let agent_id = value_str(&record, "agent_id");
    let period_start = parse_date(&value_str(&record, "period_start"))?;
    let period_end = parse_date(&value_str(&record, "period_end"))?;

    let settings = load_commission_settings(pool).await?;
    let aggregate =
        aggregate_agent_commission(pool, &agent_id, period_start, period_end, &settings).await?;

    let patch = snapshot_fields(&aggregate, &settings);
    let updated = update_row(pool, "reports", &path.report_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "recalculate",
        "reports",
        Some(&path.report_id),
        Some(record),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(envelope_with_message(updated, "Report recalculated.")))
}

/// Live aggregate for one agent over an arbitrary date range, without
/// touching stored snapshots. A range that does not parse as ISO dates is
/// treated as empty and yields all zeros rather than an error.
async fn commission_summary(
    State(state): State<AppState>,
    Query(query): Query<CommissionSummaryQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    get_row(pool, "users", &query.agent_id, "id").await?;

    let settings = load_commission_settings(pool).await?;
    let aggregate = summary_aggregate(
        pool,
        &query.agent_id,
        parse_date_opt(&query.from_date),
        parse_date_opt(&query.to_date),
        &settings,
    )
    .await?;

    Ok(Json(envelope(json!({
        "agent_id": query.agent_id,
        "from_date": query.from_date.trim(),
        "to_date": query.to_date.trim(),
        "properties_closed": aggregate.properties_closed,
        "referral_properties": aggregate.referral_properties,
        "leads_converted": aggregate.leads_converted,
        "referral_leads": aggregate.referral_leads,
        "referral_records": aggregate.referral_records,
        "sales_volume": round2(aggregate.sales_volume),
        "external_commission": round2(aggregate.external_commission),
        "internal_commission": round2(aggregate.internal_commission),
        "total_commission": round2(aggregate.total_commission()),
        "external_rate": external_rate(&settings),
        "internal_rate": internal_rate(&settings),
    }))))
}

/// Active agents and managers earn commission; admins do not.
async fn commission_earning_agents(pool: &sqlx::PgPool) -> AppResult<Vec<String>> {
    let mut filters = Map::new();
    filters.insert("is_active".to_string(), Value::Bool(true));
    let users = list_rows(pool, "users", Some(&filters), 5000, 0, "full_name", true).await?;
    Ok(users
        .iter()
        .filter(|user| {
            matches!(
                user.get("role").and_then(Value::as_str),
                Some("agent") | Some("manager")
            )
        })
        .map(|user| value_str(user, "id"))
        .filter(|id| !id.is_empty())
        .collect())
}

async fn upsert_snapshot(
    pool: &sqlx::PgPool,
    agent_id: &str,
    period_start: NaiveDate,
    period_end: NaiveDate,
    aggregate: &CommissionAggregate,
    settings: &SettingsMap,
) -> AppResult<Value> {
    let mut filters = Map::new();
    filters.insert("agent_id".to_string(), Value::String(agent_id.to_string()));
    filters.insert(
        "period_start".to_string(),
        Value::String(period_start.to_string()),
    );
    filters.insert(
        "period_end".to_string(),
        Value::String(period_end.to_string()),
    );
    let existing = list_rows(pool, "reports", Some(&filters), 1, 0, "generated_at", false).await?;

    let mut record = snapshot_fields(aggregate, settings);
    record.insert("agent_id".to_string(), Value::String(agent_id.to_string()));
    record.insert(
        "period_start".to_string(),
        Value::String(period_start.to_string()),
    );
    record.insert(
        "period_end".to_string(),
        Value::String(period_end.to_string()),
    );

    match existing.into_iter().next() {
        Some(current) => {
            let report_id = value_str(&current, "id");
            Ok(update_row(pool, "reports", &report_id, &record, "id").await?)
        }
        None => Ok(create_row(pool, "reports", &record).await?),
    }
}

/// The stored figures of a snapshot. Money is rounded here because stored
/// rows are served back verbatim.
fn snapshot_fields(aggregate: &CommissionAggregate, settings: &SettingsMap) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(
        "properties_closed".to_string(),
        json!(aggregate.properties_closed),
    );
    fields.insert(
        "referral_properties".to_string(),
        json!(aggregate.referral_properties),
    );
    fields.insert(
        "leads_converted".to_string(),
        json!(aggregate.leads_converted),
    );
    fields.insert("referral_leads".to_string(), json!(aggregate.referral_leads));
    fields.insert(
        "referral_records".to_string(),
        json!(aggregate.referral_records),
    );
    fields.insert(
        "sales_volume".to_string(),
        json!(round2(aggregate.sales_volume)),
    );
    fields.insert(
        "external_commission".to_string(),
        json!(round2(aggregate.external_commission)),
    );
    fields.insert(
        "internal_commission".to_string(),
        json!(round2(aggregate.internal_commission)),
    );
    fields.insert(
        "total_commission".to_string(),
        json!(round2(aggregate.total_commission())),
    );
    fields.insert("external_rate".to_string(), json!(external_rate(settings)));
    fields.insert("internal_rate".to_string(), json!(internal_rate(settings)));
    fields.insert(
        "generated_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    fields
}

async fn summary_aggregate(
    pool: &sqlx::PgPool,
    agent_id: &str,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    settings: &SettingsMap,
) -> AppResult<CommissionAggregate> {
    match (from, to) {
        (Some(from), Some(to)) => {
            aggregate_agent_commission(pool, agent_id, from, to, settings).await
        }
        _ => Ok(CommissionAggregate::default()),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn parse_date(value: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::BadRequest("Invalid ISO date.".to_string()))
}

fn parse_date_opt(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
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
    use serde_json::Value;
    use sqlx::postgres::PgPoolOptions;

    use super::{parse_date_opt, round2, snapshot_fields, summary_aggregate};
    use crate::services::commission::{CommissionAggregate, SettingsMap};

    #[tokio::test]
    async fn malformed_summary_range_yields_zeroed_aggregate() {
        // Lazy pool: the summary short-circuits before any query runs.
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool");
        let settings = SettingsMap::new();

        let aggregate = summary_aggregate(
            &pool,
            "agent",
            parse_date_opt("not-a-date"),
            parse_date_opt("2026-03-31"),
            &settings,
        )
        .await
        .expect("empty aggregate");
        assert_eq!(aggregate, CommissionAggregate::default());

        assert!(parse_date_opt("2026-03-01").is_some());
        assert!(parse_date_opt("03/01/2026").is_none());
    }

    #[test]
    fn rounds_money_to_cents() {
        assert_eq!(round2(2000.005), 2000.01);
        assert_eq!(round2(499.994), 499.99);
        assert_eq!(round2(0.0), 0.0);
    }

    #[test]
    fn snapshot_carries_applied_rates_and_totals() {
        let aggregate = CommissionAggregate {
            properties_closed: 2,
            referral_properties: 1,
            external_commission: 2000.0,
            internal_commission: 500.0,
            sales_volume: 150_000.0,
            ..CommissionAggregate::default()
        };
        let fields = snapshot_fields(&aggregate, &SettingsMap::new());

        assert_eq!(
            fields.get("total_commission").and_then(Value::as_f64),
            Some(2500.0)
        );
        assert_eq!(fields.get("external_rate").and_then(Value::as_f64), Some(2.0));
        assert_eq!(fields.get("internal_rate").and_then(Value::as_f64), Some(0.5));
        assert!(fields.contains_key("generated_at"));
    }
}

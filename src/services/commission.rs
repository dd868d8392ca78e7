//! Referral commission calculation.
//!
//! Rates come from `system_settings` rows named
//! `commission_<short>_percentage`. The loader parses whatever rows exist;
//! defaults are applied at the point of use, never at load time, so every
//! caller sees the same fallback policy even when the table is empty.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate};
use serde_json::{Map, Value};

use crate::error::AppError;
use crate::repository::table_service::list_rows;

pub const DEFAULT_EXTERNAL_REFERRAL_PERCENTAGE: f64 = 2.0;
pub const DEFAULT_INTERNAL_REFERRAL_PERCENTAGE: f64 = 0.5;

const SETTING_KEY_PREFIX: &str = "commission_";
const SETTING_KEY_SUFFIX: &str = "_percentage";

pub type SettingsMap = HashMap<String, f64>;

/// Loads every `commission_*_percentage` setting into a short-key map,
/// e.g. `commission_referral_external_percentage` -> `referral_external`.
/// Rows with non-numeric values are skipped; absent rows are not an error.
pub async fn load_commission_settings(pool: &sqlx::PgPool) -> Result<SettingsMap, AppError> {
    let rows = list_rows(pool, "system_settings", None, 500, 0, "key", true).await?;
    Ok(parse_commission_settings(&rows))
}

pub fn parse_commission_settings(rows: &[Value]) -> SettingsMap {
    let mut settings = SettingsMap::new();
    for row in rows {
        let Some(key) = row.get("key").and_then(Value::as_str) else {
            continue;
        };
        let Some(short_key) = commission_short_key(key) else {
            continue;
        };
        if let Some(percentage) = number_from_value(row.get("value")) {
            settings.insert(short_key, percentage);
        }
    }
    settings
}

/// Strips the `commission_` prefix and `_percentage` suffix. Returns `None`
/// for keys outside the naming convention or with an empty middle part.
pub fn commission_short_key(key: &str) -> Option<String> {
    let trimmed = key.trim();
    let middle = trimmed
        .strip_prefix(SETTING_KEY_PREFIX)?
        .strip_suffix(SETTING_KEY_SUFFIX)?;
    if middle.is_empty() {
        return None;
    }
    Some(middle.to_string())
}

pub fn external_rate(settings: &SettingsMap) -> f64 {
    settings
        .get("referral_external")
        .copied()
        .unwrap_or(DEFAULT_EXTERNAL_REFERRAL_PERCENTAGE)
}

pub fn internal_rate(settings: &SettingsMap) -> f64 {
    settings
        .get("referral_internal")
        .copied()
        .unwrap_or(DEFAULT_INTERNAL_REFERRAL_PERCENTAGE)
}

/// The rate applied to a referral depends solely on its `external` flag.
pub fn referral_commission(base: f64, external: bool, settings: &SettingsMap) -> f64 {
    if base <= 0.0 {
        return 0.0;
    }
    let rate = if external {
        external_rate(settings)
    } else {
        internal_rate(settings)
    };
    base * rate / 100.0
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommissionAggregate {
    pub properties_closed: i64,
    pub referral_properties: i64,
    pub leads_converted: i64,
    pub referral_leads: i64,
    pub referral_records: i64,
    pub sales_volume: f64,
    pub external_commission: f64,
    pub internal_commission: f64,
}

impl CommissionAggregate {
    pub fn total_commission(&self) -> f64 {
        self.external_commission + self.internal_commission
    }

    fn absorb(&mut self, other: CommissionAggregate) {
        self.properties_closed += other.properties_closed;
        self.referral_properties += other.referral_properties;
        self.leads_converted += other.leads_converted;
        self.referral_leads += other.referral_leads;
        self.referral_records += other.referral_records;
        self.sales_volume += other.sales_volume;
        self.external_commission += other.external_commission;
        self.internal_commission += other.internal_commission;
    }
}

/// Computes the referral commission aggregate for one agent and period.
///
/// An inverted period is treated as empty and yields a zeroed aggregate
/// rather than an error.
pub async fn aggregate_agent_commission(
    pool: &sqlx::PgPool,
    agent_id: &str,
    period_start: NaiveDate,
    period_end: NaiveDate,
    settings: &SettingsMap,
) -> Result<CommissionAggregate, AppError> {
    if period_end < period_start {
        return Ok(CommissionAggregate::default());
    }

    let agent_filter = {
        let mut filters = Map::new();
        filters.insert(
            "agent_id".to_string(),
            Value::String(agent_id.to_string()),
        );
        filters
    };

    let mut aggregate = CommissionAggregate::default();

    let mut property_filters = agent_filter.clone();
    property_filters.insert("status".to_string(), Value::String("closed".to_string()));
    let properties = list_all_rows(pool, "properties", &property_filters, "created_at").await?;
    aggregate.absorb(closed_property_commission(
        &properties,
        period_start,
        period_end,
        settings,
    ));

    let mut lead_filters = agent_filter.clone();
    lead_filters.insert("status".to_string(), Value::String("converted".to_string()));
    let leads = list_all_rows(pool, "leads", &lead_filters, "created_at").await?;
    aggregate.absorb(converted_lead_commission(
        &leads,
        period_start,
        period_end,
        settings,
    ));

    let referrals =
        list_all_rows(pool, "property_referrals", &agent_filter, "occurred_on").await?;
    aggregate.absorb(referral_record_commission(
        &referrals,
        period_start,
        period_end,
        settings,
    ));

    Ok(aggregate)
}

const AGGREGATE_PAGE_SIZE: i64 = 1000;

/// Pages through every matching row so high-volume agents are never
/// truncated mid-calculation.
async fn list_all_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: &Map<String, Value>,
    order_by: &str,
) -> Result<Vec<Value>, AppError> {
    let mut rows = Vec::new();
    let mut offset = 0;
    loop {
        let page = list_rows(
            pool,
            table,
            Some(filters),
            AGGREGATE_PAGE_SIZE,
            offset,
            order_by,
            false,
        )
        .await?;
        let page_len = page.len();
        rows.extend(page);
        match next_page_offset(page_len, AGGREGATE_PAGE_SIZE, offset) {
            Some(next) => offset = next,
            None => return Ok(rows),
        }
    }
}

/// A short page means the table is exhausted.
fn next_page_offset(page_len: usize, page_size: i64, offset: i64) -> Option<i64> {
    if (page_len as i64) < page_size {
        return None;
    }
    Some(offset + page_size)
}

/// Pass 1: properties closed inside the period. Referral-sourced ones earn
/// commission on the closing price, falling back to the asking price.
pub fn closed_property_commission(
    properties: &[Value],
    period_start: NaiveDate,
    period_end: NaiveDate,
    settings: &SettingsMap,
) -> CommissionAggregate {
    let mut aggregate = CommissionAggregate::default();
    for property in properties {
        let Some(closed_on) = date_of(property, "closed_at") else {
            continue;
        };
        if closed_on < period_start || closed_on > period_end {
            continue;
        }
        aggregate.properties_closed += 1;

        let base = number_from_value(property.get("closed_price"))
            .filter(|value| *value > 0.0)
            .or_else(|| number_from_value(property.get("price")))
            .unwrap_or(0.0);
        aggregate.sales_volume += base.max(0.0);

        if !bool_of(property, "is_referral") {
            continue;
        }
        aggregate.referral_properties += 1;
        let external = bool_of(property, "referral_external");
        let commission = referral_commission(base, external, settings);
        if external {
            aggregate.external_commission += commission;
        } else {
            aggregate.internal_commission += commission;
        }
    }
    aggregate
}

/// Pass 2: leads converted inside the period, commission on the lead price.
pub fn converted_lead_commission(
    leads: &[Value],
    period_start: NaiveDate,
    period_end: NaiveDate,
    settings: &SettingsMap,
) -> CommissionAggregate {
    let mut aggregate = CommissionAggregate::default();
    for lead in leads {
        let Some(converted_on) = date_of(lead, "converted_at") else {
            continue;
        };
        if converted_on < period_start || converted_on > period_end {
            continue;
        }
        aggregate.leads_converted += 1;

        if !bool_of(lead, "is_referral") {
            continue;
        }
        aggregate.referral_leads += 1;
        let base = number_from_value(lead.get("price")).unwrap_or(0.0);
        let external = bool_of(lead, "referral_external");
        let commission = referral_commission(base, external, settings);
        if external {
            aggregate.external_commission += commission;
        } else {
            aggregate.internal_commission += commission;
        }
    }
    aggregate
}

/// Pass 3: standalone referral records attached to properties.
pub fn referral_record_commission(
    referrals: &[Value],
    period_start: NaiveDate,
    period_end: NaiveDate,
    settings: &SettingsMap,
) -> CommissionAggregate {
    let mut aggregate = CommissionAggregate::default();
    for referral in referrals {
        let Some(occurred_on) = date_of(referral, "occurred_on") else {
            continue;
        };
        if occurred_on < period_start || occurred_on > period_end {
            continue;
        }
        aggregate.referral_records += 1;

        let base = number_from_value(referral.get("amount")).unwrap_or(0.0);
        let external = bool_of(referral, "external");
        let commission = referral_commission(base, external, settings);
        if external {
            aggregate.external_commission += commission;
        } else {
            aggregate.internal_commission += commission;
        }
    }
    aggregate
}

fn date_of(row: &Value, key: &str) -> Option<NaiveDate> {
    let text = row.get(key)?.as_str()?.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date);
    }
    let mut normalized = text.to_string();
    if normalized.ends_with('Z') {
        normalized.truncate(normalized.len().saturating_sub(1));
        normalized.push_str("+00:00");
    }
    DateTime::parse_from_rfc3339(&normalized)
        .ok()
        .map(|value| value.date_naive())
}

fn bool_of(row: &Value, key: &str) -> bool {
    match row.get(key) {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => {
            let lower = text.trim().to_ascii_lowercase();
            lower == "true" || lower == "1"
        }
        _ => false,
    }
}

fn number_from_value(value: Option<&Value>) -> Option<f64> {
    match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;

    use super::*;

    fn date(text: &str) -> NaiveDate {
        NaiveDate::parse_from_str(text, "%Y-%m-%d").expect("valid date")
    }

    #[test]
    fn parses_setting_keys_to_short_keys() {
        assert_eq!(
            commission_short_key("commission_referral_external_percentage").as_deref(),
            Some("referral_external")
        );
        assert_eq!(
            commission_short_key("commission_referral_internal_percentage").as_deref(),
            Some("referral_internal")
        );
        assert_eq!(commission_short_key("commission__percentage"), None);
        assert_eq!(commission_short_key("vat_percentage"), None);
        assert_eq!(commission_short_key("commission_base"), None);
    }

    #[test]
    fn parses_settings_rows_and_skips_malformed_values() {
        let rows = vec![
            json!({ "key": "commission_referral_external_percentage", "value": "3.5" }),
            json!({ "key": "commission_referral_internal_percentage", "value": 1.0 }),
            json!({ "key": "commission_bonus_percentage", "value": "not-a-number" }),
            json!({ "key": "office_address", "value": "Main St 1" }),
        ];
        let settings = parse_commission_settings(&rows);
        assert_eq!(settings.get("referral_external"), Some(&3.5));
        assert_eq!(settings.get("referral_internal"), Some(&1.0));
        assert!(!settings.contains_key("bonus"));
        assert_eq!(settings.len(), 2);
    }

    #[test]
    fn defaults_apply_at_point_of_use() {
        let empty = SettingsMap::new();
        assert_eq!(external_rate(&empty), 2.0);
        assert_eq!(internal_rate(&empty), 0.5);

        // A property priced at 100,000 with no custom settings.
        assert_eq!(referral_commission(100_000.0, true, &empty), 2_000.0);
        assert_eq!(referral_commission(100_000.0, false, &empty), 500.0);
    }

    #[test]
    fn rate_depends_only_on_the_external_flag() {
        let mut settings = SettingsMap::new();
        settings.insert("referral_external".to_string(), 4.0);
        settings.insert("referral_internal".to_string(), 1.0);

        assert_eq!(referral_commission(50_000.0, true, &settings), 2_000.0);
        assert_eq!(referral_commission(50_000.0, false, &settings), 500.0);
        assert_eq!(referral_commission(0.0, true, &settings), 0.0);
        assert_eq!(referral_commission(-10.0, false, &settings), 0.0);
    }

    #[test]
    fn closed_properties_inside_period_earn_referral_commission() {
        let settings = SettingsMap::new();
        let properties = vec![
            json!({
                "status": "closed",
                "closed_at": "2026-03-10T14:00:00Z",
                "closed_price": 100000,
                "is_referral": true,
                "referral_external": true
            }),
            json!({
                "status": "closed",
                "closed_at": "2026-03-12",
                "price": 80000,
                "is_referral": true,
                "referral_external": false
            }),
            // Outside the period.
            json!({
                "status": "closed",
                "closed_at": "2026-04-02",
                "closed_price": 999999,
                "is_referral": true,
                "referral_external": true
            }),
            // Closed but not referral-sourced: counts toward volume only.
            json!({
                "status": "closed",
                "closed_at": "2026-03-15",
                "closed_price": 50000,
                "is_referral": false
            }),
        ];

        let aggregate = closed_property_commission(
            &properties,
            date("2026-03-01"),
            date("2026-03-31"),
            &settings,
        );
        assert_eq!(aggregate.properties_closed, 3);
        assert_eq!(aggregate.referral_properties, 2);
        assert_eq!(aggregate.external_commission, 2_000.0);
        assert_eq!(aggregate.internal_commission, 400.0);
        assert_eq!(aggregate.sales_volume, 230_000.0);
    }

    #[test]
    fn converted_leads_use_the_lead_price() {
        let settings = SettingsMap::new();
        let leads = vec![
            json!({
                "status": "converted",
                "converted_at": "2026-03-05T09:00:00Z",
                "price": 100000,
                "is_referral": true,
                "referral_external": false
            }),
            json!({
                "status": "converted",
                "converted_at": "2026-03-06",
                "price": 100000,
                "is_referral": false
            }),
        ];
        let aggregate =
            converted_lead_commission(&leads, date("2026-03-01"), date("2026-03-31"), &settings);
        assert_eq!(aggregate.leads_converted, 2);
        assert_eq!(aggregate.referral_leads, 1);
        assert_eq!(aggregate.internal_commission, 500.0);
        assert_eq!(aggregate.external_commission, 0.0);
    }

    #[test]
    fn referral_records_commission_on_their_amount() {
        let mut settings = SettingsMap::new();
        settings.insert("referral_external".to_string(), 3.0);
        let referrals = vec![
            json!({ "occurred_on": "2026-03-20", "amount": 200000, "external": true }),
            json!({ "occurred_on": "2026-03-21", "amount": 200000, "external": false }),
            json!({ "occurred_on": "2026-02-01", "amount": 1, "external": true }),
        ];
        let aggregate =
            referral_record_commission(&referrals, date("2026-03-01"), date("2026-03-31"), &settings);
        assert_eq!(aggregate.referral_records, 2);
        assert_eq!(aggregate.external_commission, 6_000.0);
        assert_eq!(aggregate.internal_commission, 1_000.0);
    }

    #[tokio::test]
    async fn inverted_period_yields_zeroed_aggregate_without_querying() {
        // Lazy pool: the guard returns before the first query would connect.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool");

        let aggregate = aggregate_agent_commission(
            &pool,
            "550e8400-e29b-41d4-a716-446655440000",
            date("2026-03-31"),
            date("2026-03-01"),
            &SettingsMap::new(),
        )
        .await
        .expect("empty aggregate");
        assert_eq!(aggregate, CommissionAggregate::default());
    }

    #[test]
    fn pages_advance_until_a_short_page() {
        assert_eq!(next_page_offset(1000, 1000, 0), Some(1000));
        assert_eq!(next_page_offset(1000, 1000, 1000), Some(2000));
        assert_eq!(next_page_offset(999, 1000, 2000), None);
        assert_eq!(next_page_offset(0, 1000, 0), None);
    }

    #[test]
    fn totals_combine_external_and_internal() {
        let mut aggregate = CommissionAggregate::default();
        aggregate.external_commission = 2_000.0;
        aggregate.internal_commission = 500.0;
        assert_eq!(aggregate.total_commission(), 2_500.0);
    }
}

use serde::Deserialize;
use serde_json::{json, Value};
use validator::Validate;

use crate::error::AppError;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

/// Response envelope shared by every endpoint.
pub fn envelope(data: Value) -> Value {
    json!({ "success": true, "data": data })
}

pub fn envelope_with_message(data: Value, message: &str) -> Value {
    json!({ "success": true, "data": data, "message": message })
}

pub fn clamp_limit(limit: i64) -> i64 {
    limit.clamp(1, 500)
}

pub fn serialize_to_map<T>(value: &T) -> serde_json::Map<String, Value>
where
    T: serde::Serialize,
{
    let json = serde_json::to_value(value).unwrap_or_else(|_| Value::Object(Default::default()));
    json.as_object().cloned().unwrap_or_default()
}

pub fn remove_nulls(
    mut map: serde_json::Map<String, Value>,
) -> serde_json::Map<String, Value> {
    map.retain(|_, value| !value.is_null());
    map
}

fn default_limit_100() -> i64 {
    100
}
fn default_false() -> bool {
    false
}
fn default_currency_eur() -> String {
    "EUR".to_string()
}
fn default_property_status() -> String {
    "listed".to_string()
}
fn default_lead_status() -> String {
    "new".to_string()
}
fn default_agent_role() -> String {
    "agent".to_string()
}
fn default_event_kind() -> String {
    "other".to_string()
}
fn default_duration_minutes() -> i32 {
    30
}

// ── Path params ──

#[derive(Debug, Clone, Deserialize)]
pub struct PropertyPath {
    pub property_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeadPath {
    pub lead_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewingPath {
    pub viewing_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventPath {
    pub event_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserPath {
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportPath {
    pub report_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettingPath {
    pub key: String,
}

// ── Properties ──

#[derive(Debug, Clone, Deserialize)]
pub struct PropertiesQuery {
    pub status: Option<String>,
    pub agent_id: Option<String>,
    pub property_type: Option<String>,
    pub city: Option<String>,
    pub is_referral: Option<bool>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreatePropertyInput {
    #[validate(length(min = 1, max = 255))]
    pub title: String,
    pub description: Option<String>,
    pub property_type: Option<String>,
    pub address_line1: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    #[validate(range(min = 0.0))]
    pub price: f64,
    #[serde(default = "default_currency_eur")]
    pub currency: String,
    #[serde(default = "default_property_status")]
    pub status: String,
    pub agent_id: Option<String>,
    #[serde(default = "default_false")]
    pub is_referral: bool,
    #[serde(default = "default_false")]
    pub referral_external: bool,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdatePropertyInput {
    pub title: Option<String>,
    pub description: Option<String>,
    pub property_type: Option<String>,
    pub address_line1: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub status: Option<String>,
    pub agent_id: Option<String>,
    pub is_referral: Option<bool>,
    pub referral_external: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClosePropertyInput {
    pub closed_price: Option<f64>,
    /// ISO date; defaults to today when omitted.
    pub closed_on: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreatePropertyReferralInput {
    pub agent_id: String,
    pub external: bool,
    #[validate(range(min = 0.0))]
    pub amount: f64,
    pub occurred_on: Option<String>,
    pub notes: Option<String>,
}

// ── Leads ──

#[derive(Debug, Clone, Deserialize)]
pub struct LeadsQuery {
    pub status: Option<String>,
    pub agent_id: Option<String>,
    pub source: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateLeadInput {
    #[validate(length(min = 1, max = 255))]
    pub full_name: String,
    #[validate(email)]
    pub email: Option<String>,
    pub phone: Option<String>,
    pub source: Option<String>,
    #[serde(default = "default_lead_status")]
    pub status: String,
    pub agent_id: Option<String>,
    pub price: Option<f64>,
    #[serde(default = "default_false")]
    pub is_referral: bool,
    #[serde(default = "default_false")]
    pub referral_external: bool,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateLeadInput {
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub source: Option<String>,
    pub status: Option<String>,
    pub agent_id: Option<String>,
    pub price: Option<f64>,
    pub is_referral: Option<bool>,
    pub referral_external: Option<bool>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConvertLeadInput {
    /// Title for the property created from this lead; defaults to the
    /// lead's name when omitted.
    pub title: Option<String>,
    pub address_line1: Option<String>,
    pub city: Option<String>,
    pub price: Option<f64>,
}

// ── Viewings ──

#[derive(Debug, Clone, Deserialize)]
pub struct ViewingsQuery {
    pub property_id: Option<String>,
    pub lead_id: Option<String>,
    pub agent_id: Option<String>,
    pub status: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateViewingInput {
    pub property_id: String,
    pub lead_id: Option<String>,
    pub agent_id: String,
    /// RFC 3339 timestamp.
    pub scheduled_at: String,
    #[serde(default = "default_duration_minutes")]
    #[validate(range(min = 5, max = 480))]
    pub duration_minutes: i32,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateViewingInput {
    pub lead_id: Option<String>,
    pub agent_id: Option<String>,
    pub scheduled_at: Option<String>,
    pub duration_minutes: Option<i32>,
    pub notes: Option<String>,
}

// ── Calendar ──

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarRangeQuery {
    pub agent_id: Option<String>,
    /// RFC 3339 range bounds.
    pub from: String,
    pub to: String,
    pub kind: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateCalendarEventInput {
    #[validate(length(min = 1, max = 255))]
    pub title: String,
    pub agent_id: String,
    pub starts_at: String,
    pub ends_at: String,
    #[serde(default = "default_event_kind")]
    pub kind: String,
    pub property_id: Option<String>,
    pub lead_id: Option<String>,
    pub location: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateCalendarEventInput {
    pub title: Option<String>,
    pub agent_id: Option<String>,
    pub starts_at: Option<String>,
    pub ends_at: Option<String>,
    pub kind: Option<String>,
    pub property_id: Option<String>,
    pub lead_id: Option<String>,
    pub location: Option<String>,
    pub notes: Option<String>,
}

// ── Users / HR ──

#[derive(Debug, Clone, Deserialize)]
pub struct UsersQuery {
    pub role: Option<String>,
    pub is_active: Option<bool>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateUserInput {
    #[validate(length(min = 1, max = 255))]
    pub full_name: String,
    #[validate(email)]
    pub email: String,
    #[serde(default = "default_agent_role")]
    pub role: String,
    pub phone: Option<String>,
    /// ISO date.
    pub hired_on: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct UpdateUserInput {
    pub full_name: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
    pub role: Option<String>,
    pub phone: Option<String>,
    pub hired_on: Option<String>,
}

// ── Settings ──

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpsertSettingInput {
    #[validate(length(min = 1, max = 1024))]
    pub value: String,
}

// ── Reports ──

#[derive(Debug, Clone, Deserialize)]
pub struct ReportsQuery {
    pub agent_id: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateReportInput {
    /// When omitted, one report is generated per active agent.
    pub agent_id: Option<String>,
    /// ISO dates, inclusive on both ends.
    pub period_start: String,
    pub period_end: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommissionSummaryQuery {
    pub agent_id: String,
    pub from_date: String,
    pub to_date: String,
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{
        clamp_limit, envelope, remove_nulls, serialize_to_map, validate_input, UpdateLeadInput,
        UpsertSettingInput,
    };

    #[test]
    fn clamps_limits_into_range() {
        assert_eq!(clamp_limit(0), 1);
        assert_eq!(clamp_limit(100), 100);
        assert_eq!(clamp_limit(9999), 500);
    }

    #[test]
    fn envelope_marks_success() {
        let body = envelope(json!([1, 2]));
        assert_eq!(body.get("success"), Some(&Value::Bool(true)));
        assert!(body.get("data").is_some());
    }

    #[test]
    fn setting_values_must_not_be_blank() {
        let blank = UpsertSettingInput {
            value: String::new(),
        };
        assert!(validate_input(&blank).is_err());

        let ok = UpsertSettingInput {
            value: "2.5".to_string(),
        };
        assert!(validate_input(&ok).is_ok());
    }

    #[test]
    fn patch_serialization_drops_nulls() {
        let patch: UpdateLeadInput = serde_json::from_value(json!({
            "status": "qualified",
            "price": null
        }))
        .expect("valid patch");
        let map = remove_nulls(serialize_to_map(&patch));
        assert_eq!(map.get("status").and_then(Value::as_str), Some("qualified"));
        assert!(!map.contains_key("price"));
        assert!(!map.contains_key("full_name"));
    }
}

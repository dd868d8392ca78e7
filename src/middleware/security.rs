use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::state::AppState;

/// Rejects requests whose Host header is not on the trusted list. A `*`
/// entry disables the check (useful behind a trusted reverse proxy).
pub async fn enforce_trusted_hosts(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let trusted = &state.config.trusted_hosts;
    if trusted.iter().any(|host| host.trim() == "*") {
        return next.run(request).await;
    }

    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(':').next().unwrap_or(value).trim().to_string())
        .unwrap_or_default();

    let allowed = trusted
        .iter()
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(&host));

    if !allowed {
        tracing::warn!(host = %host, "Rejected request from untrusted host");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "Invalid host header." })),
        )
            .into_response();
    }

    next.run(request).await
}

use axum::{routing::get, Router};

use crate::state::AppState;

pub mod calendar;
pub mod health;
pub mod leads;
pub mod properties;
pub mod reports;
pub mod settings;
pub mod users;
pub mod viewings;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .merge(properties::router())
        .merge(leads::router())
        .merge(viewings::router())
        .merge(calendar::router())
        .merge(users::router())
        .merge(settings::router())
        .merge(reports::router())
}

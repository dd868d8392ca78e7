use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::db;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: Option<PgPool>,
    /// Maps bearer-token digests to user ids so hot endpoints skip the
    /// session lookup. Entries expire quickly so revocation stays effective.
    pub session_cache: Cache<String, String>,
}

impl AppState {
    pub fn build(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let db_pool = db::build_pool(&config);
        if db_pool.is_none() {
            tracing::warn!("DATABASE_URL is not set; all data endpoints will fail");
        }

        let session_cache = Cache::builder()
            .max_capacity(config.session_cache_max_entries)
            .time_to_live(Duration::from_secs(config.session_cache_ttl_seconds))
            .build();

        Ok(Self {
            config: Arc::new(config),
            db_pool,
            session_cache,
        })
    }
}

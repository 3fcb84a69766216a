use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde_json::Value;
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::db;

/// Shared application state. Caches are explicit components with a TTL
/// and an invalidation call — never module-level globals.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: Option<PgPool>,
    pub http_client: reqwest::Client,
    /// (org_id, user_id) -> membership row.
    pub org_membership_cache: Cache<(String, String), Option<Value>>,
    /// property_id -> billing policy row.
    pub billing_policy_cache: Cache<String, Value>,
}

impl AppState {
    pub fn build(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let db_pool = db::build_pool(&config);

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        let org_membership_cache = Cache::builder()
            .max_capacity(config.org_membership_cache_max_entries)
            .time_to_live(Duration::from_secs(config.org_membership_cache_ttl_seconds))
            .build();

        let billing_policy_cache = Cache::builder()
            .max_capacity(config.billing_policy_cache_max_entries)
            .time_to_live(Duration::from_secs(config.billing_policy_cache_ttl_seconds))
            .build();

        Ok(Self {
            config: Arc::new(config),
            db_pool,
            http_client,
            org_membership_cache,
            billing_policy_cache,
        })
    }

    /// Drop the cached billing policy for a property after a write.
    pub async fn invalidate_billing_policy(&self, property_id: &str) {
        self.billing_policy_cache
            .invalidate(&property_id.to_string())
            .await;
    }
}

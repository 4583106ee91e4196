use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::future::Cache;
use sea_orm::DatabaseConnection;

use crate::broker::{BrokerApi, RecipientProfile};
use crate::config::{AdminConfig, CacheConfig, LimitsConfig, RateLimitingConfig, WebConfig};
use crate::ledger::LedgerStore;
use crate::purchase::PurchaseService;
use crate::security::rate_limit::RateLimiter;
use crate::wallet::TransactionSubmitter;

#[derive(Clone)]
pub struct AppState {
    pub database: DatabaseConnection,
    pub broker: Arc<dyn BrokerApi>,
    pub submitter: Arc<TransactionSubmitter>,
    pub purchases: Arc<PurchaseService>,
    pub ledger: LedgerStore,
    pub limiter: Arc<RateLimiter>,
    pub cache: Arc<ApiCache>,
    pub limits: LimitsConfig,
    pub rate_limiting: RateLimitingConfig,
    pub admin: AdminConfig,
    pub web: WebConfig,
    pub start_time: Instant,
}

pub struct ApiCache {
    pub profiles: Cache<String, Arc<RecipientProfile>>,
    pub profile_capacity: u64,
}

impl ApiCache {
    pub fn new(config: &CacheConfig) -> Self {
        assert!(
            config.profiles_max_capacity >= 100,
            "Profile cache capacity threshold"
        );

        let profiles = Cache::builder()
            .max_capacity(config.profiles_max_capacity)
            .time_to_live(Duration::from_secs(config.profiles_ttl_seconds))
            .time_to_idle(Duration::from_secs(config.profiles_ttl_seconds / 2 + 1))
            .build();

        Self {
            profiles,
            profile_capacity: config.profiles_max_capacity,
        }
    }
}

use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Serialize;
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::security;
use crate::state::AppState;

mod admin;
mod purchase;

pub fn router(state: AppState) -> Router {
    assert!(
        state.start_time.elapsed() < Duration::from_secs(86_400),
        "Application uptime exceeds 24 hours before router creation"
    );

    let cors = cors_layer(&state);
    let api_router = purchase::router().with_state(state.clone());
    let admin_router = admin::router().with_state(state.clone());

    Router::new()
        .route("/health", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/tonconnect-manifest.json", get(tonconnect_manifest))
        .route("/user/purchases/{user_id}", get(purchase::user_purchases))
        .nest("/api", api_router)
        .nest("/admin", admin_router)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        // Outermost layer: the anomaly filter sees every request before
        // routing happens.
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::filter_request,
        ))
        .with_state(state)
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, HeaderName::from_static("x-admin-token")])
        .max_age(Duration::from_secs(3600));

    if state.web.allows_any_origin() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = state
        .web
        .origins_list()
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    assert!(
        !origins.is_empty(),
        "At least one valid CORS origin must be configured"
    );
    layer.allow_origin(origins)
}

async fn health_live(State(state): State<AppState>) -> Result<Json<HealthResponse>, HttpError> {
    let uptime = state.start_time.elapsed().as_secs();
    assert!(
        uptime <= 31_536_000,
        "Uptime exceeds one year without restart"
    );
    let response = HealthResponse {
        status: "live",
        uptime_seconds: uptime,
    };
    Ok(Json(response))
}

async fn health_ready(State(state): State<AppState>) -> Result<Json<ReadyResponse>, HttpError> {
    state
        .database
        .ping()
        .await
        .map_err(|err| HttpError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?;

    let response = ReadyResponse {
        status: "ready",
        profile_cache_entries: state.cache.profiles.entry_count(),
        profile_cache_capacity: state.cache.profile_capacity,
    };
    Ok(Json(response))
}

/// TON Connect manifest served to wallets linking against the shop.
async fn tonconnect_manifest(State(state): State<AppState>) -> Json<Value> {
    let base = state.web.web_app_url.trim_end_matches('/');
    Json(json!({
        "url": base,
        "name": "Telegram Stars Shop",
        "iconUrl": format!("{base}/icon.png"),
        "termsOfUseUrl": format!("{base}/"),
        "privacyPolicyUrl": format!("{base}/"),
    }))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    status: &'static str,
    profile_cache_entries: u64,
    profile_cache_capacity: u64,
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: String) -> Self {
        assert!(status != StatusCode::OK, "Error status cannot be 200");
        assert!(!message.is_empty(), "Error message cannot be empty");
        Self { status, message }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        info!("HTTP error: {}", self.message);
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Instant;

    use sea_orm::EntityTrait;

    use crate::config::{
        AdminConfig, CacheConfig, LimitsConfig, RateLimitingConfig, WalletConfig, WebConfig,
    };
    use crate::entities::security_event;
    use crate::ledger::LedgerStore;
    use crate::ledger::tests::memory_database;
    use crate::purchase::PurchaseService;
    use crate::purchase::tests::{RecordingWallet, StubBroker};
    use crate::security::rate_limit::RateLimiter;
    use crate::state::{ApiCache, AppState};
    use crate::wallet::TransactionSubmitter;

    async fn test_state(broker: Arc<StubBroker>, wallet: Arc<RecordingWallet>) -> AppState {
        let database = memory_database().await;
        let wallet_config = WalletConfig {
            rpc_url: "http://127.0.0.1:1".to_string(),
            mnemonic: "abandon, ability".to_string(),
            request_timeout_ms: Some(1_000),
        };
        let limits = LimitsConfig {
            min_stars: 50,
            max_stars: 1_000_000,
        };
        let rate_limiting = RateLimitingConfig {
            purchase_limit: 10,
            purchase_window_minutes: 1,
            lookup_limit: 10,
            lookup_window_minutes: 1,
        };
        let submitter = Arc::new(TransactionSubmitter::with_provider(wallet_config, wallet));
        let ledger = LedgerStore::new(database.clone());
        let limiter = Arc::new(RateLimiter::new());
        let purchases = Arc::new(PurchaseService::new(
            broker.clone(),
            submitter.clone(),
            ledger.clone(),
            limiter.clone(),
            None,
            None,
            limits.clone(),
            rate_limiting.clone(),
            false,
        ));

        AppState {
            database,
            broker,
            submitter,
            purchases,
            ledger,
            limiter,
            cache: Arc::new(ApiCache::new(&CacheConfig {
                profiles_max_capacity: 1_000,
                profiles_ttl_seconds: 300,
            })),
            limits,
            rate_limiting,
            admin: AdminConfig {
                token: Some("admin-secret".to_string()),
            },
            web: WebConfig {
                web_app_url: "https://shop.example.org".to_string(),
                allowed_origins: "*".to_string(),
            },
            start_time: Instant::now(),
        }
    }

    async fn serve(state: AppState) -> SocketAddr {
        let app = router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("test listener binds");
        let addr = listener.local_addr().expect("test listener address");
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .expect("test server runs");
        });
        addr
    }

    #[tokio::test]
    async fn test_health_endpoint_is_live() {
        let addr = serve(test_state(StubBroker::new(true), RecordingWallet::new()).await).await;
        let body: Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .expect("health reachable")
            .json()
            .await
            .expect("health is JSON");
        assert_eq!(body["status"], "live");
    }

    #[tokio::test]
    async fn test_sensitive_path_is_blocked_before_routing() {
        let broker = StubBroker::new(true);
        let state = test_state(broker.clone(), RecordingWallet::new()).await;
        let database = state.database.clone();
        let addr = serve(state).await;

        let response = reqwest::get(format!("http://{addr}/.env"))
            .await
            .expect("request completes");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: Value = response.json().await.expect("error body is JSON");
        assert_eq!(body["error"], "Not Found");

        // The event row is written from a spawned task.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let events = security_event::Entity::find()
            .all(&database)
            .await
            .expect("events query");
        assert_eq!(events.len(), 1);
        assert!(events[0].blocked);
        assert_eq!(events[0].pattern, "/.env");
        assert_eq!(broker.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_purchase_round_trip_over_http() {
        let broker = StubBroker::new(true);
        let wallet = RecordingWallet::new();
        let addr = serve(test_state(broker.clone(), wallet.clone()).await).await;

        let client = reqwest::Client::new();
        let body: Value = client
            .post(format!("http://{addr}/api/purchase"))
            .json(&json!({
                "username": "@alice",
                "amount": 100,
                "payment_method": "ton",
                "buyer": {"id": 6082937, "first_name": "Bob"},
            }))
            .send()
            .await
            .expect("purchase request completes")
            .json()
            .await
            .expect("purchase response is JSON");

        assert_eq!(body["success"], true);
        assert_eq!(body["amount"], 100);
        assert_eq!(body["recipient"], "alice");
        assert_eq!(body["tx_hash"].as_str().map(str::len), Some(64));
        assert_eq!(wallet.transfers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_quantity_below_minimum_is_rejected_with_400() {
        let broker = StubBroker::new(true);
        let addr = serve(test_state(broker.clone(), RecordingWallet::new()).await).await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{addr}/api/purchase"))
            .json(&json!({
                "username": "alice",
                "amount": 10,
                "payment_method": "ton",
            }))
            .send()
            .await
            .expect("purchase request completes");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(broker.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_admin_statistics_requires_token() {
        let addr = serve(test_state(StubBroker::new(true), RecordingWallet::new()).await).await;
        let client = reqwest::Client::new();

        let unauthorized = client
            .get(format!("http://{addr}/admin/statistics"))
            .send()
            .await
            .expect("request completes");
        assert_eq!(unauthorized.status(), StatusCode::FORBIDDEN);

        let authorized: Value = client
            .get(format!("http://{addr}/admin/statistics"))
            .header("x-admin-token", "admin-secret")
            .send()
            .await
            .expect("request completes")
            .json()
            .await
            .expect("statistics body is JSON");
        assert_eq!(authorized["success"], true);
    }
}

//! Token-guarded operator endpoints.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tracing::info;

use crate::models::purchase::StatisticsResponse;
use crate::state::AppState;

use super::HttpError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(admin_health))
        .route("/statistics", get(admin_statistics))
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), HttpError> {
    let expected = state
        .admin
        .token
        .as_deref()
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            HttpError::new(
                StatusCode::FORBIDDEN,
                "Admin endpoints are disabled".to_string(),
            )
        })?;
    let supplied = headers
        .get("x-admin-token")
        .and_then(|value| value.to_str().ok());
    if supplied != Some(expected) {
        return Err(HttpError::new(
            StatusCode::FORBIDDEN,
            "Invalid admin token".to_string(),
        ));
    }
    Ok(())
}

/// Health with wallet details, which the public endpoint must not expose.
async fn admin_health(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, HttpError> {
    require_admin(&state, &headers)?;

    let wallet_balance = state.submitter.balance_ton().await.ok();
    Ok(Json(json!({
        "status": "healthy",
        "wallet_ready": wallet_balance.is_some(),
        "wallet_balance": wallet_balance,
        "profile_cache_entries": state.cache.profiles.entry_count(),
    })))
}

async fn admin_statistics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StatisticsResponse>, HttpError> {
    require_admin(&state, &headers)?;

    let statistics = state
        .ledger
        .statistics()
        .await
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    info!("Admin accessed statistics");

    Ok(Json(StatisticsResponse {
        success: true,
        statistics,
    }))
}

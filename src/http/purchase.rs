//! Purchase API handlers: recipient preview, price quotes, the purchase
//! pipeline entry point, wallet balance and buyer history.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode, header::USER_AGENT};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use tracing::info;

use crate::models::purchase::{
    CalculatePriceRequest, CheckUsernameRequest, PriceCalculation, PurchaseApiRequest,
    PurchaseHistoryEntry, PurchaseResponse, RequestMeta, UserProfileResponse,
    UserPurchasesResponse, WalletBalanceResponse,
};
use crate::purchase::PurchaseError;
use crate::security::rate_limit::{RateAction, RateKey};
use crate::state::AppState;
use crate::wallet::SubmitError;

use super::HttpError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/check_user", post(check_user))
        .route("/calculate_price", post(calculate_price))
        .route("/purchase", post(purchase))
        .route("/wallet/balance", get(wallet_balance))
}

/// Recipient preview through the broker, cached and lookup-rate-limited.
async fn check_user(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<CheckUsernameRequest>,
) -> Result<Json<UserProfileResponse>, HttpError> {
    let username = request.username.trim().trim_start_matches('@').to_string();
    if username.is_empty() {
        return Err(HttpError::new(
            StatusCode::BAD_REQUEST,
            "Username cannot be empty".to_string(),
        ));
    }

    // Lookups arrive before any session is presented, so the limit is keyed
    // by source address.
    let decision = state.limiter.check(
        RateKey::Ip(addr.ip().to_string()),
        RateAction::Lookup,
        state.rate_limiting.lookup_limit,
        state.rate_limiting.lookup_window(),
    );
    if !decision.is_allowed() {
        return Err(HttpError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "Too many lookups, slow down".to_string(),
        ));
    }

    if let Some(profile) = state.cache.profiles.get(&username).await {
        return Ok(Json(profile_response(&profile)));
    }

    let profile = state
        .broker
        .fetch_profile(&username)
        .await
        .map_err(|err| {
            info!("Recipient lookup failed: {err}");
            HttpError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Recipient lookup failed".to_string(),
            )
        })?;

    match profile {
        Some(profile) => {
            let profile = Arc::new(profile);
            state
                .cache
                .profiles
                .insert(username, Arc::clone(&profile))
                .await;
            Ok(Json(profile_response(&profile)))
        }
        None => Ok(Json(UserProfileResponse {
            success: false,
            username,
            user_id: None,
            first_name: None,
            last_name: None,
            photo_url: None,
            is_premium: None,
            error: Some("User not found in Fragment".to_string()),
        })),
    }
}

fn profile_response(profile: &crate::broker::RecipientProfile) -> UserProfileResponse {
    UserProfileResponse {
        success: true,
        username: profile.username.clone(),
        user_id: profile.user_id,
        first_name: profile.first_name.clone(),
        last_name: profile.last_name.clone(),
        photo_url: profile.photo_url.clone(),
        is_premium: Some(profile.is_premium),
        error: None,
    }
}

async fn calculate_price(
    State(state): State<AppState>,
    Json(request): Json<CalculatePriceRequest>,
) -> Result<Json<PriceCalculation>, HttpError> {
    if request.amount < state.limits.min_stars || request.amount > state.limits.max_stars {
        return Err(HttpError::new(
            StatusCode::BAD_REQUEST,
            format!(
                "Amount must be between {} and {}",
                state.limits.min_stars, state.limits.max_stars
            ),
        ));
    }
    Ok(Json(request.payment_method.price_for(request.amount)))
}

/// The purchase pipeline entry point. Gating rejections become HTTP status
/// codes; recorded pipeline outcomes (success or stage failure) come back as
/// the structured purchase response.
async fn purchase(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<PurchaseApiRequest>,
) -> Result<Json<PurchaseResponse>, HttpError> {
    let meta = RequestMeta {
        ip_address: addr.ip().to_string(),
        user_agent: headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    };

    info!(
        "Purchase request: {} Stars -> {} from {}",
        request.amount, request.username, meta.ip_address
    );

    match state.purchases.purchase(request, meta).await {
        Ok(response) => Ok(Json(response)),
        Err(err) => Err(purchase_rejection(err)),
    }
}

fn purchase_rejection(err: PurchaseError) -> HttpError {
    let status = match &err {
        PurchaseError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        PurchaseError::AuthenticationFailed(_) => StatusCode::FORBIDDEN,
        PurchaseError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        PurchaseError::DuplicateIntent => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    HttpError::new(status, err.to_string())
}

async fn wallet_balance(
    State(state): State<AppState>,
) -> Result<Json<WalletBalanceResponse>, HttpError> {
    let balance = state.submitter.balance_ton().await.map_err(|err| match err {
        SubmitError::WalletNotInitialized => HttpError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Wallet not initialized".to_string(),
        ),
        _ => HttpError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to get balance".to_string(),
        ),
    })?;

    Ok(Json(WalletBalanceResponse {
        success: true,
        balance,
        currency: "TON",
    }))
}

/// Purchase history for one buyer, latest first.
pub(super) async fn user_purchases(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<UserPurchasesResponse>, HttpError> {
    let rows = state
        .ledger
        .user_history(user_id, 50)
        .await
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    let purchases: Vec<PurchaseHistoryEntry> = rows
        .into_iter()
        .map(|row| PurchaseHistoryEntry {
            recipient_username: row.recipient_username,
            amount: row.amount_stars,
            tx_hash: row.tx_hash,
            ton_viewer_link: row.ton_viewer_link,
            status: row.status,
            timestamp: row.created_at.with_timezone(&Utc),
        })
        .collect();

    Ok(Json(UserPurchasesResponse {
        success: true,
        user_id,
        total: purchases.len(),
        purchases,
    }))
}

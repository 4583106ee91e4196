//! Purchase orchestration pipeline.
//!
//! Every purchase attempt runs the same gated chain: rate limit, session
//! verification, bounds validation, idempotency claim, then the three broker
//! stages, memo decoding and the wallet broadcast, with the ledger row
//! written to its terminal state before the response leaves. Gating
//! rejections surface as typed errors for the HTTP layer to map onto status
//! codes; broker and wallet failures after the claim become recorded
//! `{success:false}` outcomes.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::auth::WebAppAuthenticator;
use crate::broker::BrokerApi;
use crate::config::{LimitsConfig, RateLimitingConfig};
use crate::ledger::{BeginOutcome, LedgerStore, TxStatus, derive_idempotency_key};
use crate::models::purchase::{
    BuyerInfo, PurchaseApiRequest, PurchaseIntent, PurchaseResponse, RequestMeta,
};
use crate::notifier::{PurchaseNotification, TelegramNotifier};
use crate::payload::decode_memo;
use crate::security::rate_limit::{RateAction, RateKey, RateLimiter};
use crate::wallet::{NANO_PER_TON, SubmitError, TransactionSubmitter};

pub const TON_VIEWER_BASE: &str = "https://tonviewer.com/transaction";

#[derive(Debug, Error)]
pub enum PurchaseError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("rate limited")]
    RateLimited,
    #[error("recipient not found")]
    RecipientNotFound,
    #[error("purchase request initialization failed")]
    BrokerInitFailed,
    #[error("transaction parameters unavailable")]
    BrokerParamsFailed,
    #[error("wallet is not initialized")]
    WalletNotInitialized,
    #[error("recipient address is required")]
    InvalidRecipient,
    #[error("amount must be greater than 0")]
    InvalidAmount,
    #[error("broadcast failed")]
    BroadcastFailed,
    #[error("duplicate purchase intent")]
    DuplicateIntent,
    #[error("internal error")]
    Internal,
}

impl PurchaseError {
    /// Stable classification code used in responses and ledger rows. Broker
    /// and wallet internals never leak through here.
    pub fn classification(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::RateLimited => "rate_limited",
            Self::RecipientNotFound => "recipient_not_found",
            Self::BrokerInitFailed => "broker_init_failed",
            Self::BrokerParamsFailed => "broker_params_failed",
            Self::WalletNotInitialized => "wallet_not_initialized",
            Self::InvalidRecipient => "invalid_recipient",
            Self::InvalidAmount => "invalid_amount",
            Self::BroadcastFailed => "broadcast_failed",
            Self::DuplicateIntent => "duplicate_intent",
            Self::Internal => "internal_error",
        }
    }
}

impl From<SubmitError> for PurchaseError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::WalletNotInitialized => Self::WalletNotInitialized,
            SubmitError::InvalidRecipient => Self::InvalidRecipient,
            SubmitError::InvalidAmount => Self::InvalidAmount,
            SubmitError::BroadcastFailed(_) => Self::BroadcastFailed,
        }
    }
}

pub struct PurchaseService {
    broker: Arc<dyn BrokerApi>,
    submitter: Arc<TransactionSubmitter>,
    ledger: LedgerStore,
    limiter: Arc<RateLimiter>,
    authenticator: Option<WebAppAuthenticator>,
    notifier: Option<Arc<TelegramNotifier>>,
    limits: LimitsConfig,
    rate_limiting: RateLimitingConfig,
    require_init_data: bool,
}

impl PurchaseService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        submitter: Arc<TransactionSubmitter>,
        ledger: LedgerStore,
        limiter: Arc<RateLimiter>,
        authenticator: Option<WebAppAuthenticator>,
        notifier: Option<Arc<TelegramNotifier>>,
        limits: LimitsConfig,
        rate_limiting: RateLimitingConfig,
        require_init_data: bool,
    ) -> Self {
        assert!(
            limits.min_stars <= limits.max_stars,
            "Star bounds must be ordered"
        );
        assert!(limits.min_stars > 0, "Minimum star quantity must be positive");
        Self {
            broker,
            submitter,
            ledger,
            limiter,
            authenticator,
            notifier,
            limits,
            rate_limiting,
            require_init_data,
        }
    }

    /// Run one purchase attempt through the full gated pipeline.
    ///
    /// `Err` covers rejections before any side effect (rate limit, session,
    /// validation, a still-pending duplicate, storage trouble). `Ok` carries
    /// the recorded outcome, including broker/wallet stage failures and
    /// replays of an earlier attempt with the same idempotency key.
    pub async fn purchase(
        &self,
        request: PurchaseApiRequest,
        meta: RequestMeta,
    ) -> Result<PurchaseResponse, PurchaseError> {
        let claimed_buyer_id = request.buyer.as_ref().and_then(|buyer| buyer.id);

        // Rate limit and session checks run before any suspension point.
        let rate_key = RateKey::for_request(claimed_buyer_id, &meta.ip_address);
        let decision = self.limiter.check(
            rate_key,
            RateAction::Purchase,
            self.rate_limiting.purchase_limit,
            self.rate_limiting.purchase_window(),
        );
        if !decision.is_allowed() {
            warn!(
                "Purchase rate limited for {} ({:?})",
                meta.ip_address, decision
            );
            return Err(PurchaseError::RateLimited);
        }

        self.verify_session(request.init_data.as_deref(), request.buyer.as_ref())?;

        let handle = request.username.trim().trim_start_matches('@');
        if handle.is_empty() {
            return Err(PurchaseError::InvalidRequest(
                "Recipient username cannot be empty".to_string(),
            ));
        }
        if request.amount < self.limits.min_stars || request.amount > self.limits.max_stars {
            return Err(PurchaseError::InvalidRequest(format!(
                "Amount must be between {} and {}",
                self.limits.min_stars, self.limits.max_stars
            )));
        }

        let idempotency_key = request
            .idempotency_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                derive_idempotency_key(
                    claimed_buyer_id,
                    handle,
                    request.amount,
                    request.payment_method.as_str(),
                )
            });

        let intent = PurchaseIntent {
            recipient_username: handle.to_string(),
            quantity: request.amount,
            payment_method: request.payment_method,
            buyer: request.buyer.clone(),
            idempotency_key: idempotency_key.clone(),
        };

        match self
            .ledger
            .begin(&idempotency_key, &intent, &meta)
            .await
            .map_err(|err| {
                error!("Ledger begin failed: {err}");
                PurchaseError::Internal
            })? {
            BeginOutcome::AlreadyExists(record) => return replay(record),
            BeginOutcome::Proceed => {}
        }

        info!(
            "Purchase started: {} Stars -> @{} (key {idempotency_key})",
            intent.quantity, intent.recipient_username
        );

        match self.run_stages(&intent).await {
            Ok((tx_hash, viewer_link)) => {
                self.ledger
                    .complete_success(&idempotency_key, &tx_hash, &viewer_link)
                    .await
                    .map_err(|err| {
                        error!("Ledger completion failed: {err}");
                        PurchaseError::Internal
                    })?;
                self.spawn_notification(&intent, &tx_hash, &viewer_link);
                Ok(PurchaseResponse::succeeded(
                    tx_hash,
                    intent.quantity,
                    intent.recipient_username,
                    viewer_link,
                ))
            }
            Err(stage_error) => {
                let code = stage_error.classification();
                if let Err(err) = self.ledger.complete_failure(&idempotency_key, code).await {
                    error!("Ledger failure record failed: {err}");
                }
                warn!("Purchase failed at {code} (key {idempotency_key})");
                Ok(PurchaseResponse::failed(code.to_string()))
            }
        }
    }

    /// The broker pipeline, memo decoding and the broadcast. Three remote
    /// stages, each with its own timeout inside the client, none retried: a
    /// repeated init could reserve a second purchase at the broker.
    async fn run_stages(&self, intent: &PurchaseIntent) -> Result<(String, String), PurchaseError> {
        let token = self
            .broker
            .resolve_recipient(&intent.recipient_username)
            .await
            .map_err(|err| {
                warn!("Recipient resolution failed: {err}");
                PurchaseError::RecipientNotFound
            })?
            .ok_or(PurchaseError::RecipientNotFound)?;

        let request_id = self
            .broker
            .init_purchase(&token, intent.quantity)
            .await
            .map_err(|err| {
                warn!("Purchase initialization failed: {err}");
                PurchaseError::BrokerInitFailed
            })?;

        let params = self
            .broker
            .fetch_transaction_params(&token, &request_id, intent.quantity)
            .await
            .map_err(|err| {
                warn!("Transaction parameter fetch failed: {err}");
                PurchaseError::BrokerParamsFailed
            })?;

        let memo = decode_memo(&params.payload, intent.quantity);
        let amount_ton = params.amount_nano as f64 / NANO_PER_TON;

        let tx_hash = self
            .submitter
            .submit(&params.destination_address, amount_ton, &memo)
            .await?;
        let viewer_link = format!("{TON_VIEWER_BASE}/{tx_hash}");
        Ok((tx_hash, viewer_link))
    }

    /// Verify the signed session blob when present. Absence is allowed
    /// unless the deployment requires init data; a verified identity must
    /// match the claimed buyer id.
    fn verify_session(
        &self,
        init_data: Option<&str>,
        buyer: Option<&BuyerInfo>,
    ) -> Result<(), PurchaseError> {
        let Some(authenticator) = &self.authenticator else {
            return Ok(());
        };

        match init_data.filter(|data| !data.is_empty()) {
            Some(data) => {
                let identity = authenticator.verify(data).ok_or_else(|| {
                    PurchaseError::AuthenticationFailed(
                        "Invalid Telegram WebApp signature".to_string(),
                    )
                })?;
                if let Some(claimed) = buyer.and_then(|buyer| buyer.id) {
                    if claimed != identity.user_id {
                        return Err(PurchaseError::AuthenticationFailed(
                            "User ID mismatch".to_string(),
                        ));
                    }
                }
                info!("Session verified for user {}", identity.user_id);
                Ok(())
            }
            None if self.require_init_data => Err(PurchaseError::AuthenticationFailed(
                "Session data is required".to_string(),
            )),
            None => {
                if buyer.is_some() {
                    warn!("Purchase without session verification, opened outside Telegram");
                }
                Ok(())
            }
        }
    }

    fn spawn_notification(&self, intent: &PurchaseIntent, tx_hash: &str, viewer_link: &str) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let notifier = Arc::clone(notifier);
        let buyer = intent.buyer.clone().unwrap_or_default();
        let notification = PurchaseNotification {
            buyer_id: buyer.id,
            buyer_username: buyer.username,
            buyer_first_name: buyer.first_name,
            recipient_username: intent.recipient_username.clone(),
            quantity: intent.quantity,
            tx_hash: tx_hash.to_string(),
            ton_viewer_link: viewer_link.to_string(),
        };
        tokio::spawn(async move {
            notifier.notify_purchase(&notification).await;
        });
    }
}

/// Turn an existing ledger row into the response for a replayed request.
fn replay(
    record: crate::entities::purchase_transaction::Model,
) -> Result<PurchaseResponse, PurchaseError> {
    if record.status == TxStatus::Success.as_str() {
        info!(
            "Replaying recorded success for key {}",
            record.idempotency_key
        );
        return Ok(PurchaseResponse::succeeded(
            record.tx_hash.unwrap_or_default(),
            u32::try_from(record.amount_stars).unwrap_or_default(),
            record.recipient_username,
            record.ton_viewer_link.unwrap_or_default(),
        ));
    }
    if record.status == TxStatus::Failed.as_str() {
        info!(
            "Replaying recorded failure for key {}",
            record.idempotency_key
        );
        return Ok(PurchaseResponse::failed(
            record
                .error_message
                .unwrap_or_else(|| "purchase_failed".to_string()),
        ));
    }
    // A pending row means another task is mid-pipeline with this key.
    Err(PurchaseError::DuplicateIntent)
}

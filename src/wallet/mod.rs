//! TON transaction submission.
//!
//! Signing and broadcasting are delegated to an external wallet daemon
//! reached over JSON-RPC; this module owns the process-wide wallet handle.
//! The daemon signs transfers with a monotonically increasing sequence
//! number read from wallet state, so two interleaved broadcasts can read the
//! same seqno and one of them is dropped by the chain. `TransactionSubmitter`
//! therefore holds a single broadcast lock across the seqno read and the
//! send: parameter fetching for concurrent purchases may overlap, broadcasts
//! never do.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ObjectParams;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

use crate::config::WalletConfig;

pub const NANO_PER_TON: f64 = 1_000_000_000.0;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("wallet RPC failed: {0}")]
    Rpc(String),
    #[error("wallet rejected transfer: {0}")]
    Rejected(String),
}

/// Typed submission failures surfaced to the purchase pipeline.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("wallet is not initialized")]
    WalletNotInitialized,
    #[error("recipient address is required")]
    InvalidRecipient,
    #[error("amount must be greater than 0")]
    InvalidAmount,
    #[error("broadcast failed: {0}")]
    BroadcastFailed(String),
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub destination: String,
    pub amount_ton: f64,
    pub comment: String,
}

/// Seam between the submitter and the signing daemon.
#[async_trait]
pub trait WalletProvider: Send + Sync {
    fn address(&self) -> &str;
    async fn seqno(&self) -> Result<u32, WalletError>;
    async fn transfer(&self, request: &TransferRequest, seqno: u32)
    -> Result<String, WalletError>;
    async fn balance_nano(&self) -> Result<u64, WalletError>;
}

/// JSON-RPC client for the wallet daemon.
pub struct RpcWalletProvider {
    client: HttpClient,
    address: String,
}

impl RpcWalletProvider {
    /// Open a signing session: build the client and register the mnemonic
    /// with the daemon. The mnemonic never appears in logs.
    pub async fn connect(config: &WalletConfig) -> Result<Self, WalletError> {
        let client = HttpClientBuilder::default()
            .request_timeout(config.request_timeout())
            .build(&config.rpc_url)
            .map_err(|err| WalletError::Rpc(err.to_string()))?;

        let mut params = ObjectParams::new();
        params
            .insert("mnemonic", config.mnemonic_words())
            .map_err(|err| WalletError::Rpc(err.to_string()))?;
        let response: InitWalletResponse = client
            .request("wallet_init", params)
            .await
            .map_err(|err| WalletError::Rpc(err.to_string()))?;

        if response.address.is_empty() {
            return Err(WalletError::Rpc(
                "wallet daemon returned an empty address".to_string(),
            ));
        }
        info!("Wallet session opened for {}", response.address);

        Ok(Self {
            client,
            address: response.address,
        })
    }
}

#[async_trait]
impl WalletProvider for RpcWalletProvider {
    fn address(&self) -> &str {
        &self.address
    }

    async fn seqno(&self) -> Result<u32, WalletError> {
        let response: SeqnoResponse = self
            .client
            .request("wallet_seqno", rpc_params![])
            .await
            .map_err(|err| WalletError::Rpc(err.to_string()))?;
        Ok(response.seqno)
    }

    async fn transfer(
        &self,
        request: &TransferRequest,
        seqno: u32,
    ) -> Result<String, WalletError> {
        let mut params = ObjectParams::new();
        params
            .insert("destination", &request.destination)
            .map_err(|err| WalletError::Rpc(err.to_string()))?;
        params
            .insert("amount_ton", request.amount_ton)
            .map_err(|err| WalletError::Rpc(err.to_string()))?;
        params
            .insert("comment", &request.comment)
            .map_err(|err| WalletError::Rpc(err.to_string()))?;
        params
            .insert("seqno", seqno)
            .map_err(|err| WalletError::Rpc(err.to_string()))?;

        let response: TransferResponse = self
            .client
            .request("wallet_sendTransfer", params)
            .await
            .map_err(|err| WalletError::Rejected(err.to_string()))?;

        if response.tx_hash.is_empty() {
            return Err(WalletError::Rejected(
                "wallet daemon returned an empty transaction hash".to_string(),
            ));
        }
        Ok(response.tx_hash)
    }

    async fn balance_nano(&self) -> Result<u64, WalletError> {
        let response: BalanceResponse = self
            .client
            .request("wallet_balance", rpc_params![])
            .await
            .map_err(|err| WalletError::Rpc(err.to_string()))?;
        Ok(response.balance_nano)
    }
}

/// Process-wide submitter: lazy one-time wallet initialization plus the
/// single-flight broadcast discipline.
pub struct TransactionSubmitter {
    config: WalletConfig,
    provider: OnceCell<Arc<dyn WalletProvider>>,
    broadcast_lock: Mutex<()>,
}

impl TransactionSubmitter {
    pub fn new(config: WalletConfig) -> Self {
        Self {
            config,
            provider: OnceCell::new(),
            broadcast_lock: Mutex::new(()),
        }
    }

    /// Build a submitter around an already-connected provider. Test seam.
    pub fn with_provider(config: WalletConfig, provider: Arc<dyn WalletProvider>) -> Self {
        let cell = OnceCell::new();
        cell.set(provider)
            .ok()
            .expect("fresh OnceCell accepts a value");
        Self {
            config,
            provider: cell,
            broadcast_lock: Mutex::new(()),
        }
    }

    async fn provider(&self) -> Result<&Arc<dyn WalletProvider>, SubmitError> {
        self.provider
            .get_or_try_init(|| async {
                let provider = RpcWalletProvider::connect(&self.config).await?;
                Ok::<Arc<dyn WalletProvider>, WalletError>(Arc::new(provider))
            })
            .await
            .map_err(|err| {
                warn!("Wallet initialization failed: {err}");
                SubmitError::WalletNotInitialized
            })
    }

    /// Sign and broadcast a transfer, returning the transaction hash.
    ///
    /// The broadcast lock is held from the seqno read through the send; a
    /// concurrent submission waits here instead of racing the wallet state.
    pub async fn submit(
        &self,
        destination: &str,
        amount_ton: f64,
        memo: &str,
    ) -> Result<String, SubmitError> {
        if destination.is_empty() {
            return Err(SubmitError::InvalidRecipient);
        }
        if amount_ton <= 0.0 {
            return Err(SubmitError::InvalidAmount);
        }

        let provider = self.provider().await?;
        let request = TransferRequest {
            destination: destination.to_string(),
            amount_ton,
            comment: memo.to_string(),
        };

        let _guard = self.broadcast_lock.lock().await;
        let seqno = provider
            .seqno()
            .await
            .map_err(|err| SubmitError::BroadcastFailed(err.to_string()))?;
        let tx_hash = provider
            .transfer(&request, seqno)
            .await
            .map_err(|err| SubmitError::BroadcastFailed(err.to_string()))?;

        info!(
            "Broadcast {:.4} TON to {} at seqno {seqno} (tx: {tx_hash})",
            amount_ton, destination
        );
        Ok(tx_hash)
    }

    pub async fn balance_ton(&self) -> Result<f64, SubmitError> {
        let provider = self.provider().await?;
        let nano = provider
            .balance_nano()
            .await
            .map_err(|err| SubmitError::BroadcastFailed(err.to_string()))?;
        Ok(nano as f64 / NANO_PER_TON)
    }

    pub async fn wallet_address(&self) -> Result<String, SubmitError> {
        Ok(self.provider().await?.address().to_string())
    }
}

#[derive(Debug, Deserialize)]
struct InitWalletResponse {
    address: String,
}

#[derive(Debug, Deserialize)]
struct SeqnoResponse {
    seqno: u32,
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance_nano: u64,
}

//! Fragment broker client.
//!
//! The broker resolves recipients and reserves Stars purchases, returning
//! the on-chain transfer parameters. All calls are form-encoded POSTs to a
//! single hashed endpoint, discriminated by a `method` field and
//! authenticated with four opaque session cookies. Purchases are a strict
//! three-step protocol: resolve a recipient token, initialize a purchase
//! request, fetch the buy-link transaction parameters. The broker quotes a
//! price between init and get-link, so the steps are never collapsed or
//! reordered, and a stage failure aborts the purchase without retry — a
//! repeated init could double-reserve.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::config::BrokerConfig;

/// Wire discriminator for broker calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerMethod {
    SearchStarsRecipient,
    InitBuyStarsRequest,
    GetBuyStarsLink,
}

impl BrokerMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SearchStarsRecipient => "searchStarsRecipient",
            Self::InitBuyStarsRequest => "initBuyStarsRequest",
            Self::GetBuyStarsLink => "getBuyStarsLink",
        }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("broker returned HTTP {0}")]
    Status(u16),
    #[error("broker response missing {0}")]
    MissingField(&'static str),
}

/// On-chain transfer instructions extracted from a buy-link response.
///
/// Only constructed when the destination, a strictly positive amount, and
/// the payload are all present — the submitter can rely on that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionParameters {
    pub destination_address: String,
    pub amount_nano: u64,
    pub payload: String,
}

/// Recipient preview assembled from a `searchStarsRecipient` response.
#[derive(Debug, Clone, Serialize)]
pub struct RecipientProfile {
    pub username: String,
    pub recipient_token: String,
    pub user_id: Option<i64>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub photo_url: Option<String>,
    pub is_premium: bool,
}

/// Seam between the purchase pipeline and the broker wire protocol.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Resolve a handle to an opaque recipient token. `Ok(None)` means the
    /// broker does not know the recipient.
    async fn resolve_recipient(&self, query: &str) -> Result<Option<String>, BrokerError>;

    /// Full recipient preview for the lookup endpoint.
    async fn fetch_profile(&self, query: &str) -> Result<Option<RecipientProfile>, BrokerError>;

    /// Reserve a purchase of `quantity` Stars for a resolved recipient.
    async fn init_purchase(
        &self,
        recipient_token: &str,
        quantity: u32,
    ) -> Result<String, BrokerError>;

    /// Fetch the transfer parameters for a reserved purchase.
    async fn fetch_transaction_params(
        &self,
        recipient_token: &str,
        request_id: &str,
        quantity: u32,
    ) -> Result<TransactionParameters, BrokerError>;
}

#[derive(Clone)]
pub struct BrokerClient {
    http: Client,
    endpoint: String,
    origin: String,
    cookie_header: HeaderValue,
    wallet_address: String,
    wallet_public_key: String,
    wallet_state_init: String,
    lookup_timeout: Duration,
    params_timeout: Duration,
}

impl BrokerClient {
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        assert!(!config.api_hash.is_empty(), "Broker API hash must be provided");

        let endpoint_url =
            Url::parse(&config.base_url).context("Broker base URL is not a valid URL")?;
        let origin = endpoint_url.origin().ascii_serialization();

        let cookie_header = format!(
            "stel_ssid={}; stel_dt={}; stel_ton_token={}; stel_token={}",
            config.stel_ssid, config.stel_dt, config.stel_ton_token, config.stel_token
        );
        let cookie_header = HeaderValue::from_str(&cookie_header)
            .context("Broker session cookies contain invalid header characters")?;

        let http = Client::builder()
            .build()
            .context("Failed to build broker HTTP client")?;

        Ok(Self {
            http,
            endpoint: format!("{}?hash={}", config.base_url, config.api_hash),
            origin,
            cookie_header,
            wallet_address: config.wallet_address.clone(),
            wallet_public_key: config.wallet_public_key.clone(),
            wallet_state_init: config.wallet_state_init.clone(),
            lookup_timeout: config.lookup_timeout(),
            params_timeout: config.params_timeout(),
        })
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        form: &[(&str, &str)],
        headers: HeaderMap,
        timeout: Duration,
    ) -> Result<T, BrokerError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::COOKIE, self.cookie_header.clone())
            .headers(headers)
            .form(form)
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BrokerError::Status(status.as_u16()));
        }
        Ok(response.json::<T>().await?)
    }

    async fn search_recipient(
        &self,
        query: &str,
    ) -> Result<Option<FoundRecipient>, BrokerError> {
        let form = [
            ("query", query),
            ("method", BrokerMethod::SearchStarsRecipient.as_str()),
        ];
        let response: SearchRecipientResponse = self
            .post_form(&form, HeaderMap::new(), self.lookup_timeout)
            .await?;
        Ok(response.found)
    }
}

#[async_trait]
impl BrokerApi for BrokerClient {
    async fn resolve_recipient(&self, query: &str) -> Result<Option<String>, BrokerError> {
        let query = query.trim_start_matches('@');
        let found = self.search_recipient(query).await?;
        let token = found.and_then(|f| f.recipient);
        match &token {
            Some(token) => tracing::debug!("Recipient {query} resolved to token {token}"),
            None => tracing::info!("Recipient {query} not found at broker"),
        }
        Ok(token)
    }

    async fn fetch_profile(&self, query: &str) -> Result<Option<RecipientProfile>, BrokerError> {
        let query = query.trim_start_matches('@');
        let Some(found) = self.search_recipient(query).await? else {
            return Ok(None);
        };
        let Some(recipient_token) = found.recipient else {
            return Ok(None);
        };

        Ok(Some(RecipientProfile {
            username: query.to_string(),
            recipient_token,
            user_id: found.user_id,
            first_name: found.first_name,
            last_name: found.last_name,
            photo_url: found.photo.as_deref().and_then(extract_photo_url),
            is_premium: found.is_premium.unwrap_or(false),
        }))
    }

    async fn init_purchase(
        &self,
        recipient_token: &str,
        quantity: u32,
    ) -> Result<String, BrokerError> {
        assert!(quantity > 0, "Quantity must be validated before broker calls");
        let quantity = quantity.to_string();
        let form = [
            ("recipient", recipient_token),
            ("quantity", quantity.as_str()),
            ("method", BrokerMethod::InitBuyStarsRequest.as_str()),
        ];
        let response: InitPurchaseResponse = self
            .post_form(&form, HeaderMap::new(), self.lookup_timeout)
            .await?;
        response
            .req_id
            .filter(|id| !id.is_empty())
            .ok_or(BrokerError::MissingField("req_id"))
    }

    async fn fetch_transaction_params(
        &self,
        recipient_token: &str,
        request_id: &str,
        quantity: u32,
    ) -> Result<TransactionParameters, BrokerError> {
        // Fixed wallet-identity envelope the broker expects from a TonConnect
        // client; only the request id varies per purchase.
        let features = r#"["SendTransaction",{"name":"SendTransaction","maxMessages":255}]"#;
        let form = [
            ("address", self.wallet_address.as_str()),
            ("chain", "-239"),
            ("walletStateInit", self.wallet_state_init.as_str()),
            ("publicKey", self.wallet_public_key.as_str()),
            ("features", features),
            ("maxProtocolVersion", "2"),
            ("platform", "iphone"),
            ("appName", "Tonkeeper"),
            ("appVersion", "5.0.14"),
            ("transaction", "1"),
            ("id", request_id),
            ("show_sender", "0"),
            ("method", BrokerMethod::GetBuyStarsLink.as_str()),
        ];

        let referer = format!(
            "{}/stars/buy?recipient={recipient_token}&quantity={quantity}",
            self.origin
        );
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"),
        );
        headers.insert(
            reqwest::header::ORIGIN,
            HeaderValue::from_str(&self.origin).expect("Origin was serialized from a valid URL"),
        );
        if let Ok(value) = HeaderValue::from_str(&referer) {
            headers.insert(reqwest::header::REFERER, value);
        }
        headers.insert(
            "x-requested-with",
            HeaderValue::from_static("XMLHttpRequest"),
        );

        let response: BuyLinkResponse =
            self.post_form(&form, headers, self.params_timeout).await?;

        if !response.ok {
            return Err(BrokerError::MissingField("transaction"));
        }
        let transaction = response
            .transaction
            .ok_or(BrokerError::MissingField("transaction"))?;
        let message = transaction
            .messages
            .into_iter()
            .next()
            .ok_or(BrokerError::MissingField("transaction.messages"))?;

        let destination_address = message
            .address
            .filter(|address| !address.is_empty())
            .ok_or(BrokerError::MissingField("address"))?;
        let amount_nano = message
            .amount
            .as_ref()
            .and_then(parse_amount)
            .filter(|&amount| amount > 0)
            .ok_or(BrokerError::MissingField("amount"))?;
        let payload = message
            .payload
            .filter(|payload| !payload.is_empty())
            .ok_or(BrokerError::MissingField("payload"))?;

        Ok(TransactionParameters {
            destination_address,
            amount_nano,
            payload,
        })
    }
}

/// Amount arrives as a decimal string in practice, but some broker responses
/// carry a bare number.
fn parse_amount(value: &Value) -> Option<u64> {
    match value {
        Value::String(text) => text.trim().parse().ok(),
        Value::Number(number) => number.as_u64(),
        _ => None,
    }
}

/// The `photo` field is an HTML `<img>` tag; pull the `src` attribute out.
fn extract_photo_url(photo_html: &str) -> Option<String> {
    let start = photo_html.find("src=\"")? + 5;
    let end = photo_html[start..].find('"')? + start;
    if end > start {
        Some(photo_html[start..end].to_string())
    } else {
        None
    }
}

#[derive(Debug, Deserialize)]
struct SearchRecipientResponse {
    #[serde(default)]
    found: Option<FoundRecipient>,
}

#[derive(Debug, Deserialize)]
struct FoundRecipient {
    #[serde(default)]
    recipient: Option<String>,
    #[serde(default, alias = "id")]
    user_id: Option<i64>,
    #[serde(default, rename = "name", alias = "first_name", alias = "firstName")]
    first_name: Option<String>,
    #[serde(default, alias = "lastName")]
    last_name: Option<String>,
    #[serde(default)]
    photo: Option<String>,
    #[serde(default, alias = "isPremium")]
    is_premium: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct InitPurchaseResponse {
    #[serde(default)]
    req_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BuyLinkResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    transaction: Option<TransactionEnvelope>,
}

#[derive(Debug, Deserialize)]
struct TransactionEnvelope {
    #[serde(default)]
    messages: Vec<TransactionMessage>,
}

#[derive(Debug, Deserialize)]
struct TransactionMessage {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    amount: Option<Value>,
    #[serde(default)]
    payload: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::http::HeaderMap as AxumHeaderMap;
    use axum::routing::post;
    use serde_json::json;

    #[test]
    fn test_method_wire_names() {
        assert_eq!(
            BrokerMethod::SearchStarsRecipient.as_str(),
            "searchStarsRecipient"
        );
        assert_eq!(
            BrokerMethod::InitBuyStarsRequest.as_str(),
            "initBuyStarsRequest"
        );
        assert_eq!(BrokerMethod::GetBuyStarsLink.as_str(), "getBuyStarsLink");
    }

    #[test]
    fn test_parse_amount_accepts_string_and_number() {
        assert_eq!(parse_amount(&json!("500000000")), Some(500_000_000));
        assert_eq!(parse_amount(&json!(500_000_000u64)), Some(500_000_000));
        assert_eq!(parse_amount(&json!(" 42 ")), Some(42));
        assert_eq!(parse_amount(&json!("abc")), None);
        assert_eq!(parse_amount(&json!(null)), None);
    }

    #[test]
    fn test_photo_url_extraction() {
        assert_eq!(
            extract_photo_url(r#"<img src="https://cdn.example/p.jpg" />"#).as_deref(),
            Some("https://cdn.example/p.jpg")
        );
        assert_eq!(extract_photo_url("<img />"), None);
        assert_eq!(extract_photo_url(r#"<img src="" />"#), None);
    }

    #[test]
    fn test_buy_link_response_shape() {
        let raw = r#"{
            "ok": true,
            "transaction": {
                "messages": [
                    {"address": "EQAbc", "amount": "500000000", "payload": "cGF5"}
                ]
            }
        }"#;
        let parsed: BuyLinkResponse = serde_json::from_str(raw).expect("response must parse");
        assert!(parsed.ok);
        let message = parsed
            .transaction
            .expect("transaction present")
            .messages
            .into_iter()
            .next()
            .expect("one message");
        assert_eq!(message.address.as_deref(), Some("EQAbc"));
        assert_eq!(parse_amount(message.amount.as_ref().unwrap()), Some(500_000_000));
    }

    fn test_config(base_url: String) -> BrokerConfig {
        BrokerConfig {
            base_url,
            api_hash: "deadbeef".to_string(),
            stel_ssid: "ssid1".to_string(),
            stel_dt: "dt1".to_string(),
            stel_ton_token: "ton1".to_string(),
            stel_token: "tok1".to_string(),
            wallet_address: "EQWallet".to_string(),
            wallet_public_key: "pubkey".to_string(),
            wallet_state_init: "stateinit".to_string(),
            lookup_timeout_ms: Some(2_000),
            params_timeout_ms: Some(3_000),
        }
    }

    async fn stub_broker(headers: AxumHeaderMap, body: String) -> Json<Value> {
        let cookies = headers
            .get("cookie")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        assert!(cookies.contains("stel_ssid=ssid1"), "cookies must be forwarded");

        if body.contains("method=searchStarsRecipient") {
            Json(json!({"found": {"recipient": "tok-alice", "id": 42, "name": "Alice"}}))
        } else if body.contains("method=initBuyStarsRequest") {
            assert!(body.contains("recipient=tok-alice"));
            Json(json!({"req_id": "r1"}))
        } else if body.contains("method=getBuyStarsLink") {
            assert!(body.contains("id=r1"));
            assert!(body.contains("walletStateInit=stateinit"));
            Json(json!({
                "ok": true,
                "transaction": {"messages": [
                    {"address": "EQDest", "amount": "500000000", "payload": "cGF5bG9hZA"}
                ]}
            }))
        } else {
            Json(json!({}))
        }
    }

    #[tokio::test]
    async fn test_three_stage_protocol_against_stub_endpoint() {
        let app = Router::new().route("/api", post(stub_broker));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub listener");
        let addr = listener.local_addr().expect("stub address");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("stub server");
        });

        let config = test_config(format!("http://{addr}/api"));
        let client = BrokerClient::new(&config).expect("client builds");

        let token = client
            .resolve_recipient("@alice")
            .await
            .expect("resolve succeeds")
            .expect("recipient known");
        assert_eq!(token, "tok-alice");

        let profile = client
            .fetch_profile("alice")
            .await
            .expect("profile call succeeds")
            .expect("profile present");
        assert_eq!(profile.user_id, Some(42));
        assert_eq!(profile.first_name.as_deref(), Some("Alice"));

        let request_id = client
            .init_purchase(&token, 100)
            .await
            .expect("init succeeds");
        assert_eq!(request_id, "r1");

        let params = client
            .fetch_transaction_params(&token, &request_id, 100)
            .await
            .expect("params succeed");
        assert_eq!(params.destination_address, "EQDest");
        assert_eq!(params.amount_nano, 500_000_000);
        assert_eq!(params.payload, "cGF5bG9hZA");
    }

    #[tokio::test]
    async fn test_unknown_recipient_resolves_to_none() {
        let app = Router::new().route(
            "/api",
            post(|| async { Json(json!({"found": {}})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub listener");
        let addr = listener.local_addr().expect("stub address");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("stub server");
        });

        let client =
            BrokerClient::new(&test_config(format!("http://{addr}/api"))).expect("client builds");
        let token = client
            .resolve_recipient("ghost")
            .await
            .expect("resolve succeeds");
        assert!(token.is_none());
    }
}

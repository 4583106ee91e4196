//! Request and response bodies for the purchase API surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of supported payment methods. The wire value is the lowercase
/// name; anything else fails deserialization before reaching a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Ton,
    Crypto,
    Rub,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ton => "ton",
            Self::Crypto => "crypto",
            Self::Rub => "rub",
        }
    }

    fn currency(self) -> &'static str {
        match self {
            Self::Ton => "TON",
            Self::Crypto => "USDT",
            Self::Rub => "RUB",
        }
    }

    /// Quote a price for `quantity` Stars.
    pub fn price_for(self, quantity: u32) -> PriceCalculation {
        let quantity_f = f64::from(quantity);
        let price = match self {
            Self::Ton => round_to(quantity_f * 0.007, 4),
            Self::Crypto => round_to(quantity_f * 0.019, 3),
            Self::Rub => round_to(quantity_f * 1.5, 2),
        };
        PriceCalculation {
            amount_stars: quantity,
            price,
            total_ton: price,
            currency: self.currency().to_string(),
            payment_method: self.as_str().to_string(),
        }
    }
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Buyer details forwarded by the Mini-App client. Trusted only after the
/// session signature has been verified against them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuyerInfo {
    pub id: Option<i64>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// One purchase attempt, assembled from the API request after the
/// idempotency key has been resolved. Immutable for its whole lifetime.
#[derive(Debug, Clone)]
pub struct PurchaseIntent {
    pub recipient_username: String,
    pub quantity: u32,
    pub payment_method: PaymentMethod,
    pub buyer: Option<BuyerInfo>,
    pub idempotency_key: String,
}

/// Request-scoped metadata persisted alongside the ledger row.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub ip_address: String,
    pub user_agent: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CheckUsernameRequest {
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct UserProfileResponse {
    pub success: bool,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_premium: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CalculatePriceRequest {
    pub amount: u32,
    #[serde(default = "default_payment_method")]
    pub payment_method: PaymentMethod,
}

fn default_payment_method() -> PaymentMethod {
    PaymentMethod::Ton
}

#[derive(Debug, Serialize)]
pub struct PriceCalculation {
    pub amount_stars: u32,
    pub price: f64,
    /// Duplicate of `price` kept for frontend compatibility
    pub total_ton: f64,
    pub currency: String,
    pub payment_method: String,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseApiRequest {
    /// Recipient handle, with or without a leading `@`
    pub username: String,
    pub amount: u32,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub buyer: Option<BuyerInfo>,
    /// Signed WebApp session blob, when opened through Telegram
    #[serde(default)]
    pub init_data: Option<String>,
    /// Caller-supplied idempotency key; derived from the intent when absent
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ton_viewer_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PurchaseResponse {
    pub fn succeeded(
        tx_hash: String,
        amount: u32,
        recipient: String,
        ton_viewer_link: String,
    ) -> Self {
        Self {
            success: true,
            tx_hash: Some(tx_hash),
            amount: Some(amount),
            recipient: Some(recipient),
            ton_viewer_link: Some(ton_viewer_link),
            error: None,
        }
    }

    pub fn failed(error: String) -> Self {
        Self {
            success: false,
            tx_hash: None,
            amount: None,
            recipient: None,
            ton_viewer_link: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PurchaseHistoryEntry {
    pub recipient_username: String,
    pub amount: i64,
    pub tx_hash: Option<String>,
    pub ton_viewer_link: Option<String>,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct UserPurchasesResponse {
    pub success: bool,
    pub user_id: i64,
    pub purchases: Vec<PurchaseHistoryEntry>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct WalletBalanceResponse {
    pub success: bool,
    pub balance: f64,
    pub currency: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatisticsResponse {
    pub success: bool,
    pub statistics: crate::ledger::StatisticsReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_method_wire_values() {
        assert_eq!(
            serde_json::from_str::<PaymentMethod>("\"ton\"").unwrap(),
            PaymentMethod::Ton
        );
        assert_eq!(
            serde_json::from_str::<PaymentMethod>("\"crypto\"").unwrap(),
            PaymentMethod::Crypto
        );
        assert!(serde_json::from_str::<PaymentMethod>("\"card\"").is_err());
    }

    #[test]
    fn test_price_calculation_per_method() {
        let ton = PaymentMethod::Ton.price_for(100);
        assert!((ton.price - 0.7).abs() < 1e-9);
        assert_eq!(ton.currency, "TON");

        let crypto = PaymentMethod::Crypto.price_for(100);
        assert!((crypto.price - 1.9).abs() < 1e-9);
        assert_eq!(crypto.currency, "USDT");

        let rub = PaymentMethod::Rub.price_for(100);
        assert!((rub.price - 150.0).abs() < 1e-9);
        assert_eq!(rub.currency, "RUB");
    }

    #[test]
    fn test_rounding_is_per_method() {
        // 33 * 0.007 = 0.231 exactly at 4 decimals; 333 * 0.019 = 6.327
        let ton = PaymentMethod::Ton.price_for(33);
        assert!((ton.price - 0.231).abs() < 1e-9);
        let crypto = PaymentMethod::Crypto.price_for(333);
        assert!((crypto.price - 6.327).abs() < 1e-9);
    }
}

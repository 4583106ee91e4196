//! Telegram notifications for completed purchases.
//!
//! Strictly fire-and-forget: a notification failure is logged and dropped,
//! it never changes the recorded outcome of a purchase.

use std::time::Duration;

use reqwest::Client;
use serde_json::json;
use tracing::{info, warn};

/// Payload handed to the notifier after a successful purchase.
#[derive(Debug, Clone)]
pub struct PurchaseNotification {
    pub buyer_id: Option<i64>,
    pub buyer_username: Option<String>,
    pub buyer_first_name: Option<String>,
    pub recipient_username: String,
    pub quantity: u32,
    pub tx_hash: String,
    pub ton_viewer_link: String,
}

// The base URL embeds the bot token; keep it out of Debug output and logs.
pub struct TelegramNotifier {
    http: Client,
    base_url: String,
    admin_chat_id: i64,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, admin_chat_id: i64) -> Self {
        assert!(!bot_token.is_empty(), "Notifier bot token must be provided");
        assert!(admin_chat_id != 0, "Admin chat id must be configured");
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client builds with static configuration");
        Self {
            http,
            base_url: format!("https://api.telegram.org/bot{bot_token}"),
            admin_chat_id,
        }
    }

    pub async fn notify_purchase(&self, notification: &PurchaseNotification) {
        self.send_message(self.admin_chat_id, admin_message(notification))
            .await;
        if let Some(buyer_id) = notification.buyer_id {
            self.send_message(buyer_id, buyer_message(notification))
                .await;
        } else {
            info!("Buyer chat unknown, purchase notification sent to admin only");
        }
    }

    async fn send_message(&self, chat_id: i64, text: String) {
        let payload = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        let result = self
            .http
            .post(format!("{}/sendMessage", self.base_url))
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                info!("Notification delivered to chat {chat_id}");
            }
            Ok(response) => {
                warn!(
                    "Notification to chat {chat_id} rejected with HTTP {}",
                    response.status()
                );
            }
            Err(err) => {
                warn!("Notification to chat {chat_id} failed: {err}");
            }
        }
    }
}

fn buyer_label(notification: &PurchaseNotification) -> String {
    if let Some(first_name) = &notification.buyer_first_name {
        first_name.clone()
    } else if let Some(username) = &notification.buyer_username {
        format!("@{username}")
    } else {
        "Unknown buyer".to_string()
    }
}

fn admin_message(notification: &PurchaseNotification) -> String {
    let mut message = format!(
        "🔔 <b>NEW STARS PURCHASE</b>\n\n👤 Buyer: {}\n",
        buyer_label(notification)
    );
    if let Some(buyer_id) = notification.buyer_id {
        message.push_str(&format!("🆔 ID: <code>{buyer_id}</code>\n"));
    }
    if let Some(username) = &notification.buyer_username {
        message.push_str(&format!("📧 Username: @{username}\n"));
    }
    message.push_str(&format!(
        "\n🎯 Recipient: <code>@{}</code>\n⭐ Quantity: <b>{} Stars</b>\n\n🔗 TX Hash:\n<code>{}</code>\n\n<a href='{}'>📊 View in TON Viewer</a>",
        notification.recipient_username,
        notification.quantity,
        notification.tx_hash,
        notification.ton_viewer_link
    ));
    message
}

fn buyer_message(notification: &PurchaseNotification) -> String {
    format!(
        "✅ <b>Purchase complete!</b>\n\n⭐ {} Stars sent to <code>@{}</code>\n\n🔗 TX Hash:\n<code>{}</code>\n\n<a href='{}'>📊 View in TON Viewer</a>",
        notification.quantity,
        notification.recipient_username,
        notification.tx_hash,
        notification.ton_viewer_link
    )
}

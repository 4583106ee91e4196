//! Purchase ledger entity: one row per logical purchase attempt.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "purchase_transactions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Unique key deduplicating retries of the same purchase intent
    #[sea_orm(column_type = "String(StringLen::N(128))", unique)]
    pub idempotency_key: String,
    /// Buyer identity when the request carried a verified or claimed one
    pub buyer_telegram_id: Option<i64>,
    #[sea_orm(column_type = "String(StringLen::N(64))", nullable)]
    pub buyer_username: Option<String>,
    #[sea_orm(column_type = "String(StringLen::N(128))", nullable)]
    pub buyer_first_name: Option<String>,
    #[sea_orm(column_type = "String(StringLen::N(64))")]
    pub recipient_username: String,
    pub amount_stars: i64,
    #[sea_orm(column_type = "String(StringLen::N(16))")]
    pub payment_method: String,
    /// Hash of the broadcast transaction, set on success
    #[sea_orm(column_type = "String(StringLen::N(128))", nullable)]
    pub tx_hash: Option<String>,
    #[sea_orm(column_type = "String(StringLen::N(256))", nullable)]
    pub ton_viewer_link: Option<String>,
    /// `pending`, `success` or `failed`
    #[sea_orm(column_type = "String(StringLen::N(16))")]
    pub status: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,
    #[sea_orm(column_type = "String(StringLen::N(45))", nullable)]
    pub ip_address: Option<String>,
    #[sea_orm(column_type = "String(StringLen::N(512))", nullable)]
    pub user_agent: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

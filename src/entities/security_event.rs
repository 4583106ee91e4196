//! Security event entity for requests caught by the anomaly filter.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "security_events")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Source address of the offending request
    #[sea_orm(column_type = "String(StringLen::N(45))")]
    pub ip_address: String,
    /// Requested path and query
    #[sea_orm(column_type = "String(StringLen::N(512))")]
    pub endpoint: String,
    /// The list entry that matched
    #[sea_orm(column_type = "String(StringLen::N(128))")]
    pub pattern: String,
    #[sea_orm(column_type = "String(StringLen::N(512))", nullable)]
    pub user_agent: Option<String>,
    /// True when the match came from the block list and the request was
    /// answered with not-found
    pub blocked: bool,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

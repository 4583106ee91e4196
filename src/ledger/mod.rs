//! Durable purchase ledger and the idempotency guard over it.
//!
//! The ledger is the system of record for at-most-once purchase semantics:
//! `begin` claims an idempotency key with a single conditional insert, and a
//! conflict hands back the existing record instead of letting the pipeline
//! run again. In-memory dedup would not survive a restart, so nothing else
//! is allowed to stand in for this table.

use chrono::Utc;
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::entities::prelude::SecurityEvent;
use crate::entities::purchase_transaction;
use crate::models::purchase::{PurchaseIntent, RequestMeta};

/// Terminal and transient states of a ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Success,
    Failed,
}

impl TxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Result of claiming an idempotency key.
#[derive(Debug)]
pub enum BeginOutcome {
    /// The key was free; a `pending` row now exists and the pipeline may run.
    Proceed,
    /// A concurrent or earlier request holds the key.
    AlreadyExists(purchase_transaction::Model),
}

/// Derive a stable idempotency key from the intent's identifying fields.
///
/// Used when the caller does not supply one; the guard itself never invents
/// keys.
pub fn derive_idempotency_key(
    buyer_id: Option<i64>,
    recipient: &str,
    quantity: u32,
    payment_method: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(buyer_id.unwrap_or(0).to_le_bytes());
    hasher.update([0x1f]);
    hasher.update(recipient.as_bytes());
    hasher.update([0x1f]);
    hasher.update(quantity.to_le_bytes());
    hasher.update([0x1f]);
    hasher.update(payment_method.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct LedgerStore {
    database: DatabaseConnection,
}

impl LedgerStore {
    pub fn new(database: DatabaseConnection) -> Self {
        Self { database }
    }

    /// Atomically claim `key`, inserting a `pending` row.
    ///
    /// The insert-or-detect-conflict is a single conditional write
    /// (`ON CONFLICT DO NOTHING`), not a read-then-write, so two concurrent
    /// callers sharing a key cannot both proceed.
    pub async fn begin(
        &self,
        key: &str,
        intent: &PurchaseIntent,
        meta: &RequestMeta,
    ) -> Result<BeginOutcome, DbErr> {
        assert!(!key.is_empty(), "Idempotency key must not be empty");
        let now = Utc::now().fixed_offset();
        let buyer = intent.buyer.as_ref();

        let row = purchase_transaction::ActiveModel {
            id: NotSet,
            idempotency_key: Set(key.to_string()),
            buyer_telegram_id: Set(buyer.and_then(|b| b.id)),
            buyer_username: Set(buyer.and_then(|b| b.username.clone())),
            buyer_first_name: Set(buyer.and_then(|b| b.first_name.clone())),
            recipient_username: Set(intent.recipient_username.clone()),
            amount_stars: Set(i64::from(intent.quantity)),
            payment_method: Set(intent.payment_method.as_str().to_string()),
            tx_hash: Set(None),
            ton_viewer_link: Set(None),
            status: Set(TxStatus::Pending.as_str().to_string()),
            error_message: Set(None),
            ip_address: Set(Some(meta.ip_address.clone())),
            user_agent: Set(meta.user_agent.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let inserted = purchase_transaction::Entity::insert(row)
            .on_conflict(
                OnConflict::column(purchase_transaction::Column::IdempotencyKey)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.database)
            .await?;

        if inserted == 0 {
            let existing = self.find_by_key(key).await?.ok_or_else(|| {
                DbErr::RecordNotFound(format!("conflicting ledger row vanished for key {key}"))
            })?;
            return Ok(BeginOutcome::AlreadyExists(existing));
        }
        Ok(BeginOutcome::Proceed)
    }

    /// Record the successful terminal state for `key`.
    ///
    /// Only a `pending` row is updated; a second completion is a no-op.
    pub async fn complete_success(
        &self,
        key: &str,
        tx_hash: &str,
        ton_viewer_link: &str,
    ) -> Result<(), DbErr> {
        let updated = purchase_transaction::Entity::update_many()
            .col_expr(
                purchase_transaction::Column::Status,
                Expr::value(TxStatus::Success.as_str()),
            )
            .col_expr(purchase_transaction::Column::TxHash, Expr::value(tx_hash))
            .col_expr(
                purchase_transaction::Column::TonViewerLink,
                Expr::value(ton_viewer_link),
            )
            .col_expr(
                purchase_transaction::Column::UpdatedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(purchase_transaction::Column::IdempotencyKey.eq(key))
            .filter(purchase_transaction::Column::Status.eq(TxStatus::Pending.as_str()))
            .exec(&self.database)
            .await?;
        if updated.rows_affected == 0 {
            warn!("Ledger row for key {key} was already terminal");
        }
        Ok(())
    }

    /// Record the failed terminal state for `key`.
    pub async fn complete_failure(&self, key: &str, error: &str) -> Result<(), DbErr> {
        let updated = purchase_transaction::Entity::update_many()
            .col_expr(
                purchase_transaction::Column::Status,
                Expr::value(TxStatus::Failed.as_str()),
            )
            .col_expr(
                purchase_transaction::Column::ErrorMessage,
                Expr::value(error),
            )
            .col_expr(
                purchase_transaction::Column::UpdatedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(purchase_transaction::Column::IdempotencyKey.eq(key))
            .filter(purchase_transaction::Column::Status.eq(TxStatus::Pending.as_str()))
            .exec(&self.database)
            .await?;
        if updated.rows_affected == 0 {
            warn!("Ledger row for key {key} was already terminal");
        }
        Ok(())
    }

    pub async fn find_by_key(
        &self,
        key: &str,
    ) -> Result<Option<purchase_transaction::Model>, DbErr> {
        purchase_transaction::Entity::find()
            .filter(purchase_transaction::Column::IdempotencyKey.eq(key))
            .one(&self.database)
            .await
    }

    pub async fn user_history(
        &self,
        buyer_telegram_id: i64,
        limit: u64,
    ) -> Result<Vec<purchase_transaction::Model>, DbErr> {
        assert!(limit > 0, "History limit must be positive");
        assert!(limit <= 500, "History limit exceeds defensive bound");
        purchase_transaction::Entity::find()
            .filter(purchase_transaction::Column::BuyerTelegramId.eq(buyer_telegram_id))
            .order_by_desc(purchase_transaction::Column::CreatedAt)
            .limit(limit)
            .all(&self.database)
            .await
    }

    pub async fn statistics(&self) -> Result<StatisticsReport, DbErr> {
        let total_transactions = purchase_transaction::Entity::find()
            .count(&self.database)
            .await?;
        let successful_transactions = purchase_transaction::Entity::find()
            .filter(purchase_transaction::Column::Status.eq(TxStatus::Success.as_str()))
            .count(&self.database)
            .await?;

        let total_stars_sold: Option<i64> = purchase_transaction::Entity::find()
            .select_only()
            .column_as(purchase_transaction::Column::AmountStars.sum(), "total")
            .filter(purchase_transaction::Column::Status.eq(TxStatus::Success.as_str()))
            .into_tuple::<Option<i64>>()
            .one(&self.database)
            .await?
            .unwrap_or(None);

        let buyers: Vec<Option<i64>> = purchase_transaction::Entity::find()
            .select_only()
            .column(purchase_transaction::Column::BuyerTelegramId)
            .distinct()
            .into_tuple::<Option<i64>>()
            .all(&self.database)
            .await?;
        let unique_buyers = buyers.into_iter().flatten().count() as u64;

        let security_events = SecurityEvent::find().count(&self.database).await?;

        Ok(StatisticsReport {
            total_transactions,
            successful_transactions,
            total_stars_sold: total_stars_sold.unwrap_or(0),
            unique_buyers,
            security_events,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct StatisticsReport {
    pub total_transactions: u64,
    pub successful_transactions: u64,
    pub total_stars_sold: i64,
    pub unique_buyers: u64,
    pub security_events: u64,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::purchase::{BuyerInfo, PaymentMethod};
    use migration::MigratorTrait;
    use sea_orm::{ConnectOptions, Database};

    pub(crate) async fn memory_database() -> DatabaseConnection {
        let mut options = ConnectOptions::new("sqlite::memory:");
        options.max_connections(1);
        let database = Database::connect(options)
            .await
            .expect("in-memory database connects");
        migration::Migrator::up(&database, None)
            .await
            .expect("migrations apply");
        database
    }

    fn intent(key: &str) -> PurchaseIntent {
        PurchaseIntent {
            recipient_username: "alice".to_string(),
            quantity: 100,
            payment_method: PaymentMethod::Ton,
            buyer: Some(BuyerInfo {
                id: Some(6082937),
                username: Some("buyer".to_string()),
                first_name: Some("Bob".to_string()),
                last_name: None,
            }),
            idempotency_key: key.to_string(),
        }
    }

    fn meta() -> RequestMeta {
        RequestMeta {
            ip_address: "203.0.113.7".to_string(),
            user_agent: Some("test-agent".to_string()),
        }
    }

    #[tokio::test]
    async fn test_begin_claims_key_exactly_once() {
        let store = LedgerStore::new(memory_database().await);

        let first = store.begin("k1", &intent("k1"), &meta()).await.unwrap();
        assert!(matches!(first, BeginOutcome::Proceed));

        let second = store.begin("k1", &intent("k1"), &meta()).await.unwrap();
        match second {
            BeginOutcome::AlreadyExists(record) => {
                assert_eq!(record.status, "pending");
                assert_eq!(record.recipient_username, "alice");
            }
            BeginOutcome::Proceed => panic!("duplicate key must not proceed"),
        }
    }

    #[tokio::test]
    async fn test_completion_is_terminal_exactly_once() {
        let store = LedgerStore::new(memory_database().await);
        store.begin("k2", &intent("k2"), &meta()).await.unwrap();

        store
            .complete_success("k2", &"a".repeat(64), "https://tonviewer.com/transaction/aa")
            .await
            .unwrap();
        // A late failure report must not overwrite the terminal state.
        store.complete_failure("k2", "too late").await.unwrap();

        let record = store.find_by_key("k2").await.unwrap().expect("row exists");
        assert_eq!(record.status, "success");
        assert_eq!(record.tx_hash.as_deref(), Some("a".repeat(64).as_str()));
        assert!(record.error_message.is_none());
    }

    #[tokio::test]
    async fn test_failed_completion_records_error() {
        let store = LedgerStore::new(memory_database().await);
        store.begin("k3", &intent("k3"), &meta()).await.unwrap();
        store
            .complete_failure("k3", "recipient_not_found")
            .await
            .unwrap();

        let record = store.find_by_key("k3").await.unwrap().expect("row exists");
        assert_eq!(record.status, "failed");
        assert_eq!(record.error_message.as_deref(), Some("recipient_not_found"));
        assert!(record.tx_hash.is_none());
    }

    #[tokio::test]
    async fn test_user_history_orders_latest_first() {
        let store = LedgerStore::new(memory_database().await);
        store.begin("h1", &intent("h1"), &meta()).await.unwrap();
        store.begin("h2", &intent("h2"), &meta()).await.unwrap();
        store
            .complete_success("h2", &"b".repeat(64), "https://tonviewer.com/transaction/bb")
            .await
            .unwrap();

        let history = store.user_history(6082937, 50).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().any(|row| row.idempotency_key == "h1"));
        assert!(history.iter().any(|row| row.idempotency_key == "h2"));
    }

    #[tokio::test]
    async fn test_statistics_aggregate_success_only() {
        let store = LedgerStore::new(memory_database().await);
        store.begin("s1", &intent("s1"), &meta()).await.unwrap();
        store.begin("s2", &intent("s2"), &meta()).await.unwrap();
        store
            .complete_success("s1", &"c".repeat(64), "https://tonviewer.com/transaction/cc")
            .await
            .unwrap();
        store.complete_failure("s2", "broker_init_failed").await.unwrap();

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.total_transactions, 2);
        assert_eq!(stats.successful_transactions, 1);
        assert_eq!(stats.total_stars_sold, 100);
        assert_eq!(stats.unique_buyers, 1);
    }

    #[test]
    fn test_derived_keys_are_stable_and_distinct() {
        let a = derive_idempotency_key(Some(1), "alice", 100, "ton");
        let b = derive_idempotency_key(Some(1), "alice", 100, "ton");
        let c = derive_idempotency_key(Some(1), "alice", 101, "ton");
        let d = derive_idempotency_key(Some(2), "alice", 100, "ton");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }
}

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_query::Expr;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Purchase ledger: one row per logical purchase attempt, keyed by the
        // idempotency key so a replayed request can never create a second row
        manager
            .create_table(
                Table::create()
                    .table(PurchaseTransactions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PurchaseTransactions::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(PurchaseTransactions::IdempotencyKey)
                            .string_len(128)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(PurchaseTransactions::BuyerTelegramId).big_integer())
                    .col(ColumnDef::new(PurchaseTransactions::BuyerUsername).string_len(64))
                    .col(ColumnDef::new(PurchaseTransactions::BuyerFirstName).string_len(128))
                    .col(
                        ColumnDef::new(PurchaseTransactions::RecipientUsername)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PurchaseTransactions::AmountStars)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PurchaseTransactions::PaymentMethod)
                            .string_len(16)
                            .not_null(),
                    )
                    .col(ColumnDef::new(PurchaseTransactions::TxHash).string_len(128))
                    .col(ColumnDef::new(PurchaseTransactions::TonViewerLink).string_len(256))
                    .col(
                        ColumnDef::new(PurchaseTransactions::Status)
                            .string_len(16)
                            .not_null(),
                    )
                    .col(ColumnDef::new(PurchaseTransactions::ErrorMessage).text())
                    .col(
                        ColumnDef::new(PurchaseTransactions::IpAddress).string_len(45), // IPv6 max length
                    )
                    .col(ColumnDef::new(PurchaseTransactions::UserAgent).string_len(512))
                    .col(
                        ColumnDef::new(PurchaseTransactions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(PurchaseTransactions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Index for buyer history lookups
        manager
            .create_index(
                Index::create()
                    .name("idx_purchases_buyer")
                    .table(PurchaseTransactions::Table)
                    .col(PurchaseTransactions::BuyerTelegramId)
                    .col(PurchaseTransactions::CreatedAt)
                    .to_owned(),
            )
            .await?;

        // Index for transaction lookup
        manager
            .create_index(
                Index::create()
                    .name("idx_purchases_tx_hash")
                    .table(PurchaseTransactions::Table)
                    .col(PurchaseTransactions::TxHash)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PurchaseTransactions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum PurchaseTransactions {
    Table,
    Id,
    IdempotencyKey,
    BuyerTelegramId,
    BuyerUsername,
    BuyerFirstName,
    RecipientUsername,
    AmountStars,
    PaymentMethod,
    TxHash,
    TonViewerLink,
    Status,
    ErrorMessage,
    IpAddress,
    UserAgent,
    CreatedAt,
    UpdatedAt,
}

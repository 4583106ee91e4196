use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_query::Expr;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Security events recorded by the request anomaly filter
        manager
            .create_table(
                Table::create()
                    .table(SecurityEvents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SecurityEvents::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(SecurityEvents::IpAddress)
                            .string_len(45)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SecurityEvents::Endpoint)
                            .string_len(512)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SecurityEvents::Pattern)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(ColumnDef::new(SecurityEvents::UserAgent).string_len(512))
                    .col(
                        ColumnDef::new(SecurityEvents::Blocked)
                            .boolean()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SecurityEvents::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Index for per-source triage
        manager
            .create_index(
                Index::create()
                    .name("idx_security_events_ip")
                    .table(SecurityEvents::Table)
                    .col(SecurityEvents::IpAddress)
                    .col(SecurityEvents::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SecurityEvents::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SecurityEvents {
    Table,
    Id,
    IpAddress,
    Endpoint,
    Pattern,
    UserAgent,
    Blocked,
    CreatedAt,
}

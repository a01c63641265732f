//! Migration to create the jobs table.
//!
//! Training and video-generation jobs share one table, discriminated by `kind`.
//! A provider request id resolves to at most one job across both kinds.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Jobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Jobs::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Jobs::AccountId).integer().not_null())
                    .col(ColumnDef::new(Jobs::Kind).text().not_null())
                    .col(ColumnDef::new(Jobs::ProviderRequestId).text().null())
                    .col(
                        ColumnDef::new(Jobs::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(Jobs::CreditsCharged)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Jobs::DisplayName).text().null())
                    .col(ColumnDef::new(Jobs::TriggerToken).text().null())
                    .col(ColumnDef::new(Jobs::ImageCount).integer().null())
                    .col(ColumnDef::new(Jobs::ModelUrl).text().null())
                    .col(ColumnDef::new(Jobs::ModelJobId).integer().null())
                    .col(ColumnDef::new(Jobs::SourceImageUrl).text().null())
                    .col(ColumnDef::new(Jobs::MotionPrompt).text().null())
                    .col(ColumnDef::new(Jobs::VideoUrl).text().null())
                    .col(ColumnDef::new(Jobs::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(Jobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Jobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Jobs::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_jobs_account_id")
                            .from(Jobs::Table, Jobs::AccountId)
                            .to(Accounts::Table, Accounts::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        // NULLs are distinct, so jobs awaiting submission do not collide
        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_provider_request_id")
                    .table(Jobs::Table)
                    .col(Jobs::ProviderRequestId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_account_kind_created")
                    .table(Jobs::Table)
                    .col(Jobs::AccountId)
                    .col(Jobs::Kind)
                    .col(Jobs::CreatedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_jobs_provider_request_id").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_jobs_account_kind_created").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Jobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Id,
    AccountId,
    Kind,
    ProviderRequestId,
    Status,
    CreditsCharged,
    DisplayName,
    TriggerToken,
    ImageCount,
    ModelUrl,
    ModelJobId,
    SourceImageUrl,
    MotionPrompt,
    VideoUrl,
    ErrorMessage,
    CreatedAt,
    UpdatedAt,
    CompletedAt,
}

#[derive(DeriveIden)]
enum Accounts {
    Table,
    Id,
}

//! Adds a partial unique index so a checkout session is credited once and a job is
//! charged and refunded at most once.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::{DatabaseBackend, Statement};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();
        match backend {
            DatabaseBackend::Postgres => {
                manager
                    .get_connection()
                    .execute(Statement::from_string(
                        backend,
                        "DO $$\nBEGIN\n    IF NOT EXISTS (\n        SELECT 1 FROM pg_indexes\n        WHERE schemaname = current_schema()\n          AND indexname = 'idx_ledger_entries_kind_external_ref'\n    ) THEN\n        CREATE UNIQUE INDEX idx_ledger_entries_kind_external_ref\n            ON ledger_entries (kind, external_ref)\n            WHERE external_ref IS NOT NULL\n              AND kind IN ('purchase','consumption','refund');\n    END IF;\nEND\n$$;"
                            .to_string(),
                    ))
                    .await
                    .map(|_| ())
            }
            _ => manager
                .get_connection()
                .execute(Statement::from_string(
                    backend,
                    "CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_entries_kind_external_ref \
                     ON ledger_entries (kind, external_ref) \
                     WHERE external_ref IS NOT NULL AND kind IN ('purchase','consumption','refund')"
                        .to_string(),
                ))
                .await
                .map(|_| ()),
        }
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "DROP INDEX IF EXISTS idx_ledger_entries_kind_external_ref",
            ))
            .await
            .map(|_| ())
    }
}

//! Database migrations for the Studio Credits service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_06_01_000001_create_accounts;
mod m2025_06_01_000100_create_ledger_entries;
mod m2025_06_01_000200_create_jobs;
mod m2025_06_02_000100_add_ledger_idempotency_guard;
mod m2025_06_03_000100_create_rate_limit_counters;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_06_01_000001_create_accounts::Migration),
            Box::new(m2025_06_01_000100_create_ledger_entries::Migration),
            Box::new(m2025_06_01_000200_create_jobs::Migration),
            Box::new(m2025_06_02_000100_add_ledger_idempotency_guard::Migration),
            Box::new(m2025_06_03_000100_create_rate_limit_counters::Migration),
        ]
    }
}

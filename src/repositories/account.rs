//! # Account Repository
//!
//! Account creation and lookup. Accounts start with a zero balance; credits only
//! ever arrive through the ledger.

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ActiveValue::NotSet, DatabaseConnection, DbErr, EntityTrait, Set};

use crate::models::account::{ActiveModel, Entity as Account, Model};

/// Repository for account database operations
#[derive(Clone)]
pub struct AccountRepository {
    db: DatabaseConnection,
}

impl AccountRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Create an account with a zero balance
    pub async fn create(&self, email: &str) -> Result<Model, DbErr> {
        let now = Utc::now().fixed_offset();

        let account = ActiveModel {
            id: NotSet,
            email: Set(email.trim().to_lowercase()),
            credits_balance: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let account = account.insert(&self.db).await?;
        tracing::info!(account_id = account.id, "Account created");

        Ok(account)
    }

    pub async fn find(&self, account_id: i32) -> Result<Option<Model>, DbErr> {
        Account::find_by_id(account_id).one(&self.db).await
    }
}

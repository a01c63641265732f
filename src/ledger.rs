//! # Credit Ledger
//!
//! Owns the authoritative credit balance of every account and the append-only
//! `ledger_entries` log. Every mutation updates `accounts.credits_balance` and
//! inserts the matching entry inside one transaction, so the balance always
//! equals the sum of the account's entry deltas.
//!
//! Debits are applied with a conditional `UPDATE ... WHERE credits_balance >= amount`,
//! which the database serializes per row. Two concurrent debits that each look
//! affordable against the old balance cannot both succeed.
//!
//! The `*_in` variants accept any connection that can open a (nested)
//! transaction, allowing callers such as the job launcher to compose a debit
//! with other writes atomically.

use chrono::Utc;
use metrics::counter;
use sea_orm::prelude::*;
use sea_orm::{
    ActiveValue::NotSet, ConnectionTrait, DatabaseConnection, QueryOrder, QuerySelect, Set,
    TransactionTrait,
};
use thiserror::Error;

use crate::error::is_unique_violation;
use crate::models::account::{self, Entity as Account};
use crate::models::ledger_entry::{self, Entity as LedgerEntry, LedgerEntryKind};

/// Errors raised by ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("account {0} not found")]
    AccountNotFound(i32),

    #[error("insufficient credits: balance {balance}, requested {requested}")]
    InsufficientCredits { balance: i64, requested: i64 },

    /// A purchase, consumption or refund with this external reference already exists
    #[error("{kind} entry for '{external_ref}' already recorded")]
    DuplicateEntry {
        kind: LedgerEntryKind,
        external_ref: String,
    },

    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

/// Parameters of a single balance change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRequest {
    pub account_id: i32,
    /// Always positive; the operation decides the sign
    pub amount: i64,
    pub kind: LedgerEntryKind,
    pub description: String,
    pub external_ref: Option<String>,
    pub amount_cents: Option<i64>,
}

impl EntryRequest {
    pub fn new(
        account_id: i32,
        amount: i64,
        kind: LedgerEntryKind,
        description: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            amount,
            kind,
            description: description.into(),
            external_ref: None,
            amount_cents: None,
        }
    }

    pub fn with_external_ref(mut self, external_ref: impl Into<String>) -> Self {
        self.external_ref = Some(external_ref.into());
        self
    }

    pub fn with_amount_cents(mut self, amount_cents: i64) -> Self {
        self.amount_cents = Some(amount_cents);
        self
    }
}

/// Credit ledger backed by the `accounts` and `ledger_entries` tables
#[derive(Clone)]
pub struct Ledger {
    db: DatabaseConnection,
}

impl Ledger {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Add `amount` credits to the account. Returns the new balance.
    pub async fn credit(&self, request: EntryRequest) -> Result<i64, LedgerError> {
        self.credit_in(&self.db, request).await
    }

    /// Remove `amount` credits from the account. Returns the new balance.
    pub async fn debit(&self, request: EntryRequest) -> Result<i64, LedgerError> {
        self.debit_in(&self.db, request).await
    }

    pub async fn credit_in<C>(&self, conn: &C, request: EntryRequest) -> Result<i64, LedgerError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        if request.amount <= 0 {
            return Err(LedgerError::InvalidAmount(request.amount));
        }

        let txn = conn.begin().await?;
        let balance = apply_entry(&txn, &request, request.amount).await?;
        txn.commit().await?;

        tracing::info!(
            account_id = request.account_id,
            amount = request.amount,
            kind = %request.kind,
            external_ref = ?request.external_ref,
            balance,
            "Ledger credit applied"
        );
        counter!("ledger_entries_total", "kind" => request.kind.as_str()).increment(1);

        Ok(balance)
    }

    pub async fn debit_in<C>(&self, conn: &C, request: EntryRequest) -> Result<i64, LedgerError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        if request.amount <= 0 {
            return Err(LedgerError::InvalidAmount(request.amount));
        }

        let txn = conn.begin().await?;
        let balance = apply_entry(&txn, &request, -request.amount).await?;
        txn.commit().await?;

        tracing::info!(
            account_id = request.account_id,
            amount = request.amount,
            kind = %request.kind,
            external_ref = ?request.external_ref,
            balance,
            "Ledger debit applied"
        );
        counter!("ledger_entries_total", "kind" => request.kind.as_str()).increment(1);

        Ok(balance)
    }

    /// Append a zero-delta `admin_adjustment` entry recording a manual intervention
    pub async fn record_audit_in<C>(
        &self,
        conn: &C,
        account_id: i32,
        description: &str,
        external_ref: Option<String>,
    ) -> Result<i64, LedgerError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let txn = conn.begin().await?;
        let balance = current_balance(&txn, account_id).await?;
        insert_entry(
            &txn,
            &EntryRequest {
                account_id,
                amount: 0,
                kind: LedgerEntryKind::AdminAdjustment,
                description: description.to_string(),
                external_ref,
                amount_cents: None,
            },
            0,
            balance,
        )
        .await?;
        txn.commit().await?;

        counter!("ledger_entries_total", "kind" => LedgerEntryKind::AdminAdjustment.as_str())
            .increment(1);
        Ok(balance)
    }

    pub async fn record_audit(
        &self,
        account_id: i32,
        description: &str,
        external_ref: Option<String>,
    ) -> Result<i64, LedgerError> {
        self.record_audit_in(&self.db, account_id, description, external_ref)
            .await
    }

    /// Current balance of the account
    pub async fn balance_of(&self, account_id: i32) -> Result<i64, LedgerError> {
        current_balance(&self.db, account_id).await
    }

    /// Ledger history for an account, newest first
    pub async fn entries(
        &self,
        account_id: i32,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<ledger_entry::Model>, LedgerError> {
        let entries = LedgerEntry::find()
            .filter(ledger_entry::Column::AccountId.eq(account_id))
            .order_by_desc(ledger_entry::Column::CreatedAt)
            .order_by_desc(ledger_entry::Column::Id)
            .offset(offset)
            .limit(limit)
            .all(&self.db)
            .await?;

        Ok(entries)
    }

    /// Whether an entry of `kind` already references `external_ref`
    pub async fn has_entry(
        &self,
        kind: LedgerEntryKind,
        external_ref: &str,
    ) -> Result<bool, LedgerError> {
        has_entry_in(&self.db, kind, external_ref).await
    }
}

pub(crate) async fn has_entry_in<C: ConnectionTrait>(
    conn: &C,
    kind: LedgerEntryKind,
    external_ref: &str,
) -> Result<bool, LedgerError> {
    let count = LedgerEntry::find()
        .filter(ledger_entry::Column::Kind.eq(kind.as_str()))
        .filter(ledger_entry::Column::ExternalRef.eq(external_ref))
        .count(conn)
        .await?;

    Ok(count > 0)
}

async fn current_balance<C: ConnectionTrait>(conn: &C, account_id: i32) -> Result<i64, LedgerError> {
    Account::find_by_id(account_id)
        .one(conn)
        .await?
        .map(|account| account.credits_balance)
        .ok_or(LedgerError::AccountNotFound(account_id))
}

async fn apply_entry<C: ConnectionTrait>(
    txn: &C,
    request: &EntryRequest,
    delta: i64,
) -> Result<i64, LedgerError> {
    let mut update = Account::update_many()
        .col_expr(
            account::Column::CreditsBalance,
            Expr::col(account::Column::CreditsBalance).add(delta),
        )
        .col_expr(
            account::Column::UpdatedAt,
            Expr::value(Utc::now().fixed_offset()),
        )
        .filter(account::Column::Id.eq(request.account_id));

    if delta < 0 {
        update = update.filter(account::Column::CreditsBalance.gte(-delta));
    }

    let result = update.exec(txn).await?;
    if result.rows_affected == 0 {
        return Err(match Account::find_by_id(request.account_id).one(txn).await? {
            None => LedgerError::AccountNotFound(request.account_id),
            Some(account) => LedgerError::InsufficientCredits {
                balance: account.credits_balance,
                requested: -delta,
            },
        });
    }

    let balance_after = current_balance(txn, request.account_id).await?;
    insert_entry(txn, request, delta, balance_after).await?;

    Ok(balance_after)
}

async fn insert_entry<C: ConnectionTrait>(
    txn: &C,
    request: &EntryRequest,
    delta: i64,
    balance_after: i64,
) -> Result<(), LedgerError> {
    let entry = ledger_entry::ActiveModel {
        id: NotSet,
        account_id: Set(request.account_id),
        delta: Set(delta),
        kind: Set(request.kind.as_str().to_string()),
        description: Set(request.description.clone()),
        external_ref: Set(request.external_ref.clone()),
        amount_cents: Set(request.amount_cents),
        balance_after: Set(balance_after),
        created_at: Set(Utc::now().fixed_offset()),
    };

    entry.insert(txn).await.map_err(|error| {
        if is_unique_violation(&error) {
            LedgerError::DuplicateEntry {
                kind: request.kind,
                external_ref: request.external_ref.clone().unwrap_or_default(),
            }
        } else {
            tracing::error!(
                account_id = request.account_id,
                kind = %request.kind,
                "Failed to insert ledger entry: {}",
                error
            );
            LedgerError::Database(error)
        }
    })?;

    Ok(())
}

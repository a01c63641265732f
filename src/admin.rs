//! # Admin Override
//!
//! Privileged repairs for jobs that automatic reconciliation cannot settle:
//! forced refunds, forced status changes, manual job records and manual credit
//! grants. Every operation leaves a ledger entry and a `warn!` audit line.

use sea_orm::{DatabaseConnection, DbErr, TransactionTrait};
use thiserror::Error;
use tracing::warn;

use crate::ledger::{EntryRequest, Ledger, LedgerError, has_entry_in};
use crate::models::job::{JobStatus, Model as Job};
use crate::models::ledger_entry::{LedgerEntryKind, job_ref};
use crate::repositories::account::AccountRepository;
use crate::repositories::job::{JobStore, JobStoreError, NewJob};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("job {0} not found")]
    JobNotFound(i32),

    #[error("account {0} not found")]
    AccountNotFound(i32),

    #[error("job {0} has already been refunded")]
    AlreadyRefunded(i32),

    #[error("job {0} was not charged any credits")]
    NothingToRefund(i32),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

/// Result of a forced refund
#[derive(Debug, Clone)]
pub struct ForcedRefund {
    pub job: Job,
    pub refunded: i64,
    pub balance: i64,
}

#[derive(Clone)]
pub struct AdminOverride {
    db: DatabaseConnection,
    accounts: AccountRepository,
    jobs: JobStore,
    ledger: Ledger,
}

impl AdminOverride {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            accounts: AccountRepository::new(db.clone()),
            jobs: JobStore::new(db.clone()),
            ledger: Ledger::new(db.clone()),
            db,
        }
    }

    async fn load_job(&self, job_id: i32) -> Result<Job, AdminError> {
        self.jobs
            .find(job_id)
            .await?
            .ok_or(AdminError::JobNotFound(job_id))
    }

    /// Return the job's charge to its account and mark the job failed.
    ///
    /// Reports [`AdminError::AlreadyRefunded`] without touching the ledger when a
    /// refund entry for the job exists.
    pub async fn force_refund(&self, job_id: i32) -> Result<ForcedRefund, AdminError> {
        let job = self.load_job(job_id).await?;
        let reference = job_ref(job.id);

        if has_entry_in(&self.db, LedgerEntryKind::Refund, &reference).await? {
            return Err(AdminError::AlreadyRefunded(job.id));
        }
        if job.credits_charged <= 0 {
            return Err(AdminError::NothingToRefund(job.id));
        }

        let txn = self.db.begin().await?;
        let balance = match self
            .ledger
            .credit_in(
                &txn,
                EntryRequest::new(
                    job.account_id,
                    job.credits_charged,
                    LedgerEntryKind::Refund,
                    format!("Admin refund for job #{}", job.id),
                )
                .with_external_ref(reference),
            )
            .await
        {
            Ok(balance) => balance,
            Err(LedgerError::DuplicateEntry { .. }) => {
                return Err(AdminError::AlreadyRefunded(job.id));
            }
            Err(e) => return Err(e.into()),
        };

        let error_message = job
            .error_message
            .clone()
            .or_else(|| Some("Refunded by administrator".to_string()));
        let updated = self
            .jobs
            .force_status_in(&txn, job.id, JobStatus::Failed, error_message)
            .await?;
        txn.commit().await?;

        warn!(
            job_id = job.id,
            account_id = job.account_id,
            previous_status = %job.status,
            refunded = job.credits_charged,
            "AUDIT: admin forced refund"
        );

        Ok(ForcedRefund {
            job: updated,
            refunded: job.credits_charged,
            balance,
        })
    }

    /// Set a job's status unconditionally, bypassing the compare-and-swap guard
    pub async fn force_status(
        &self,
        job_id: i32,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<Job, AdminError> {
        let job = self.load_job(job_id).await?;

        let txn = self.db.begin().await?;
        let updated = self
            .jobs
            .force_status_in(&txn, job.id, status, error_message)
            .await?;
        self.ledger
            .record_audit_in(
                &txn,
                job.account_id,
                &format!(
                    "Admin changed job #{} status from {} to {}",
                    job.id, job.status, status
                ),
                Some(job_ref(job.id)),
            )
            .await?;
        txn.commit().await?;

        warn!(
            job_id = job.id,
            account_id = job.account_id,
            from = %job.status,
            to = %status,
            "AUDIT: admin forced job status"
        );

        Ok(updated)
    }

    /// Grant credits to an account. Returns the new balance.
    pub async fn manual_credit_adjustment(
        &self,
        account_id: i32,
        amount: i64,
        description: &str,
    ) -> Result<i64, AdminError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(AdminError::Validation(
                "description must not be empty".to_string(),
            ));
        }

        let balance = self
            .ledger
            .credit(EntryRequest::new(
                account_id,
                amount,
                LedgerEntryKind::AdminAdjustment,
                description,
            ))
            .await
            .map_err(|e| match e {
                LedgerError::AccountNotFound(id) => AdminError::AccountNotFound(id),
                other => AdminError::Ledger(other),
            })?;

        warn!(account_id, amount, balance, "AUDIT: admin credit adjustment");
        Ok(balance)
    }

    /// Record a job submitted outside the launcher so its webhooks can be reconciled.
    ///
    /// A non-zero `credits_charged` is debited in the same transaction, keeping
    /// later refunds backed by a matching consumption entry.
    pub async fn create_manual_job(&self, new_job: NewJob) -> Result<Job, AdminError> {
        if new_job.credits_charged < 0 {
            return Err(AdminError::Validation(
                "credits_charged must not be negative".to_string(),
            ));
        }
        if self.accounts.find(new_job.account_id).await?.is_none() {
            return Err(AdminError::AccountNotFound(new_job.account_id));
        }

        let charge = new_job.credits_charged;
        let txn = self.db.begin().await?;
        let job = self.jobs.create_in(&txn, new_job).await?;
        if charge > 0 {
            self.ledger
                .debit_in(
                    &txn,
                    EntryRequest::new(
                        job.account_id,
                        charge,
                        LedgerEntryKind::Consumption,
                        format!("Manual {} job #{}", job.kind, job.id),
                    )
                    .with_external_ref(job_ref(job.id)),
                )
                .await?;
        }
        self.ledger
            .record_audit_in(
                &txn,
                job.account_id,
                &format!("Admin created {} job #{}", job.kind, job.id),
                Some(job_ref(job.id)),
            )
            .await?;
        txn.commit().await?;

        warn!(
            job_id = job.id,
            account_id = job.account_id,
            provider_request_id = ?job.provider_request_id,
            status = %job.status,
            "AUDIT: admin created job"
        );

        Ok(job)
    }
}

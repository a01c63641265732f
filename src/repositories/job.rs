//! # Job Store
//!
//! Persistence for training and video jobs. Status changes go through
//! [`JobStore::transition`], a compare-and-swap on the `status` column: the
//! update only applies when the stored status is one of the expected source
//! statuses, so two concurrent terminal notifications for the same job resolve
//! to exactly one winner and one [`JobStoreError::Conflict`].

use chrono::Utc;
use sea_orm::prelude::*;
use sea_orm::sea_query::SimpleExpr;
use sea_orm::{
    ActiveValue::NotSet, ConnectionTrait, DatabaseConnection, QueryOrder, QuerySelect, Set,
};
use thiserror::Error;

use crate::error::is_unique_violation;
use crate::models::job::{self, ActiveModel, Entity as Job, JobKind, JobStatus, Model};

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job {0} not found")]
    NotFound(i32),

    /// The job was not in any of the expected source statuses
    #[error("job {job_id} is already {current}")]
    Conflict { job_id: i32, current: String },

    #[error("provider request id '{0}' is already attached to another job")]
    DuplicateProviderRequest(String),

    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

/// Fields for a job about to be inserted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub account_id: i32,
    pub kind: JobKind,
    pub status: JobStatus,
    pub provider_request_id: Option<String>,
    pub credits_charged: i64,
    pub display_name: Option<String>,
    pub trigger_token: Option<String>,
    pub image_count: Option<i32>,
    pub model_job_id: Option<i32>,
    pub source_image_url: Option<String>,
    pub motion_prompt: Option<String>,
}

impl NewJob {
    pub fn training(
        account_id: i32,
        display_name: impl Into<String>,
        trigger_token: impl Into<String>,
        image_count: i32,
        credits_charged: i64,
    ) -> Self {
        Self {
            display_name: Some(display_name.into()),
            trigger_token: Some(trigger_token.into()),
            image_count: Some(image_count),
            ..Self::empty(account_id, JobKind::Training, credits_charged)
        }
    }

    pub fn video(
        account_id: i32,
        source_image_url: impl Into<String>,
        motion_prompt: impl Into<String>,
        model_job_id: Option<i32>,
        credits_charged: i64,
    ) -> Self {
        Self {
            source_image_url: Some(source_image_url.into()),
            motion_prompt: Some(motion_prompt.into()),
            model_job_id,
            ..Self::empty(account_id, JobKind::Video, credits_charged)
        }
    }

    fn empty(account_id: i32, kind: JobKind, credits_charged: i64) -> Self {
        Self {
            account_id,
            kind,
            status: JobStatus::Pending,
            provider_request_id: None,
            credits_charged,
            display_name: None,
            trigger_token: None,
            image_count: None,
            model_job_id: None,
            source_image_url: None,
            motion_prompt: None,
        }
    }

    pub fn with_provider_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.provider_request_id = Some(request_id.into());
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }
}

/// Optional column updates applied together with a status change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionFields {
    pub provider_request_id: Option<String>,
    pub model_url: Option<String>,
    pub video_url: Option<String>,
    pub error_message: Option<String>,
}

impl TransitionFields {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Result reference stored in the column matching the job kind
    pub fn result(kind: JobKind, url: impl Into<String>) -> Self {
        let url = url.into();
        match kind {
            JobKind::Training => Self {
                model_url: Some(url),
                ..Self::default()
            },
            JobKind::Video => Self {
                video_url: Some(url),
                ..Self::default()
            },
        }
    }

    fn column_updates(self) -> Vec<(job::Column, SimpleExpr)> {
        let mut updates = Vec::new();
        if let Some(request_id) = self.provider_request_id {
            updates.push((job::Column::ProviderRequestId, Expr::value(request_id)));
        }
        if let Some(url) = self.model_url {
            updates.push((job::Column::ModelUrl, Expr::value(url)));
        }
        if let Some(url) = self.video_url {
            updates.push((job::Column::VideoUrl, Expr::value(url)));
        }
        if let Some(message) = self.error_message {
            updates.push((job::Column::ErrorMessage, Expr::value(message)));
        }
        updates
    }
}

/// Repository for job database operations
#[derive(Clone)]
pub struct JobStore {
    db: DatabaseConnection,
}

impl JobStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Insert a job; status defaults to `pending`
    pub async fn create(&self, new_job: NewJob) -> Result<Model, JobStoreError> {
        self.create_in(&self.db, new_job).await
    }

    pub async fn create_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        new_job: NewJob,
    ) -> Result<Model, JobStoreError> {
        let now = Utc::now().fixed_offset();
        let request_id = new_job.provider_request_id.clone();

        let active = ActiveModel {
            id: NotSet,
            account_id: Set(new_job.account_id),
            kind: Set(new_job.kind.as_str().to_string()),
            provider_request_id: Set(new_job.provider_request_id),
            status: Set(new_job.status.as_str().to_string()),
            credits_charged: Set(new_job.credits_charged),
            display_name: Set(new_job.display_name),
            trigger_token: Set(new_job.trigger_token),
            image_count: Set(new_job.image_count),
            model_url: Set(None),
            model_job_id: Set(new_job.model_job_id),
            source_image_url: Set(new_job.source_image_url),
            motion_prompt: Set(new_job.motion_prompt),
            video_url: Set(None),
            error_message: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            completed_at: Set(new_job.status.is_terminal().then_some(now)),
        };

        let job = active.insert(conn).await.map_err(|error| {
            if is_unique_violation(&error) {
                JobStoreError::DuplicateProviderRequest(request_id.unwrap_or_default())
            } else {
                tracing::error!("Failed to create job: {}", error);
                JobStoreError::Database(error)
            }
        })?;

        tracing::info!(
            job_id = job.id,
            account_id = job.account_id,
            kind = %job.kind,
            status = %job.status,
            "Job created"
        );

        Ok(job)
    }

    pub async fn find(&self, job_id: i32) -> Result<Option<Model>, JobStoreError> {
        Ok(Job::find_by_id(job_id).one(&self.db).await?)
    }

    /// Find a job only if it belongs to the given account
    pub async fn find_for_account(
        &self,
        account_id: i32,
        job_id: i32,
    ) -> Result<Option<Model>, JobStoreError> {
        let job = Job::find_by_id(job_id)
            .filter(job::Column::AccountId.eq(account_id))
            .one(&self.db)
            .await?;

        Ok(job)
    }

    pub async fn find_by_provider_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<Model>, JobStoreError> {
        let job = Job::find()
            .filter(job::Column::ProviderRequestId.eq(request_id))
            .one(&self.db)
            .await?;

        Ok(job)
    }

    /// Jobs of an account, newest first
    pub async fn list_for_account(
        &self,
        account_id: i32,
        kind: Option<JobKind>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Model>, JobStoreError> {
        let mut query = Job::find()
            .filter(job::Column::AccountId.eq(account_id))
            .order_by_desc(job::Column::CreatedAt)
            .order_by_desc(job::Column::Id);

        if let Some(kind) = kind {
            query = query.filter(job::Column::Kind.eq(kind.as_str()));
        }

        Ok(query.offset(offset).limit(limit).all(&self.db).await?)
    }

    /// Compare-and-swap status change.
    ///
    /// Applies `to` and `fields` only if the current status is in `from`.
    /// Moving into a terminal status stamps `completed_at`.
    pub async fn transition(
        &self,
        job_id: i32,
        from: &[JobStatus],
        to: JobStatus,
        fields: TransitionFields,
    ) -> Result<Model, JobStoreError> {
        self.transition_in(&self.db, job_id, from, to, fields).await
    }

    pub async fn transition_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        job_id: i32,
        from: &[JobStatus],
        to: JobStatus,
        fields: TransitionFields,
    ) -> Result<Model, JobStoreError> {
        let now = Utc::now().fixed_offset();
        let request_id = fields.provider_request_id.clone();

        let mut update = Job::update_many()
            .col_expr(job::Column::Status, Expr::value(to.as_str()))
            .col_expr(job::Column::UpdatedAt, Expr::value(now));
        if to.is_terminal() {
            update = update.col_expr(job::Column::CompletedAt, Expr::value(now));
        }
        for (column, value) in fields.column_updates() {
            update = update.col_expr(column, value);
        }

        let result = update
            .filter(job::Column::Id.eq(job_id))
            .filter(job::Column::Status.is_in(from.iter().map(JobStatus::as_str)))
            .exec(conn)
            .await
            .map_err(|error| {
                if is_unique_violation(&error) {
                    JobStoreError::DuplicateProviderRequest(request_id.unwrap_or_default())
                } else {
                    JobStoreError::Database(error)
                }
            })?;

        let job = Job::find_by_id(job_id)
            .one(conn)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))?;

        if result.rows_affected == 0 {
            tracing::debug!(
                job_id,
                current = %job.status,
                target = %to,
                "Job transition lost compare-and-swap"
            );
            return Err(JobStoreError::Conflict {
                job_id,
                current: job.status,
            });
        }

        tracing::info!(job_id, status = %to, "Job transitioned");
        Ok(job)
    }

    /// Record the provider request id of a submitted job and move it to `processing`
    pub async fn attach_provider_request(
        &self,
        job_id: i32,
        request_id: &str,
    ) -> Result<Model, JobStoreError> {
        self.transition(
            job_id,
            &[JobStatus::Pending],
            JobStatus::Processing,
            TransitionFields {
                provider_request_id: Some(request_id.to_string()),
                ..TransitionFields::default()
            },
        )
        .await
    }

    /// Unconditional status change, bypassing the compare-and-swap guard.
    ///
    /// Leaving a terminal status clears `completed_at`.
    pub async fn force_status_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        job_id: i32,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<Model, JobStoreError> {
        let now = Utc::now().fixed_offset();

        let mut update = Job::update_many()
            .col_expr(job::Column::Status, Expr::value(status.as_str()))
            .col_expr(job::Column::UpdatedAt, Expr::value(now))
            .col_expr(
                job::Column::CompletedAt,
                Expr::value(status.is_terminal().then_some(now)),
            );
        if let Some(message) = error_message {
            update = update.col_expr(job::Column::ErrorMessage, Expr::value(message));
        }

        let result = update
            .filter(job::Column::Id.eq(job_id))
            .exec(conn)
            .await?;
        if result.rows_affected == 0 {
            return Err(JobStoreError::NotFound(job_id));
        }

        Job::find_by_id(job_id)
            .one(conn)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))
    }
}

//! # Jobs API Handlers
//!
//! Launch training and video jobs for the calling account and read them back.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::auth::{AccountHeader, AccountId};
use crate::error::ApiError;
use crate::launcher::{TrainingLaunch, VideoLaunch};
use crate::models::JobKind;
use crate::models::job::Model as Job;
use crate::server::AppState;

/// A training or video job
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub id: i32,
    #[schema(example = "video")]
    pub kind: String,
    #[schema(example = "processing")]
    pub status: String,
    pub provider_request_id: Option<String>,
    #[schema(example = 5)]
    pub credits_charged: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_job_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion_prompt: Option<String>,
    /// Trained model or rendered video, once completed
    pub result_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        let result_url = job.result_url().map(str::to_string);
        Self {
            id: job.id,
            kind: job.kind,
            status: job.status,
            provider_request_id: job.provider_request_id,
            credits_charged: job.credits_charged,
            display_name: job.display_name,
            trigger_token: job.trigger_token,
            image_count: job.image_count,
            model_job_id: job.model_job_id,
            source_image_url: job.source_image_url,
            motion_prompt: job.motion_prompt,
            result_url,
            error_message: job.error_message,
            created_at: job.created_at.to_rfc3339(),
            updated_at: job.updated_at.to_rfc3339(),
            completed_at: job.completed_at.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobListResponse {
    pub data: Vec<JobResponse>,
    pub limit: u64,
    pub offset: u64,
}

/// Request payload for a training job
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LaunchTrainingRequest {
    #[schema(example = "Biscuit")]
    pub display_name: String,
    /// Token that invokes the trained subject in prompts
    #[schema(example = "biscuit_dog")]
    pub trigger_token: String,
    pub image_urls: Vec<String>,
}

/// Request payload for a video job
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LaunchVideoRequest {
    pub source_image_url: String,
    #[schema(example = "the dog wags its tail and looks at the camera")]
    pub motion_prompt: String,
    /// Completed training job of the same account
    pub model_job_id: Option<i32>,
}

/// Filters for the job list
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct JobListQuery {
    /// `training` or `video`
    pub kind: Option<JobKind>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Launch a training job
#[utoipa::path(
    post,
    path = "/jobs/training",
    security(("bearer_auth" = [])),
    params(AccountHeader),
    request_body = LaunchTrainingRequest,
    responses(
        (status = 201, description = "Job charged and submitted", body = JobResponse),
        (status = 400, description = "Validation failed or insufficient credits", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Account not found", body = ApiError),
        (status = 502, description = "Provider rejected the submission; job left pending", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn launch_training(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
    Json(request): Json<LaunchTrainingRequest>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let job = state
        .launcher
        .launch_training(
            account_id,
            TrainingLaunch {
                display_name: request.display_name,
                trigger_token: request.trigger_token,
                image_urls: request.image_urls,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(job.into())))
}

/// Launch a video job
#[utoipa::path(
    post,
    path = "/jobs/video",
    security(("bearer_auth" = [])),
    params(AccountHeader),
    request_body = LaunchVideoRequest,
    responses(
        (status = 201, description = "Job charged and submitted", body = JobResponse),
        (status = 400, description = "Validation failed or insufficient credits", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Account or model job not found", body = ApiError),
        (status = 502, description = "Provider rejected the submission; job left pending", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn launch_video(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
    Json(request): Json<LaunchVideoRequest>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let job = state
        .launcher
        .launch_video(
            account_id,
            VideoLaunch {
                source_image_url: request.source_image_url,
                motion_prompt: request.motion_prompt,
                model_job_id: request.model_job_id,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(job.into())))
}

/// List the calling account's jobs, newest first
#[utoipa::path(
    get,
    path = "/jobs",
    security(("bearer_auth" = [])),
    params(AccountHeader, JobListQuery),
    responses(
        (status = 200, description = "Jobs", body = JobListResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
    Query(query): Query<JobListQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    let (limit, offset) = crate::handlers::types::PageQuery {
        limit: query.limit,
        offset: query.offset,
    }
    .bounds();

    let jobs = state
        .jobs
        .list_for_account(account_id, query.kind, limit, offset)
        .await?;

    Ok(Json(JobListResponse {
        data: jobs.into_iter().map(JobResponse::from).collect(),
        limit,
        offset,
    }))
}

/// Get one of the calling account's jobs
#[utoipa::path(
    get,
    path = "/jobs/{job_id}",
    security(("bearer_auth" = [])),
    params(
        AccountHeader,
        ("job_id" = i32, Path, description = "Job id")
    ),
    responses(
        (status = 200, description = "Job", body = JobResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "No such job for this account", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
    Path(job_id): Path<i32>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state
        .jobs
        .find_for_account(account_id, job_id)
        .await?
        .ok_or_else(|| {
            ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "Job not found")
                .with_details(serde_json::json!({ "job_id": job_id }))
        })?;

    Ok(Json(job.into()))
}

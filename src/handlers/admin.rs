//! # Admin API Handlers
//!
//! Operator endpoints over [`crate::admin::AdminOverride`]. Every route requires
//! an admin bearer token.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::AdminAuth;
use crate::error::{ApiError, validation_error};
use crate::handlers::jobs::JobResponse;
use crate::models::{JobKind, JobStatus};
use crate::repositories::NewJob;
use crate::server::AppState;

const STATUS_WHITELIST: &str = "pending, processing, completed, failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Refund,
    UpdateStatus,
}

/// Request payload for a job action
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobActionRequest {
    pub action: JobAction,
    /// Target status for `update_status`
    #[schema(example = "failed")]
    pub status: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobActionResponse {
    pub job: JobResponse,
    /// Credits returned by a refund
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refunded: Option<i64>,
    /// Account balance after a refund
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<i64>,
}

/// Request payload for recording a job submitted outside the service
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManualJobRequest {
    pub account_id: i32,
    pub kind: JobKind,
    pub provider_request_id: String,
    /// Defaults to `processing`
    pub status: Option<JobStatus>,
    /// Defaults to 0; a positive charge is debited from the account
    pub credits_charged: Option<i64>,
    pub display_name: Option<String>,
    pub trigger_token: Option<String>,
    pub image_count: Option<i32>,
    pub model_job_id: Option<i32>,
    pub source_image_url: Option<String>,
    pub motion_prompt: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateAccountRequest {
    #[schema(example = "owner@example.com")]
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    pub id: i32,
    pub email: String,
    pub balance: i64,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreditAdjustmentRequest {
    /// Credits to grant; must be positive
    #[schema(example = 25)]
    pub amount: i64,
    #[schema(example = "Goodwill credit for delayed render")]
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreditAdjustmentResponse {
    pub account_id: i32,
    pub balance: i64,
}

fn parse_status(raw: Option<&str>) -> Result<JobStatus, ApiError> {
    let raw = raw.ok_or_else(|| {
        validation_error(
            "status is required for update_status",
            serde_json::json!({ "status": format!("must be one of {STATUS_WHITELIST}") }),
        )
    })?;

    raw.trim().parse::<JobStatus>().map_err(|_| {
        validation_error(
            "Invalid job status",
            serde_json::json!({ "status": format!("must be one of {STATUS_WHITELIST}") }),
        )
    })
}

/// Refund a job or force its status
#[utoipa::path(
    post,
    path = "/admin/jobs/{job_id}/actions",
    security(("bearer_auth" = [])),
    params(("job_id" = i32, Path, description = "Job id")),
    request_body = JobActionRequest,
    responses(
        (status = 200, description = "Action applied", body = JobActionResponse),
        (status = 400, description = "Invalid action, status or nothing to refund", body = ApiError),
        (status = 401, description = "Missing or invalid admin token", body = ApiError),
        (status = 404, description = "Job not found", body = ApiError),
        (status = 409, description = "Job already refunded", body = ApiError)
    ),
    tag = "admin"
)]
pub async fn job_action(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(job_id): Path<i32>,
    Json(request): Json<JobActionRequest>,
) -> Result<Json<JobActionResponse>, ApiError> {
    let response = match request.action {
        JobAction::Refund => {
            let refund = state.admin.force_refund(job_id).await?;
            JobActionResponse {
                job: refund.job.into(),
                refunded: Some(refund.refunded),
                balance: Some(refund.balance),
            }
        }
        JobAction::UpdateStatus => {
            let status = parse_status(request.status.as_deref())?;
            let job = state
                .admin
                .force_status(job_id, status, request.error_message)
                .await?;
            JobActionResponse {
                job: job.into(),
                refunded: None,
                balance: None,
            }
        }
    };

    Ok(Json(response))
}

/// Record a job submitted outside the service
#[utoipa::path(
    post,
    path = "/admin/jobs",
    security(("bearer_auth" = [])),
    request_body = ManualJobRequest,
    responses(
        (status = 201, description = "Job recorded", body = JobResponse),
        (status = 400, description = "Validation failed or insufficient credits", body = ApiError),
        (status = 401, description = "Missing or invalid admin token", body = ApiError),
        (status = 404, description = "Account not found", body = ApiError),
        (status = 409, description = "Provider request id already attached", body = ApiError)
    ),
    tag = "admin"
)]
pub async fn create_manual_job(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Json(request): Json<ManualJobRequest>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let provider_request_id = request.provider_request_id.trim();
    if provider_request_id.is_empty() {
        return Err(validation_error(
            "providerRequestId is required",
            serde_json::json!({ "providerRequestId": "must not be empty" }),
        ));
    }

    let new_job = NewJob {
        account_id: request.account_id,
        kind: request.kind,
        status: request.status.unwrap_or(JobStatus::Processing),
        provider_request_id: Some(provider_request_id.to_string()),
        credits_charged: request.credits_charged.unwrap_or(0),
        display_name: request.display_name,
        trigger_token: request.trigger_token,
        image_count: request.image_count,
        model_job_id: request.model_job_id,
        source_image_url: request.source_image_url,
        motion_prompt: request.motion_prompt,
    };

    let job = state.admin.create_manual_job(new_job).await?;
    Ok((StatusCode::CREATED, Json(job.into())))
}

/// Create an account with a zero balance
#[utoipa::path(
    post,
    path = "/admin/accounts",
    security(("bearer_auth" = [])),
    request_body = CreateAccountRequest,
    responses(
        (status = 201, description = "Account created", body = AccountResponse),
        (status = 400, description = "Invalid email", body = ApiError),
        (status = 401, description = "Missing or invalid admin token", body = ApiError),
        (status = 409, description = "Email already registered", body = ApiError)
    ),
    tag = "admin"
)]
pub async fn create_account(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Json(request): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<AccountResponse>), ApiError> {
    let email = request.email.trim();
    if email.is_empty() || !email.contains('@') || email.len() > 255 {
        return Err(validation_error(
            "Invalid email",
            serde_json::json!({ "email": "must be a valid address of at most 255 characters" }),
        ));
    }

    let account = state.accounts.create(email).await?;
    Ok((
        StatusCode::CREATED,
        Json(AccountResponse {
            id: account.id,
            email: account.email,
            balance: account.credits_balance,
            created_at: account.created_at.to_rfc3339(),
        }),
    ))
}

/// Grant credits to an account
#[utoipa::path(
    post,
    path = "/admin/accounts/{account_id}/credits",
    security(("bearer_auth" = [])),
    params(("account_id" = i32, Path, description = "Account id")),
    request_body = CreditAdjustmentRequest,
    responses(
        (status = 200, description = "Credits granted", body = CreditAdjustmentResponse),
        (status = 400, description = "Non-positive amount or empty description", body = ApiError),
        (status = 401, description = "Missing or invalid admin token", body = ApiError),
        (status = 404, description = "Account not found", body = ApiError)
    ),
    tag = "admin"
)]
pub async fn adjust_credits(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(account_id): Path<i32>,
    Json(request): Json<CreditAdjustmentRequest>,
) -> Result<Json<CreditAdjustmentResponse>, ApiError> {
    let balance = state
        .admin
        .manual_credit_adjustment(account_id, request.amount, &request.description)
        .await?;

    Ok(Json(CreditAdjustmentResponse {
        account_id,
        balance,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_whitelist_is_enforced() {
        assert_eq!(parse_status(Some("failed")).ok(), Some(JobStatus::Failed));
        assert_eq!(
            parse_status(Some(" processing ")).ok(),
            Some(JobStatus::Processing)
        );
        assert!(parse_status(Some("refunded")).is_err());
        assert!(parse_status(Some("FAILED; DROP TABLE jobs")).is_err());
        assert!(parse_status(None).is_err());
    }

    #[test]
    fn action_names_are_snake_case() {
        let request: JobActionRequest =
            serde_json::from_str(r#"{"action":"update_status","status":"failed","errorMessage":"stuck"}"#)
                .unwrap();
        assert_eq!(request.action, JobAction::UpdateStatus);
        assert_eq!(request.error_message.as_deref(), Some("stuck"));

        assert!(serde_json::from_str::<JobActionRequest>(r#"{"action":"delete"}"#).is_err());
    }
}

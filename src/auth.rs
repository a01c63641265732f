//! # Authentication and Authorization
//!
//! Bearer authentication for the two caller classes of the API:
//!
//! - the web tier, which presents a service token and forwards the verified
//!   account id in `X-Account-Id`
//! - operators, who present an admin token on `/admin` routes
//!
//! Webhook routes are not covered here; they verify provider signatures in
//! [`crate::webhook_verification`].

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts, Request, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use utoipa::IntoParams;

use crate::config::AppConfig;
use crate::error::{ApiError, unauthorized, validation_error};
use crate::server::AppState;

/// Header carrying the account the web tier authenticated
pub const ACCOUNT_ID_HEADER: &str = "X-Account-Id";

/// Account on whose behalf a user route runs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountId(pub i32);

/// Marker type for authenticated admin requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminAuth;

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(app_state: &AppState) -> Self {
        Arc::clone(&app_state.config)
    }
}

/// Validates the service token and resolves the caller's account
pub async fn account_auth_middleware(
    State(config): State<Arc<AppConfig>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(request.headers())?;
    if !token_matches(&config.service_tokens, token) {
        return Err(unauthorized(Some("Invalid bearer token")));
    }

    let account_id = extract_account_id(request.headers())?;
    tracing::debug!(account_id = account_id.0, "Authenticated account request");

    request.extensions_mut().insert(account_id);
    Ok(next.run(request).await)
}

/// Validates an admin token
pub async fn admin_auth_middleware(
    State(config): State<Arc<AppConfig>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(request.headers())?;
    if !token_matches(&config.admin_tokens, token) {
        tracing::warn!(path = %request.uri().path(), "Rejected admin request");
        return Err(unauthorized(Some("Invalid bearer token")));
    }

    request.extensions_mut().insert(AdminAuth);
    Ok(next.run(request).await)
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| unauthorized(Some("Missing Authorization header")))?
        .to_str()
        .map_err(|_| unauthorized(Some("Invalid Authorization header")))?;

    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| unauthorized(Some("Authorization header must use Bearer scheme")))
}

fn token_matches(configured: &[String], token: &str) -> bool {
    configured
        .iter()
        .any(|candidate| ConstantTimeEq::ct_eq(token.as_bytes(), candidate.as_bytes()).into())
}

fn extract_account_id(headers: &HeaderMap) -> Result<AccountId, ApiError> {
    let header_value = headers
        .get(ACCOUNT_ID_HEADER)
        .ok_or_else(|| {
            validation_error(
                "Missing required header",
                serde_json::json!({ "X-Account-Id": "Required header is missing" }),
            )
        })?
        .to_str()
        .map_err(|_| {
            validation_error(
                "Invalid account header",
                serde_json::json!({ "X-Account-Id": "Header must be valid UTF-8" }),
            )
        })?;

    match header_value.trim().parse::<i32>() {
        Ok(id) if id > 0 => Ok(AccountId(id)),
        _ => Err(validation_error(
            "Invalid account ID",
            serde_json::json!({ "X-Account-Id": "Must be a positive integer" }),
        )),
    }
}

/// OpenAPI header parameter for X-Account-Id
#[derive(Debug, Serialize, Deserialize, IntoParams, utoipa::ToSchema)]
#[into_params(parameter_in = Header)]
pub struct AccountHeader {
    /// Account identifier verified by the web tier's session layer
    #[serde(rename = "X-Account-Id")]
    #[param(rename = "X-Account-Id", value_type = i32)]
    pub account_id: i32,
}

impl<S> FromRequestParts<S> for AccountId
where
    S: Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AccountId>()
            .copied()
            .ok_or_else(|| unauthorized(Some("Account authentication required")))
    }
}

impl<S> FromRequestParts<S> for AdminAuth
where
    S: Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AdminAuth>()
            .copied()
            .ok_or_else(|| unauthorized(Some("Admin authentication required")))
    }
}

//! # Credits API Handlers
//!
//! Balance and ledger history for the calling account.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::{AccountHeader, AccountId};
use crate::error::ApiError;
use crate::handlers::types::PageQuery;
use crate::models::ledger_entry;
use crate::rate_limit::balance_key;
use crate::server::AppState;

/// Current balance of the calling account
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    #[schema(example = 40)]
    pub balance: i64,
}

/// One ledger entry
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntryResponse {
    pub id: i32,
    /// Signed credit change
    #[schema(example = -10)]
    pub delta: i64,
    #[schema(example = "consumption")]
    pub kind: String,
    pub description: String,
    pub external_ref: Option<String>,
    /// Amount paid in cents, purchases only
    pub amount_cents: Option<i64>,
    pub balance_after: i64,
    pub created_at: String,
}

impl From<ledger_entry::Model> for LedgerEntryResponse {
    fn from(entry: ledger_entry::Model) -> Self {
        Self {
            id: entry.id,
            delta: entry.delta,
            kind: entry.kind,
            description: entry.description,
            external_ref: entry.external_ref,
            amount_cents: entry.amount_cents,
            balance_after: entry.balance_after,
            created_at: entry.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TransactionsResponse {
    pub data: Vec<LedgerEntryResponse>,
    pub limit: u64,
    pub offset: u64,
}

/// Get the calling account's credit balance
#[utoipa::path(
    get,
    path = "/credits/balance",
    security(("bearer_auth" = [])),
    params(AccountHeader),
    responses(
        (status = 200, description = "Current balance", body = BalanceResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Account not found", body = ApiError),
        (status = 429, description = "Too many balance reads", body = ApiError, headers(
            ("Retry-After", description = "Seconds until the window resets")
        ))
    ),
    tag = "credits"
)]
pub async fn get_balance(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
) -> Result<Json<BalanceResponse>, ApiError> {
    let limits = &state.config.balance_rate_limit;
    let decision = state
        .rate_limiter
        .check(&balance_key(account_id), limits.max_requests, limits.window_ms)
        .await;

    if !decision.allowed {
        tracing::info!(account_id, "Balance read rate limited");
        return Err(ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "Too many balance requests",
        )
        .with_retry_after(decision.retry_after_seconds)
        .with_details(serde_json::json!({
            "limit": decision.limit,
            "retryAfterSeconds": decision.retry_after_seconds,
        })));
    }

    let balance = state.ledger.balance_of(account_id).await?;
    Ok(Json(BalanceResponse { balance }))
}

/// List the calling account's ledger entries, newest first
#[utoipa::path(
    get,
    path = "/credits/transactions",
    security(("bearer_auth" = [])),
    params(AccountHeader, PageQuery),
    responses(
        (status = 200, description = "Ledger entries", body = TransactionsResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "credits"
)]
pub async fn list_transactions(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
    Query(page): Query<PageQuery>,
) -> Result<Json<TransactionsResponse>, ApiError> {
    let (limit, offset) = page.bounds();
    let entries = state.ledger.entries(account_id, limit, offset).await?;

    Ok(Json(TransactionsResponse {
        data: entries.into_iter().map(LedgerEntryResponse::from).collect(),
        limit,
        offset,
    }))
}

//! # Webhook Handlers
//!
//! Callbacks from the payment and generation providers. Both routes are public;
//! each delivery is authenticated by [`crate::webhook_verification::verify`]
//! before anything touches the ledger or the job store.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::error::{ApiError, ErrorType};
use crate::payments::PaymentOutcome;
use crate::reconciler::ReconcileOutcome;
use crate::server::AppState;
use crate::webhook_verification::{PaymentEvent, VerifiedEvent, WebhookProvider, verify};

/// Acknowledgement returned to the payment provider
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PaymentWebhookAck {
    #[schema(example = true)]
    pub received: bool,
}

/// Acknowledgement returned to the generation provider
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct GenerationWebhookAck {
    #[schema(example = true)]
    pub success: bool,
}

fn record_event(provider: WebhookProvider, outcome: &'static str) {
    counter!(
        "webhook_events_total",
        "provider" => provider.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Payment provider events (`checkout.session.completed` credits the account)
#[utoipa::path(
    post,
    path = "/webhooks/payments",
    request_body(content = String, description = "Raw event JSON signed by the payment provider", content_type = "application/json"),
    params(
        ("Stripe-Signature" = String, Header, description = "t=<unix seconds>,v1=<hex HMAC-SHA256>")
    ),
    responses(
        (status = 200, description = "Event accepted (including duplicates and ignored types)", body = PaymentWebhookAck),
        (status = 400, description = "Malformed event or invalid checkout metadata", body = ApiError),
        (status = 401, description = "Signature verification failed", body = ApiError),
        (status = 404, description = "Account not found", body = ApiError),
        (status = 500, description = "Webhook secret not configured", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<PaymentWebhookAck>, ApiError> {
    let provider = WebhookProvider::Payment;
    let event = match verify(provider, &body, &headers, &state.config) {
        Ok(VerifiedEvent::Payment(event)) => event,
        Ok(VerifiedEvent::Generation(_)) => return Err(ErrorType::InternalServerError.into()),
        Err(e) => {
            record_event(provider, "rejected");
            return Err(e.into());
        }
    };

    match event {
        PaymentEvent::Ignored {
            event_id,
            event_type,
        } => {
            debug!(%event_id, %event_type, "Ignoring payment event");
            record_event(provider, "ignored");
        }
        PaymentEvent::CheckoutCompleted(checkout) => {
            match state.payments.apply_checkout(&checkout).await? {
                PaymentOutcome::Credited { balance } => {
                    info!(
                        event_id = %checkout.event_id,
                        session_id = %checkout.session_id,
                        account_id = checkout.account_id,
                        credits = checkout.credit_amount,
                        balance,
                        "Checkout credited"
                    );
                    record_event(provider, "credited");
                }
                PaymentOutcome::AlreadyApplied => record_event(provider, "duplicate"),
            }
        }
    }

    Ok(Json(PaymentWebhookAck { received: true }))
}

/// Generation provider job status notifications
#[utoipa::path(
    post,
    path = "/webhooks/generation",
    request_body(content = String, description = "`{requestId, status: COMPLETED|FAILED, payload, error?}`", content_type = "application/json"),
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Notification applied or ignored as a duplicate", body = GenerationWebhookAck),
        (status = 400, description = "Malformed notification", body = ApiError),
        (status = 401, description = "Bearer secret mismatch", body = ApiError),
        (status = 404, description = "No job with this request id", body = ApiError),
        (status = 500, description = "Webhook secret not configured", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn generation_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<GenerationWebhookAck>, ApiError> {
    let provider = WebhookProvider::Generation;
    let event = match verify(provider, &body, &headers, &state.config) {
        Ok(VerifiedEvent::Generation(event)) => event,
        Ok(VerifiedEvent::Payment(_)) => return Err(ErrorType::InternalServerError.into()),
        Err(e) => {
            record_event(provider, "rejected");
            return Err(e.into());
        }
    };

    let outcome = state.reconciler.reconcile(&event).await?;
    let label = match &outcome {
        ReconcileOutcome::Completed { .. } => "completed",
        ReconcileOutcome::Failed { .. } => "failed",
        ReconcileOutcome::RefundPending { .. } => "refund_pending",
        ReconcileOutcome::AlreadyTerminal { .. } => "duplicate",
        ReconcileOutcome::UnknownJob { .. } => "unknown_job",
    };
    record_event(provider, label);

    if let ReconcileOutcome::UnknownJob { request_id } = outcome {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "No job matches this request id",
        )
        .with_details(serde_json::json!({ "request_id": request_id })));
    }

    Ok(Json(GenerationWebhookAck { success: true }))
}

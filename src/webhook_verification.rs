//! # Webhook Verification
//!
//! Authenticates inbound webhooks from the payment provider and the generation
//! provider, then parses the raw body into typed events. Nothing downstream ever
//! sees a body that has not passed through [`verify`].
//!
//! - Payment provider: `Stripe-Signature: t=<unix>,v1=<hex>` where the signature
//!   is HMAC-SHA256 over `"<t>.<raw body>"`, with a timestamp tolerance window.
//! - Generation provider: `Authorization: Bearer <shared secret>`.
//!
//! Both strategies fail closed: a missing secret rejects every delivery with
//! [`VerificationError::NotConfigured`].

use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::{HeaderMap, StatusCode};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::AppConfig;

type HmacSha256 = Hmac<Sha256>;

pub const PAYMENT_SIGNATURE_HEADER: &str = "stripe-signature";

/// Event type carrying a completed checkout
pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";

/// Errors that can occur during webhook verification or payload parsing
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("Missing required signature header: {header}")]
    MissingSignature { header: String },

    #[error("Invalid signature format: {header}")]
    InvalidSignatureFormat { header: String },

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Invalid timestamp: {header}")]
    InvalidTimestamp { header: String },

    #[error("Timestamp too old: {seconds}s old, max allowed: {max_seconds}s")]
    TimestampTooOld { seconds: u64, max_seconds: u64 },

    #[error("Timestamp too far in future: {seconds}s in future, max allowed: {max_seconds}s")]
    TimestampTooFuture { seconds: u64, max_seconds: u64 },

    #[error("Webhook verification not configured for provider: {provider}")]
    NotConfigured { provider: String },

    #[error("Invalid webhook payload: {reason}")]
    InvalidPayload { reason: String },
}

impl VerificationError {
    /// Returns the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            VerificationError::NotConfigured { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            VerificationError::InvalidPayload { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    fn invalid_payload(reason: impl Into<String>) -> Self {
        VerificationError::InvalidPayload {
            reason: reason.into(),
        }
    }
}

/// Result type for webhook verification
pub type VerificationResult<T> = Result<T, VerificationError>;

/// Webhook sources accepted by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookProvider {
    Payment,
    Generation,
}

impl WebhookProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookProvider::Payment => "payment",
            WebhookProvider::Generation => "generation",
        }
    }
}

/// An authenticated and parsed webhook delivery
#[derive(Debug, Clone, PartialEq)]
pub enum VerifiedEvent {
    Payment(PaymentEvent),
    Generation(GenerationEvent),
}

/// Payment provider events the service understands
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentEvent {
    CheckoutCompleted(CheckoutCompleted),
    /// Authenticated event of a type that carries no ledger effect
    Ignored { event_id: String, event_type: String },
}

/// Validated `checkout.session.completed` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutCompleted {
    pub event_id: String,
    pub session_id: String,
    pub account_id: i32,
    pub credit_amount: i64,
    pub package_id: String,
    /// Amount paid in cents, when the provider reports it
    pub amount_total: Option<i64>,
}

/// Terminal outcome reported by the generation provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    Success,
    Failure,
}

/// Validated generation provider status notification
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationEvent {
    pub request_id: String,
    pub outcome: GenerationOutcome,
    pub payload: Value,
    pub error: Option<String>,
}

/// Authenticate a delivery and parse it into a typed event
pub fn verify(
    provider: WebhookProvider,
    body: &[u8],
    headers: &HeaderMap,
    config: &AppConfig,
) -> VerificationResult<VerifiedEvent> {
    match provider {
        WebhookProvider::Payment => {
            let secret = config.payment_webhook_secret.as_deref().ok_or_else(|| {
                VerificationError::NotConfigured {
                    provider: provider.as_str().to_string(),
                }
            })?;

            let signature_header = headers
                .get(PAYMENT_SIGNATURE_HEADER)
                .and_then(|h| h.to_str().ok())
                .unwrap_or("");

            verify_payment_signature(
                body,
                signature_header,
                secret,
                config.payment_webhook_tolerance_seconds,
                unix_now()?,
            )?;

            parse_payment_event(body).map(VerifiedEvent::Payment)
        }
        WebhookProvider::Generation => {
            let secret = config.generation_webhook_secret.as_deref().ok_or_else(|| {
                VerificationError::NotConfigured {
                    provider: provider.as_str().to_string(),
                }
            })?;

            verify_bearer_token(headers, secret)?;

            parse_generation_event(body).map(VerifiedEvent::Generation)
        }
    }
}

fn unix_now() -> VerificationResult<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| VerificationError::InvalidTimestamp {
            header: "Failed to get current time".to_string(),
        })
}

/// Verifies a `Stripe-Signature` header against the raw body.
///
/// Accepts the delivery if any `v1` signature in the header matches.
pub fn verify_payment_signature(
    body: &[u8],
    signature_header: &str,
    secret: &str,
    tolerance_seconds: u64,
    now: u64,
) -> VerificationResult<()> {
    debug!(
        body_size = body.len(),
        tolerance_seconds, "Starting payment signature verification"
    );

    if signature_header.is_empty() {
        return Err(VerificationError::MissingSignature {
            header: "Stripe-Signature".to_string(),
        });
    }

    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => signatures.push(value),
            Some(_) => {}
            None => {
                return Err(VerificationError::InvalidSignatureFormat {
                    header: "Stripe-Signature must be a list of key=value pairs".to_string(),
                });
            }
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| VerificationError::InvalidSignatureFormat {
            header: "Stripe-Signature is missing t=".to_string(),
        })?
        .parse::<u64>()
        .map_err(|_| VerificationError::InvalidTimestamp {
            header: "Stripe-Signature t= must be a valid Unix timestamp".to_string(),
        })?;

    if signatures.is_empty() {
        return Err(VerificationError::InvalidSignatureFormat {
            header: "Stripe-Signature is missing v1=".to_string(),
        });
    }

    let time_diff = now.abs_diff(timestamp);
    if time_diff > tolerance_seconds {
        return Err(if now > timestamp {
            VerificationError::TimestampTooOld {
                seconds: time_diff,
                max_seconds: tolerance_seconds,
            }
        } else {
            VerificationError::TimestampTooFuture {
                seconds: time_diff,
                max_seconds: tolerance_seconds,
            }
        });
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerificationError::VerificationFailed)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    let expected: &[u8] = expected.as_ref();

    let matched = signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|provided| bool::from(expected.ct_eq(&provided[..])))
            .unwrap_or(false)
    });

    if matched {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

/// Verifies `Authorization: Bearer <secret>` in constant time
pub fn verify_bearer_token(headers: &HeaderMap, secret: &str) -> VerificationResult<()> {
    let provided_auth = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    let Some(token) = provided_auth.strip_prefix("Bearer ") else {
        return Err(VerificationError::MissingSignature {
            header: "Authorization (Bearer)".to_string(),
        });
    };

    if token.trim().as_bytes().ct_eq(secret.as_bytes()).into() {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

#[derive(Debug, Deserialize)]
struct PaymentEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: PaymentEnvelopeData,
}

#[derive(Debug, Deserialize)]
struct PaymentEnvelopeData {
    object: Value,
}

/// Parse a payment provider envelope; only completed checkouts are validated further
pub fn parse_payment_event(body: &[u8]) -> VerificationResult<PaymentEvent> {
    let envelope: PaymentEnvelope = serde_json::from_slice(body)
        .map_err(|e| VerificationError::invalid_payload(format!("malformed event: {e}")))?;

    if envelope.event_type != CHECKOUT_COMPLETED {
        return Ok(PaymentEvent::Ignored {
            event_id: envelope.id,
            event_type: envelope.event_type,
        });
    }

    let session = &envelope.data.object;
    let session_id = session
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| VerificationError::invalid_payload("checkout session id is missing"))?;

    let metadata = session
        .get("metadata")
        .and_then(Value::as_object)
        .ok_or_else(|| VerificationError::invalid_payload("checkout metadata is missing"))?;

    let account_id = positive_metadata_int(metadata, "accountId")?;
    let account_id = i32::try_from(account_id)
        .map_err(|_| VerificationError::invalid_payload("accountId is out of range"))?;
    let credit_amount = positive_metadata_int(metadata, "creditAmount")?;
    let package_id = metadata
        .get("packageId")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| VerificationError::invalid_payload("packageId is missing"))?;

    Ok(PaymentEvent::CheckoutCompleted(CheckoutCompleted {
        event_id: envelope.id,
        session_id: session_id.to_string(),
        account_id,
        credit_amount,
        package_id: package_id.to_string(),
        amount_total: session.get("amount_total").and_then(Value::as_i64),
    }))
}

/// Metadata values arrive as strings from the checkout API but may be numbers
fn positive_metadata_int(
    metadata: &serde_json::Map<String, Value>,
    key: &str,
) -> VerificationResult<i64> {
    let value = match metadata.get(key) {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };

    match value {
        Some(v) if v > 0 => Ok(v),
        _ => Err(VerificationError::invalid_payload(format!(
            "{key} must be a positive integer"
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct RawGenerationEvent {
    #[serde(rename = "requestId", alias = "request_id")]
    request_id: String,
    status: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    error: Option<Value>,
}

/// Parse a generation provider status notification
pub fn parse_generation_event(body: &[u8]) -> VerificationResult<GenerationEvent> {
    let raw: RawGenerationEvent = serde_json::from_slice(body)
        .map_err(|e| VerificationError::invalid_payload(format!("malformed event: {e}")))?;

    let request_id = raw.request_id.trim();
    if request_id.is_empty() {
        return Err(VerificationError::invalid_payload("requestId is empty"));
    }

    let outcome = match raw.status.to_ascii_uppercase().as_str() {
        "COMPLETED" | "OK" => GenerationOutcome::Success,
        "FAILED" | "ERROR" => GenerationOutcome::Failure,
        other => {
            warn!(status = %other, "Unrecognised generation status");
            return Err(VerificationError::invalid_payload(format!(
                "unsupported status '{other}'"
            )));
        }
    };

    let error = match raw.error {
        None | Some(Value::Null) => None,
        Some(Value::String(message)) => Some(message),
        Some(other) => Some(other.to_string()),
    };

    Ok(GenerationEvent {
        request_id: request_id.to_string(),
        outcome,
        payload: raw.payload,
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: u64 = 1_750_000_000;

    fn sign(body: &[u8], secret: &str, timestamp: u64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(body);
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    fn checkout_body(metadata: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": {"object": {"id": "cs_test_1", "amount_total": 2499, "metadata": metadata}}
        }))
        .unwrap()
    }

    #[test]
    fn test_payment_signature_success() {
        let body = b"{\"id\":\"evt_1\"}";
        let header = sign(body, "whsec_test", NOW);
        assert!(verify_payment_signature(body, &header, "whsec_test", 300, NOW).is_ok());
    }

    #[test]
    fn test_payment_signature_accepts_any_matching_v1() {
        let body = b"{}";
        let header = format!("{},v1=deadbeef", sign(body, "whsec_test", NOW));
        assert!(verify_payment_signature(body, &header, "whsec_test", 300, NOW).is_ok());
    }

    #[test]
    fn test_payment_signature_modified_body() {
        let header = sign(b"original", "whsec_test", NOW);
        assert!(matches!(
            verify_payment_signature(b"tampered", &header, "whsec_test", 300, NOW),
            Err(VerificationError::VerificationFailed)
        ));
    }

    #[test]
    fn test_payment_signature_stale_timestamp() {
        let body = b"{}";
        let header = sign(body, "whsec_test", NOW - 400);
        assert!(matches!(
            verify_payment_signature(body, &header, "whsec_test", 300, NOW),
            Err(VerificationError::TimestampTooOld { .. })
        ));
    }

    #[test]
    fn test_payment_signature_malformed_headers() {
        let body = b"{}";
        for header in ["", "v1=abc", "t=123", "garbage", "t=abc,v1=00"] {
            let result = verify_payment_signature(body, header, "whsec_test", 300, NOW);
            let err = result.unwrap_err();
            assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED, "{header}");
        }
    }

    #[test]
    fn test_verify_fails_closed_without_secret() {
        let config = AppConfig::default();
        let err = verify(WebhookProvider::Payment, b"{}", &HeaderMap::new(), &config).unwrap_err();
        assert!(matches!(err, VerificationError::NotConfigured { .. }));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer anything".parse().unwrap());
        let err = verify(WebhookProvider::Generation, b"{}", &headers, &config).unwrap_err();
        assert!(matches!(err, VerificationError::NotConfigured { .. }));
    }

    #[test]
    fn test_bearer_token_verification() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer gen-secret".parse().unwrap());
        assert!(verify_bearer_token(&headers, "gen-secret").is_ok());

        headers.insert("authorization", "Bearer wrong".parse().unwrap());
        assert!(matches!(
            verify_bearer_token(&headers, "gen-secret"),
            Err(VerificationError::VerificationFailed)
        ));

        headers.insert("authorization", "Key gen-secret".parse().unwrap());
        assert!(matches!(
            verify_bearer_token(&headers, "gen-secret"),
            Err(VerificationError::MissingSignature { .. })
        ));
    }

    #[test]
    fn test_parse_checkout_with_string_metadata() {
        let body = checkout_body(json!({
            "accountId": "7", "creditAmount": "45", "packageId": "popular"
        }));

        let event = parse_payment_event(&body).unwrap();
        assert_eq!(
            event,
            PaymentEvent::CheckoutCompleted(CheckoutCompleted {
                event_id: "evt_1".to_string(),
                session_id: "cs_test_1".to_string(),
                account_id: 7,
                credit_amount: 45,
                package_id: "popular".to_string(),
                amount_total: Some(2499),
            })
        );
    }

    #[test]
    fn test_parse_checkout_with_numeric_metadata() {
        let body = checkout_body(json!({
            "accountId": 7, "creditAmount": 45, "packageId": "popular"
        }));
        assert!(matches!(
            parse_payment_event(&body),
            Ok(PaymentEvent::CheckoutCompleted(CheckoutCompleted { account_id: 7, .. }))
        ));
    }

    #[test]
    fn test_parse_checkout_rejects_invalid_metadata() {
        for metadata in [
            json!({"creditAmount": "45", "packageId": "popular"}),
            json!({"accountId": "0", "creditAmount": "45", "packageId": "popular"}),
            json!({"accountId": "7", "creditAmount": "-5", "packageId": "popular"}),
            json!({"accountId": "abc", "creditAmount": "45", "packageId": "popular"}),
            json!({"accountId": "7", "creditAmount": "45"}),
        ] {
            let err = parse_payment_event(&checkout_body(metadata.clone())).unwrap_err();
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST, "{metadata}");
        }
    }

    #[test]
    fn test_parse_other_payment_events_are_ignored() {
        let body = serde_json::to_vec(&json!({
            "id": "evt_2", "type": "invoice.paid", "data": {"object": {}}
        }))
        .unwrap();
        assert!(matches!(
            parse_payment_event(&body),
            Ok(PaymentEvent::Ignored { .. })
        ));
    }

    #[test]
    fn test_parse_generation_event_statuses() {
        let event = parse_generation_event(
            br#"{"requestId":"req-1","status":"COMPLETED","payload":{"video":{"url":"https://cdn/v.mp4"}}}"#,
        )
        .unwrap();
        assert_eq!(event.request_id, "req-1");
        assert_eq!(event.outcome, GenerationOutcome::Success);

        let event =
            parse_generation_event(br#"{"request_id":"req-2","status":"ERROR","error":"boom"}"#)
                .unwrap();
        assert_eq!(event.outcome, GenerationOutcome::Failure);
        assert_eq!(event.error.as_deref(), Some("boom"));
        assert_eq!(event.payload, Value::Null);

        assert!(parse_generation_event(br#"{"requestId":"req-3","status":"IN_QUEUE"}"#).is_err());
        assert!(parse_generation_event(br#"{"status":"FAILED"}"#).is_err());
    }
}

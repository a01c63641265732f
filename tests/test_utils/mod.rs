//! Test utilities for database and HTTP testing.
//!
//! SQLite databases with all migrations applied, seeded accounts, a scripted
//! generation provider and helpers for signing payment webhooks.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, Response},
};
use hmac::{Hmac, Mac};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use serde_json::Value;
use sha2::Sha256;
use studio_credits::config::AppConfig;
use studio_credits::launcher::{GenerationProvider, GenerationRequest, ProviderError};
use studio_credits::ledger::{EntryRequest, Ledger};
use studio_credits::models::LedgerEntryKind;
use studio_credits::repositories::AccountRepository;
use studio_credits::server::{AppState, create_app};
use tempfile::TempDir;
use tower::ServiceExt;

pub const SERVICE_TOKEN: &str = "web-tier-token";
pub const ADMIN_TOKEN: &str = "operator-token";
pub const PAYMENT_SECRET: &str = "whsec_test_secret";
pub const GENERATION_SECRET: &str = "gen-shared-secret";

/// Sets up an in-memory SQLite database with all migrations applied.
///
/// A single pooled connection keeps every query on the same in-memory database.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options.max_connections(1).sqlx_logging(false);
    let db = Database::connect(options).await?;

    Migrator::up(&db, None).await?;

    Ok(db)
}

/// File-backed SQLite database served by several pooled connections.
///
/// Transactions on different connections really interleave here, so tests of
/// concurrent writers use this instead of [`setup_test_db`]. Keep the returned
/// directory alive for as long as the connection is used.
pub async fn setup_pooled_test_db(connections: u32) -> Result<(TempDir, DatabaseConnection)> {
    let dir = tempfile::tempdir()?;
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("studio.db").display());

    let mut options = ConnectOptions::new(url);
    options
        .max_connections(connections)
        .min_connections(connections)
        .sqlx_logging(false)
        .map_sqlx_sqlite_opts(|sqlite| sqlite.busy_timeout(Duration::from_secs(10)));
    let db = Database::connect(options).await?;

    Migrator::up(&db, None).await?;

    Ok((dir, db))
}

/// Creates an account holding `credits`, granted through the ledger.
pub async fn create_account(db: &DatabaseConnection, email: &str, credits: i64) -> Result<i32> {
    let account = AccountRepository::new(db.clone()).create(email).await?;
    if credits > 0 {
        Ledger::new(db.clone())
            .credit(EntryRequest::new(
                account.id,
                credits,
                LedgerEntryKind::AdminAdjustment,
                "Test grant",
            ))
            .await?;
    }
    Ok(account.id)
}

/// Configuration with every secret and token set
pub fn test_config() -> AppConfig {
    AppConfig {
        profile: "test".to_string(),
        service_tokens: vec![SERVICE_TOKEN.to_string()],
        admin_tokens: vec![ADMIN_TOKEN.to_string()],
        payment_webhook_secret: Some(PAYMENT_SECRET.to_string()),
        generation_webhook_secret: Some(GENERATION_SECRET.to_string()),
        public_base_url: "https://studio.test".to_string(),
        ..Default::default()
    }
}

/// Generation provider that hands out sequential request ids, or always fails
pub struct ScriptedProvider {
    fail: bool,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    async fn submit(&self, _request: &GenerationRequest) -> Result<String, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail {
            return Err(ProviderError::Api {
                status: 503,
                body: "queue unavailable".to_string(),
            });
        }
        Ok(format!("req-{call}"))
    }
}

/// Router over `db` with the given configuration and provider
pub fn test_app(
    db: &DatabaseConnection,
    config: AppConfig,
    provider: Arc<dyn GenerationProvider>,
) -> Router {
    create_app(AppState::new(config, db.clone(), provider))
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// `Stripe-Signature` header value for `body`
pub fn sign_payment(body: &str, secret: &str, timestamp: u64) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{timestamp}.{body}").as_bytes());
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

/// A `checkout.session.completed` event body
pub fn checkout_event(session_id: &str, account_id: i32, package_id: &str, credits: i64) -> String {
    serde_json::json!({
        "id": format!("evt_{session_id}"),
        "type": "checkout.session.completed",
        "data": {
            "object": {
                "id": session_id,
                "amount_total": 2499,
                "metadata": {
                    "accountId": account_id.to_string(),
                    "creditAmount": credits.to_string(),
                    "packageId": package_id
                }
            }
        }
    })
    .to_string()
}

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).unwrap()
}

/// Request on a user route as `account_id`
pub fn account_request(method: &str, uri: &str, account_id: i32, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {SERVICE_TOKEN}"))
        .header("X-Account-Id", account_id.to_string());
    with_json(builder, body)
}

/// Request on an admin route
pub fn admin_request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {ADMIN_TOKEN}"));
    with_json(builder, body)
}

/// Signed generation provider notification
pub fn generation_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhooks/generation")
        .header("Authorization", format!("Bearer {GENERATION_SECRET}"))
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn with_json(builder: axum::http::request::Builder, body: Option<Value>) -> Request<Body> {
    match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

//! # Server Configuration
//!
//! Application state, router assembly and the serve loop for the Studio Credits API.

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tower_http::{
    catch_panic::CatchPanicLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::admin::AdminOverride;
use crate::auth::{account_auth_middleware, admin_auth_middleware};
use crate::config::AppConfig;
use crate::error::panic_response;
use crate::handlers;
use crate::launcher::{GenerationProvider, HttpGenerationProvider, JobLauncher};
use crate::ledger::Ledger;
use crate::payments::PaymentProcessor;
use crate::rate_limit::{RateLimiter, SqlCounterStore};
use crate::reconciler::JobReconciler;
use crate::repositories::{AccountRepository, JobStore};
use crate::telemetry::trace_id_middleware;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub accounts: AccountRepository,
    pub ledger: Ledger,
    pub jobs: JobStore,
    pub payments: PaymentProcessor,
    pub reconciler: JobReconciler,
    pub admin: AdminOverride,
    pub launcher: JobLauncher,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    /// Wire every service to one database pool and the given generation provider.
    ///
    /// Rate-limit counters are kept in the database so replicas share them.
    pub fn new(
        config: AppConfig,
        db: DatabaseConnection,
        provider: Arc<dyn GenerationProvider>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(
            Arc::new(SqlCounterStore::new(db.clone())),
            config.balance_rate_limit.failure_mode,
        );
        Self::with_rate_limiter(config, db, provider, rate_limiter)
    }

    pub fn with_rate_limiter(
        config: AppConfig,
        db: DatabaseConnection,
        provider: Arc<dyn GenerationProvider>,
        rate_limiter: RateLimiter,
    ) -> Self {
        let ledger = Ledger::new(db.clone());
        let jobs = JobStore::new(db.clone());

        Self {
            accounts: AccountRepository::new(db.clone()),
            payments: PaymentProcessor::new(ledger.clone()),
            reconciler: JobReconciler::new(jobs.clone(), ledger.clone()),
            admin: AdminOverride::new(db.clone()),
            launcher: JobLauncher::new(db.clone(), provider, &config),
            rate_limiter,
            ledger,
            jobs,
            config: Arc::new(config),
            db,
        }
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let account_routes = Router::new()
        .route("/credits/balance", get(handlers::credits::get_balance))
        .route(
            "/credits/transactions",
            get(handlers::credits::list_transactions),
        )
        .route("/jobs", get(handlers::jobs::list_jobs))
        .route("/jobs/training", post(handlers::jobs::launch_training))
        .route("/jobs/video", post(handlers::jobs::launch_video))
        .route("/jobs/{job_id}", get(handlers::jobs::get_job))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            account_auth_middleware,
        ));

    let admin_routes = Router::new()
        .route("/admin/accounts", post(handlers::admin::create_account))
        .route(
            "/admin/accounts/{account_id}/credits",
            post(handlers::admin::adjust_credits),
        )
        .route("/admin/jobs", post(handlers::admin::create_manual_job))
        .route(
            "/admin/jobs/{job_id}/actions",
            post(handlers::admin::job_action),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            admin_auth_middleware,
        ));

    let app = Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route(
            "/webhooks/payments",
            post(handlers::webhooks::payment_webhook),
        )
        .route(
            "/webhooks/generation",
            post(handlers::webhooks::generation_webhook),
        )
        .merge(account_routes)
        .merge(admin_routes)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()));

    with_request_boundary(app)
}

/// Outer layers shared by every route: trace ids, request spans and a panic
/// boundary that answers 500 instead of dropping the connection.
pub fn with_request_boundary(router: Router) -> Router {
    router
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(trace_id_middleware))
}

/// Starts the server with the given configuration
pub async fn run_server(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<()> {
    let addr = config
        .bind_addr()
        .map_err(|e| anyhow::anyhow!("Invalid server address: {e}"))?;

    let provider = Arc::new(HttpGenerationProvider::new(config.generation.clone())?);
    let profile = config.profile.clone();
    let app = create_app(AppState::new(config, db, provider));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, %profile, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
            );
        }
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::webhooks::payment_webhook,
        crate::handlers::webhooks::generation_webhook,
        crate::handlers::credits::get_balance,
        crate::handlers::credits::list_transactions,
        crate::handlers::jobs::launch_training,
        crate::handlers::jobs::launch_video,
        crate::handlers::jobs::list_jobs,
        crate::handlers::jobs::get_job,
        crate::handlers::admin::job_action,
        crate::handlers::admin::create_manual_job,
        crate::handlers::admin::create_account,
        crate::handlers::admin::adjust_credits,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::error::ApiError,
            crate::handlers::HealthResponse,
            crate::handlers::webhooks::PaymentWebhookAck,
            crate::handlers::webhooks::GenerationWebhookAck,
            crate::handlers::credits::BalanceResponse,
            crate::handlers::credits::LedgerEntryResponse,
            crate::handlers::credits::TransactionsResponse,
            crate::handlers::jobs::JobResponse,
            crate::handlers::jobs::JobListResponse,
            crate::handlers::jobs::LaunchTrainingRequest,
            crate::handlers::jobs::LaunchVideoRequest,
            crate::handlers::admin::JobActionRequest,
            crate::handlers::admin::JobAction,
            crate::handlers::admin::JobActionResponse,
            crate::handlers::admin::ManualJobRequest,
            crate::handlers::admin::CreateAccountRequest,
            crate::handlers::admin::AccountResponse,
            crate::handlers::admin::CreditAdjustmentRequest,
            crate::handlers::admin::CreditAdjustmentResponse,
            crate::models::JobKind,
            crate::models::JobStatus,
            crate::models::LedgerEntryKind,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "root", description = "Service information and health"),
        (name = "webhooks", description = "Payment and generation provider callbacks"),
        (name = "credits", description = "Credit balance and ledger history"),
        (name = "jobs", description = "Training and video generation jobs"),
        (name = "admin", description = "Operator overrides"),
    ),
    info(
        title = "Studio Credits API",
        description = "Credit ledger, job reconciliation and provider webhooks for the pet photo studio",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;

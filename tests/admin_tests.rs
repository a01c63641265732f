//! Operator overrides, directly and through the admin routes.

#[path = "test_utils/mod.rs"]
mod test_utils;

use axum::http::StatusCode;
use serde_json::json;
use studio_credits::admin::{AdminError, AdminOverride};
use studio_credits::launcher::{JobLauncher, TrainingLaunch};
use studio_credits::ledger::Ledger;
use studio_credits::models::{JobKind, JobStatus, LedgerEntryKind};
use studio_credits::reconciler::{JobReconciler, ReconcileOutcome};
use studio_credits::repositories::{JobStore, NewJob};
use studio_credits::webhook_verification::{GenerationEvent, GenerationOutcome};
use test_utils::{
    SERVICE_TOKEN, ScriptedProvider, admin_request, create_account,
    generation_request, json_body, send, setup_test_db, test_app, test_config,
};

fn training() -> TrainingLaunch {
    TrainingLaunch {
        display_name: "Biscuit".to_string(),
        trigger_token: "biscuit_dog".to_string(),
        image_urls: vec!["https://cdn.test/1.jpg".to_string()],
    }
}

#[tokio::test]
async fn forced_refund_is_exactly_once() {
    let db = setup_test_db().await.unwrap();
    let account_id = create_account(&db, "owner@example.com", 10).await.unwrap();
    let launcher = JobLauncher::new(db.clone(), ScriptedProvider::accepting(), &test_config());
    let admin = AdminOverride::new(db.clone());
    let ledger = Ledger::new(db.clone());

    let job = launcher.launch_training(account_id, training()).await.unwrap();
    assert_eq!(ledger.balance_of(account_id).await.unwrap(), 0);

    let refund = admin.force_refund(job.id).await.unwrap();
    assert_eq!(refund.refunded, 10);
    assert_eq!(refund.balance, 10);
    assert_eq!(refund.job.status, "failed");
    assert_eq!(
        refund.job.error_message.as_deref(),
        Some("Refunded by administrator")
    );

    assert!(matches!(
        admin.force_refund(job.id).await,
        Err(AdminError::AlreadyRefunded(id)) if id == job.id
    ));
    assert_eq!(ledger.balance_of(account_id).await.unwrap(), 10);
}

#[tokio::test]
async fn forced_refund_after_webhook_refund_is_rejected() {
    let db = setup_test_db().await.unwrap();
    let account_id = create_account(&db, "owner@example.com", 10).await.unwrap();
    let launcher = JobLauncher::new(db.clone(), ScriptedProvider::accepting(), &test_config());
    let reconciler = JobReconciler::new(JobStore::new(db.clone()), Ledger::new(db.clone()));
    let admin = AdminOverride::new(db.clone());

    let job = launcher.launch_training(account_id, training()).await.unwrap();
    let outcome = reconciler
        .reconcile(&GenerationEvent {
            request_id: "req-1".to_string(),
            outcome: GenerationOutcome::Failure,
            payload: serde_json::Value::Null,
            error: None,
        })
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Failed { refunded: 10, .. }));

    assert!(matches!(
        admin.force_refund(job.id).await,
        Err(AdminError::AlreadyRefunded(_))
    ));
    assert_eq!(Ledger::new(db).balance_of(account_id).await.unwrap(), 10);
}

#[tokio::test]
async fn forced_refund_needs_a_charge_and_a_job() {
    let db = setup_test_db().await.unwrap();
    let account_id = create_account(&db, "owner@example.com", 0).await.unwrap();
    let admin = AdminOverride::new(db.clone());

    let free = admin
        .create_manual_job(
            NewJob::video(account_id, "https://cdn.test/pet.jpg", "wag", None, 0)
                .with_provider_request_id("ext-free")
                .with_status(JobStatus::Processing),
        )
        .await
        .unwrap();

    assert!(matches!(
        admin.force_refund(free.id).await,
        Err(AdminError::NothingToRefund(_))
    ));
    assert!(matches!(
        admin.force_refund(9999).await,
        Err(AdminError::JobNotFound(9999))
    ));
}

#[tokio::test]
async fn forced_status_bypasses_guard_and_is_audited() {
    let db = setup_test_db().await.unwrap();
    let account_id = create_account(&db, "owner@example.com", 10).await.unwrap();
    let launcher = JobLauncher::new(db.clone(), ScriptedProvider::accepting(), &test_config());
    let admin = AdminOverride::new(db.clone());
    let ledger = Ledger::new(db.clone());

    let job = launcher.launch_training(account_id, training()).await.unwrap();
    let failed = admin
        .force_status(job.id, JobStatus::Failed, Some("stuck in queue".to_string()))
        .await
        .unwrap();
    assert_eq!(failed.status, "failed");
    assert!(failed.completed_at.is_some());

    // Terminal to active is allowed for operators
    let reopened = admin
        .force_status(job.id, JobStatus::Processing, None)
        .await
        .unwrap();
    assert_eq!(reopened.status, "processing");
    assert!(reopened.completed_at.is_none());

    let audits: Vec<_> = ledger
        .entries(account_id, 100, 0)
        .await
        .unwrap()
        .into_iter()
        .filter(|entry| {
            entry.kind == LedgerEntryKind::AdminAdjustment.as_str() && entry.delta == 0
        })
        .collect();
    assert_eq!(audits.len(), 2);
    let reference = format!("job:{}", job.id);
    assert!(
        audits
            .iter()
            .all(|entry| entry.external_ref.as_deref() == Some(reference.as_str()))
    );
    // Forcing a status never moves credits
    assert_eq!(ledger.balance_of(account_id).await.unwrap(), 0);
}

#[tokio::test]
async fn manual_credit_adjustment_validates_input() {
    let db = setup_test_db().await.unwrap();
    let account_id = create_account(&db, "owner@example.com", 0).await.unwrap();
    let admin = AdminOverride::new(db.clone());

    assert_eq!(
        admin
            .manual_credit_adjustment(account_id, 25, "Goodwill credit")
            .await
            .unwrap(),
        25
    );
    assert!(matches!(
        admin.manual_credit_adjustment(account_id, 5, "   ").await,
        Err(AdminError::Validation(_))
    ));
    assert!(matches!(
        admin.manual_credit_adjustment(account_id, 0, "Zero").await,
        Err(AdminError::Ledger(_))
    ));
    assert!(matches!(
        admin.manual_credit_adjustment(777, 5, "Nobody").await,
        Err(AdminError::AccountNotFound(777))
    ));
}

#[tokio::test]
async fn admin_routes_require_admin_token() {
    let db = setup_test_db().await.unwrap();
    let app = test_app(&db, test_config(), ScriptedProvider::accepting());
    let body = json!({"email": "new@example.com"});

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/admin/accounts")
        .header("Authorization", format!("Bearer {SERVICE_TOKEN}"))
        .header("Content-Type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(&app, admin_request("POST", "/admin/accounts", Some(body))).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let account = json_body(response).await;
    assert_eq!(account["email"], "new@example.com");
    assert_eq!(account["balance"], 0);
}

#[tokio::test]
async fn manual_job_is_reconciled_by_webhook() {
    let db = setup_test_db().await.unwrap();
    let account_id = create_account(&db, "owner@example.com", 0).await.unwrap();
    let app = test_app(&db, test_config(), ScriptedProvider::accepting());

    let response = send(
        &app,
        admin_request(
            "POST",
            &format!("/admin/accounts/{account_id}/credits"),
            Some(json!({"amount": 10, "description": "Support ticket 812"})),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["balance"], 10);

    let response = send(
        &app,
        admin_request(
            "POST",
            "/admin/jobs",
            Some(json!({
                "accountId": account_id,
                "kind": "training",
                "providerRequestId": "ext-42",
                "creditsCharged": 10,
                "displayName": "Biscuit",
                "triggerToken": "biscuit_dog"
            })),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let job = json_body(response).await;
    assert_eq!(job["status"], "processing");
    assert_eq!(
        Ledger::new(db.clone()).balance_of(account_id).await.unwrap(),
        0
    );

    let response = send(
        &app,
        generation_request(json!({
            "requestId": "ext-42",
            "status": "COMPLETED",
            "payload": {"diffusers_lora_file": {"url": "https://cdn.test/lora.safetensors"}}
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let stored = JobStore::new(db)
        .find(job["id"].as_i64().unwrap() as i32)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.job_kind(), Some(JobKind::Training));
    assert_eq!(stored.job_status(), Some(JobStatus::Completed));
    assert_eq!(
        stored.model_url.as_deref(),
        Some("https://cdn.test/lora.safetensors")
    );
}

#[tokio::test]
async fn job_actions_over_http() {
    let db = setup_test_db().await.unwrap();
    let account_id = create_account(&db, "owner@example.com", 10).await.unwrap();
    let launcher = JobLauncher::new(db.clone(), ScriptedProvider::accepting(), &test_config());
    let job = launcher.launch_training(account_id, training()).await.unwrap();
    let app = test_app(&db, test_config(), ScriptedProvider::accepting());
    let uri = format!("/admin/jobs/{}/actions", job.id);

    let response = send(
        &app,
        admin_request(
            "POST",
            &uri,
            Some(json!({"action": "update_status", "status": "cancelled"})),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(&app, admin_request("POST", &uri, Some(json!({"action": "refund"})))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["refunded"], 10);
    assert_eq!(body["balance"], 10);
    assert_eq!(body["job"]["status"], "failed");

    let response = send(&app, admin_request("POST", &uri, Some(json!({"action": "refund"})))).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(
        json_body(response).await["details"]["reason"],
        "already_refunded"
    );

    let response = send(
        &app,
        admin_request(
            "POST",
            "/admin/jobs/9999/actions",
            Some(json!({"action": "update_status", "status": "failed"})),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

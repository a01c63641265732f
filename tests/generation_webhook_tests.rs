//! End-to-end checks of `/webhooks/generation` together with the job routes.

#[path = "test_utils/mod.rs"]
mod test_utils;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::json;
use studio_credits::config::AppConfig;
use test_utils::{
    ScriptedProvider, account_request, create_account, generation_request, json_body, send,
    setup_test_db, test_app, test_config,
};

fn training_body() -> serde_json::Value {
    json!({
        "displayName": "Biscuit",
        "triggerToken": "biscuit_dog",
        "imageUrls": ["https://cdn.test/1.jpg", "https://cdn.test/2.jpg"]
    })
}

async fn balance(app: &axum::Router, account_id: i32) -> i64 {
    let response = send(
        app,
        account_request("GET", "/credits/balance", account_id, None),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    json_body(response).await["balance"].as_i64().unwrap()
}

#[tokio::test]
async fn failed_training_round_trip_refunds_once() {
    let db = setup_test_db().await.unwrap();
    let account_id = create_account(&db, "owner@example.com", 50).await.unwrap();
    let app = test_app(&db, test_config(), ScriptedProvider::accepting());

    let response = send(
        &app,
        account_request("POST", "/jobs/training", account_id, Some(training_body())),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let job = json_body(response).await;
    assert_eq!(job["status"], "processing");
    assert_eq!(job["creditsCharged"], 10);
    assert_eq!(job["providerRequestId"], "req-1");
    assert_eq!(balance(&app, account_id).await, 40);

    let failed = json!({"request_id": "req-1", "status": "FAILED", "error": "out of memory"});
    for _ in 0..2 {
        let response = send(&app, generation_request(failed.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["success"], true);
        assert_eq!(balance(&app, account_id).await, 50);
    }

    let uri = format!("/jobs/{}", job["id"]);
    let response = send(&app, account_request("GET", &uri, account_id, None)).await;
    let job = json_body(response).await;
    assert_eq!(job["status"], "failed");
    assert_eq!(job["errorMessage"], "out of memory");
}

#[tokio::test]
async fn completed_video_exposes_result_url() {
    let db = setup_test_db().await.unwrap();
    let account_id = create_account(&db, "owner@example.com", 5).await.unwrap();
    let app = test_app(&db, test_config(), ScriptedProvider::accepting());

    let response = send(
        &app,
        account_request(
            "POST",
            "/jobs/video",
            account_id,
            Some(json!({
                "sourceImageUrl": "https://cdn.test/pet.jpg",
                "motionPrompt": "the dog wags its tail"
            })),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let job = json_body(response).await;

    let response = send(
        &app,
        generation_request(json!({
            "requestId": "req-1",
            "status": "COMPLETED",
            "payload": {"video": {"url": "https://cdn.test/out.mp4"}}
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let uri = format!("/jobs/{}", job["id"]);
    let response = send(&app, account_request("GET", &uri, account_id, None)).await;
    let job = json_body(response).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["resultUrl"], "https://cdn.test/out.mp4");
    assert_eq!(balance(&app, account_id).await, 0);
}

#[tokio::test]
async fn wrong_bearer_is_unauthorized() {
    let db = setup_test_db().await.unwrap();
    let app = test_app(&db, test_config(), ScriptedProvider::accepting());

    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/generation")
        .header("Authorization", "Bearer not-the-secret")
        .body(Body::from(
            json!({"requestId": "req-1", "status": "FAILED"}).to_string(),
        ))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/generation")
        .body(Body::from(
            json!({"requestId": "req-1", "status": "FAILED"}).to_string(),
        ))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn missing_secret_is_a_server_error() {
    let db = setup_test_db().await.unwrap();
    let config = AppConfig {
        generation_webhook_secret: None,
        ..test_config()
    };
    let app = test_app(&db, config, ScriptedProvider::accepting());

    let response = send(
        &app,
        generation_request(json!({"requestId": "req-1", "status": "FAILED"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn unknown_request_id_is_not_found() {
    let db = setup_test_db().await.unwrap();
    let app = test_app(&db, test_config(), ScriptedProvider::accepting());

    let response = send(
        &app,
        generation_request(json!({"requestId": "req-404", "status": "COMPLETED"})),
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["details"]["request_id"], "req-404");
}

#[tokio::test]
async fn unsupported_status_is_bad_request() {
    let db = setup_test_db().await.unwrap();
    let app = test_app(&db, test_config(), ScriptedProvider::accepting());

    let response = send(
        &app,
        generation_request(json!({"requestId": "req-1", "status": "IN_QUEUE"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn jobs_are_scoped_to_the_calling_account() {
    let db = setup_test_db().await.unwrap();
    let owner = create_account(&db, "owner@example.com", 20).await.unwrap();
    let other = create_account(&db, "other@example.com", 0).await.unwrap();
    let app = test_app(&db, test_config(), ScriptedProvider::accepting());

    let response = send(
        &app,
        account_request("POST", "/jobs/training", owner, Some(training_body())),
    )
    .await;
    let job = json_body(response).await;
    let uri = format!("/jobs/{}", job["id"]);

    let response = send(&app, account_request("GET", &uri, other, None)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&app, account_request("GET", "/jobs?kind=training", owner, None)).await;
    let list = json_body(response).await;
    assert_eq!(list["data"].as_array().unwrap().len(), 1);

    let response = send(&app, account_request("GET", "/jobs?kind=video", owner, None)).await;
    let list = json_body(response).await;
    assert!(list["data"].as_array().unwrap().is_empty());

    let response = send(&app, account_request("GET", "/jobs", other, None)).await;
    let list = json_body(response).await;
    assert!(list["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn insufficient_credits_creates_no_job() {
    let db = setup_test_db().await.unwrap();
    let account_id = create_account(&db, "owner@example.com", 9).await.unwrap();
    let provider = ScriptedProvider::accepting();
    let app = test_app(&db, test_config(), provider.clone());

    let response = send(
        &app,
        account_request("POST", "/jobs/training", account_id, Some(training_body())),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["code"], "INSUFFICIENT_CREDITS");
    assert_eq!(body["details"]["balance"], 9);
    assert_eq!(body["details"]["required"], 10);
    assert_eq!(provider.calls(), 0);

    let response = send(&app, account_request("GET", "/jobs", account_id, None)).await;
    assert!(json_body(response).await["data"].as_array().unwrap().is_empty());
    assert_eq!(balance(&app, account_id).await, 9);
}

#[tokio::test]
async fn provider_outage_leaves_job_pending_and_charged() {
    let db = setup_test_db().await.unwrap();
    let account_id = create_account(&db, "owner@example.com", 10).await.unwrap();
    let app = test_app(&db, test_config(), ScriptedProvider::failing());

    let response = send(
        &app,
        account_request("POST", "/jobs/training", account_id, Some(training_body())),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = json_body(response).await;
    assert_eq!(body["code"], "PROVIDER_ERROR");
    assert_eq!(body["details"]["upstream_status"], 503);
    let job_id = body["details"]["job_id"].as_i64().unwrap();

    let response = send(
        &app,
        account_request("GET", &format!("/jobs/{job_id}"), account_id, None),
    )
    .await;
    let job = json_body(response).await;
    assert_eq!(job["status"], "pending");
    assert_eq!(balance(&app, account_id).await, 0);
}

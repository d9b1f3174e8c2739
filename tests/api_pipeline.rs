// tests/api_pipeline.rs
//
// HTTP-level tests for the analysis pipeline routes, driven through the full
// middleware stack with tower::ServiceExt::oneshot.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use serde_json::json;

use common::{app, app_with_services, config, get, post_json, send};
use nudge_pipeline::config::Environment;
use nudge_pipeline::services::{PatternScorer, ScoreRequest, Scoring, ServiceError, Services};

struct OfflineScorer;

#[async_trait]
impl PatternScorer for OfflineScorer {
    async fn score(&self, _req: &ScoreRequest<'_>) -> Result<Scoring, ServiceError> {
        Err(ServiceError::Status {
            service: "scoring",
            status: 503,
            body: "model offline".into(),
        })
    }

    fn name(&self) -> &'static str {
        "offline"
    }
}

fn offline_services() -> Services {
    Services {
        scorer: Arc::new(OfflineScorer),
        ..Services::local()
    }
}

#[tokio::test]
async fn analyze_detects_procrastination() {
    let app = app(config());
    let r = send(
        &app,
        post_json(
            "/analyze",
            &json!({"userId": "u1", "message": "I'll do it tomorrow, maybe"}),
        ),
    )
    .await;

    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.json["success"], true);
    let top = &r.json["data"]["patterns"][0];
    assert_eq!(top["type"], "procrastination");
    assert!(top["confidence"].as_f64().unwrap() > 0.0);
    assert!(r.json["data"]["analysis"]["sentiment"].is_string());
    assert!(r.json["data"]["processingTime"].is_u64());

    let rid = r.headers.get("x-request-id").expect("request id header");
    assert_eq!(rid.to_str().unwrap(), r.json["requestId"].as_str().unwrap());
}

#[tokio::test]
async fn patterns_detect_reports_total_and_keeps_top_three() {
    let app = app(config());
    let msg = "Maybe tomorrow. I'm overwhelmed, exhausted and burned out, \
               it has to be perfect and I can't decide, I'm not good enough";
    let r = send(
        &app,
        post_json(
            "/patterns/detect",
            &json!({"userId": "u1", "message": msg, "context": {"energyLevel": 2}}),
        ),
    )
    .await;

    assert_eq!(r.status, StatusCode::OK);
    let data = &r.json["data"];
    let shown = data["patterns"].as_array().unwrap();
    assert!(shown.len() <= 3);
    assert!(data["totalPatterns"].as_u64().unwrap() >= shown.len() as u64);
    let confs: Vec<f64> = shown
        .iter()
        .map(|p| p["confidence"].as_f64().unwrap())
        .collect();
    assert!(confs.windows(2).all(|w| w[0] >= w[1]));
    assert_eq!(data["userContext"]["energyLevel"], 2);
}

#[tokio::test]
async fn validation_errors_list_fields() {
    let app = app(config());
    let r = send(
        &app,
        post_json(
            "/analyze",
            &json!({"message": "", "context": {"energyLevel": 42}}),
        ),
    )
    .await;

    assert_eq!(r.status, StatusCode::BAD_REQUEST);
    assert_eq!(r.json["error"], "validation_failed");
    let fields: Vec<&str> = r.json["details"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["field"].as_str().unwrap())
        .collect();
    assert!(fields.contains(&"userId"));
    assert!(fields.contains(&"message"));
    assert!(fields.iter().any(|f| f.contains("energyLevel")));
}

#[tokio::test]
async fn enhance_appends_suggestion_and_issues_id() {
    let app = app(config());
    let r = send(
        &app,
        post_json(
            "/enhance",
            &json!({
                "userId": "u1",
                "message": "I'll do it tomorrow, maybe",
                "aiResponse": "Sounds good."
            }),
        ),
    )
    .await;

    assert_eq!(r.status, StatusCode::OK);
    let data = &r.json["data"];
    assert_eq!(data["enhanced"], true);
    assert!(data["enhancedResponse"]
        .as_str()
        .unwrap()
        .starts_with("Sounds good.\n\n"));
    assert_eq!(data["pattern"]["type"], "procrastination");
    let id = data["enhancementId"].as_str().unwrap();
    assert_eq!(id.len(), 32);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn feedback_for_unknown_enhancement_is_accepted() {
    let app = app(config());
    let r = send(
        &app,
        post_json(
            "/feedback",
            &json!({
                "userId": "u1",
                "enhancementId": "never-issued",
                "feedback": {"engaged": true, "helpful": false}
            }),
        ),
    )
    .await;
    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.json["success"], true);
}

#[tokio::test]
async fn feedback_engaged_must_be_boolean() {
    let app = app(config());
    let r = send(
        &app,
        post_json(
            "/feedback",
            &json!({
                "userId": "u1",
                "enhancementId": "e1",
                "feedback": {"engaged": "yes"}
            }),
        ),
    )
    .await;
    assert_eq!(r.status, StatusCode::BAD_REQUEST);
    assert_eq!(r.json["details"][0]["field"], "feedback.engaged");
}

#[tokio::test]
async fn upstream_failure_detail_only_outside_production() {
    let dev = app_with_services(config(), offline_services());
    let body = json!({"userId": "u1", "message": "later"});

    let r = send(&dev, post_json("/analyze", &body)).await;
    assert_eq!(r.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(r.json["message"], "Pattern analysis failed");
    assert!(r.json["detail"].as_str().unwrap().contains("model offline"));

    let mut cfg = config();
    cfg.environment = Environment::Production;
    let prod = app_with_services(cfg, offline_services());
    let r = send(&prod, post_json("/analyze", &body)).await;
    assert_eq!(r.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(r.json["message"], "Pattern analysis failed");
    assert!(r.json.get("detail").is_none());
    assert!(!r.json.to_string().contains("model offline"));
}

#[tokio::test]
async fn enhance_reports_its_own_stage_when_scoring_fails() {
    let app = app_with_services(config(), offline_services());
    let r = send(
        &app,
        post_json(
            "/enhance",
            &json!({"userId": "u1", "message": "later", "aiResponse": "ok"}),
        ),
    )
    .await;
    assert_eq!(r.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(r.json["message"], "Response enhancement failed");
}

#[tokio::test]
async fn pattern_catalog_and_health() {
    let app = app(config());

    let r = send(&app, get("/patterns/list")).await;
    assert_eq!(r.status, StatusCode::OK);
    let kinds: Vec<&str> = r.json["patterns"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["type"].as_str().unwrap())
        .collect();
    assert!(kinds.contains(&"procrastination"));

    let r = send(&app, get("/health")).await;
    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.json["status"], "ok");
    assert_eq!(r.json["service"], "nudge-pipeline");

    for path in ["/patterns/health", "/scoring/health"] {
        let r = send(&app, get(path)).await;
        assert_eq!(r.status, StatusCode::OK, "{path}");
        assert_eq!(r.json["status"], "ok");
        assert!(r.json["timestamp"].is_string());
    }
    let r = send(&app, get("/scoring/health")).await;
    assert_eq!(r.json["service"], "scoring");
}

#[tokio::test]
async fn unknown_route_uses_error_shape() {
    let app = app(config());
    let r = send(&app, get("/nope")).await;
    assert_eq!(r.status, StatusCode::NOT_FOUND);
    assert_eq!(r.json["success"], false);
    assert_eq!(r.json["error"], "not_found");
    assert!(r.json["requestId"].is_string());
}

// tests/api_interventions.rs
//
// Intervention ingress, polling, consumption, history and the event stream over HTTP.

mod common;

use std::time::Duration;

use axum::{
    body::{Body, BodyDataStream},
    http::{Request, StatusCode},
};
use futures_util::StreamExt as _;
use serde_json::{json, Value};
use tower::ServiceExt as _;

use common::{app, config, get, post_json, send};

fn intervention(user: &str, id: &str) -> Value {
    json!({
        "userId": user,
        "id": id,
        "message": format!("nudge {id}"),
        "priority": 2,
        "finalPriority": 2.5,
        "createdAt": "2026-10-16T09:00:00Z",
        "deliveryTimestamp": "2026-10-16T09:00:05Z",
        "patternType": "procrastination"
    })
}

#[tokio::test]
async fn newer_ingress_supersedes_pending() {
    let app = app(config());

    let r = send(&app, post_json("/interventions", &intervention("u1", "A"))).await;
    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.json["activated"], true);
    assert!(r.json["superseded"].is_null());

    let r = send(&app, post_json("/interventions", &intervention("u1", "B"))).await;
    assert_eq!(r.json["superseded"], "A");

    let r = send(&app, get("/interventions/pending?userId=u1")).await;
    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.json, json!({"id": "B"}));

    let r = send(&app, get("/interventions/pending?userId=someone-else")).await;
    assert_eq!(r.json, json!({}));
}

#[tokio::test]
async fn user_id_may_come_from_query() {
    let app = app(config());
    let mut body = intervention("ignored", "Q");
    body.as_object_mut().unwrap().remove("userId");

    let r = send(&app, post_json("/interventions", &body)).await;
    assert_eq!(r.status, StatusCode::BAD_REQUEST);
    assert_eq!(r.json["details"][0]["field"], "userId");

    let r = send(&app, post_json("/interventions?userId=u7", &body)).await;
    assert_eq!(r.status, StatusCode::OK);
    let r = send(&app, get("/interventions/pending?userId=u7")).await;
    assert_eq!(r.json["id"], "Q");
}

#[tokio::test]
async fn malformed_ingress_is_rejected() {
    let app = app(config());
    let r = send(
        &app,
        post_json("/interventions", &json!({"userId": "u1", "id": "A"})),
    )
    .await;
    assert_eq!(r.status, StatusCode::BAD_REQUEST);
    assert!(r.json["details"].as_array().unwrap().len() >= 2);

    let r = send(&app, post_json("/interventions", &json!(["not", "an", "object"]))).await;
    assert_eq!(r.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn consume_is_idempotent_and_shows_in_history() {
    let app = app(config());
    send(&app, post_json("/interventions", &intervention("u1", "A"))).await;
    send(&app, post_json("/interventions", &intervention("u1", "B"))).await;

    let r = send(&app, post_json("/interventions/A/used", &json!({"userId": "u1"}))).await;
    assert_eq!(r.json["consumed"], false, "superseded item cannot be consumed");

    let r = send(&app, post_json("/interventions/B/used", &json!({"userId": "u1"}))).await;
    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.json["consumed"], true);

    let again = Request::builder()
        .method("POST")
        .uri("/interventions/B/used?userId=u1")
        .body(Body::empty())
        .unwrap();
    let r = send(&app, again).await;
    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.json["consumed"], false);

    let r = send(&app, get("/interventions/pending?userId=u1")).await;
    assert_eq!(r.json, json!({}));

    let r = send(&app, get("/interventions/history?userId=u1")).await;
    let statuses: Vec<(&str, &str)> = r.json["interventions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| (i["id"].as_str().unwrap(), i["status"].as_str().unwrap()))
        .collect();
    assert!(statuses.contains(&("A", "superseded")));
    assert!(statuses.contains(&("B", "used")));
}

#[tokio::test]
async fn used_body_is_sanitized_whatever_its_content_type() {
    let app = app(config());
    send(&app, post_json("/interventions", &intervention("u1", "B"))).await;

    let req = Request::builder()
        .method("POST")
        .uri("/interventions/B/used")
        .header("content-type", "text/plain")
        .body(Body::from(r#"{"userId": "<u1>"}"#))
        .unwrap();
    let r = send(&app, req).await;
    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.json["consumed"], true);

    let r = send(&app, get("/interventions/history?userId=u1")).await;
    assert_eq!(r.json["interventions"][0]["status"], "used");
}

#[tokio::test]
async fn duplicate_ingress_is_reported() {
    let app = app(config());
    send(&app, post_json("/interventions", &intervention("u1", "A"))).await;
    let r = send(&app, post_json("/interventions", &intervention("u1", "A"))).await;
    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.json["activated"], false);
    assert_eq!(r.json["duplicate"], true);
}

#[tokio::test]
async fn pending_requires_user() {
    let app = app(config());
    let r = send(&app, get("/interventions/pending")).await;
    assert_eq!(r.status, StatusCode::BAD_REQUEST);
}

async fn next_frame(frames: &mut BodyDataStream) -> String {
    let chunk = tokio::time::timeout(Duration::from_secs(5), frames.next())
        .await
        .expect("frame in time")
        .expect("stream open")
        .expect("chunk");
    String::from_utf8(chunk.to_vec()).unwrap()
}

#[tokio::test]
async fn stream_replays_pending_then_follows_transitions() {
    let app = app(config());
    send(&app, post_json("/interventions", &intervention("u1", "A"))).await;

    let resp = app
        .clone()
        .oneshot(get("/interventions/stream?userId=u1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    let mut frames = resp.into_body().into_data_stream();

    let first = next_frame(&mut frames).await;
    assert!(first.contains("event: pending"), "{first}");
    assert!(first.contains("\"id\":\"A\""), "{first}");

    // other users' traffic is filtered out
    send(&app, post_json("/interventions", &intervention("u2", "X"))).await;
    send(&app, post_json("/interventions", &intervention("u1", "B"))).await;

    let frame = next_frame(&mut frames).await;
    assert!(frame.contains("event: superseded"), "{frame}");
    assert!(frame.contains("\"id\":\"A\""), "{frame}");
    let frame = next_frame(&mut frames).await;
    assert!(frame.contains("event: activated"), "{frame}");
    assert!(frame.contains("\"id\":\"B\""), "{frame}");
    assert!(!frame.contains("\"id\":\"X\""));
}

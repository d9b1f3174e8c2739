use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    middleware::{from_fn, from_fn_with_state},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::Stream;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::error::{ApiError, ApiFailure, Payload};
use crate::intervention::{ConsumeOutcome, IngestOutcome, Intervention, InterventionHub};
use crate::metrics::Metrics;
use crate::pipeline::{
    DetectRequest, EnhanceRequest, FeedbackRequest, PatternDetectionResult, Pipeline,
    MAX_USER_ID_LEN,
};
use crate::relay::{Relay, RelayResponse};
use crate::security::{
    self, sanitize, sanitize_json, validate_input, Cipher, CleanQuery, Gateway, RequestId, SESSION_HEADER,
};
use crate::services::{build_services, catalog, remote, Services};
use crate::usage::{UsageTracker, DEFAULT_USAGE_CAPACITY};

const SERVICE_NAME: &str = "nudge-pipeline";
/// Services whose health probe is routed statically next to `/{service}/health`.
const KNOWN_SERVICES: &[&str] = &[
    "analyze",
    "enhance",
    "feedback",
    "patterns",
    "interventions",
    "webhook",
];
const DEFAULT_USAGE_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub gateway: Arc<Gateway>,
    pub pipeline: Arc<Pipeline>,
    pub hub: Arc<InterventionHub>,
    pub relay: Arc<Relay>,
    pub usage: Arc<UsageTracker>,
    pub metrics: Option<Metrics>,
}

impl AppState {
    pub fn from_config(config: GatewayConfig) -> anyhow::Result<Self> {
        let services = build_services(&config.services)?;
        Self::with_services(config, services)
    }

    /// Same as [`AppState::from_config`] with the collaborators supplied by the caller.
    pub fn with_services(config: GatewayConfig, services: Services) -> anyhow::Result<Self> {
        let cipher = Arc::new(Cipher::from_config_key(config.encryption_key.as_deref())?);
        let usage = Arc::new(UsageTracker::new(DEFAULT_USAGE_CAPACITY, cipher));
        let relay = Relay::new(
            remote::http_client(config.services.timeout_secs)?,
            config.webhook_base_url.clone(),
        );
        let metrics = if config.debug_routes {
            Some(Metrics::init()?)
        } else {
            None
        };

        Ok(Self {
            gateway: Arc::new(Gateway::from_config(&config)),
            pipeline: Arc::new(Pipeline::new(services, usage.clone())),
            hub: InterventionHub::new(Duration::from_secs(config.intervention_ttl_secs)),
            relay: Arc::new(relay),
            usage,
            metrics,
            config: Arc::new(config),
        })
    }

    fn fail(&self, request_id: &RequestId, err: impl Into<ApiError>) -> ApiFailure {
        ApiFailure::new(request_id.clone(), err.into())
            .exposing_detail(!self.config.is_production())
    }
}

/// Full application: routes plus the admission stack.
pub fn router(state: AppState) -> Router {
    let gateway = state.gateway.clone();
    gateway.spawn_sweeper();

    let mut routes = Router::new()
        .route("/health", get(health))
        .route("/{service}/health", get(service_health))
        .route("/csrf-token", get(csrf_token))
        .route("/analyze", post(analyze))
        .route("/enhance", post(enhance))
        .route("/feedback", post(feedback))
        .route("/patterns/detect", post(patterns_detect))
        .route("/patterns/list", get(patterns_list))
        .route("/interventions", post(intervention_ingest))
        .route("/interventions/pending", get(intervention_pending))
        .route("/interventions/history", get(intervention_history))
        .route("/interventions/stream", get(intervention_stream))
        .route("/interventions/{id}/used", post(intervention_used))
        .route("/webhook", post(webhook));
    for service in KNOWN_SERVICES {
        routes = routes.route(&format!("/{service}/health"), get(service_health));
    }
    if state.config.debug_routes {
        routes = routes.route("/usage/recent", get(usage_recent));
        if let Some(m) = &state.metrics {
            routes = routes.merge(m.router());
        }
    }

    // outermost last: cors → request id → trace → rate admission → csrf → sanitize
    routes
        .fallback(not_found)
        .layer(from_fn_with_state(gateway.clone(), security::sanitize_body))
        .layer(from_fn_with_state(gateway.clone(), security::csrf_guard))
        .layer(from_fn_with_state(gateway.clone(), security::rate_admission))
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(security::assign_request_id))
        .layer(gateway.origins.cors_layer())
        .with_state(state)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T: Serialize> {
    success: bool,
    request_id: String,
    data: T,
}

fn ok<T: Serialize>(request_id: &RequestId, data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        request_id: request_id.as_str().to_string(),
        data,
    })
}

async fn health() -> Json<Value> {
    Json(health_body(SERVICE_NAME))
}

async fn service_health(Path(service): Path<String>) -> Json<Value> {
    Json(health_body(&sanitize(&service)))
}

fn health_body(service: &str) -> Value {
    json!({
        "status": "ok",
        "service": service,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

async fn not_found(request_id: RequestId) -> ApiFailure {
    ApiFailure::new(request_id, ApiError::NotFound)
}

async fn csrf_token(
    State(state): State<AppState>,
    request_id: RequestId,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiFailure> {
    let session = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| validate_input(s, MAX_USER_ID_LEN))
        .ok_or_else(|| {
            state.fail(
                &request_id,
                ApiError::invalid(SESSION_HEADER, "header is required"),
            )
        })?;
    let token = state.gateway.csrf.issue(session);
    Ok(Json(json!({
        "success": true,
        "requestId": request_id.as_str(),
        "csrfToken": token,
    })))
}

async fn analyze(
    State(state): State<AppState>,
    request_id: RequestId,
    Payload(req): Payload<DetectRequest>,
) -> Result<Json<Envelope<PatternDetectionResult>>, ApiFailure> {
    let detection = state
        .pipeline
        .detect(&req, "analyze")
        .await
        .map_err(|e| state.fail(&request_id, e))?;
    Ok(ok(&request_id, detection.result))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DetectData {
    #[serde(flatten)]
    result: PatternDetectionResult,
    total_patterns: usize,
}

async fn patterns_detect(
    State(state): State<AppState>,
    request_id: RequestId,
    Payload(req): Payload<DetectRequest>,
) -> Result<Json<Envelope<DetectData>>, ApiFailure> {
    let detection = state
        .pipeline
        .detect(&req, "patterns/detect")
        .await
        .map_err(|e| state.fail(&request_id, e))?;
    Ok(ok(
        &request_id,
        DetectData {
            result: detection.result,
            total_patterns: detection.total_patterns,
        },
    ))
}

async fn enhance(
    State(state): State<AppState>,
    request_id: RequestId,
    Payload(req): Payload<EnhanceRequest>,
) -> Result<Json<Value>, ApiFailure> {
    let result = state
        .pipeline
        .enhance(&req)
        .await
        .map_err(|e| state.fail(&request_id, e))?;
    Ok(Json(json!({
        "success": true,
        "requestId": request_id.as_str(),
        "data": result,
    })))
}

async fn feedback(
    State(state): State<AppState>,
    request_id: RequestId,
    Payload(req): Payload<FeedbackRequest>,
) -> Result<Json<Value>, ApiFailure> {
    state
        .pipeline
        .submit_feedback(&req)
        .await
        .map_err(|e| state.fail(&request_id, e))?;
    Ok(Json(json!({
        "success": true,
        "requestId": request_id.as_str(),
        "message": "Feedback recorded",
    })))
}

async fn patterns_list() -> Json<Value> {
    Json(json!({
        "success": true,
        "patterns": catalog::patterns(),
    }))
}

/// `userId` from the JSON body first, then the query string.
fn user_id_param(
    state: &AppState,
    request_id: &RequestId,
    body: Option<&Map<String, Value>>,
    query: &CleanQuery,
) -> Result<String, ApiFailure> {
    let from_body = body
        .and_then(|b| b.get("userId"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());
    match from_body.or_else(|| query.get("userId")) {
        Some(u) if validate_input(u, MAX_USER_ID_LEN) => Ok(u.to_string()),
        Some(_) => Err(state.fail(
            request_id,
            ApiError::invalid("userId", "must be at most 128 characters"),
        )),
        None => Err(state.fail(request_id, ApiError::invalid("userId", "is required"))),
    }
}

fn json_object(
    state: &AppState,
    request_id: &RequestId,
    body: Value,
) -> Result<Map<String, Value>, ApiFailure> {
    match body {
        Value::Object(map) => Ok(map),
        _ => Err(state.fail(request_id, ApiError::invalid("body", "must be a JSON object"))),
    }
}

async fn intervention_ingest(
    State(state): State<AppState>,
    request_id: RequestId,
    query: CleanQuery,
    Payload(body): Payload<Value>,
) -> Result<Json<Value>, ApiFailure> {
    let body = json_object(&state, &request_id, body)?;
    let user_id = user_id_param(&state, &request_id, Some(&body), &query)?;
    let intervention = Intervention::from_ingress(body)
        .map_err(|fields| state.fail(&request_id, ApiError::Validation(fields)))?;

    let out = match state.hub.ingest(&user_id, intervention) {
        IngestOutcome::Activated { superseded } => json!({
            "success": true,
            "requestId": request_id.as_str(),
            "activated": true,
            "superseded": superseded,
        }),
        IngestOutcome::Duplicate => json!({
            "success": true,
            "requestId": request_id.as_str(),
            "activated": false,
            "duplicate": true,
        }),
    };
    Ok(Json(out))
}

async fn intervention_pending(
    State(state): State<AppState>,
    request_id: RequestId,
    query: CleanQuery,
) -> Result<Json<Value>, ApiFailure> {
    let user_id = user_id_param(&state, &request_id, None, &query)?;
    Ok(Json(match state.hub.pending_id(&user_id) {
        Some(id) => json!({ "id": id }),
        None => json!({}),
    }))
}

async fn intervention_used(
    State(state): State<AppState>,
    request_id: RequestId,
    Path(id): Path<String>,
    query: CleanQuery,
    body: Bytes,
) -> Result<Json<Value>, ApiFailure> {
    // body is optional here; `userId` may come from the query string instead.
    // Read as raw bytes, so the JSON-only body layer may not have cleaned it.
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        let mut value = serde_json::from_slice(&body).map_err(|_| {
            state.fail(&request_id, ApiError::invalid("body", "must be valid JSON"))
        })?;
        sanitize_json(&mut value);
        Some(json_object(&state, &request_id, value)?)
    };
    let user_id = user_id_param(&state, &request_id, body.as_ref(), &query)?;
    let consumed = matches!(
        state.hub.consume(&user_id, &sanitize(&id)),
        ConsumeOutcome::Consumed(_)
    );
    Ok(Json(json!({
        "success": true,
        "requestId": request_id.as_str(),
        "consumed": consumed,
    })))
}

async fn intervention_history(
    State(state): State<AppState>,
    request_id: RequestId,
    query: CleanQuery,
) -> Result<Json<Value>, ApiFailure> {
    let user_id = user_id_param(&state, &request_id, None, &query)?;
    let interventions = state.hub.history(&user_id);
    Ok(Json(json!({
        "success": true,
        "userId": user_id,
        "interventions": interventions,
    })))
}

/// Server-sent events for one user: the current pending item first, then every transition.
async fn intervention_stream(
    State(state): State<AppState>,
    request_id: RequestId,
    query: CleanQuery,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static>, ApiFailure> {
    use async_stream::stream;

    let user_id = user_id_param(&state, &request_id, None, &query)?;
    let mut rx = state.hub.subscribe();
    let current = state.hub.pending(&user_id);
    info!(target: "intervention", user_id = %user_id, "stream opened");

    let stream = stream! {
        if let Some(iv) = current {
            if let Some(ev) = sse_event("pending", &iv) {
                yield Ok::<Event, Infallible>(ev);
            }
        }
        loop {
            match rx.recv().await {
                Ok(ev) if ev.user_id == user_id => {
                    if let Some(out) = sse_event(ev.kind.as_str(), &ev) {
                        yield Ok(out);
                    }
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => {
                    yield Ok(Event::default().comment(format!("{n} events dropped")));
                }
                Err(RecvError::Closed) => break,
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

fn sse_event<T: Serialize>(name: &str, payload: &T) -> Option<Event> {
    match Event::default().event(name).json_data(payload) {
        Ok(ev) => Some(ev),
        Err(e) => {
            warn!(target: "intervention", error = %e, "cannot encode stream event");
            None
        }
    }
}

async fn webhook(
    State(state): State<AppState>,
    request_id: RequestId,
    Payload(body): Payload<Value>,
) -> Result<Json<RelayResponse>, ApiFailure> {
    let body = json_object(&state, &request_id, body)?;
    let out = state
        .relay
        .forward(body)
        .await
        .map_err(|e| state.fail(&request_id, e))?;
    Ok(Json(out))
}

async fn usage_recent(State(state): State<AppState>, query: CleanQuery) -> Json<Value> {
    let limit = query
        .get("limit")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(DEFAULT_USAGE_LIMIT);
    Json(json!({
        "success": true,
        "events": state.usage.recent(limit),
    }))
}

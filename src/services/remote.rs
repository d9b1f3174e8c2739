//! HTTP JSON clients for the external scoring, enhancement and learning services.
//!
//! No retries here: callers own redelivery. The only timeout is the transport-level one
//! set on the shared client.

use std::time::Duration;

use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};

use super::{
    EnhanceRequest, Enhancement, Enhancer, FeedbackRecord, Learner, PatternScorer, ScoreRequest,
    Scoring, ServiceError,
};

const USER_AGENT: &str = concat!("nudge-pipeline/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY: usize = 512;

pub fn http_client(timeout_secs: u64) -> anyhow::Result<Client> {
    Ok(Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(timeout_secs.min(10)))
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

async fn post_json<B, R>(
    http: &Client,
    url: &str,
    service: &'static str,
    body: &B,
) -> Result<Option<R>, ServiceError>
where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let resp = http
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|source| ServiceError::Transport { service, source })?;

    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|source| ServiceError::Transport { service, source })?;
    if !status.is_success() {
        return Err(ServiceError::Status {
            service,
            status: status.as_u16(),
            body: truncate(&text, MAX_ERROR_BODY),
        });
    }
    if text.trim().is_empty() {
        return Ok(None);
    }
    unwrap_data(&text)
        .map(Some)
        .map_err(|detail| ServiceError::Decode { service, detail })
}

/// Accept either the bare object or the `{success, data: {...}}` envelope.
fn unwrap_data<R: DeserializeOwned>(text: &str) -> Result<R, String> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let inner = match value {
        serde_json::Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or_default()
        }
        other => other,
    };
    serde_json::from_value(inner).map_err(|e| e.to_string())
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

pub struct RemoteScorer {
    http: Client,
    url: String,
}

impl RemoteScorer {
    pub fn new(http: Client, url: &str) -> Self {
        Self {
            http,
            url: url.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl PatternScorer for RemoteScorer {
    async fn score(&self, req: &ScoreRequest<'_>) -> Result<Scoring, ServiceError> {
        post_json::<_, Scoring>(&self.http, &self.url, "scoring service", req)
            .await?
            .ok_or_else(|| ServiceError::Decode {
                service: "scoring service",
                detail: "empty body".into(),
            })
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

pub struct RemoteEnhancer {
    http: Client,
    url: String,
}

impl RemoteEnhancer {
    pub fn new(http: Client, url: &str) -> Self {
        Self {
            http,
            url: url.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Enhancer for RemoteEnhancer {
    async fn enhance(&self, req: &EnhanceRequest<'_>) -> Result<Enhancement, ServiceError> {
        post_json::<_, Enhancement>(&self.http, &self.url, "enhancement service", req)
            .await?
            .ok_or_else(|| ServiceError::Decode {
                service: "enhancement service",
                detail: "empty body".into(),
            })
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

pub struct RemoteLearner {
    http: Client,
    url: String,
}

impl RemoteLearner {
    pub fn new(http: Client, url: &str) -> Self {
        Self {
            http,
            url: url.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Learner for RemoteLearner {
    async fn learn(&self, record: &FeedbackRecord) -> Result<(), ServiceError> {
        // any 2xx is an ack; the body is irrelevant
        let resp = self
            .http
            .post(&self.url)
            .json(record)
            .send()
            .await
            .map_err(|source| ServiceError::Transport {
                service: "learning service",
                source,
            })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ServiceError::Status {
            service: "learning service",
            status: status.as_u16(),
            body: truncate(&body, MAX_ERROR_BODY),
        })
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::{json, Value};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn scorer_reads_enveloped_and_bare_bodies() {
        let base = serve(
            Router::new()
                .route(
                    "/bare",
                    post(|Json(v): Json<Value>| async move {
                        Json(json!({
                            "patterns": [{"type": "avoidance", "confidence": 0.5}],
                            "userContext": {"echo": v["userId"]}
                        }))
                    }),
                )
                .route(
                    "/wrapped",
                    post(|| async {
                        Json(json!({"success": true, "data": {"patterns": []}}))
                    }),
                ),
        )
        .await;

        let http = http_client(5).unwrap();
        let req = ScoreRequest {
            user_id: "u9",
            message: "hi",
            context: None,
        };
        let s = RemoteScorer::new(http.clone(), &format!("{base}/bare"))
            .score(&req)
            .await
            .unwrap();
        assert_eq!(s.patterns[0].kind, "avoidance");
        assert_eq!(s.user_context["echo"], "u9");

        let s = RemoteScorer::new(http, &format!("{base}/wrapped"))
            .score(&req)
            .await
            .unwrap();
        assert!(s.patterns.is_empty());
    }

    #[tokio::test]
    async fn non_success_status_carries_body() {
        let base = serve(Router::new().route(
            "/learn",
            post(|| async { (StatusCode::BAD_GATEWAY, "model store offline") }),
        ))
        .await;

        let learner = RemoteLearner::new(http_client(5).unwrap(), &format!("{base}/learn"));
        let err = learner
            .learn(&FeedbackRecord {
                user_id: "u1".into(),
                enhancement_id: "e1".into(),
                feedback: crate::services::Feedback {
                    engaged: true,
                    helpful: None,
                    action_taken: None,
                    business_impact: None,
                },
            })
            .await
            .unwrap_err();
        match err {
            ServiceError::Status { status, body, .. } => {
                assert_eq!(status, 502);
                assert_eq!(body, "model store offline");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé…");
        assert_eq!(truncate("ok", 5), "ok");
    }
}

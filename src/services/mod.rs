//! External collaborators behind request/response contracts.
//!
//! The pipeline only sees the three traits below. [`build_services`] picks the remote
//! HTTP client for every collaborator that has a configured URL and the built-in
//! implementation otherwise.

pub mod catalog;
pub mod local;
pub mod remote;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

use crate::config::ServiceEndpoints;

/// One detected behavioral signature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pattern {
    #[serde(rename = "type")]
    pub kind: String,
    pub confidence: f64,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Analysis {
    pub intent: String,
    pub sentiment: String,
}

impl Default for Analysis {
    fn default() -> Self {
        Self {
            intent: "unknown".to_string(),
            sentiment: "neutral".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRequest<'a> {
    pub user_id: &'a str,
    pub message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<&'a Map<String, Value>>,
}

/// What the scoring service answers; patterns in any order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Scoring {
    pub patterns: Vec<Pattern>,
    pub analysis: Analysis,
    pub user_context: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhanceRequest<'a> {
    pub user_id: &'a str,
    pub message: &'a str,
    pub ai_response: &'a str,
    /// Full detection, every pattern ranked by confidence.
    pub patterns: &'a [Pattern],
    pub analysis: &'a Analysis,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Enhancement {
    pub enhanced: bool,
    pub enhanced_response: String,
    #[serde(default)]
    pub pattern: Option<Pattern>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    pub engaged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helpful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_taken: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_impact: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRecord {
    pub user_id: String,
    pub enhancement_id: String,
    pub feedback: Feedback,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{service} request failed: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{service} returned HTTP {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("{service} sent an unreadable response: {detail}")]
    Decode {
        service: &'static str,
        detail: String,
    },
    #[error("{0}")]
    Rejected(String),
}

#[async_trait::async_trait]
pub trait PatternScorer: Send + Sync {
    async fn score(&self, req: &ScoreRequest<'_>) -> Result<Scoring, ServiceError>;
    fn name(&self) -> &'static str;
}

#[async_trait::async_trait]
pub trait Enhancer: Send + Sync {
    async fn enhance(&self, req: &EnhanceRequest<'_>) -> Result<Enhancement, ServiceError>;
    fn name(&self) -> &'static str;
}

#[async_trait::async_trait]
pub trait Learner: Send + Sync {
    async fn learn(&self, record: &FeedbackRecord) -> Result<(), ServiceError>;
    fn name(&self) -> &'static str;
}

pub type DynScorer = Arc<dyn PatternScorer>;
pub type DynEnhancer = Arc<dyn Enhancer>;
pub type DynLearner = Arc<dyn Learner>;

#[derive(Clone)]
pub struct Services {
    pub scorer: DynScorer,
    pub enhancer: DynEnhancer,
    pub learner: DynLearner,
}

impl Services {
    /// Everything in-process.
    pub fn local() -> Self {
        Self {
            scorer: Arc::new(local::KeywordScorer::new()),
            enhancer: Arc::new(local::SuggestionEnhancer),
            learner: Arc::new(local::TallyLearner::default()),
        }
    }
}

pub fn build_services(endpoints: &ServiceEndpoints) -> anyhow::Result<Services> {
    let mut services = Services::local();
    let any_remote = endpoints.scoring_url.is_some()
        || endpoints.enhancement_url.is_some()
        || endpoints.learning_url.is_some();
    if !any_remote {
        info!(target: "pipeline", "using built-in scorer, enhancer and learner");
        return Ok(services);
    }

    let http = remote::http_client(endpoints.timeout_secs)?;
    if let Some(url) = &endpoints.scoring_url {
        services.scorer = Arc::new(remote::RemoteScorer::new(http.clone(), url));
    }
    if let Some(url) = &endpoints.enhancement_url {
        services.enhancer = Arc::new(remote::RemoteEnhancer::new(http.clone(), url));
    }
    if let Some(url) = &endpoints.learning_url {
        services.learner = Arc::new(remote::RemoteLearner::new(http, url));
    }
    info!(
        target: "pipeline",
        scorer = services.scorer.name(),
        enhancer = services.enhancer.name(),
        learner = services.learner.name(),
        "collaborators configured"
    );
    Ok(services)
}

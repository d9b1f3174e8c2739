//! Orchestration pipeline: detect → enhance → feedback → learn.
//!
//! Each stage validates its input before touching a collaborator, converts collaborator
//! failures into [`PipelineError::Upstream`] and records a best-effort usage event.

mod detect;
mod enhance;
mod feedback;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::{ApiError, FieldError};
use crate::security::{crypto::to_hex, validate_input};
use crate::services::{Analysis, Pattern, ServiceError, Services};
use crate::usage::UsageTracker;

pub use detect::Detection;

pub const MAX_USER_ID_LEN: usize = 128;
pub const MAX_MESSAGE_LEN: usize = 5000;
pub const MAX_AI_RESPONSE_LEN: usize = 10_000;
pub const MAX_ENHANCEMENT_ID_LEN: usize = 256;
/// Patterns exposed to clients per detection.
pub const TOP_PATTERNS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Detect,
    Enhance,
    Feedback,
}

impl Stage {
    pub fn public_message(self) -> &'static str {
        match self {
            Stage::Detect => "Pattern analysis failed",
            Stage::Enhance => "Response enhancement failed",
            Stage::Feedback => "Feedback processing failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request")]
    Validation(Vec<FieldError>),
    #[error("{}: {source}", stage.public_message())]
    Upstream {
        stage: Stage,
        #[source]
        source: ServiceError,
    },
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Validation(fields) => ApiError::Validation(fields),
            PipelineError::Upstream { stage, source } => ApiError::Upstream {
                public: stage.public_message().to_string(),
                detail: source.to_string(),
            },
        }
    }
}

/// Body of `/analyze` and `/patterns/detect`. Fields are optional here so that missing
/// ones are reported per field rather than as a deserialization error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectRequest {
    pub user_id: Option<String>,
    pub message: Option<String>,
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnhanceRequest {
    pub user_id: Option<String>,
    pub message: Option<String>,
    pub ai_response: Option<String>,
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeedbackRequest {
    pub user_id: Option<String>,
    pub enhancement_id: Option<String>,
    pub feedback: Option<Value>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatternDetectionResult {
    pub patterns: Vec<Pattern>,
    pub analysis: Analysis,
    pub user_context: Value,
    pub processing_time: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnhancementResult {
    pub enhanced: bool,
    pub enhanced_response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<Pattern>,
    pub enhancement_id: String,
    pub processing_time: u64,
}

pub struct Pipeline {
    services: Services,
    usage: Arc<UsageTracker>,
}

impl Pipeline {
    pub fn new(services: Services, usage: Arc<UsageTracker>) -> Self {
        Self { services, usage }
    }
}

/// Collects field errors so a request reports every problem at once.
#[derive(Default)]
struct Checks(Vec<FieldError>);

impl Checks {
    fn text<'a>(&mut self, field: &str, value: Option<&'a String>, max_len: usize) -> &'a str {
        match value {
            Some(s) if validate_input(s, max_len) => s.as_str(),
            Some(s) if s.trim().is_empty() => self.fail(field, "must not be empty"),
            Some(_) => self.fail(
                field,
                &format!("must be at most {max_len} characters without script tags"),
            ),
            None => self.fail(field, "is required"),
        }
    }

    fn context<'a>(&mut self, value: Option<&'a Value>) -> Option<&'a Map<String, Value>> {
        let map = match value {
            None | Some(Value::Null) => return None,
            Some(Value::Object(map)) => map,
            Some(_) => {
                self.fail("context", "must be an object");
                return None;
            }
        };
        if let Some(level) = map.get("energyLevel") {
            if !level.as_f64().is_some_and(|l| (1.0..=10.0).contains(&l)) {
                self.fail("context.energyLevel", "must be a number from 1 to 10");
            }
        }
        for key in ["businessType", "sessionId"] {
            if map.get(key).is_some_and(|v| !(v.is_string() || v.is_null())) {
                self.fail(&format!("context.{key}"), "must be a string");
            }
        }
        Some(map)
    }

    fn fail(&mut self, field: &str, message: &str) -> &'static str {
        self.0.push(FieldError::new(field, message));
        ""
    }

    fn finish(self) -> Result<(), PipelineError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Validation(self.0))
        }
    }
}

/// Short content hash for logs; message text itself is never logged.
pub(crate) fn fingerprint(s: &str) -> String {
    to_hex(&Sha256::digest(s.as_bytes())[..6])
}

fn elapsed_ms(start: std::time::Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::security::{crypto::generate_key, Cipher, CipherConfig};
    use crate::services::{
        EnhanceRequest as EnhanceCall, Enhancement, Enhancer, FeedbackRecord, Learner,
        PatternScorer, ScoreRequest, Scoring,
    };
    use crate::usage::DEFAULT_USAGE_CAPACITY;

    pub struct Failing;

    #[async_trait::async_trait]
    impl PatternScorer for Failing {
        async fn score(&self, _: &ScoreRequest<'_>) -> Result<Scoring, ServiceError> {
            Err(ServiceError::Rejected("scorer exploded at 10.0.0.7".into()))
        }
        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[async_trait::async_trait]
    impl Enhancer for Failing {
        async fn enhance(&self, _: &EnhanceCall<'_>) -> Result<Enhancement, ServiceError> {
            Err(ServiceError::Rejected("enhancer exploded".into()))
        }
        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[async_trait::async_trait]
    impl Learner for Failing {
        async fn learn(&self, _: &FeedbackRecord) -> Result<(), ServiceError> {
            Err(ServiceError::Rejected("learner exploded".into()))
        }
        fn name(&self) -> &'static str {
            "failing"
        }
    }

    pub fn usage() -> Arc<UsageTracker> {
        let cipher = Cipher::new(CipherConfig::default(), &generate_key(32)).unwrap();
        Arc::new(UsageTracker::new(DEFAULT_USAGE_CAPACITY, Arc::new(cipher)))
    }

    pub fn local_pipeline() -> (Pipeline, Arc<UsageTracker>) {
        let usage = usage();
        (Pipeline::new(Services::local(), usage.clone()), usage)
    }

    pub fn failing_pipeline() -> Pipeline {
        Pipeline::new(
            Services {
                scorer: Arc::new(Failing),
                enhancer: Arc::new(Failing),
                learner: Arc::new(Failing),
            },
            usage(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_maps_to_redactable_api_error() {
        let err = PipelineError::Upstream {
            stage: Stage::Enhance,
            source: ServiceError::Rejected("boom".into()),
        };
        match ApiError::from(err) {
            ApiError::Upstream { public, detail } => {
                assert_eq!(public, "Response enhancement failed");
                assert_eq!(detail, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn context_checks() {
        let mut c = Checks::default();
        let ctx = serde_json::json!({"energyLevel": 11, "sessionId": 5, "extra": [1]});
        assert!(c.context(Some(&ctx)).is_some());
        let fields: Vec<_> = c.0.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(fields, vec!["context.energyLevel", "context.sessionId"]);

        let mut c = Checks::default();
        assert!(c.context(Some(&Value::from("nope"))).is_none());
        assert_eq!(c.0[0].field, "context");
    }

    #[test]
    fn fingerprint_is_short_and_stable() {
        assert_eq!(fingerprint("hello").len(), 12);
        assert_eq!(fingerprint("hello"), fingerprint("hello"));
        assert_ne!(fingerprint("hello"), fingerprint("hello!"));
    }
}

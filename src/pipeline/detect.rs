use std::time::Instant;

use serde_json::{Map, Value};
use tracing::{info, warn};

use super::{
    elapsed_ms, fingerprint, Checks, DetectRequest, PatternDetectionResult, Pipeline,
    PipelineError, Stage, MAX_MESSAGE_LEN, MAX_USER_ID_LEN, TOP_PATTERNS,
};
use crate::services::{ScoreRequest, Scoring};
use crate::usage::UsageEvent;

/// Client view plus the untruncated pattern count.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub result: PatternDetectionResult,
    pub total_patterns: usize,
}

pub(super) struct Validated<'a> {
    pub user_id: &'a str,
    pub message: &'a str,
    pub context: Option<&'a Map<String, Value>>,
}

impl Pipeline {
    pub async fn detect(
        &self,
        req: &DetectRequest,
        endpoint: &'static str,
    ) -> Result<Detection, PipelineError> {
        let start = Instant::now();
        let mut checks = Checks::default();
        let input = Validated {
            user_id: checks.text("userId", req.user_id.as_ref(), MAX_USER_ID_LEN),
            message: checks.text("message", req.message.as_ref(), MAX_MESSAGE_LEN),
            context: checks.context(req.context.as_ref()),
        };
        checks.finish()?;

        let scoring = self.score(&input).await?;
        let total_patterns = scoring.patterns.len();
        let mut patterns = scoring.patterns;
        patterns.truncate(TOP_PATTERNS);

        let processing_time = elapsed_ms(start);
        self.usage.record(UsageEvent {
            pattern_count: total_patterns,
            ..UsageEvent::new(endpoint, input.user_id, processing_time)
        });
        info!(
            target: "pipeline",
            endpoint,
            user_id = input.user_id,
            msg_len = input.message.chars().count(),
            msg_hash = %fingerprint(input.message),
            patterns = total_patterns,
            top = patterns.first().map(|p| p.kind.as_str()).unwrap_or("-"),
            ms = processing_time,
            "patterns detected"
        );

        Ok(Detection {
            result: PatternDetectionResult {
                patterns,
                analysis: scoring.analysis,
                user_context: scoring.user_context,
                processing_time,
            },
            total_patterns,
        })
    }

    /// Scorer call with patterns ranked by confidence, highest first.
    pub(super) async fn score(&self, input: &Validated<'_>) -> Result<Scoring, PipelineError> {
        let call = ScoreRequest {
            user_id: input.user_id,
            message: input.message,
            context: input.context,
        };
        let mut scoring = self.services.scorer.score(&call).await.map_err(|source| {
            warn!(target: "pipeline", user_id = input.user_id, error = %source, "scoring failed");
            PipelineError::Upstream {
                stage: Stage::Detect,
                source,
            }
        })?;

        scoring
            .patterns
            .retain(|p| p.confidence.is_finite() && !p.kind.is_empty());
        for p in &mut scoring.patterns {
            p.confidence = p.confidence.clamp(0.0, 1.0);
        }
        scoring
            .patterns
            .sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        if scoring.user_context.is_null() {
            scoring.user_context = Value::Object(Map::new());
        }
        Ok(scoring)
    }
}

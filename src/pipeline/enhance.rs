use std::time::Instant;

use tracing::{info, warn};

use super::detect::Validated;
use super::{
    elapsed_ms, Checks, EnhanceRequest, EnhancementResult, Pipeline, PipelineError, Stage,
    MAX_AI_RESPONSE_LEN, MAX_MESSAGE_LEN, MAX_USER_ID_LEN,
};
use crate::security::crypto::generate_token;
use crate::services::EnhanceRequest as EnhanceCall;
use crate::usage::UsageEvent;

const ENHANCEMENT_ID_BYTES: usize = 16;

impl Pipeline {
    /// Re-runs detection on the same message, then asks the enhancer to rework the draft.
    pub async fn enhance(&self, req: &EnhanceRequest) -> Result<EnhancementResult, PipelineError> {
        let start = Instant::now();
        let mut checks = Checks::default();
        let input = Validated {
            user_id: checks.text("userId", req.user_id.as_ref(), MAX_USER_ID_LEN),
            message: checks.text("message", req.message.as_ref(), MAX_MESSAGE_LEN),
            context: checks.context(req.context.as_ref()),
        };
        let ai_response = checks.text("aiResponse", req.ai_response.as_ref(), MAX_AI_RESPONSE_LEN);
        checks.finish()?;

        let scoring = self.score(&input).await.map_err(|e| match e {
            PipelineError::Upstream { source, .. } => PipelineError::Upstream {
                stage: Stage::Enhance,
                source,
            },
            other => other,
        })?;

        let call = EnhanceCall {
            user_id: input.user_id,
            message: input.message,
            ai_response,
            patterns: &scoring.patterns,
            analysis: &scoring.analysis,
        };
        let out = self
            .services
            .enhancer
            .enhance(&call)
            .await
            .map_err(|source| {
                warn!(target: "pipeline", user_id = input.user_id, error = %source, "enhancement failed");
                PipelineError::Upstream {
                    stage: Stage::Enhance,
                    source,
                }
            })?;

        let processing_time = elapsed_ms(start);
        let pattern_type = out.pattern.as_ref().map(|p| p.kind.clone());
        self.usage.record(UsageEvent {
            pattern_count: scoring.patterns.len(),
            enhanced: Some(out.enhanced),
            pattern_type: pattern_type.clone(),
            ..UsageEvent::new("enhance", input.user_id, processing_time)
        });
        info!(
            target: "pipeline",
            user_id = input.user_id,
            enhanced = out.enhanced,
            pattern = pattern_type.as_deref().unwrap_or("-"),
            ms = processing_time,
            "response enhanced"
        );

        Ok(EnhancementResult {
            enhanced: out.enhanced,
            enhanced_response: out.enhanced_response,
            pattern: out.pattern,
            enhancement_id: generate_token(ENHANCEMENT_ID_BYTES),
            processing_time,
        })
    }
}

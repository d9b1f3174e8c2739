use std::time::Instant;

use serde_json::Value;
use tracing::{info, warn};

use super::{
    elapsed_ms, Checks, FeedbackRequest, Pipeline, PipelineError, Stage, MAX_ENHANCEMENT_ID_LEN,
    MAX_USER_ID_LEN,
};
use crate::error::FieldError;
use crate::services::{Feedback, FeedbackRecord};
use crate::usage::UsageEvent;

impl Pipeline {
    /// Forward feedback to the learner. Awaited, never retried; the enhancement id is
    /// opaque here and not checked for existence.
    pub async fn submit_feedback(&self, req: &FeedbackRequest) -> Result<(), PipelineError> {
        let start = Instant::now();
        let mut checks = Checks::default();
        let user_id = checks.text("userId", req.user_id.as_ref(), MAX_USER_ID_LEN);
        let enhancement_id =
            checks.text("enhancementId", req.enhancement_id.as_ref(), MAX_ENHANCEMENT_ID_LEN);
        let feedback = parse_feedback(req.feedback.as_ref(), &mut checks.0);
        checks.finish()?;
        let Some(feedback) = feedback else {
            return Err(PipelineError::Validation(vec![FieldError::new(
                "feedback",
                "is required",
            )]));
        };

        let record = FeedbackRecord {
            user_id: user_id.to_string(),
            enhancement_id: enhancement_id.to_string(),
            feedback,
        };
        self.services
            .learner
            .learn(&record)
            .await
            .map_err(|source| {
                warn!(target: "pipeline", user_id, error = %source, "learning service failed");
                PipelineError::Upstream {
                    stage: Stage::Feedback,
                    source,
                }
            })?;

        let ms = elapsed_ms(start);
        self.usage.record(UsageEvent::new("feedback", user_id, ms));
        info!(
            target: "pipeline",
            user_id,
            engaged = record.feedback.engaged,
            ms,
            "feedback forwarded"
        );
        Ok(())
    }
}

fn parse_feedback(value: Option<&Value>, errors: &mut Vec<FieldError>) -> Option<Feedback> {
    let obj = match value {
        Some(Value::Object(obj)) => obj,
        Some(_) => {
            errors.push(FieldError::new("feedback", "must be an object"));
            return None;
        }
        None => {
            errors.push(FieldError::new("feedback", "is required"));
            return None;
        }
    };

    let engaged = match obj.get("engaged") {
        Some(Value::Bool(b)) => Some(*b),
        _ => {
            errors.push(FieldError::new("feedback.engaged", "must be a boolean"));
            None
        }
    };
    let mut opt_bool = |key: &str| match obj.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => {
            errors.push(FieldError::new(format!("feedback.{key}"), "must be a boolean"));
            None
        }
    };
    let helpful = opt_bool("helpful");
    let action_taken = opt_bool("actionTaken");
    let business_impact = match obj.get("businessImpact") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            errors.push(FieldError::new("feedback.businessImpact", "must be a string"));
            None
        }
    };

    Some(Feedback {
        engaged: engaged?,
        helpful,
        action_taken,
        business_impact,
    })
}

//! Built-in collaborators used when no remote service is configured.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use super::catalog::{self, tokenize};
use super::{
    Analysis, EnhanceRequest, Enhancement, Enhancer, FeedbackRecord, Learner, Pattern,
    PatternScorer, ScoreRequest, Scoring, ServiceError,
};

/// Minimum confidence before the enhancer appends a suggestion.
pub const ENHANCE_THRESHOLD: f64 = 0.3;

const FUTURE_WORDS: &[&str] = &["tomorrow", "later", "next", "will", "i'll", "plan", "going"];

/// Keyword/phrase matcher over the embedded catalog.
#[derive(Debug, Default)]
pub struct KeywordScorer;

impl KeywordScorer {
    pub fn new() -> Self {
        Self
    }

    pub fn score_text(&self, message: &str, context: Option<&Map<String, Value>>) -> Scoring {
        let tokens = tokenize(message);
        // padded so phrases only match on token boundaries
        let haystack = format!(" {} ", tokens.join(" "));

        let low_energy = context
            .and_then(|c| c.get("energyLevel"))
            .and_then(Value::as_f64)
            .is_some_and(|e| e <= 3.0);

        let mut patterns: Vec<Pattern> = catalog::patterns()
            .iter()
            .filter_map(|def| {
                let hits: Vec<String> = def
                    .keywords
                    .iter()
                    .filter(|kw| haystack.contains(&format!(" {} ", kw.to_lowercase())))
                    .cloned()
                    .collect();
                if hits.is_empty() {
                    return None;
                }
                let mut confidence = 0.4 + 0.2 * (hits.len() as f64 - 1.0);
                if low_energy && matches!(def.kind.as_str(), "burnout" | "overwhelm") {
                    confidence += 0.1;
                }
                Some(Pattern {
                    kind: def.kind.clone(),
                    confidence: round2(confidence.min(0.95)),
                    keywords: hits,
                    suggestions: def.suggestions.clone(),
                })
            })
            .collect();
        patterns.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let sentiment = sentiment_label(&tokens);
        Scoring {
            analysis: Analysis {
                intent: intent_label(message, &tokens, sentiment).to_string(),
                sentiment: sentiment.to_string(),
            },
            patterns,
            user_context: Value::Object(context.cloned().unwrap_or_default()),
        }
    }
}

#[async_trait::async_trait]
impl PatternScorer for KeywordScorer {
    async fn score(&self, req: &ScoreRequest<'_>) -> Result<Scoring, ServiceError> {
        Ok(self.score_text(req.message, req.context))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Lexicon sum; a negator within the previous three tokens flips a word's sign.
fn sentiment_label(tokens: &[String]) -> &'static str {
    let lex = catalog::sentiment_lexicon();
    let is = |list: &[String], w: &str| list.iter().any(|x| x == w);

    let mut score = 0i32;
    for (i, w) in tokens.iter().enumerate() {
        let base = if is(&lex.positive, w) {
            1
        } else if is(&lex.negative, w) {
            -1
        } else {
            continue;
        };
        let negated = (1..=3).any(|k| i >= k && is(&lex.negators, &tokens[i - k]));
        score += if negated { -base } else { base };
    }
    match score {
        s if s > 0 => "positive",
        s if s < 0 => "negative",
        _ => "neutral",
    }
}

fn intent_label(message: &str, tokens: &[String], sentiment: &str) -> &'static str {
    if message.trim_end().ends_with('?') {
        "question"
    } else if tokens.iter().any(|t| FUTURE_WORDS.contains(&t.as_str())) {
        "planning"
    } else if sentiment == "negative" {
        "venting"
    } else {
        "statement"
    }
}

/// Appends the top pattern's first unused suggestion to the draft reply.
#[derive(Debug, Default)]
pub struct SuggestionEnhancer;

#[async_trait::async_trait]
impl Enhancer for SuggestionEnhancer {
    async fn enhance(&self, req: &EnhanceRequest<'_>) -> Result<Enhancement, ServiceError> {
        let top = req
            .patterns
            .iter()
            .find(|p| p.confidence >= ENHANCE_THRESHOLD);
        let suggestion = top.and_then(|p| {
            p.suggestions
                .iter()
                .find(|s| !req.ai_response.contains(s.as_str()))
        });

        Ok(match (top, suggestion) {
            (Some(p), Some(s)) => Enhancement {
                enhanced: true,
                enhanced_response: format!("{}\n\n{}", req.ai_response.trim_end(), s),
                pattern: Some(p.clone()),
            },
            _ => Enhancement {
                enhanced: false,
                enhanced_response: req.ai_response.to_string(),
                pattern: None,
            },
        })
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tally {
    pub total: u64,
    pub engaged: u64,
    pub helpful: u64,
    pub action_taken: u64,
}

/// Per-user feedback counters, process lifetime only.
#[derive(Debug, Default)]
pub struct TallyLearner {
    tallies: Mutex<HashMap<String, Tally>>,
}

impl TallyLearner {
    pub fn tally(&self, user_id: &str) -> Tally {
        self.tallies.lock().get(user_id).copied().unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Learner for TallyLearner {
    async fn learn(&self, record: &FeedbackRecord) -> Result<(), ServiceError> {
        let fb = &record.feedback;
        let snapshot = {
            let mut map = self.tallies.lock();
            let t = map.entry(record.user_id.clone()).or_default();
            t.total += 1;
            t.engaged += u64::from(fb.engaged);
            t.helpful += u64::from(fb.helpful.unwrap_or(false));
            t.action_taken += u64::from(fb.action_taken.unwrap_or(false));
            *t
        };
        info!(
            target: "pipeline",
            user_id = %record.user_id,
            enhancement_id = %record.enhancement_id,
            engaged = fb.engaged,
            total = snapshot.total,
            "feedback learned"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::Feedback;

    #[test]
    fn procrastination_is_detected_in_vague_promises() {
        let s = KeywordScorer::new().score_text("I'll do it tomorrow, maybe", None);
        let top = &s.patterns[0];
        assert_eq!(top.kind, "procrastination");
        assert!(top.confidence > 0.0);
        assert_eq!(top.keywords, vec!["tomorrow", "maybe"]);
        assert_eq!(s.analysis.intent, "planning");
        assert_eq!(s.user_context, Value::Object(Map::new()));
    }

    #[test]
    fn phrases_match_on_word_boundaries_only() {
        let scorer = KeywordScorer::new();
        let s = scorer.score_text("I keep pushing it to next week", None);
        assert!(s.patterns.iter().any(|p| p.kind == "procrastination"));

        // "later" inside "translater" must not count
        let s = scorer.score_text("the translater arrived", None);
        assert!(s.patterns.iter().all(|p| p.kind != "procrastination"));
    }

    #[test]
    fn patterns_are_ranked_and_context_is_echoed() {
        let mut ctx = Map::new();
        ctx.insert("energyLevel".into(), Value::from(2));
        ctx.insert("businessType".into(), Value::from("bakery"));
        let s = KeywordScorer::new().score_text(
            "I'm exhausted and drained, maybe I'll look at it later",
            Some(&ctx),
        );
        assert!(s.patterns.len() >= 2);
        for pair in s.patterns.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
        }
        assert_eq!(s.user_context["businessType"], "bakery");
    }

    #[test]
    fn negation_flips_sentiment() {
        let s = KeywordScorer::new().score_text("I am not happy with this", None);
        assert_eq!(s.analysis.sentiment, "negative");
        let s = KeywordScorer::new().score_text("feeling great", None);
        assert_eq!(s.analysis.sentiment, "positive");
        let s = KeywordScorer::new().score_text("what should I do?", None);
        assert_eq!(s.analysis.intent, "question");
    }

    #[tokio::test]
    async fn enhancer_appends_suggestion_above_threshold() {
        let scoring = KeywordScorer::new().score_text("maybe tomorrow", None);
        let req = EnhanceRequest {
            user_id: "u1",
            message: "maybe tomorrow",
            ai_response: "Sounds like a plan.",
            patterns: &scoring.patterns,
            analysis: &scoring.analysis,
        };
        let out = SuggestionEnhancer.enhance(&req).await.unwrap();
        assert!(out.enhanced);
        assert!(out.enhanced_response.starts_with("Sounds like a plan.\n\n"));
        assert_eq!(out.pattern.unwrap().kind, "procrastination");

        let none = EnhanceRequest {
            patterns: &[],
            ..req
        };
        let out = SuggestionEnhancer.enhance(&none).await.unwrap();
        assert!(!out.enhanced);
        assert_eq!(out.enhanced_response, "Sounds like a plan.");
        assert!(out.pattern.is_none());
    }

    #[tokio::test]
    async fn learner_tallies_per_user() {
        let learner = TallyLearner::default();
        let rec = |engaged, helpful| FeedbackRecord {
            user_id: "u1".into(),
            enhancement_id: "whatever".into(),
            feedback: Feedback {
                engaged,
                helpful,
                action_taken: None,
                business_impact: None,
            },
        };
        learner.learn(&rec(true, Some(true))).await.unwrap();
        learner.learn(&rec(false, None)).await.unwrap();
        let t = learner.tally("u1");
        assert_eq!((t.total, t.engaged, t.helpful), (2, 1, 1));
        assert_eq!(learner.tally("nobody"), Tally::default());
    }
}

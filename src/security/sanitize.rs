//! Input sanitization and validation.
//!
//! `sanitize` strips markup brackets, `javascript:` schemes and inline event-handler
//! attributes, then trims. The rules run to a fixpoint so the result is stable under
//! repeated application (removing one token can splice together another).

use std::collections::HashMap;

use axum::{
    extract::{FromRequestParts, Query},
    http::request::Parts,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{ApiError, ApiFailure, ExposeDetail};
use crate::security::RequestId;

static RE_JS_SCHEME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)javascript:").expect("js scheme regex"));
static RE_EVENT_HANDLER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bon\w+\s*=").expect("event handler regex"));
static RE_SCRIPT_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<\s*/?\s*script\b").expect("script tag regex"));

pub fn sanitize(input: &str) -> String {
    let mut current = sanitize_once(input);
    loop {
        let next = sanitize_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn sanitize_once(input: &str) -> String {
    let no_brackets: String = input.chars().filter(|c| *c != '<' && *c != '>').collect();
    let no_scheme = RE_JS_SCHEME.replace_all(&no_brackets, "");
    let no_handlers = RE_EVENT_HANDLER.replace_all(&no_scheme, "");
    no_handlers.trim().to_string()
}

/// True iff `s` is non-blank, at most `max_len` chars, and carries no raw script tag.
pub fn validate_input(s: &str, max_len: usize) -> bool {
    !s.trim().is_empty() && s.chars().count() <= max_len && !RE_SCRIPT_TAG.is_match(s)
}

/// Sanitize every string value in a JSON tree in place. Object keys are left alone.
pub fn sanitize_json(value: &mut Value) {
    match value {
        Value::String(s) => {
            let clean = sanitize(s);
            if clean != *s {
                *s = clean;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(sanitize_json),
        Value::Object(map) => map.values_mut().for_each(sanitize_json),
        _ => {}
    }
}

/// Query-string extractor that sanitizes every value before a handler sees it.
#[derive(Debug, Default)]
pub struct CleanQuery(pub HashMap<String, String>);

impl CleanQuery {
    /// Non-empty value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }
}

impl<S> FromRequestParts<S> for CleanQuery
where
    S: Send + Sync,
{
    type Rejection = ApiFailure;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let request_id = RequestId::from_extensions(&parts.extensions);
        let expose = ExposeDetail::from_extensions(&parts.extensions);
        let Query(raw) = Query::<HashMap<String, String>>::from_request_parts(parts, state)
            .await
            .map_err(|rej| {
                let message = if expose {
                    rej.body_text()
                } else {
                    "malformed query string".to_string()
                };
                ApiFailure::new(request_id, ApiError::invalid("query", message))
            })?;
        Ok(CleanQuery(
            raw.into_iter().map(|(k, v)| (k, sanitize(&v))).collect(),
        ))
    }
}

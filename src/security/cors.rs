//! CORS origin allow-list.
//!
//! Patterns are exact origins (`https://app.example.com`), wildcard subdomains
//! (`https://*.vercel.app`, which never matches the bare apex) or `*`.

use std::{collections::HashSet, sync::Arc, time::Duration};

use axum::http::{
    header::{AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER},
    request::Parts,
    HeaderName, HeaderValue, Method,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    any: bool,
    exact: HashSet<String>,
    /// `(scheme, ".suffix")`
    wildcard: Vec<(String, String)>,
}

impl OriginPolicy {
    pub fn from_list<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut policy = OriginPolicy::default();
        for raw in patterns {
            let p = normalize(raw.as_ref());
            if p.is_empty() {
                continue;
            }
            if p == "*" {
                policy.any = true;
            } else if let Some((scheme, rest)) = p.split_once("://") {
                match rest.strip_prefix('*') {
                    Some(suffix) if suffix.starts_with('.') => {
                        policy.wildcard.push((scheme.to_string(), suffix.to_string()))
                    }
                    _ => {
                        policy.exact.insert(p.clone());
                    }
                }
            }
        }
        policy
    }

    pub fn is_allowed(&self, origin: &str) -> bool {
        if self.any {
            return true;
        }
        let origin = normalize(origin);
        if self.exact.contains(&origin) {
            return true;
        }
        let Some((scheme, host)) = origin.split_once("://") else {
            return false;
        };
        self.wildcard.iter().any(|(s, suffix)| {
            s == scheme && host.len() > suffix.len() && host.ends_with(suffix.as_str())
        })
    }

    /// tower-http layer answering every `OPTIONS` with `200` and an empty body.
    pub fn cors_layer(self: &Arc<Self>) -> CorsLayer {
        let policy = Arc::clone(self);
        CorsLayer::new()
            .allow_origin(AllowOrigin::predicate(
                move |origin: &HeaderValue, _parts: &Parts| {
                    origin.to_str().map(|o| policy.is_allowed(o)).unwrap_or(false)
                },
            ))
            .allow_credentials(true)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([
                CONTENT_TYPE,
                AUTHORIZATION,
                HeaderName::from_static(super::CSRF_HEADER),
                HeaderName::from_static(super::SESSION_HEADER),
                HeaderName::from_static(super::REQUEST_ID_HEADER),
            ])
            .expose_headers([HeaderName::from_static(super::REQUEST_ID_HEADER), RETRY_AFTER])
            .max_age(Duration::from_secs(86_400))
    }
}

fn normalize(s: &str) -> String {
    s.trim().trim_end_matches('/').to_ascii_lowercase()
}

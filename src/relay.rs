//! Webhook relay: forwards browser payloads to the automation system so the UI never
//! talks to it cross-origin.

use metrics::counter;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::ApiError;

pub const DEFAULT_ENDPOINT: &str = "/webhook/intervention";

#[derive(Debug, Clone, Serialize)]
pub struct RelayResponse {
    pub success: bool,
    pub data: Value,
    pub status: u16,
    pub message: String,
}

pub struct Relay {
    http: Client,
    base_url: Option<String>,
}

impl Relay {
    pub fn new(http: Client, base_url: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.map(|b| b.trim_end_matches('/').to_string()),
        }
    }

    /// `endpoint` is taken out of the body; everything else is forwarded as is.
    pub async fn forward(&self, mut body: Map<String, Value>) -> Result<RelayResponse, ApiError> {
        let endpoint = match body.remove("endpoint") {
            None | Some(Value::Null) => DEFAULT_ENDPOINT.to_string(),
            Some(Value::String(s)) if is_relative_path(&s) => s,
            Some(_) => {
                return Err(ApiError::invalid(
                    "endpoint",
                    "must be a relative path starting with '/'",
                ))
            }
        };
        let Some(base) = &self.base_url else {
            counter!("relay_requests_total", "outcome" => "unconfigured").increment(1);
            return Err(ApiError::Relay {
                status: None,
                body: "webhook relay target is not configured".to_string(),
            });
        };
        let url = format!("{base}{endpoint}");

        let resp = self
            .http
            .post(&url)
            .json(&Value::Object(body))
            .send()
            .await
            .map_err(|e| {
                counter!("relay_requests_total", "outcome" => "unreachable").increment(1);
                warn!(target: "relay", endpoint = %endpoint, error = %e, "relay target unreachable");
                ApiError::Relay {
                    status: None,
                    body: e.to_string(),
                }
            })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| {
            counter!("relay_requests_total", "outcome" => "unreadable").increment(1);
            warn!(target: "relay", endpoint = %endpoint, status = status.as_u16(), error = %e, "relay reply body unreadable");
            ApiError::Relay {
                status: Some(status.as_u16()),
                body: e.to_string(),
            }
        })?;
        if !status.is_success() {
            counter!("relay_requests_total", "outcome" => "upstream_error").increment(1);
            warn!(target: "relay", endpoint = %endpoint, status = status.as_u16(), "relay target returned an error");
            return Err(ApiError::Relay {
                status: Some(status.as_u16()),
                body: text,
            });
        }

        counter!("relay_requests_total", "outcome" => "ok").increment(1);
        info!(target: "relay", endpoint = %endpoint, status = status.as_u16(), "payload relayed");
        let data = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(RelayResponse {
            success: true,
            data,
            status: status.as_u16(),
            message: "Webhook relayed".to_string(),
        })
    }
}

fn is_relative_path(s: &str) -> bool {
    s.starts_with('/') && !s.starts_with("//") && !s.contains("://") && !s.contains('\\')
}

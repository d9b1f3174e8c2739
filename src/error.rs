//! HTTP error taxonomy shared by every handler and middleware.
//!
//! Each failure renders as `{success:false, requestId, error, message, ...}` with the
//! `X-Request-Id` header set, so clients can quote the id when reporting problems.

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::{header, Extensions, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::security::{RequestId, REQUEST_ID_HEADER};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation failed")]
    Validation(Vec<FieldError>),
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },
    #[error("csrf token rejected")]
    CsrfRejected,
    /// `public` is safe for end users; `detail` is only exposed outside production.
    #[error("{public}")]
    Upstream { public: String, detail: String },
    #[error("relay failed")]
    Relay { status: Option<u16>, body: String },
    #[error("not found")]
    NotFound,
}

impl ApiError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::Validation(vec![FieldError::new(field, message)])
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::CsrfRejected => StatusCode::FORBIDDEN,
            ApiError::Upstream { .. } | ApiError::Relay { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::NotFound => StatusCode::NOT_FOUND,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_failed",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::CsrfRejected => "csrf_rejected",
            ApiError::Upstream { .. } => "upstream_failed",
            ApiError::Relay { .. } => "relay_failed",
            ApiError::NotFound => "not_found",
        }
    }

    fn public_message(&self) -> String {
        match self {
            ApiError::Validation(_) => "Invalid request".to_string(),
            ApiError::RateLimited { .. } => {
                "Too many requests from this client, please try again later.".to_string()
            }
            ApiError::CsrfRejected => "Invalid or missing CSRF token".to_string(),
            ApiError::Upstream { public, .. } => public.clone(),
            ApiError::Relay { .. } => "Webhook relay failed".to_string(),
            ApiError::NotFound => "Not found".to_string(),
        }
    }
}

/// Request extension set by the admission stack: whether parser and upstream error
/// text may reach the client. Absent means no.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExposeDetail(pub bool);

impl ExposeDetail {
    pub fn from_extensions(ext: &Extensions) -> bool {
        ext.get::<ExposeDetail>().copied().unwrap_or_default().0
    }
}

/// An [`ApiError`] bound to the request it failed.
#[derive(Debug)]
pub struct ApiFailure {
    pub request_id: RequestId,
    pub error: ApiError,
    /// Development mode: include upstream error text in the body.
    pub expose_detail: bool,
}

impl ApiFailure {
    pub fn new(request_id: RequestId, error: ApiError) -> Self {
        Self {
            request_id,
            error,
            expose_detail: false,
        }
    }

    pub fn exposing_detail(mut self, expose: bool) -> Self {
        self.expose_detail = expose;
        self
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = self.error.status();
        let mut body = json!({
            "success": false,
            "requestId": self.request_id.as_str(),
            "error": self.error.code(),
            "message": self.error.public_message(),
        });

        match &self.error {
            ApiError::Validation(details) => {
                body["details"] = json!(details);
            }
            ApiError::RateLimited { retry_after_secs } => {
                body["retryAfterSecs"] = json!(retry_after_secs);
            }
            ApiError::Upstream { detail, .. } if self.expose_detail => {
                body["detail"] = json!(detail);
            }
            ApiError::Relay {
                status: upstream,
                body: text,
            } => {
                body["upstreamStatus"] = json!(upstream);
                if self.expose_detail {
                    body["upstreamBody"] = json!(text);
                }
            }
            _ => {}
        }

        let mut resp = (status, Json(body)).into_response();
        if let Ok(v) = HeaderValue::from_str(self.request_id.as_str()) {
            resp.headers_mut().insert(REQUEST_ID_HEADER, v);
        }
        if let ApiError::RateLimited { retry_after_secs } = self.error {
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        resp
    }
}

/// JSON body extractor whose rejections use the shared error shape.
pub struct Payload<T>(pub T);

impl<S, T> FromRequest<S> for Payload<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiFailure;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let request_id = RequestId::from_extensions(req.extensions());
        let expose = ExposeDetail::from_extensions(req.extensions());
        let Json(value) = Json::<Value>::from_request(req, state)
            .await
            .map_err(|rej| {
                let message = if expose {
                    rej.body_text()
                } else {
                    json_rejection_summary(&rej).to_string()
                };
                ApiFailure::new(request_id.clone(), ApiError::invalid("body", message))
                    .exposing_detail(expose)
            })?;
        serde_json::from_value(value).map(Payload).map_err(|e| {
            let message = if expose {
                e.to_string()
            } else {
                "does not match the expected shape".to_string()
            };
            ApiFailure::new(request_id, ApiError::invalid("body", message)).exposing_detail(expose)
        })
    }
}

fn json_rejection_summary(rej: &JsonRejection) -> &'static str {
    match rej {
        JsonRejection::MissingJsonContentType(_) => "expected content-type application/json",
        JsonRejection::JsonSyntaxError(_) => "malformed JSON",
        JsonRejection::JsonDataError(_) => "does not match the expected shape",
        _ => "request body unreadable",
    }
}

//! Intervention records and their ingress validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::FieldError;
use crate::security::validate_input;

const MAX_ID_LEN: usize = 128;
const MAX_MESSAGE_LEN: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Used,
    Expired,
    /// Replaced by a newer ingress before it was used or expired.
    Superseded,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Used | Status::Expired | Status::Superseded)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intervention {
    pub id: String,
    pub message: String,
    pub priority: f64,
    pub final_priority: f64,
    pub created_at: DateTime<Utc>,
    pub delivery_timestamp: DateTime<Utc>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    /// Anything else the automation system attached (pattern type, tags, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Intervention {
    /// Validate an ingress body. `userId` is routing data and is not kept. The stored
    /// status is always `pending`.
    pub fn from_ingress(mut body: Map<String, Value>) -> Result<Self, Vec<FieldError>> {
        let mut errors = Vec::new();
        body.remove("userId");

        let mut text = |key: &str, max: usize, errors: &mut Vec<FieldError>| {
            match body.remove(key) {
                Some(Value::String(s)) if validate_input(&s, max) => s.trim().to_string(),
                Some(Value::String(_)) => {
                    errors.push(FieldError::new(key, format!("must be non-empty, at most {max} chars")));
                    String::new()
                }
                Some(_) => {
                    errors.push(FieldError::new(key, "must be a string"));
                    String::new()
                }
                None => {
                    errors.push(FieldError::new(key, "is required"));
                    String::new()
                }
            }
        };
        let id = text("id", MAX_ID_LEN, &mut errors);
        let message = text("message", MAX_MESSAGE_LEN, &mut errors);

        let mut number = |key: &str, errors: &mut Vec<FieldError>| match body
            .remove(key)
            .as_ref()
            .and_then(Value::as_f64)
        {
            Some(n) if n.is_finite() => n,
            _ => {
                errors.push(FieldError::new(key, "must be a finite number"));
                0.0
            }
        };
        let priority = number("priority", &mut errors);
        let final_priority = number("finalPriority", &mut errors);

        let mut timestamp = |key: &str, errors: &mut Vec<FieldError>| {
            let parsed = body
                .remove(key)
                .as_ref()
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc));
            if parsed.is_none() {
                errors.push(FieldError::new(key, "must be an RFC 3339 timestamp"));
            }
            parsed.unwrap_or_default()
        };
        let created_at = timestamp("createdAt", &mut errors);
        let delivery_timestamp = timestamp("deliveryTimestamp", &mut errors);

        match body.remove("status") {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) if s == "pending" || s == "delivered" => {}
            Some(_) => errors.push(FieldError::new(
                "status",
                "must be \"pending\" or \"delivered\" on ingress",
            )),
        }
        for key in ["usedAt", "closedAt"] {
            body.remove(key);
        }

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Self {
            id,
            message,
            priority,
            final_priority,
            created_at,
            delivery_timestamp,
            status: Status::Pending,
            used_at: None,
            closed_at: None,
            extra: body,
        })
    }
}

/// What happened to an intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Activated,
    Superseded,
    Used,
    Expired,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Activated => "activated",
            EventKind::Superseded => "superseded",
            EventKind::Used => "used",
            EventKind::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterventionEvent {
    pub kind: EventKind,
    pub user_id: String,
    pub intervention: Intervention,
}

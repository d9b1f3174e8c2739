//! usage.rs: best-effort usage events for the pipeline endpoints.
//!
//! Events land in a bounded in-memory ring. Recording never blocks: if the ring is
//! contended the event is dropped. User ids are sealed with the process cipher before
//! they are stored.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::security::Cipher;

pub const DEFAULT_USAGE_CAPACITY: usize = 2000;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub endpoint: &'static str,
    pub user_id: String,
    pub processing_time_ms: u64,
    pub pattern_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhanced: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern_type: Option<String>,
    pub at: DateTime<Utc>,
}

impl UsageEvent {
    pub fn new(endpoint: &'static str, user_id: &str, processing_time_ms: u64) -> Self {
        Self {
            endpoint,
            user_id: user_id.to_string(),
            processing_time_ms,
            pattern_count: 0,
            enhanced: None,
            pattern_type: None,
            at: Utc::now(),
        }
    }
}

/// Stored form: the user id is sealed.
struct Entry {
    event: UsageEvent,
    sealed_user: String,
}

pub struct UsageTracker {
    ring: Mutex<VecDeque<Entry>>,
    cap: usize,
    cipher: Arc<Cipher>,
}

impl UsageTracker {
    pub fn new(cap: usize, cipher: Arc<Cipher>) -> Self {
        let cap = cap.clamp(1, 100_000);
        Self {
            ring: Mutex::new(VecDeque::with_capacity(cap.min(4096))),
            cap,
            cipher,
        }
    }

    pub fn record(&self, event: UsageEvent) {
        counter!("usage_events_total", "endpoint" => event.endpoint).increment(1);
        histogram!("pipeline_duration_ms", "endpoint" => event.endpoint)
            .record(event.processing_time_ms as f64);
        if event.endpoint != "feedback" {
            histogram!("pipeline_patterns_detected").record(event.pattern_count as f64);
        }

        let sealed_user = match self.cipher.encrypt_str(&event.user_id) {
            Ok(s) => s,
            Err(e) => {
                warn!(target: "usage", error = %e, "usage event dropped: cannot seal user id");
                return;
            }
        };
        let Some(mut ring) = self.ring.try_lock() else {
            debug!(target: "usage", endpoint = event.endpoint, "usage ring busy; event dropped");
            return;
        };
        ring.push_back(Entry {
            event: UsageEvent {
                user_id: String::new(),
                ..event
            },
            sealed_user,
        });
        while ring.len() > self.cap {
            ring.pop_front();
        }
    }

    /// Last `n` events, oldest first, with user ids unsealed.
    pub fn recent(&self, n: usize) -> Vec<UsageEvent> {
        let ring = self.ring.lock();
        let start = ring.len().saturating_sub(n);
        ring.iter()
            .skip(start)
            .filter_map(|e| match self.cipher.decrypt_str(&e.sealed_user) {
                Ok(user_id) => Some(UsageEvent {
                    user_id,
                    ..e.event.clone()
                }),
                Err(err) => {
                    warn!(target: "usage", error = %err, "cannot unseal usage entry");
                    None
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Per-user active slot with supersession, idempotent consumption and TTL expiry.
//!
//! Every transition for a user runs under that user's `DashMap` entry lock, so two
//! concurrent ingresses are linearized and at most one record is ever `pending`.
//! Expiry timers are aborted on supersession and consumption; a timer that fires anyway
//! only acts if the active slot still holds its exact id.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use super::model::{EventKind, Intervention, InterventionEvent, Status};

pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_HISTORY_CAP: usize = 50;
/// Ids remembered per user for duplicate detection, independent of history trimming.
pub const SEEN_IDS_CAP: usize = 1024;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Activated { superseded: Option<String> },
    /// The id was already seen for this user; nothing changed.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeOutcome {
    Consumed(Intervention),
    NotActive,
}

struct Active {
    id: String,
    timer: Option<AbortHandle>,
}

/// Bounded set of ingested ids; the oldest is forgotten first.
#[derive(Default)]
struct SeenIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenIds {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: &str, cap: usize) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > cap {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }
}

#[derive(Default)]
struct UserSlot {
    active: Option<Active>,
    /// Oldest first.
    history: VecDeque<Intervention>,
    seen: SeenIds,
}

impl UserSlot {
    fn record_mut(&mut self, id: &str) -> Option<&mut Intervention> {
        self.history.iter_mut().rev().find(|iv| iv.id == id)
    }
}

pub struct InterventionHub {
    users: DashMap<String, UserSlot>,
    ttl: Duration,
    history_cap: usize,
    seen_cap: usize,
    events: broadcast::Sender<InterventionEvent>,
    this: Weak<InterventionHub>,
}

impl InterventionHub {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Self::with_history_cap(ttl, DEFAULT_HISTORY_CAP)
    }

    pub fn with_history_cap(ttl: Duration, history_cap: usize) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new_cyclic(|this| Self {
            users: DashMap::new(),
            ttl,
            history_cap: history_cap.max(1),
            seen_cap: history_cap.max(SEEN_IDS_CAP),
            events,
            this: this.clone(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InterventionEvent> {
        self.events.subscribe()
    }

    pub fn ingest(&self, user_id: &str, mut iv: Intervention) -> IngestOutcome {
        let mut slot = self.users.entry(user_id.to_string()).or_default();
        if slot.seen.contains(&iv.id) {
            debug!(target: "intervention", user_id, id = %iv.id, "duplicate ingress ignored");
            return IngestOutcome::Duplicate;
        }

        let mut superseded = None;
        if let Some(prev) = slot.active.take() {
            if let Some(timer) = prev.timer {
                timer.abort();
            }
            if let Some(rec) = slot.record_mut(&prev.id) {
                rec.status = Status::Superseded;
                rec.closed_at = Some(Utc::now());
                let rec = rec.clone();
                self.emit(EventKind::Superseded, user_id, rec);
            }
            superseded = Some(prev.id);
        }

        iv.status = Status::Pending;
        iv.used_at = None;
        iv.closed_at = None;
        slot.seen.insert(&iv.id, self.seen_cap);
        slot.history.push_back(iv.clone());
        while slot.history.len() > self.history_cap {
            slot.history.pop_front();
        }
        slot.active = Some(Active {
            id: iv.id.clone(),
            timer: self.schedule_expiry(user_id, &iv.id),
        });

        info!(
            target: "intervention",
            user_id,
            id = %iv.id,
            superseded = superseded.as_deref().unwrap_or("-"),
            "intervention pending"
        );
        self.emit(EventKind::Activated, user_id, iv);
        IngestOutcome::Activated { superseded }
    }

    /// Mark `id` used if it is the active one. Anything else is a no-op.
    pub fn consume(&self, user_id: &str, id: &str) -> ConsumeOutcome {
        let Some(mut slot) = self.users.get_mut(user_id) else {
            return ConsumeOutcome::NotActive;
        };
        if !slot.active.as_ref().is_some_and(|a| a.id == id) {
            debug!(target: "intervention", user_id, id, "consume ignored: not active");
            return ConsumeOutcome::NotActive;
        }
        if let Some(timer) = slot.active.take().and_then(|a| a.timer) {
            timer.abort();
        }

        let Some(rec) = slot.record_mut(id) else {
            return ConsumeOutcome::NotActive;
        };
        let now = Utc::now();
        rec.status = Status::Used;
        rec.used_at = Some(now);
        rec.closed_at = Some(now);
        let rec = rec.clone();
        info!(target: "intervention", user_id, id, "intervention used");
        self.emit(EventKind::Used, user_id, rec.clone());
        ConsumeOutcome::Consumed(rec)
    }

    /// Expiry transition; acts only while the active slot still holds `id`.
    pub fn expire(&self, user_id: &str, id: &str) -> bool {
        let Some(mut slot) = self.users.get_mut(user_id) else {
            return false;
        };
        if !slot.active.as_ref().is_some_and(|a| a.id == id) {
            return false;
        }
        slot.active = None;
        if let Some(rec) = slot.record_mut(id) {
            rec.status = Status::Expired;
            rec.closed_at = Some(Utc::now());
            let rec = rec.clone();
            self.emit(EventKind::Expired, user_id, rec);
        }
        info!(target: "intervention", user_id, id, "intervention expired");
        true
    }

    pub fn pending_id(&self, user_id: &str) -> Option<String> {
        self.users
            .get(user_id)
            .and_then(|slot| slot.active.as_ref().map(|a| a.id.clone()))
    }

    pub fn pending(&self, user_id: &str) -> Option<Intervention> {
        let slot = self.users.get(user_id)?;
        let id = &slot.active.as_ref()?.id;
        slot.history.iter().rev().find(|iv| &iv.id == id).cloned()
    }

    /// Known interventions for `user_id`, oldest first.
    pub fn history(&self, user_id: &str) -> Vec<Intervention> {
        self.users
            .get(user_id)
            .map(|slot| slot.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn schedule_expiry(&self, user_id: &str, id: &str) -> Option<AbortHandle> {
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            debug!(target: "intervention", id, "no runtime; expiry timer not scheduled");
            return None;
        };
        let hub = self.this.clone();
        let (user_id, id, ttl) = (user_id.to_string(), id.to_string(), self.ttl);
        let task = rt.spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(hub) = hub.upgrade() {
                hub.expire(&user_id, &id);
            }
        });
        Some(task.abort_handle())
    }

    fn emit(&self, kind: EventKind, user_id: &str, intervention: Intervention) {
        counter!("interventions_total", "kind" => kind.as_str()).increment(1);
        // no subscribers is fine
        let _ = self.events.send(InterventionEvent {
            kind,
            user_id: user_id.to_string(),
            intervention,
        });
    }
}

//! Intervention delivery: ingress from the automation system, one active slot per user,
//! consumption by the chat UI and automatic expiry.

pub mod hub;
pub mod model;

pub use hub::{ConsumeOutcome, IngestOutcome, InterventionHub, DEFAULT_TTL};
pub use model::{EventKind, Intervention, InterventionEvent, Status};

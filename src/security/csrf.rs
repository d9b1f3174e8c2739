//! CSRF tokens bound to a client session id.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use super::crypto::{constant_time_eq, generate_token};

const TOKEN_BYTES: usize = 32;

pub struct CsrfStore {
    tokens: Mutex<LruCache<String, String>>,
}

impl CsrfStore {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            tokens: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Issue (or rotate) the token for `session_id`.
    pub fn issue(&self, session_id: &str) -> String {
        let token = generate_token(TOKEN_BYTES);
        self.tokens.lock().put(session_id.to_string(), token.clone());
        token
    }

    /// Fails closed on any missing piece.
    pub fn verify(&self, session_id: Option<&str>, presented: Option<&str>) -> bool {
        let (Some(session_id), Some(presented)) = (session_id, presented) else {
            return false;
        };
        let expected = self.tokens.lock().get(session_id).cloned();
        match expected {
            Some(expected) => verify_token(presented, &expected),
            None => false,
        }
    }
}

/// Constant-time token comparison; malformed tokens never match.
pub fn verify_token(presented: &str, expected: &str) -> bool {
    if presented.is_empty()
        || expected.is_empty()
        || !presented.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return false;
    }
    constant_time_eq(presented.as_bytes(), expected.as_bytes())
}

//! # Rate Limiter
//! Per-client sliding window admission.
//!
//! Each client identity owns an ordered queue of admission instants. On every check the
//! queue is pruned of entries older than `now - window`; the request is admitted iff the
//! remaining length is below `max_requests`. Denied requests never occupy a slot.
//!
//! Windows are spread over a fixed number of shards, each an LRU map, so a flood of
//! distinct clients cannot grow memory past `max_clients` and one busy client only
//! contends with the clients hashed to the same shard.

use std::{
    collections::hash_map::DefaultHasher,
    collections::VecDeque,
    hash::{Hash, Hasher},
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::RateLimitSettings;

const SHARDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow { remaining: usize },
    Deny { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow { .. })
    }
}

pub struct RateLimiter {
    shards: Vec<Mutex<LruCache<String, VecDeque<Instant>>>>,
    window: Duration,
    max_requests: usize,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize, max_clients: usize) -> Self {
        let per_shard = (max_clients.max(1)).div_ceil(SHARDS);
        let cap = NonZeroUsize::new(per_shard).unwrap_or(NonZeroUsize::MIN);
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(LruCache::new(cap))).collect(),
            window,
            max_requests: max_requests.max(1),
        }
    }

    pub fn from_settings(s: &RateLimitSettings) -> Self {
        Self::new(
            Duration::from_millis(s.window_ms),
            s.max_requests,
            s.max_clients,
        )
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    fn shard_for(&self, client_id: &str) -> &Mutex<LruCache<String, VecDeque<Instant>>> {
        let mut h = DefaultHasher::new();
        client_id.hash(&mut h);
        &self.shards[(h.finish() as usize) % SHARDS]
    }

    /// Decide whether `client_id` may issue a request at `now`, recording it if so.
    pub fn admit(&self, client_id: &str, now: Instant) -> Admission {
        let mut shard = self.shard_for(client_id).lock();
        let buf = shard.get_or_insert_mut(client_id.to_string(), VecDeque::new);
        prune(buf, now, self.window);

        if buf.len() >= self.max_requests {
            let retry_after = buf
                .front()
                .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
                .unwrap_or(self.window);
            return Admission::Deny { retry_after };
        }

        buf.push_back(now);
        Admission::Allow {
            remaining: self.max_requests - buf.len(),
        }
    }

    /// Drop windows with no admissions younger than the window length.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let idle: Vec<String> = shard
                .iter_mut()
                .filter_map(|(k, buf)| {
                    prune(buf, now, self.window);
                    buf.is_empty().then(|| k.clone())
                })
                .collect();
            for k in idle {
                shard.pop(&k);
                removed += 1;
            }
        }
        removed
    }

    /// Number of client windows currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

fn prune(buf: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&t) = buf.front() {
        if now.saturating_duration_since(t) >= window {
            buf.pop_front();
        } else {
            break;
        }
    }
}

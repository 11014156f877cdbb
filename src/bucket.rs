//! Per-bucket rate-limit windows.
//!
//! The table is owned by the scheduler and mutated from one task only; nothing here is
//! synchronized. All operations take the current [`Instant`] explicitly.
//!
//! Keys start out on a private window. Once the server names the bucket a key belongs to (via
//! `X-RateLimit-Bucket`), the key is moved onto the window shared by every key with the same
//! bucket hash and major parameter.

use crate::route::BucketKey;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Rate-limit state of one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    limit: u32,
    remaining: u32,
    reset_at: Instant,
    period: Duration,
}

impl Bucket {
    /// Optimistic state for a window nothing is known about: one call, refreshable now.
    fn optimistic(now: Instant) -> Self {
        Self { limit: 1, remaining: 1, reset_at: now, period: Duration::ZERO }
    }

    /// Window capacity.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Calls left before `reset_at`.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// When the window refreshes.
    pub fn reset_at(&self) -> Instant {
        self.reset_at
    }

    /// Last observed window length.
    pub fn period(&self) -> Duration {
        self.period
    }
}

/// Read-only view of a key's window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSnapshot {
    /// Key the snapshot was taken for.
    pub key: BucketKey,
    /// Server bucket hash, once known.
    pub server_bucket: Option<String>,
    /// Window capacity.
    pub limit: u32,
    /// Calls left.
    pub remaining: u32,
    /// When the window refreshes.
    pub reset_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum StateId {
    Local(BucketKey),
    Server { hash: String, major: Option<String> },
}

/// Every known window, indexed by bucket key.
#[derive(Debug, Default)]
pub struct BucketTable {
    states: HashMap<StateId, Bucket>,
    keys: HashMap<BucketKey, StateId>,
}

impl BucketTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct windows.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no window exists yet.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn state_id(&mut self, key: &BucketKey) -> StateId {
        self.keys.entry(key.clone()).or_insert_with(|| StateId::Local(key.clone())).clone()
    }

    fn bucket_mut(&mut self, key: &BucketKey, now: Instant) -> &mut Bucket {
        let id = self.state_id(key);
        self.states.entry(id).or_insert_with(|| Bucket::optimistic(now))
    }

    /// Window for `key`, created lazily.
    pub fn get_or_create(&mut self, key: &BucketKey, now: Instant) -> &Bucket {
        self.bucket_mut(key, now)
    }

    /// Window for `key`, if one exists.
    pub fn get(&self, key: &BucketKey) -> Option<&Bucket> {
        self.keys.get(key).and_then(|id| self.states.get(id))
    }

    /// Whether a call may be made for `key` at `now`.
    ///
    /// An expired window is refreshed speculatively to `limit` calls; the next response corrects
    /// the guess.
    pub fn has_capacity(&mut self, key: &BucketKey, now: Instant) -> bool {
        let bucket = self.bucket_mut(key, now);
        if bucket.remaining > 0 {
            return true;
        }
        if now >= bucket.reset_at {
            bucket.remaining = bucket.limit.max(1);
            bucket.reset_at = bucket.reset_at.max(now) + bucket.period;
            return true;
        }
        false
    }

    /// Spend one call. Only valid after [`has_capacity`](Self::has_capacity) returned `true`.
    pub fn consume(&mut self, key: &BucketKey, now: Instant) {
        let bucket = self.bucket_mut(key, now);
        debug_assert!(bucket.remaining > 0, "consume without capacity on {key}");
        bucket.remaining = bucket.remaining.saturating_sub(1);
    }

    /// Overwrite the window with what the server reported.
    pub fn update_from_headers(
        &mut self,
        key: &BucketKey,
        limit: u32,
        remaining: u32,
        reset_after: Duration,
        now: Instant,
    ) {
        let bucket = self.bucket_mut(key, now);
        bucket.limit = limit;
        bucket.remaining = remaining;
        bucket.reset_at = now + reset_after;
        if remaining.saturating_add(1) >= limit || bucket.period.is_zero() {
            // a fresh window reports (close to) its full length
            bucket.period = reset_after;
        }
    }

    /// Hold `key` until `until`: the server rejected a call on this bucket.
    pub fn defer(&mut self, key: &BucketKey, until: Instant, now: Instant) {
        let bucket = self.bucket_mut(key, now);
        bucket.remaining = 0;
        bucket.reset_at = bucket.reset_at.max(until);
    }

    /// Record that `key` belongs to the server bucket `hash`.
    ///
    /// Keys sharing a hash and major parameter share one window from here on. The first key to be
    /// linked carries its local state over.
    pub fn link(&mut self, key: &BucketKey, hash: &str, now: Instant) {
        let target =
            StateId::Server { hash: hash.to_string(), major: key.major_parameter().map(str::to_string) };
        let current = self.state_id(key);
        if current == target {
            return;
        }

        let previous = match &current {
            StateId::Local(_) => self.states.remove(&current),
            StateId::Server { .. } => None,
        };
        if !self.states.contains_key(&target) {
            let bucket = previous.unwrap_or_else(|| Bucket::optimistic(now));
            self.states.insert(target.clone(), bucket);
        }
        tracing::debug!(key = %key, bucket = hash, "linked bucket key to server bucket");
        self.keys.insert(key.clone(), target);
    }

    /// Server bucket hash `key` is linked to.
    pub fn server_bucket(&self, key: &BucketKey) -> Option<&str> {
        match self.keys.get(key)? {
            StateId::Server { hash, .. } => Some(hash),
            StateId::Local(_) => None,
        }
    }

    /// Inspection view of `key`'s window.
    pub fn snapshot(&self, key: &BucketKey) -> Option<BucketSnapshot> {
        let bucket = self.get(key)?;
        Some(BucketSnapshot {
            key: key.clone(),
            server_bucket: self.server_bucket(key).map(str::to_string),
            limit: bucket.limit,
            remaining: bucket.remaining,
            reset_at: bucket.reset_at,
        })
    }
}

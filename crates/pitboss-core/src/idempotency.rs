//! Replay cache for idempotency keys.
//!
//! Entries are keyed by tenant `(game, env)`, caller, dispatch mode,
//! function id, descriptor version, and the caller's key, so tenants and
//! functions never share a key space and a version bump never serves a
//! stale result. Each entry remembers a digest of the request payload: a
//! replay with the same payload gets the cached bytes, a replay with a
//! different payload is a `Conflict`.
//!
//! While the first call for a key runs, the key is reserved. Later calls
//! with the same key wait for it and then read its result; when it fails
//! the reservation is released and the next waiter runs the call itself.
//!
//! Eviction is by age (`ttl`) and by count (`capacity`, least recently used
//! first).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::debug;

use pitboss_contracts::approval::ApprovalMode;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub mode: ApprovalMode,
    pub function_id: String,
    pub version: String,
    pub game_id: String,
    pub env: String,
    pub caller: String,
    pub key: String,
}

impl IdempotencyKey {
    pub fn new(
        mode: ApprovalMode,
        function_id: impl Into<String>,
        version: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            mode,
            function_id: function_id.into(),
            version: version.into(),
            game_id: String::new(),
            env: String::new(),
            caller: String::new(),
            key: key.into(),
        }
    }

    /// Narrow the key to one tenant and caller.
    pub fn for_tenant(mut self, game_id: &str, env: &str, caller: &str) -> Self {
        self.game_id = game_id.to_string();
        self.env = env.to_string();
        self.caller = caller.to_string();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Miss,
    Hit(Vec<u8>),
    /// The key was used before with a different payload.
    Conflict,
}

/// The outcome of [`IdempotencyCache::claim`].
pub enum Claim<'a> {
    Hit(Vec<u8>),
    Conflict,
    /// The caller owns the key until it completes or drops the reservation.
    Reserved(Reservation<'a>),
}

struct Entry {
    digest: [u8; 32],
    result: Vec<u8>,
    stored_at: Instant,
    /// Position in the recency index.
    tick: u64,
}

struct InFlight {
    digest: [u8; 32],
    token: u64,
    /// Dropped when the reservation ends, which wakes every waiter.
    _done: watch::Sender<()>,
    waiters: watch::Receiver<()>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<IdempotencyKey, Entry>,
    /// `tick -> key`, least recent first.
    recency: BTreeMap<u64, IdempotencyKey>,
    in_flight: HashMap<IdempotencyKey, InFlight>,
    clock: u64,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, key: &IdempotencyKey) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, key.clone());
        }
    }

    fn remove(&mut self, key: &IdempotencyKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.recency.remove(&entry.tick);
        }
    }

    fn lookup(&mut self, key: &IdempotencyKey, digest: &[u8; 32], now: Instant, ttl: Duration) -> Lookup {
        let (expired, same_payload, result) = match self.entries.get(key) {
            None => return Lookup::Miss,
            Some(entry) => (
                now.saturating_duration_since(entry.stored_at) > ttl,
                entry.digest == *digest,
                entry.result.clone(),
            ),
        };
        if expired {
            self.remove(key);
            return Lookup::Miss;
        }
        if !same_payload {
            return Lookup::Conflict;
        }
        self.touch(key);
        debug!(function_id = %key.function_id, "idempotency replay served from cache");
        Lookup::Hit(result)
    }

    fn insert(&mut self, key: IdempotencyKey, digest: [u8; 32], result: Vec<u8>, now: Instant, capacity: usize) {
        self.remove(&key);
        let tick = self.next_tick();
        self.recency.insert(tick, key.clone());
        self.entries.insert(key, Entry { digest, result, stored_at: now, tick });
        while self.entries.len() > capacity {
            let Some((_, oldest)) = self.recency.pop_first() else { break };
            self.entries.remove(&oldest);
        }
    }

    fn release(&mut self, key: &IdempotencyKey, token: u64) {
        if self.in_flight.get(key).is_some_and(|f| f.token == token) {
            self.in_flight.remove(key);
        }
    }
}

pub struct IdempotencyCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<CacheState>,
}

impl IdempotencyCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self { ttl, capacity: capacity.max(1), inner: Mutex::new(CacheState::default()) }
    }

    pub fn lookup(&self, key: &IdempotencyKey, payload: &[u8]) -> Lookup {
        self.lookup_at(key, payload, Instant::now())
    }

    pub fn lookup_at(&self, key: &IdempotencyKey, payload: &[u8], now: Instant) -> Lookup {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.lookup(key, &digest(payload), now, self.ttl)
    }

    pub fn store(&self, key: IdempotencyKey, payload: &[u8], result: Vec<u8>) {
        self.store_at(key, payload, result, Instant::now())
    }

    pub fn store_at(&self, key: IdempotencyKey, payload: &[u8], result: Vec<u8>, now: Instant) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.insert(key, digest(payload), result, now, self.capacity);
    }

    /// Serve a replay, or reserve the key for a first call. A call already
    /// running under the same key and payload is waited for.
    pub async fn claim(&self, key: &IdempotencyKey, payload: &[u8]) -> Claim<'_> {
        let digest = digest(payload);
        loop {
            let mut waiter = {
                let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
                match state.lookup(key, &digest, Instant::now(), self.ttl) {
                    Lookup::Hit(result) => return Claim::Hit(result),
                    Lookup::Conflict => return Claim::Conflict,
                    Lookup::Miss => {}
                }
                match state.in_flight.get(key) {
                    Some(running) if running.digest != digest => return Claim::Conflict,
                    Some(running) => running.waiters.clone(),
                    None => {
                        let token = state.next_tick();
                        let (done, waiters) = watch::channel(());
                        state.in_flight.insert(key.clone(), InFlight { digest, token, _done: done, waiters });
                        return Claim::Reserved(Reservation {
                            cache: self,
                            key: key.clone(),
                            digest,
                            token,
                            finished: false,
                        });
                    }
                }
            };
            debug!(function_id = %key.function_id, "waiting on an in-flight call with the same idempotency key");
            // Errors once the owner's sender is dropped, which is the signal.
            let _ = waiter.changed().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).in_flight.len()
    }
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL, Self::DEFAULT_CAPACITY)
    }
}

/// Exclusive use of one idempotency key. Dropping it without `complete`
/// releases the key uncached.
pub struct Reservation<'a> {
    cache: &'a IdempotencyCache,
    key: IdempotencyKey,
    digest: [u8; 32],
    token: u64,
    finished: bool,
}

impl Reservation<'_> {
    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    /// Cache `result` and wake the waiters.
    pub fn complete(mut self, result: Vec<u8>) {
        let mut state = self.cache.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.insert(self.key.clone(), self.digest, result, Instant::now(), self.cache.capacity);
        state.release(&self.key, self.token);
        self.finished = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self.cache.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.release(&self.key, self.token);
        debug!(function_id = %self.key.function_id, "idempotency reservation released without a result");
    }
}

fn digest(payload: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(payload));
    out
}

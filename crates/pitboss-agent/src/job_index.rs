//! `job_id -> instance address`, so cancel and stream calls reach the
//! instance that started the job.
//!
//! Entries are best effort: a restart forgets them and a failed cancel
//! leaves them in place. A job is unmapped when its stream delivers a
//! `done` or `error` frame, when it is cancelled, or once it is older than
//! the index's maximum age.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

pub const DEFAULT_MAX_JOB_AGE: Duration = Duration::from_secs(24 * 60 * 60);

struct Mapping {
    addr: String,
    recorded_at: Instant,
}

pub struct JobIndex {
    max_age: Duration,
    inner: RwLock<HashMap<String, Mapping>>,
}

impl Default for JobIndex {
    fn default() -> Self {
        Self::with_max_age(DEFAULT_MAX_JOB_AGE)
    }
}

impl JobIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_age(max_age: Duration) -> Self {
        Self { max_age, inner: RwLock::new(HashMap::new()) }
    }

    /// Remember where `job_id` runs. Empty ids are ignored.
    pub fn record(&self, job_id: &str, addr: &str) -> bool {
        self.record_at(job_id, addr, Instant::now())
    }

    /// Also drops mappings older than the maximum age.
    pub fn record_at(&self, job_id: &str, addr: &str, now: Instant) -> bool {
        if job_id.is_empty() || addr.is_empty() {
            return false;
        }
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = inner.len();
        inner.retain(|_, m| now.saturating_duration_since(m.recorded_at) <= self.max_age);
        if inner.len() < before {
            debug!(dropped = before - inner.len(), "stale job mappings dropped");
        }
        inner.insert(job_id.to_string(), Mapping { addr: addr.to_string(), recorded_at: now });
        debug!(job_id, addr, "job mapped");
        true
    }

    pub fn get(&self, job_id: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .map(|m| m.addr.clone())
    }

    pub fn remove(&self, job_id: &str) -> Option<String> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id)
            .map(|m| m.addr)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::JobIndex;

    #[test]
    fn record_get_remove() {
        let index = JobIndex::new();
        assert!(index.record("j42", "127.0.0.1:20100"));
        assert_eq!(index.get("j42").as_deref(), Some("127.0.0.1:20100"));
        assert_eq!(index.remove("j42").as_deref(), Some("127.0.0.1:20100"));
        assert!(index.get("j42").is_none());
        assert!(index.remove("j42").is_none());
    }

    #[test]
    fn empty_job_ids_are_refused() {
        let index = JobIndex::new();
        assert!(!index.record("", "127.0.0.1:20100"));
        assert!(index.is_empty());
    }

    #[test]
    fn old_mappings_age_out_on_the_next_record() {
        let index = JobIndex::with_max_age(Duration::from_secs(60));
        let t0 = Instant::now();
        index.record_at("j1", "127.0.0.1:20100", t0);
        index.record_at("j2", "127.0.0.1:20100", t0 + Duration::from_secs(30));
        index.record_at("j3", "127.0.0.1:20100", t0 + Duration::from_secs(61));

        assert!(index.get("j1").is_none());
        assert!(index.get("j2").is_some());
        assert_eq!(index.len(), 2);
    }
}

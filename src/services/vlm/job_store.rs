//! In-process VLM job result store.
//!
//! Completion can arrive by webhook (the handler writes here) or by polling
//! (the client writes here after a successful poll) - whichever wins first.
//! Entries expire after a TTL so abandoned jobs don't accumulate.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::models::VlmResult;

const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
enum StoredJob {
    Pending,
    Result(Box<VlmResult>),
    Error(String),
}

struct Entry {
    job: StoredJob,
    stored_at: Instant,
}

pub struct VlmJobStore {
    entries: DashMap<String, Entry>,
    ttl: Duration,
}

impl Default for VlmJobStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl VlmJobStore {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: DashMap::new(), ttl }
    }

    pub fn mark_pending(&self, job_id: &str) {
        self.entries
            .insert(job_id.to_string(), Entry { job: StoredJob::Pending, stored_at: Instant::now() });
    }

    pub fn store_result(&self, job_id: &str, result: VlmResult) {
        self.entries.insert(
            job_id.to_string(),
            Entry { job: StoredJob::Result(Box::new(result)), stored_at: Instant::now() },
        );
    }

    pub fn store_error(&self, job_id: &str, error: impl Into<String>) {
        self.entries.insert(
            job_id.to_string(),
            Entry { job: StoredJob::Error(error.into()), stored_at: Instant::now() },
        );
    }

    pub fn get_result(&self, job_id: &str) -> Option<VlmResult> {
        let entry = self.entries.get(job_id)?;
        if entry.stored_at.elapsed() > self.ttl {
            return None;
        }
        match &entry.job {
            StoredJob::Result(result) => Some((**result).clone()),
            _ => None,
        }
    }

    pub fn get_error(&self, job_id: &str) -> Option<String> {
        let entry = self.entries.get(job_id)?;
        if entry.stored_at.elapsed() > self.ttl {
            return None;
        }
        match &entry.job {
            StoredJob::Error(error) => Some(error.clone()),
            _ => None,
        }
    }

    /// Drop expired entries; called opportunistically from the webhook handler
    pub fn purge_expired(&self) {
        self.entries.retain(|_, entry| entry.stored_at.elapsed() <= self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_roundtrip() {
        let store = VlmJobStore::default();
        store.mark_pending("job-1");
        assert!(store.get_result("job-1").is_none());
        assert!(store.get_error("job-1").is_none());

        store.store_result(
            "job-1",
            VlmResult { defect_type: Some("披锋".into()), ..VlmResult::default() },
        );
        assert_eq!(store.get_result("job-1").unwrap().defect_type.as_deref(), Some("披锋"));
    }

    #[test]
    fn error_replaces_pending() {
        let store = VlmJobStore::default();
        store.mark_pending("job-2");
        store.store_error("job-2", "model overloaded");
        assert_eq!(store.get_error("job-2").as_deref(), Some("model overloaded"));
        assert!(store.get_result("job-2").is_none());
    }

    #[test]
    fn expired_entries_are_invisible_and_purgeable() {
        let store = VlmJobStore::new(Duration::from_millis(0));
        store.store_result("job-3", VlmResult::default());
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get_result("job-3").is_none());
        store.purge_expired();
        assert!(store.is_empty());
    }
}

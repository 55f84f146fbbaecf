//! `FailureTracker` entries (spec §3), keyed by `(model, group)`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const BLOCK_THRESHOLD: u32 = 3;
const BLOCK_WINDOW: Duration = Duration::from_secs(5 * 60);
const PRUNE_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy)]
struct Entry {
    failure_count: u32,
    last_failure: Instant,
}

/// Guarded by a single mutex; critical sections are O(candidate groups).
pub struct FailureTracker {
    entries: Mutex<HashMap<(String, String), Entry>>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn report_failure(&self, model: &str, group_id: &str) {
        let mut entries = self.entries.lock().expect("failure tracker lock poisoned");
        let now = Instant::now();
        entries.retain(|_, entry| now.duration_since(entry.last_failure) < PRUNE_AGE);
        let key = (model.to_string(), group_id.to_string());
        let entry = entries.entry(key).or_insert(Entry {
            failure_count: 0,
            last_failure: now,
        });
        entry.failure_count += 1;
        entry.last_failure = now;
    }

    pub fn report_success(&self, model: &str, group_id: &str) {
        let mut entries = self.entries.lock().expect("failure tracker lock poisoned");
        entries.remove(&(model.to_string(), group_id.to_string()));
    }

    /// True while the group is within its 5-minute block window for this model.
    pub fn is_blocked(&self, model: &str, group_id: &str) -> bool {
        let entries = self.entries.lock().expect("failure tracker lock poisoned");
        match entries.get(&(model.to_string(), group_id.to_string())) {
            Some(entry) => {
                entry.failure_count >= BLOCK_THRESHOLD
                    && Instant::now().duration_since(entry.last_failure) < BLOCK_WINDOW
            }
            None => false,
        }
    }

    /// `(failure_count, last_failure)` used by the router to order candidates
    /// by ascending failure count, ties broken by older last-failure time.
    pub fn ordering_key(&self, model: &str, group_id: &str) -> (u32, Instant) {
        let entries = self.entries.lock().expect("failure tracker lock poisoned");
        match entries.get(&(model.to_string(), group_id.to_string())) {
            Some(entry) => (entry.failure_count, entry.last_failure),
            None => (0, Instant::now() - PRUNE_AGE),
        }
    }
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_failures_block_for_the_window() {
        let tracker = FailureTracker::new();
        tracker.report_failure("gpt-4o-mini", "g1");
        tracker.report_failure("gpt-4o-mini", "g1");
        assert!(!tracker.is_blocked("gpt-4o-mini", "g1"));
        tracker.report_failure("gpt-4o-mini", "g1");
        assert!(tracker.is_blocked("gpt-4o-mini", "g1"));
    }

    #[test]
    fn success_resets_the_entry() {
        let tracker = FailureTracker::new();
        for _ in 0..3 {
            tracker.report_failure("gpt-4o-mini", "g1");
        }
        assert!(tracker.is_blocked("gpt-4o-mini", "g1"));
        tracker.report_success("gpt-4o-mini", "g1");
        assert!(!tracker.is_blocked("gpt-4o-mini", "g1"));
    }

    #[test]
    fn unseen_pairs_are_never_blocked() {
        let tracker = FailureTracker::new();
        assert!(!tracker.is_blocked("gpt-4o-mini", "g1"));
    }
}

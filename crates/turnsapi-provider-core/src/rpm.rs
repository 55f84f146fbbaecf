//! Per-group sliding-window RPM limiter (spec §4.3).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Default)]
struct GroupWindow {
    limit: Option<u32>,
    timestamps: VecDeque<Instant>,
}

#[derive(Debug, Clone, Default)]
pub struct RpmStats {
    pub limit: Option<u32>,
    pub current: usize,
}

/// One lock per group's timestamp sequence, as the group count is small and
/// operations are O(window size).
pub struct RpmLimiter {
    groups: Mutex<HashMap<String, GroupWindow>>,
}

impl RpmLimiter {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_limit(&self, group_id: &str, limit: Option<u32>) {
        let mut groups = self.groups.lock().expect("rpm limiter lock poisoned");
        groups.entry(group_id.to_string()).or_default().limit = limit;
    }

    pub fn remove_limit(&self, group_id: &str) {
        self.set_limit(group_id, None);
    }

    pub fn update_limits(&self, limits: &HashMap<String, Option<u32>>) {
        for (group_id, limit) in limits {
            self.set_limit(group_id, *limit);
        }
    }

    /// Admits the call if under the group's limit; unconditional when unset.
    pub fn allow(&self, group_id: &str) -> bool {
        let mut groups = self.groups.lock().expect("rpm limiter lock poisoned");
        let window = groups.entry(group_id.to_string()).or_default();
        let Some(limit) = window.limit else {
            return true;
        };
        let now = Instant::now();
        while let Some(&front) = window.timestamps.front() {
            if now.duration_since(front) >= WINDOW {
                window.timestamps.pop_front();
            } else {
                break;
            }
        }
        if window.timestamps.len() as u32 >= limit {
            return false;
        }
        window.timestamps.push_back(now);
        true
    }

    pub fn get_all_stats(&self) -> HashMap<String, RpmStats> {
        let groups = self.groups.lock().expect("rpm limiter lock poisoned");
        groups
            .iter()
            .map(|(group_id, window)| {
                (
                    group_id.clone(),
                    RpmStats {
                        limit: window.limit,
                        current: window.timestamps.len(),
                    },
                )
            })
            .collect()
    }
}

impl Default for RpmLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_group_always_admits() {
        let limiter = RpmLimiter::new();
        for _ in 0..1000 {
            assert!(limiter.allow("g1"));
        }
    }

    #[test]
    fn limit_is_enforced_within_the_window() {
        let limiter = RpmLimiter::new();
        limiter.set_limit("g1", Some(2));
        assert!(limiter.allow("g1"));
        assert!(limiter.allow("g1"));
        assert!(!limiter.allow("g1"));
    }

    #[test]
    fn removing_the_limit_admits_unconditionally_again() {
        let limiter = RpmLimiter::new();
        limiter.set_limit("g1", Some(1));
        assert!(limiter.allow("g1"));
        assert!(!limiter.allow("g1"));
        limiter.remove_limit("g1");
        assert!(limiter.allow("g1"));
    }
}

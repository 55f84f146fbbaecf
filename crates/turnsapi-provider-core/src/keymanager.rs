//! Group key manager (spec §4.2): per-group key rotation and health tracking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng;
use tokio::sync::RwLock;
use tokio::time::{Instant, interval};
use tracing::{info, warn};

use crate::types::{ApiKey, ApiKeyHealth, GroupId, KeyValidity, RotationStrategy};

const ERROR_THRESHOLD: u32 = 5;
const COOLDOWN: Duration = Duration::from_secs(10 * 60);
const RECOVERY_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// A key unused for at least this long gets the load-balancing nudge in
/// `priority_score` (spec §4.5's key-priority formula).
const STALE_BONUS_AGE: Duration = Duration::from_secs(60 * 60);

/// Spec §4.5: `valid=true` adds +100, `-error_count` subtracts, and a key
/// idle for over an hour gains +10. Higher sorts first; ties keep the
/// original (first-seen) order via a stable sort.
fn priority_score(key: &ApiKey, now: SystemTime) -> i64 {
    let mut score = 0i64;
    if key.health.validity == KeyValidity::Valid {
        score += 100;
    }
    score -= i64::from(key.health.error_count);
    let stale = match key.health.last_used_at {
        None => true,
        Some(last_used_at) => now
            .duration_since(last_used_at)
            .map(|age| age >= STALE_BONUS_AGE)
            .unwrap_or(true),
    };
    if stale {
        score += 10;
    }
    score
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyManagerError {
    UnknownGroup,
    NoActiveKeys,
}

struct GroupState {
    rotation: RotationStrategy,
    keys: Vec<ApiKey>,
    /// Round-robin cursor: index into `keys` of the last-served key.
    cursor: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct GroupStatus {
    pub group_id: GroupId,
    pub total_keys: usize,
    pub active_keys: usize,
}

/// Owns every group's key pool. One `GroupKeyManager` is shared across the
/// process; a background task reactivates cooled-down keys every 30s.
pub struct GroupKeyManager {
    groups: Arc<RwLock<HashMap<GroupId, GroupState>>>,
}

impl GroupKeyManager {
    pub fn new() -> Arc<Self> {
        let manager = Arc::new(Self {
            groups: Arc::new(RwLock::new(HashMap::new())),
        });
        manager.clone().spawn_recovery_sweep();
        manager
    }

    fn spawn_recovery_sweep(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = interval(RECOVERY_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let mut groups = self.groups.write().await;
                let now = SystemTime::now();
                for (group_id, state) in groups.iter_mut() {
                    for key in state.keys.iter_mut() {
                        if !key.health.active {
                            if let Some(last_error_at) = key.health.last_error_at {
                                if now
                                    .duration_since(last_error_at)
                                    .map(|age| age >= COOLDOWN)
                                    .unwrap_or(true)
                                {
                                    key.health.active = true;
                                    key.health.error_count = 0;
                                    info!(group_id, "key cooldown elapsed, reactivating");
                                }
                            }
                        }
                    }
                }
            }
        });
    }

    /// Replaces a group's configured key list. Keys that persist across the
    /// update (matched by secret) keep their health; new keys start healthy.
    pub async fn update_group_config(
        &self,
        group_id: &str,
        rotation: RotationStrategy,
        secrets: Option<&[String]>,
    ) {
        let mut groups = self.groups.write().await;
        let Some(secrets) = secrets else {
            groups.remove(group_id);
            return;
        };
        let previous_health: HashMap<String, ApiKeyHealth> = groups
            .get(group_id)
            .map(|state| {
                state
                    .keys
                    .iter()
                    .map(|k| (k.secret.clone(), k.health.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let keys = secrets
            .iter()
            .enumerate()
            .map(|(order, secret)| ApiKey {
                group_id: group_id.to_string(),
                order,
                secret: secret.clone(),
                health: previous_health
                    .get(secret)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();

        groups.insert(
            group_id.to_string(),
            GroupState {
                rotation,
                keys,
                cursor: None,
            },
        );
    }

    pub async fn next_key(&self, group_id: &str) -> Result<ApiKey, KeyManagerError> {
        let mut groups = self.groups.write().await;
        let state = groups.get_mut(group_id).ok_or(KeyManagerError::UnknownGroup)?;

        let active_indices: Vec<usize> = state
            .keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.health.active)
            .map(|(i, _)| i)
            .collect();
        if active_indices.is_empty() {
            return Err(KeyManagerError::NoActiveKeys);
        }

        let chosen_index = match state.rotation {
            RotationStrategy::RoundRobin => {
                let next = match state.cursor {
                    Some(last) => active_indices
                        .iter()
                        .find(|&&i| i > last)
                        .copied()
                        .unwrap_or(active_indices[0]),
                    None => active_indices[0],
                };
                next
            }
            RotationStrategy::Random => {
                let pick = rand::rng().random_range(0..active_indices.len());
                active_indices[pick]
            }
            RotationStrategy::LeastUsed => *active_indices
                .iter()
                .min_by_key(|&&i| state.keys[i].health.usage_count)
                .expect("active_indices is non-empty"),
        };

        state.cursor = Some(chosen_index);
        let key = &mut state.keys[chosen_index];
        key.health.usage_count += 1;
        key.health.last_used_at = Some(SystemTime::now());
        Ok(key.clone())
    }

    /// Returns this group's active keys ordered by spec §4.5's priority
    /// formula, highest score first. Read-only: does not touch the
    /// round-robin cursor or usage counters. Call `mark_attempt` once a
    /// returned key is actually dispatched.
    pub async fn priority_sorted_active_keys(&self, group_id: &str) -> Result<Vec<ApiKey>, KeyManagerError> {
        let groups = self.groups.read().await;
        let state = groups.get(group_id).ok_or(KeyManagerError::UnknownGroup)?;
        let now = SystemTime::now();
        let mut active: Vec<ApiKey> = state
            .keys
            .iter()
            .filter(|k| k.health.active)
            .cloned()
            .collect();
        if active.is_empty() {
            return Err(KeyManagerError::NoActiveKeys);
        }
        active.sort_by_key(|k| std::cmp::Reverse(priority_score(k, now)));
        Ok(active)
    }

    /// Bumps usage bookkeeping for a key the orchestrator is about to
    /// dispatch an attempt with (the priority walk picks keys directly
    /// rather than through `next_key`, so this replaces its usage bump).
    pub async fn mark_attempt(&self, group_id: &str, secret: &str) {
        let mut groups = self.groups.write().await;
        if let Some(state) = groups.get_mut(group_id) {
            if let Some(key) = state.keys.iter_mut().find(|k| k.secret == secret) {
                key.health.usage_count += 1;
                key.health.last_used_at = Some(SystemTime::now());
            }
        }
    }

    pub async fn report_success(&self, group_id: &str, secret: &str) {
        let mut groups = self.groups.write().await;
        if let Some(state) = groups.get_mut(group_id) {
            if let Some(key) = state.keys.iter_mut().find(|k| k.secret == secret) {
                key.health.error_count = 0;
                key.health.active = true;
                key.health.last_error = None;
                key.health.last_error_at = None;
            }
        }
    }

    pub async fn report_error(&self, group_id: &str, secret: &str, message: &str) {
        let mut groups = self.groups.write().await;
        if let Some(state) = groups.get_mut(group_id) {
            if let Some(key) = state.keys.iter_mut().find(|k| k.secret == secret) {
                key.health.error_count += 1;
                key.health.last_error = Some(message.to_string());
                key.health.last_error_at = Some(SystemTime::now());
                if key.health.error_count >= ERROR_THRESHOLD {
                    key.health.active = false;
                    warn!(group_id, error_count = key.health.error_count, "key disabled");
                }
            }
        }
    }

    pub async fn get_group_status(&self, group_id: &str) -> Option<GroupStatus> {
        let groups = self.groups.read().await;
        groups.get(group_id).map(|state| GroupStatus {
            group_id: group_id.to_string(),
            total_keys: state.keys.len(),
            active_keys: state.keys.iter().filter(|k| k.health.active).count(),
        })
    }

    /// Maps every candidate key to the set of group ids it currently appears in.
    pub async fn check_duplication(
        &self,
        candidate_keys: &[String],
    ) -> HashMap<String, Vec<GroupId>> {
        let groups = self.groups.read().await;
        let mut result: HashMap<String, Vec<GroupId>> = HashMap::new();
        for secret in candidate_keys {
            let mut owners = Vec::new();
            for (group_id, state) in groups.iter() {
                if state.keys.iter().any(|k| &k.secret == secret) {
                    owners.push(group_id.clone());
                }
            }
            result.insert(secret.clone(), owners);
        }
        result
    }

    /// Splits `candidates` into accepted keys, keys duplicated within the
    /// same group, and keys duplicated into other groups.
    pub async fn validate_keys_for_group(
        &self,
        group_id: &str,
        candidates: &[String],
    ) -> (Vec<String>, Vec<String>, Vec<String>) {
        let groups = self.groups.read().await;
        let mut accepted = Vec::new();
        let mut internal_dupes = Vec::new();
        let mut cross_group_dupes = Vec::new();
        let mut seen_internally = std::collections::HashSet::new();

        for secret in candidates {
            if !seen_internally.insert(secret.clone()) {
                internal_dupes.push(secret.clone());
                continue;
            }
            let owned_elsewhere = groups
                .iter()
                .any(|(gid, state)| gid != group_id && state.keys.iter().any(|k| &k.secret == secret));
            if owned_elsewhere {
                cross_group_dupes.push(secret.clone());
            }
            accepted.push(secret.clone());
        }
        (accepted, internal_dupes, cross_group_dupes)
    }
}

//! Per-entity cooldown tracking after consecutive failures
//!
//! Hammering a failing endpoint wastes quota and can get an account blocked.
//! The tracker records consecutive failures per entity and imposes a stepped
//! waiting period before that entity becomes eligible again:
//!
//! | consecutive failures | cooldown |
//! |---|---|
//! | 1 | 60 s |
//! | 2 | 5 min |
//! | 3 | 15 min |
//! | 4 | 1 h |
//! | 5+ | 1 day |
//!
//! State is optionally persisted as a JSON map; losing the file degrades
//! politeness, never correctness. Deadlines are wall-clock so they survive
//! restarts.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cooldown schedule in seconds: 1m, 5m, 15m, 1h, 1d
pub const COOLDOWN_SCHEDULE: [u64; 5] = [60, 300, 900, 3600, 86400];

/// Tracked state for a single entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownState {
    pub entity_id: String,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_failures: u64,
    #[serde(default)]
    pub total_successes: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl CooldownState {
    fn new(entity_id: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            consecutive_failures: 0,
            last_failure_at: None,
            last_success_at: None,
            cooldown_until: None,
            total_failures: 0,
            total_successes: 0,
            last_error: None,
        }
    }

    /// Is the entity currently cooling down?
    pub fn is_in_cooldown(&self) -> bool {
        match self.cooldown_until {
            Some(until) => Utc::now() < until,
            None => false,
        }
    }

    /// Remaining cooldown, zero when eligible
    pub fn remaining_cooldown(&self) -> Duration {
        match self.cooldown_until {
            Some(until) => {
                let remaining = until - Utc::now();
                remaining.to_std().unwrap_or(Duration::ZERO)
            }
            None => Duration::ZERO,
        }
    }
}

/// Aggregate view across all tracked entities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CooldownStats {
    pub total_entities: usize,
    pub in_cooldown: usize,
    pub available: usize,
    pub total_failures: u64,
    pub total_successes: u64,
}

/// Tracks cooldown periods for entities after failures.
///
/// Entities are identified by string keys (job uuid, model name, API host).
/// All methods are safe to call from concurrent tasks.
pub struct CooldownTracker {
    name: String,
    persist_path: Option<PathBuf>,
    states: Mutex<HashMap<String, CooldownState>>,
}

impl CooldownTracker {
    /// In-memory tracker with no persistence
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            persist_path: None,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Tracker persisted at `<dir>/<name>_cooldowns.json`.
    ///
    /// A missing file means an empty map; an unreadable file is logged and
    /// ignored (the data is advisory).
    pub fn with_persistence(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        let name = name.into();
        let dir: PathBuf = dir.into();
        let path = dir.join(format!("{}_cooldowns.json", name));

        let states = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, CooldownState>>(&raw) {
                Ok(map) => {
                    debug!(name = %name, count = map.len(), "loaded cooldown state");
                    map
                }
                Err(e) => {
                    warn!(name = %name, error = %e, "failed to parse cooldown state, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(name = %name, error = %e, "failed to create cooldown dir, persistence disabled");
            return Self {
                name,
                persist_path: None,
                states: Mutex::new(states),
            };
        }

        Self {
            name,
            persist_path: Some(path),
            states: Mutex::new(states),
        }
    }

    fn save(&self, states: &HashMap<String, CooldownState>) {
        let Some(path) = &self.persist_path else {
            return;
        };
        match serde_json::to_string_pretty(states) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    warn!(name = %self.name, error = %e, "failed to save cooldown state");
                }
            }
            Err(e) => warn!(name = %self.name, error = %e, "failed to serialize cooldown state"),
        }
    }

    fn schedule_for(consecutive_failures: u32) -> u64 {
        if consecutive_failures == 0 {
            return 0;
        }
        let index = (consecutive_failures as usize - 1).min(COOLDOWN_SCHEDULE.len() - 1);
        COOLDOWN_SCHEDULE[index]
    }

    /// Record a failure, increasing the consecutive count and setting the cooldown
    pub fn record_failure(&self, entity_id: &str, error: Option<&str>) -> CooldownState {
        let mut states = self.states.lock().expect("cooldown lock poisoned");
        let state = states
            .entry(entity_id.to_string())
            .or_insert_with(|| CooldownState::new(entity_id));

        state.consecutive_failures += 1;
        state.total_failures += 1;
        state.last_failure_at = Some(Utc::now());
        if let Some(error) = error {
            state.last_error = Some(error.chars().take(500).collect());
        }

        let cooldown_secs = Self::schedule_for(state.consecutive_failures);
        state.cooldown_until = Some(Utc::now() + ChronoDuration::seconds(cooldown_secs as i64));

        info!(
            name = %self.name,
            entity_id,
            consecutive_failures = state.consecutive_failures,
            cooldown_secs,
            "failure recorded, cooldown set"
        );

        let snapshot = state.clone();
        self.save(&states);
        snapshot
    }

    /// Record a success, clearing the consecutive count and cooldown
    pub fn record_success(&self, entity_id: &str) -> CooldownState {
        let mut states = self.states.lock().expect("cooldown lock poisoned");
        let state = states
            .entry(entity_id.to_string())
            .or_insert_with(|| CooldownState::new(entity_id));

        let previous_failures = state.consecutive_failures;
        state.consecutive_failures = 0;
        state.total_successes += 1;
        state.last_success_at = Some(Utc::now());
        state.cooldown_until = None;
        state.last_error = None;

        if previous_failures > 0 {
            info!(name = %self.name, entity_id, previous_failures, "success recorded, cooldown cleared");
        } else {
            debug!(name = %self.name, entity_id, "success recorded");
        }

        let snapshot = state.clone();
        self.save(&states);
        snapshot
    }

    /// Should this entity be processed right now?
    pub fn should_process(&self, entity_id: &str) -> bool {
        let states = self.states.lock().expect("cooldown lock poisoned");
        match states.get(entity_id) {
            Some(state) => !state.is_in_cooldown(),
            None => true,
        }
    }

    /// Filter ids down to those past their cooldown
    pub fn get_eligible(&self, entity_ids: &[String]) -> Vec<String> {
        let states = self.states.lock().expect("cooldown lock poisoned");
        entity_ids
            .iter()
            .filter(|id| match states.get(*id) {
                Some(state) => !state.is_in_cooldown(),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Remaining cooldown for an entity, zero when eligible or untracked
    pub fn remaining_cooldown(&self, entity_id: &str) -> Duration {
        let states = self.states.lock().expect("cooldown lock poisoned");
        states
            .get(entity_id)
            .map(|s| s.remaining_cooldown())
            .unwrap_or(Duration::ZERO)
    }

    /// Current state for an entity
    pub fn status(&self, entity_id: &str) -> Option<CooldownState> {
        let states = self.states.lock().expect("cooldown lock poisoned");
        states.get(entity_id).cloned()
    }

    /// Manually clear an active cooldown. Returns false when none was active.
    pub fn clear(&self, entity_id: &str) -> bool {
        let mut states = self.states.lock().expect("cooldown lock poisoned");
        let Some(state) = states.get_mut(entity_id) else {
            return false;
        };
        if !state.is_in_cooldown() {
            return false;
        }
        state.cooldown_until = None;
        state.consecutive_failures = 0;
        info!(name = %self.name, entity_id, "cooldown manually cleared");
        self.save(&states);
        true
    }

    /// Clear every cooldown. Use with caution.
    pub fn clear_all(&self) {
        let mut states = self.states.lock().expect("cooldown lock poisoned");
        for state in states.values_mut() {
            state.cooldown_until = None;
            state.consecutive_failures = 0;
        }
        warn!(name = %self.name, count = states.len(), "all cooldowns cleared");
        self.save(&states);
    }

    /// Drop entries with no activity in `max_age_days`
    pub fn prune_older_than(&self, max_age_days: i64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::days(max_age_days);
        let mut states = self.states.lock().expect("cooldown lock poisoned");
        let before = states.len();
        states.retain(|_, state| {
            let last_activity = state.last_success_at.max(state.last_failure_at);
            match last_activity {
                Some(at) => at >= cutoff,
                None => true,
            }
        });
        let removed = before - states.len();
        if removed > 0 {
            info!(name = %self.name, removed, remaining = states.len(), "pruned old cooldown entries");
            self.save(&states);
        }
        removed
    }

    pub fn stats(&self) -> CooldownStats {
        let states = self.states.lock().expect("cooldown lock poisoned");
        let in_cooldown = states.values().filter(|s| s.is_in_cooldown()).count();
        CooldownStats {
            total_entities: states.len(),
            in_cooldown,
            available: states.len() - in_cooldown,
            total_failures: states.values().map(|s| s.total_failures).sum(),
            total_successes: states.values().map(|s| s.total_successes).sum(),
        }
    }
}

//! Durable actor state

use chrono::{DateTime, Duration, Utc};
use runsync_common::parent_dirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Run id → last time a file of that run was seen.
///
/// Only used to place data file changes whose run was not part of the same
/// batch. Entries only move forward in time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunCache(BTreeMap<String, DateTime<Utc>>);

impl RunCache {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn get(&self, run: &str) -> Option<DateTime<Utc>> {
        self.0.get(run).copied()
    }

    /// Record activity for `run`; older times never overwrite newer ones.
    /// Returns true if the entry changed.
    pub fn touch(&mut self, run: &str, time: DateTime<Utc>) -> bool {
        match self.0.get_mut(run) {
            Some(current) if *current >= time => false,
            Some(current) => {
                *current = time;
                true
            }
            None => {
                self.0.insert(run.to_string(), time);
                true
            }
        }
    }

    /// Deepest cached run containing `path`
    #[must_use]
    pub fn find_run<'a>(&self, path: &'a str) -> Option<&'a str> {
        parent_dirs(path).find(|dir| self.0.contains_key(*dir))
    }

    /// Drop entries last touched more than `ttl` before `now`
    pub fn evict(&mut self, now: DateTime<Utc>, ttl: Duration) -> Vec<String> {
        let mut evicted = Vec::new();
        self.0.retain(|run, touched| {
            let keep = now - *touched <= ttl;
            if !keep {
                evicted.push(run.clone());
            }
            keep
        });
        evicted
    }
}

/// The actor's only durable state, checkpointed after every iteration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub threshold_seconds: u64,
    #[serde(rename = "cacheTTLHours")]
    pub cache_ttl_hours: u64,
    pub run_cache: RunCache,
}

impl PipelineState {
    #[must_use]
    pub fn new(threshold_seconds: u64, cache_ttl_hours: u64) -> Self {
        Self {
            threshold_seconds,
            cache_ttl_hours,
            run_cache: RunCache::default(),
        }
    }

    #[must_use]
    pub fn threshold(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.threshold_seconds)
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        i64::try_from(self.cache_ttl_hours)
            .ok()
            .and_then(Duration::try_hours)
            .unwrap_or(Duration::MAX)
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new(30, 48)
    }
}

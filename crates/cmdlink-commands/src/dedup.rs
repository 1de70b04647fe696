//! Time-windowed record of recently dispatched commands.
//!
//! An entry blocks re-dispatch until the cooldown has elapsed. Expiry is
//! checked on lookup, so eligibility never depends on the cleanup task;
//! cleanup only bounds memory.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use cmdlink_core::DedupConfig;

pub struct DedupCache {
    entries: DashMap<String, DateTime<Utc>>,
    cooldown: chrono::Duration,
}

impl DedupCache {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            cooldown: chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.cooldown)
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown.to_std().unwrap_or(Duration::MAX)
    }

    fn is_expired(&self, recorded: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(recorded) >= self.cooldown
    }

    /// Whether `id` may be dispatched at `now`.
    pub fn should_dispatch(&self, id: &str, now: DateTime<Utc>) -> bool {
        match self.entries.get(id) {
            Some(recorded) => self.is_expired(*recorded, now),
            None => true,
        }
    }

    /// Record a successful dispatch, replacing any previous entry.
    pub fn record_dispatch(&self, id: &str, now: DateTime<Utc>) {
        self.entries.insert(id.to_string(), now);
    }

    /// Remove expired entries. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, recorded| !self.is_expired(*recorded, now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `purge_expired` every `interval` until the handle is aborted.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.purge_expired(Utc::now());
                if removed > 0 {
                    debug!(removed, remaining = cache.len(), "Purged expired dedup entries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_blocks_within_cooldown() {
        let cache = DedupCache::new(Duration::from_secs(30));
        assert!(cache.should_dispatch("C1", at(0)));

        cache.record_dispatch("C1", at(0));
        assert!(!cache.should_dispatch("C1", at(5)));
        assert!(!cache.should_dispatch("C1", at(29)));
        assert!(cache.should_dispatch("C2", at(5)));
    }

    #[test]
    fn test_expired_without_cleanup() {
        let cache = DedupCache::new(Duration::from_secs(30));
        cache.record_dispatch("C1", at(0));

        assert!(cache.should_dispatch("C1", at(30)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_record_overwrites() {
        let cache = DedupCache::new(Duration::from_secs(30));
        cache.record_dispatch("C1", at(0));
        cache.record_dispatch("C1", at(20));

        assert!(!cache.should_dispatch("C1", at(40)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_purge_expired() {
        let cache = DedupCache::new(Duration::from_secs(30));
        cache.record_dispatch("old", at(0));
        cache.record_dispatch("new", at(20));

        assert_eq!(cache.purge_expired(at(35)), 1);
        assert_eq!(cache.len(), 1);
        assert!(!cache.should_dispatch("new", at(35)));
        assert_eq!(cache.purge_expired(at(35)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_runs_on_interval() {
        let cache = Arc::new(DedupCache::new(Duration::ZERO));
        cache.record_dispatch("C1", Utc::now());

        let handle = cache.spawn_cleanup(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert!(cache.is_empty());
        handle.abort();
    }
}

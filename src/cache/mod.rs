//! Two-tier rule-set cache: an in-memory LRU backed by a disk tier, keyed
//! by rule-source identifier.

pub mod disk;
pub mod entry;
pub mod memory;

use crate::cache::disk::DiskTier;
use crate::cache::entry::{CacheCounters, CacheEntry};
use crate::cache::memory::MemoryTier;
use crate::error::CoreError;
use crate::rules::model::RuleSet;
use chrono::Duration;
use parking_lot::Mutex;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct RuleSetCacheConfig {
    pub disk_dir: PathBuf,
    pub memory_byte_budget: u64,
    pub disk_byte_budget: u64,
    pub max_age: Duration,
}

pub struct RuleSetCache {
    memory: MemoryTier,
    disk: DiskTier,
    max_age: Duration,
    counters: Mutex<CacheCounters>,
}

impl RuleSetCache {
    pub fn open(config: RuleSetCacheConfig) -> Result<Self, CoreError> {
        Ok(Self {
            memory: MemoryTier::new(config.memory_byte_budget),
            disk: DiskTier::open(config.disk_dir, config.disk_byte_budget)?,
            max_age: config.max_age,
            counters: Mutex::new(CacheCounters::default()),
        })
    }

    pub fn store(&self, key: &str, rule_set: RuleSet) -> Result<(), CoreError> {
        let entry = CacheEntry::new(key, rule_set);
        self.disk.store(&entry)?;
        self.memory.put(entry);
        Ok(())
    }

    /// Consult memory first; on miss fall through to disk and, on a disk
    /// hit, rehydrate the memory tier.
    pub fn get(&self, key: &str) -> Result<Option<RuleSet>, CoreError> {
        let mut counters = self.counters.lock();
        counters.total_requests += 1;

        if let Some(entry) = self.memory.get(key, self.max_age, &mut counters) {
            return Ok(Some(entry.rule_set));
        }

        match self.disk.get(key, self.max_age)? {
            Some(entry) => {
                counters.disk_hits += 1;
                self.memory.put(entry.clone());
                Ok(Some(entry.rule_set))
            }
            None => {
                counters.disk_misses += 1;
                Ok(None)
            }
        }
    }

    pub fn invalidate_source(&self, key: &str) -> Result<(), CoreError> {
        self.memory.remove(key);
        self.disk.invalidate(key)
    }

    pub fn invalidate_expired(&self) {
        self.memory.retain_unexpired(self.max_age);
    }

    pub fn clear_memory(&self) {
        self.memory.clear();
    }

    pub fn clear_disk(&self) -> Result<(), CoreError> {
        self.disk.clear()
    }

    pub fn clear_all(&self) -> Result<(), CoreError> {
        self.clear_memory();
        self.clear_disk()
    }

    pub fn snapshot_counters(&self) -> CacheCounters {
        self.counters.lock().clone()
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory.total_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> RuleSetCacheConfig {
        RuleSetCacheConfig {
            disk_dir: dir.to_path_buf(),
            memory_byte_budget: 1_000_000,
            disk_byte_budget: 10_000_000,
            max_age: Duration::hours(1),
        }
    }

    #[test]
    fn store_then_get_round_trips_through_memory() {
        let dir = tempdir().unwrap();
        let cache = RuleSetCache::open(config(dir.path())).unwrap();
        cache.store("source-a", RuleSet::new("source-a")).unwrap();

        let hit = cache.get("source-a").unwrap();
        assert!(hit.is_some());
        assert_eq!(cache.snapshot_counters().memory_hits, 1);
    }

    #[test]
    fn disk_hit_rehydrates_memory() {
        let dir = tempdir().unwrap();
        let cache = RuleSetCache::open(config(dir.path())).unwrap();
        cache.store("source-a", RuleSet::new("source-a")).unwrap();
        cache.clear_memory();

        let hit = cache.get("source-a").unwrap();
        assert!(hit.is_some());
        let counters = cache.snapshot_counters();
        assert_eq!(counters.disk_hits, 1);

        // Second get should now be served from memory.
        cache.get("source-a").unwrap();
        assert_eq!(cache.snapshot_counters().memory_hits, 1);
    }

    #[test]
    fn invalidate_source_clears_both_tiers() {
        let dir = tempdir().unwrap();
        let cache = RuleSetCache::open(config(dir.path())).unwrap();
        cache.store("source-a", RuleSet::new("source-a")).unwrap();
        cache.invalidate_source("source-a").unwrap();
        assert!(cache.get("source-a").unwrap().is_none());
    }

    #[test]
    fn clear_all_is_idempotent() {
        let dir = tempdir().unwrap();
        let cache = RuleSetCache::open(config(dir.path())).unwrap();
        cache.store("source-a", RuleSet::new("source-a")).unwrap();
        cache.clear_all().unwrap();
        cache.clear_all().unwrap();
        assert!(cache.get("source-a").unwrap().is_none());
    }
}

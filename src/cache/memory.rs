//! Tier 1: an in-memory LRU keyed by source id, costed by serialized byte
//! size. Many concurrent readers, one exclusive writer at a time.

use crate::cache::entry::{CacheCounters, CacheEntry};
use chrono::Duration;
use parking_lot::RwLock;
use std::collections::HashMap;

struct MemoryState {
    entries: HashMap<String, CacheEntry>,
    /// Recency order, oldest first. Small cardinality (one entry per rule
    /// source) makes the linear re-ordering on touch cheap in practice.
    order: Vec<String>,
    total_bytes: u64,
}

pub struct MemoryTier {
    state: RwLock<MemoryState>,
    byte_budget: u64,
}

impl MemoryTier {
    pub fn new(byte_budget: u64) -> Self {
        Self {
            state: RwLock::new(MemoryState {
                entries: HashMap::new(),
                order: Vec::new(),
                total_bytes: 0,
            }),
            byte_budget,
        }
    }

    /// Look up `key`, evicting it first if it has aged past `max_age`.
    pub fn get(&self, key: &str, max_age: Duration, counters: &mut CacheCounters) -> Option<CacheEntry> {
        {
            let state = self.state.read();
            if let Some(entry) = state.entries.get(key) {
                if entry.is_expired(max_age) {
                    drop(state);
                    self.remove(key);
                    counters.memory_misses += 1;
                    return None;
                }
            } else {
                counters.memory_misses += 1;
                return None;
            }
        }

        let mut state = self.state.write();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.touch();
            let touched = entry.clone();
            touch_order(&mut state.order, key);
            counters.memory_hits += 1;
            Some(touched)
        } else {
            counters.memory_misses += 1;
            None
        }
    }

    pub fn put(&self, entry: CacheEntry) {
        let mut state = self.state.write();
        if let Some(previous) = state.entries.remove(&entry.key) {
            state.total_bytes = state.total_bytes.saturating_sub(previous.size_bytes);
            state.order.retain(|k| k != &entry.key);
        }
        state.total_bytes += entry.size_bytes;
        state.order.push(entry.key.clone());
        state.entries.insert(entry.key.clone(), entry);

        evict_until_within_budget(&mut state, self.byte_budget);
    }

    pub fn remove(&self, key: &str) {
        let mut state = self.state.write();
        if let Some(entry) = state.entries.remove(key) {
            state.total_bytes = state.total_bytes.saturating_sub(entry.size_bytes);
        }
        state.order.retain(|k| k != key);
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.entries.clear();
        state.order.clear();
        state.total_bytes = 0;
    }

    pub fn retain_unexpired(&self, max_age: Duration) {
        let mut state = self.state.write();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(max_age))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(entry) = state.entries.remove(&key) {
                state.total_bytes = state.total_bytes.saturating_sub(entry.size_bytes);
            }
            state.order.retain(|k| k != &key);
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.read().total_bytes
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }
}

fn touch_order(order: &mut Vec<String>, key: &str) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        let value = order.remove(pos);
        order.push(value);
    }
}

fn evict_until_within_budget(state: &mut MemoryState, budget: u64) {
    while state.total_bytes > budget && !state.order.is_empty() {
        let oldest = state.order.remove(0);
        if let Some(entry) = state.entries.remove(&oldest) {
            state.total_bytes = state.total_bytes.saturating_sub(entry.size_bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::RuleSet;

    fn entry(key: &str, filler_bytes: usize) -> CacheEntry {
        let mut rule_set = RuleSet::new(key);
        rule_set.name = Some("x".repeat(filler_bytes));
        CacheEntry::new(key, rule_set)
    }

    #[test]
    fn evicts_least_recently_used_when_over_budget() {
        let tier = MemoryTier::new(200);
        tier.put(entry("a", 50));
        tier.put(entry("b", 50));
        tier.put(entry("c", 150)); // forces eviction of "a"

        let mut counters = CacheCounters::default();
        assert!(tier.get("a", Duration::hours(1), &mut counters).is_none());
        assert!(tier.get("c", Duration::hours(1), &mut counters).is_some());
    }

    #[test]
    fn touching_an_entry_protects_it_from_eviction() {
        let tier = MemoryTier::new(220);
        tier.put(entry("a", 50));
        tier.put(entry("b", 50));
        let mut counters = CacheCounters::default();
        tier.get("a", Duration::hours(1), &mut counters); // "a" becomes most recent
        tier.put(entry("c", 150));

        assert!(tier.get("b", Duration::hours(1), &mut counters).is_none());
        assert!(tier.get("a", Duration::hours(1), &mut counters).is_some());
    }

    #[test]
    fn expired_entries_evicted_on_get() {
        let tier = MemoryTier::new(10_000);
        tier.put(entry("a", 10));
        let mut counters = CacheCounters::default();
        let hit = tier.get("a", Duration::seconds(-1), &mut counters);
        assert!(hit.is_none());
        assert_eq!(tier.len(), 0);
    }
}

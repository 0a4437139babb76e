//! The unit stored by both cache tiers: a serialized rule set plus the
//! bookkeeping the memory and disk tiers need for eviction.

use crate::rules::model::RuleSet;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub rule_set: RuleSet,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub size_bytes: u64,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, rule_set: RuleSet) -> Self {
        let size_bytes = serde_json::to_vec(&rule_set).map(|b| b.len() as u64).unwrap_or(0);
        let now = Utc::now();
        Self {
            key: key.into(),
            rule_set,
            created_at: now,
            last_accessed: now,
            size_bytes,
        }
    }

    pub fn is_expired(&self, max_age: chrono::Duration) -> bool {
        Utc::now() - self.created_at > max_age
    }

    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheCounters {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub disk_hits: u64,
    pub disk_misses: u64,
    pub total_requests: u64,
}

impl CacheCounters {
    pub fn hit_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.memory_hits + self.disk_hits) as f64 / self.total_requests as f64
        }
    }
}

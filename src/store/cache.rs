//! Bounded least-recently-used cache of decrypted records.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::models::PatientRecord;

struct CacheEntry {
    record: PatientRecord,
    tick: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
    pub capacity: usize,
}

/// Recency is a monotonically increasing tick; `order` maps tick → key so
/// the oldest entry is always `order`'s first element.
pub struct RecordCache {
    capacity: usize,
    entries: HashMap<String, CacheEntry>,
    order: BTreeMap<u64, String>,
    next_tick: u64,
    stats: CacheStats,
}

impl RecordCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: BTreeMap::new(),
            next_tick: 0,
            stats: CacheStats { capacity, ..Default::default() },
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    /// Look up and mark as most recently used.
    pub fn get(&mut self, key: &str) -> Option<PatientRecord> {
        let tick = self.bump();
        match self.entries.get_mut(key) {
            Some(entry) => {
                self.order.remove(&entry.tick);
                entry.tick = tick;
                self.order.insert(tick, key.to_string());
                self.stats.hits += 1;
                Some(entry.record.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace, evicting the least recently used entry on overflow.
    pub fn put(&mut self, key: &str, record: PatientRecord) {
        let tick = self.bump();
        if let Some(old) = self.entries.insert(key.to_string(), CacheEntry { record, tick }) {
            self.order.remove(&old.tick);
        }
        self.order.insert(tick, key.to_string());

        while self.entries.len() > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else { break };
            self.entries.remove(&oldest);
            self.stats.evictions += 1;
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<PatientRecord> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        Some(entry.record)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys from least to most recently used.
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.order.values().cloned().collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats { len: self.entries.len(), ..self.stats }
    }
}

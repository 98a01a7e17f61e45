use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Time-boxed memoization for calendar fact reads. Entries expire after a
/// fixed TTL and are recomputed on the next read; any write to the backing
/// tables invalidates by key prefix. The engine modules never see this
/// type: handlers read through it and pass plain slices down.
#[derive(Debug)]
pub struct ReadCache<V> {
    ttl: Duration,
    entries: HashMap<String, (Instant, V)>,
}

impl<V: Clone> ReadCache<V> {
    pub fn new(ttl: Duration) -> Self {
        ReadCache {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// A hit younger than the TTL. Expired entries count as misses and are
    /// dropped lazily on the next write to the same key.
    pub fn get(&self, key: &str) -> Option<V> {
        let (deadline, value) = self.entries.get(key)?;
        if Instant::now() >= *deadline {
            return None;
        }
        Some(value.clone())
    }

    pub fn set(&mut self, key: impl Into<String>, value: V) {
        self.entries
            .insert(key.into(), (Instant::now() + self.ttl, value));
    }

    /// Drop every entry whose key starts with `prefix`. The empty prefix
    /// clears the whole family.
    pub fn invalidate_prefix(&mut self, prefix: &str) {
        self.entries.retain(|k, _| !k.starts_with(prefix));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

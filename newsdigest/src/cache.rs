use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Concurrency-safe LRU for request replay. Entries expire after `ttl` and
/// the oldest entry is evicted past `capacity`; both bounds apply.
pub struct ResponseCache<T> {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<VecDeque<CacheSlot<T>>>,
}

struct CacheSlot<T> {
    key: String,
    stored_at: Instant,
    value: T,
}

impl<T: Clone> ResponseCache<T> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let mut slots = self.inner.lock().unwrap();
        let now = Instant::now();
        slots.retain(|s| now.duration_since(s.stored_at) < self.ttl);

        let pos = slots.iter().position(|s| s.key == key)?;
        // Refresh recency without touching the stored timestamp.
        let slot = slots.remove(pos).unwrap();
        let value = slot.value.clone();
        slots.push_back(slot);
        Some(value)
    }

    pub fn put(&self, key: String, value: T) {
        let mut slots = self.inner.lock().unwrap();
        let now = Instant::now();
        slots.retain(|s| now.duration_since(s.stored_at) < self.ttl && s.key != key);
        slots.push_back(CacheSlot {
            key,
            stored_at: now,
            value,
        });
        while slots.len() > self.capacity {
            slots.pop_front();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

//! Resolver cache owned by a session.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::probe::Resolution;

struct Entry {
    resolution: Resolution,
    stored_at: Instant,
}

/// Resolved names kept for a fixed time-to-live.
pub struct ResolverCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ResolverCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// A fresh entry for `name`. Expired entries are dropped on the way.
    pub fn get(&self, name: &str) -> Option<Resolution> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = entries
            .get(name)
            .map(|entry| entry.stored_at.elapsed() < self.ttl)?;
        if fresh {
            entries.get(name).map(|entry| entry.resolution.clone())
        } else {
            entries.remove(name);
            None
        }
    }

    pub fn insert(&self, resolution: Resolution) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            resolution.name.clone(),
            Entry {
                resolution,
                stored_at: Instant::now(),
            },
        );
    }

    /// Forget `name`. Returns whether it was cached.
    pub fn invalidate(&self, name: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(name).is_some()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

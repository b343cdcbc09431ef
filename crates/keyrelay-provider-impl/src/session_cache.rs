use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use uuid::Uuid;

pub const SESSION_TTL: Duration = Duration::from_secs(60 * 60);

/// Stable prompt-cache ids keyed by caller identity.
///
/// An entry lives for `ttl` from creation; reads refresh nothing. Every
/// insert sweeps all expired entries.
#[derive(Debug)]
pub struct SessionCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(SESSION_TTL)
    }
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, (String, Instant)>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get_or_create(&self, key: &str) -> String {
        self.get_or_create_at(key, Instant::now())
    }

    pub fn get_or_create_at(&self, key: &str, now: Instant) -> String {
        let mut entries = self.entries();
        if let Some((id, expires_at)) = entries.get(key)
            && now < *expires_at
        {
            return id.clone();
        }
        entries.retain(|_, (_, expires_at)| now < *expires_at);
        let id = Uuid::new_v4().to_string();
        entries.insert(key.to_string(), (id.clone(), now + self.ttl));
        id
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

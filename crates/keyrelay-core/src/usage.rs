use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageCounts {
    pub requests: u64,
    pub success: u64,
    pub failure: u64,
}

impl UsageCounts {
    fn record(&mut self, ok: bool) {
        self.requests += 1;
        if ok {
            self.success += 1;
        } else {
            self.failure += 1;
        }
    }
}

/// In-memory request counters, per credential id.
#[derive(Debug, Default)]
pub struct UsageTracker {
    counts: Mutex<HashMap<String, UsageCounts>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, credential_id: &str, ok: bool) {
        if let Ok(mut guard) = self.counts.lock() {
            guard
                .entry(credential_id.to_string())
                .or_default()
                .record(ok);
        }
    }

    pub fn get(&self, credential_id: &str) -> UsageCounts {
        self.counts
            .lock()
            .ok()
            .and_then(|guard| guard.get(credential_id).copied())
            .unwrap_or_default()
    }

    /// Drops the counters of a removed credential.
    pub fn forget(&self, credential_id: &str) {
        if let Ok(mut guard) = self.counts.lock() {
            guard.remove(credential_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_split_by_outcome() {
        let usage = UsageTracker::new();
        usage.record("a", true);
        usage.record("a", false);
        usage.record("a", true);
        assert_eq!(
            usage.get("a"),
            UsageCounts {
                requests: 3,
                success: 2,
                failure: 1
            }
        );
        usage.forget("a");
        assert_eq!(usage.get("a"), UsageCounts::default());
    }
}

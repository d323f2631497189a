use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use meetup_common::PlayerId;

/// Last successful save time per identity, for save rate limiting.
#[derive(Debug)]
pub struct RateLimitLedger {
    cooldown_ms: i64,
    last_save: Mutex<HashMap<PlayerId, i64>>,
}

impl RateLimitLedger {
    pub fn new(cooldown_ms: i64) -> Self {
        Self {
            cooldown_ms,
            last_save: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown_ms(&self) -> i64 {
        self.cooldown_ms
    }

    /// Whether a save at `now_ms` falls inside the cooldown of the last one.
    pub fn is_limited(&self, identity: PlayerId, now_ms: i64) -> bool {
        self.lock()
            .get(&identity)
            .is_some_and(|last| now_ms - last < self.cooldown_ms)
    }

    pub fn record(&self, identity: PlayerId, now_ms: i64) {
        self.lock().insert(identity, now_ms);
    }

    /// Drop entries whose cooldown has fully elapsed. Removing them cannot
    /// change any future decision, since an expired entry never limits.
    pub fn sweep_expired(&self, now_ms: i64) -> usize {
        let mut last_save = self.lock();
        let before = last_save.len();
        last_save.retain(|_, last| now_ms - *last < self.cooldown_ms);
        let removed = before - last_save.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = last_save.len(), "swept rate-limit ledger");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PlayerId, i64>> {
        self.last_save
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::schedule::Clock;

/// Suppresses repeat notifications for identical failures within a cooldown
/// window.
///
/// Keyed by `(job name, command, error message)`; successful and skipped
/// executions are never deduplicated. One instance is shared by every
/// notifier in the process and must be swept periodically so stale keys do
/// not accumulate.
pub struct NotificationDedup {
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    seen: Mutex<HashMap<u64, DateTime<Utc>>>,
}

impl NotificationDedup {
    pub fn new(cooldown: Duration, clock: Arc<dyn Clock>) -> Arc<NotificationDedup> {
        Arc::new(NotificationDedup {
            cooldown,
            clock,
            seen: Mutex::new(HashMap::new()),
        })
    }

    /// Decide whether a notification for this outcome should go out, and
    /// record the decision. Failures repeat only after the cooldown expires;
    /// everything else always passes.
    pub fn should_notify(&self, job_name: &str, command: &str, failure: Option<&str>) -> bool {
        let Some(error) = failure else {
            return true;
        };
        let key = failure_key(job_name, command, error);
        let now = self.clock.now();
        let mut seen = self.seen.lock();
        match seen.get(&key) {
            Some(last) if within_cooldown(*last, now, self.cooldown) => false,
            _ => {
                seen.insert(key, now);
                true
            }
        }
    }

    /// Drop keys older than the cooldown. Called from a periodic sweeper
    /// task.
    pub fn sweep(&self) {
        let now = self.clock.now();
        let mut seen = self.seen.lock();
        let before = seen.len();
        seen.retain(|_, last| within_cooldown(*last, now, self.cooldown));
        let dropped = before - seen.len();
        if dropped > 0 {
            debug!(dropped, "notification dedup sweep");
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.seen.lock().len()
    }
}

fn within_cooldown(last: DateTime<Utc>, now: DateTime<Utc>, cooldown: Duration) -> bool {
    match (now - last).to_std() {
        Ok(elapsed) => elapsed < cooldown,
        // Clock went backwards; treat the key as fresh.
        Err(_) => true,
    }
}

fn failure_key(job_name: &str, command: &str, error: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    job_name.hash(&mut hasher);
    command.hash(&mut hasher);
    error.hash(&mut hasher);
    hasher.finish()
}

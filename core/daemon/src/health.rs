//! Per-target health bookkeeping.
//!
//! A target turns unhealthy after `unhealthy_after` consecutive failed passes
//! or when its directory watch could not be established. Unhealthy targets
//! are still polled; one successful pass clears the error count, and a lost
//! watch clears once the directory watch is established again.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetHealth {
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub watch_lost: bool,
}

impl TargetHealth {
    fn is_unhealthy(&self, threshold: u32) -> bool {
        self.watch_lost || self.consecutive_errors >= threshold
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthEntry {
    pub server_id: String,
    pub healthy: bool,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub watch_lost: bool,
}

#[derive(Debug)]
pub struct HealthRegistry {
    unhealthy_after: u32,
    targets: Mutex<BTreeMap<String, TargetHealth>>,
}

impl HealthRegistry {
    pub fn new(unhealthy_after: u32) -> Self {
        Self {
            unhealthy_after: unhealthy_after.max(1),
            targets: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record_success(&self, server_id: &str) {
        let mut targets = self.lock();
        let entry = targets.entry(server_id.to_string()).or_default();
        if entry.consecutive_errors > 0 {
            info!(
                server_id,
                previous_errors = entry.consecutive_errors,
                "Tail pass recovered"
            );
        }
        entry.consecutive_errors = 0;
        entry.last_error = None;
    }

    pub fn record_failure(&self, server_id: &str, error: &str) {
        let mut targets = self.lock();
        let entry = targets.entry(server_id.to_string()).or_default();
        let was_unhealthy = entry.is_unhealthy(self.unhealthy_after);
        entry.consecutive_errors = entry.consecutive_errors.saturating_add(1);
        entry.last_error = Some(error.to_string());

        if !was_unhealthy && entry.is_unhealthy(self.unhealthy_after) {
            warn!(
                server_id,
                errors = entry.consecutive_errors,
                error,
                "Target marked unhealthy; falling back to polling"
            );
        }
    }

    pub fn mark_watch_lost(&self, server_id: &str, error: &str) {
        let mut targets = self.lock();
        let entry = targets.entry(server_id.to_string()).or_default();
        entry.watch_lost = true;
        entry.last_error = Some(error.to_string());
        warn!(server_id, error, "Watch unavailable; target is polled only");
    }

    pub fn clear_watch_lost(&self, server_id: &str) {
        let mut targets = self.lock();
        let Some(entry) = targets.get_mut(server_id) else {
            return;
        };
        if entry.watch_lost {
            entry.watch_lost = false;
            info!(server_id, "Watch re-established");
        }
    }

    pub fn is_unhealthy(&self, server_id: &str) -> bool {
        self.lock()
            .get(server_id)
            .map(|entry| entry.is_unhealthy(self.unhealthy_after))
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> Vec<HealthEntry> {
        self.lock()
            .iter()
            .map(|(server_id, entry)| HealthEntry {
                server_id: server_id.clone(),
                healthy: !entry.is_unhealthy(self.unhealthy_after),
                consecutive_errors: entry.consecutive_errors,
                last_error: entry.last_error.clone(),
                watch_lost: entry.watch_lost,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, TargetHealth>> {
        match self.targets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_past_threshold_mark_unhealthy_until_success() {
        let health = HealthRegistry::new(2);
        health.record_failure("a", "read failed");
        assert!(!health.is_unhealthy("a"));
        health.record_failure("a", "read failed");
        assert!(health.is_unhealthy("a"));

        health.record_success("a");
        assert!(!health.is_unhealthy("a"));
        assert_eq!(health.snapshot()[0].consecutive_errors, 0);
    }

    #[test]
    fn lost_watch_stays_unhealthy_after_success() {
        let health = HealthRegistry::new(3);
        health.mark_watch_lost("a", "inotify limit");
        health.record_success("a");
        assert!(health.is_unhealthy("a"));
        assert!(!health.is_unhealthy("unknown"));

        let snapshot = health.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].healthy);
        assert!(snapshot[0].watch_lost);
    }

    #[test]
    fn reestablished_watch_restores_health() {
        let health = HealthRegistry::new(3);
        health.mark_watch_lost("a", "inotify limit");
        health.clear_watch_lost("a");
        health.clear_watch_lost("never-seen");

        assert!(!health.is_unhealthy("a"));
        assert_eq!(health.snapshot().len(), 1);
    }
}

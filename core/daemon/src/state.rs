//! In-memory state managed by the daemon.
//!
//! The registry is built once at startup from the enabled watch targets and
//! shared by `Arc`. Each server's tracker and activity clock live behind
//! that server's own mutex, so directory threads and the crash monitor never
//! contend across servers.

use chrono::{DateTime, Utc};
use fraglog_core::ServerWatchTarget;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::tracker::Tracker;

/// When a server last showed signs of life.
#[derive(Debug, Clone)]
pub struct ActivityClock {
    last_activity: Instant,
    last_log_timestamp: Option<DateTime<Utc>>,
}

impl ActivityClock {
    pub fn new(now: Instant) -> Self {
        Self {
            last_activity: now,
            last_log_timestamp: None,
        }
    }

    pub fn touch(&mut self, now: Instant, log_timestamp: Option<DateTime<Utc>>) {
        self.last_activity = now;
        if log_timestamp.is_some() {
            self.last_log_timestamp = log_timestamp;
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn last_log_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_log_timestamp
    }

    /// Best estimate of when the server died, on the log's own clock: the
    /// last embedded timestamp plus the wall time since that line arrived.
    pub fn crash_instant(&self, now: Instant) -> DateTime<Utc> {
        let idle = chrono::Duration::from_std(self.idle_for(now))
            .unwrap_or_else(|_| chrono::Duration::zero());
        match self.last_log_timestamp {
            Some(last) => last + idle,
            None => Utc::now(),
        }
    }
}

#[derive(Debug)]
pub struct ServerState {
    pub tracker: Tracker,
    pub clock: ActivityClock,
}

#[derive(Debug)]
pub struct ServerHandle {
    pub target: ServerWatchTarget,
    state: Mutex<ServerState>,
}

impl ServerHandle {
    pub fn new(target: ServerWatchTarget) -> Self {
        let state = ServerState {
            tracker: Tracker::new(target.server_id.clone()),
            clock: ActivityClock::new(Instant::now()),
        };
        Self {
            target,
            state: Mutex::new(state),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.target.server_id
    }

    pub fn lock(&self) -> MutexGuard<'_, ServerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!(
                    server_id = %self.target.server_id,
                    "Server state lock poisoned; continuing with inner state"
                );
                poisoned.into_inner()
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: BTreeMap<String, Arc<ServerHandle>>,
}

impl ServerRegistry {
    pub fn new<'a>(targets: impl IntoIterator<Item = &'a ServerWatchTarget>) -> Self {
        let servers = targets
            .into_iter()
            .filter(|target| target.enabled)
            .map(|target| {
                (
                    target.server_id.clone(),
                    Arc::new(ServerHandle::new(target.clone())),
                )
            })
            .collect();
        Self { servers }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServerHandle>> {
        self.servers.values()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Targets grouped by the directory that holds their log file.
    pub fn by_directory(&self) -> BTreeMap<PathBuf, Vec<Arc<ServerHandle>>> {
        let mut grouped: BTreeMap<PathBuf, Vec<Arc<ServerHandle>>> = BTreeMap::new();
        for handle in self.servers.values() {
            grouped
                .entry(handle.target.log_directory.clone())
                .or_default()
                .push(Arc::clone(handle));
        }
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: &str, dir: &str, enabled: bool) -> ServerWatchTarget {
        ServerWatchTarget {
            server_id: id.to_string(),
            display_name: id.to_string(),
            log_directory: PathBuf::from(dir),
            log_file_name: format!("{}.log", id),
            enabled,
        }
    }

    #[test]
    fn registry_groups_enabled_targets_by_directory() {
        let targets = vec![
            target("a", "/logs/shared", true),
            target("b", "/logs/shared", true),
            target("c", "/logs/solo", true),
            target("d", "/logs/solo", false),
        ];
        let registry = ServerRegistry::new(&targets);

        assert_eq!(registry.len(), 3);
        assert!(registry.iter().all(|server| server.server_id() != "d"));
        let grouped = registry.by_directory();
        assert_eq!(grouped[&PathBuf::from("/logs/shared")].len(), 2);
        assert_eq!(grouped[&PathBuf::from("/logs/solo")].len(), 1);
    }

    #[test]
    fn crash_instant_extends_last_log_timestamp() {
        let start = Instant::now();
        let mut clock = ActivityClock::new(start);
        let logged = DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp");
        clock.touch(start, Some(logged));
        clock.touch(start, None);

        let later = start + Duration::from_secs(200);
        assert_eq!(clock.idle_for(later), Duration::from_secs(200));
        assert_eq!(
            clock.crash_instant(later),
            logged + chrono::Duration::seconds(200)
        );
    }
}

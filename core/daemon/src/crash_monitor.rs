//! Detects servers that went silent with players still connected.
//!
//! A server with open sessions or a running match that has produced no log
//! line for longer than the inactivity threshold is treated as crashed: its
//! match is aborted, every session is closed at the estimated crash instant,
//! and its in-memory state is cleared. Clearing the state is what keeps the
//! monitor from firing twice for the same outage.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::backoff::sleep_unless_shutdown;
use crate::health::HealthRegistry;
use crate::shutdown::ShutdownSignal;
use crate::state::ServerRegistry;
use crate::tracker::{CloseReason, TrackerContext};

pub struct CrashMonitor {
    registry: Arc<ServerRegistry>,
    context: TrackerContext,
    health: Arc<HealthRegistry>,
    threshold: Duration,
}

impl CrashMonitor {
    pub fn new(
        registry: Arc<ServerRegistry>,
        context: TrackerContext,
        health: Arc<HealthRegistry>,
        threshold: Duration,
    ) -> Self {
        Self {
            registry,
            context,
            health,
            threshold,
        }
    }

    /// One scan over every server. Returns how many were closed as crashed.
    pub fn check(&self, now: Instant) -> usize {
        let mut fired = 0;

        for server in self.registry.iter() {
            let mut state = server.lock();
            if !state.tracker.has_open_state() {
                continue;
            }

            let idle = state.clock.idle_for(now);
            if idle <= self.threshold {
                continue;
            }

            let crash_at = state.clock.crash_instant(now);
            warn!(
                server_id = %server.server_id(),
                idle_secs = idle.as_secs(),
                sessions = state.tracker.open_session_count(),
                last_log = ?state.clock.last_log_timestamp(),
                crash_at = %crash_at.to_rfc3339(),
                "Server silent past inactivity threshold; closing as crashed"
            );
            if state
                .tracker
                .close_all(CloseReason::Crash, crash_at, &self.context)
            {
                fired += 1;
            }
        }

        fired
    }

    pub fn spawn(self, interval: Duration, shutdown: ShutdownSignal) -> JoinHandle<()> {
        thread::spawn(move || {
            while sleep_unless_shutdown(interval, &shutdown) {
                self.check(Instant::now());
                for entry in self.health.snapshot() {
                    debug!(
                        server_id = %entry.server_id,
                        healthy = entry.healthy,
                        errors = entry.consecutive_errors,
                        watch_lost = entry.watch_lost,
                        last_error = entry.last_error.as_deref().unwrap_or(""),
                        "Health snapshot"
                    );
                }
            }
            debug!("Crash monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::NoopCommands;
    use crate::db::Db;
    use crate::feed::Feed;
    use chrono::DateTime;
    use fraglog_core::{Event, EventKind, MapLoadEvent, ServerWatchTarget};
    use std::path::PathBuf;

    fn target(id: &str) -> ServerWatchTarget {
        ServerWatchTarget {
            server_id: id.to_string(),
            display_name: id.to_string(),
            log_directory: PathBuf::from("/logs"),
            log_file_name: format!("{}.log", id),
            enabled: true,
        }
    }

    #[test]
    fn silent_server_is_closed_exactly_once() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Arc::new(Db::new(temp_dir.path().join("stats.db")).expect("db init"));
        let (feed, notifications) = Feed::with_channel();
        let context = TrackerContext {
            gateway: db.clone(),
            feed,
            commands: Arc::new(NoopCommands),
        };
        let targets = vec![target("busy"), target("empty")];
        let registry = Arc::new(ServerRegistry::new(&targets));

        let joined_at = DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp");
        let start = Instant::now();
        {
            let server = registry
                .iter()
                .find(|server| server.server_id() == "busy")
                .expect("server");
            let mut state = server.lock();
            state.clock.touch(start, Some(joined_at));
            for kind in [
                EventKind::MapLoad(MapLoadEvent {
                    map: "Farmhouse".to_string(),
                    scenario: "Checkpoint_Security".to_string(),
                    max_players: 8,
                    lighting: "Day".to_string(),
                }),
                EventKind::LoginRequest {
                    name: "Alice".to_string(),
                    external_id: "1".to_string(),
                },
                EventKind::Join {
                    name: "Alice".to_string(),
                },
            ] {
                state.tracker.apply(
                    &Event {
                        timestamp: joined_at,
                        kind,
                    },
                    &context,
                );
            }
        }

        let threshold = Duration::from_secs(180);
        let monitor = CrashMonitor::new(
            registry.clone(),
            context,
            Arc::new(HealthRegistry::new(3)),
            threshold,
        );

        assert_eq!(monitor.check(start + Duration::from_secs(60)), 0);

        let late = start + Duration::from_secs(200);
        assert_eq!(monitor.check(late), 1);
        assert_eq!(monitor.check(late + Duration::from_secs(15)), 0);
        assert_eq!(monitor.check(late + Duration::from_secs(30)), 0);

        let (leave_time, duration, reason) = db.latest_session("id:1").expect("session");
        assert!(leave_time.is_some());
        assert_eq!(duration, Some(200_000));
        assert_eq!(reason.as_deref(), Some("crash"));

        let match_ids = db.match_ids();
        assert_eq!(match_ids.len(), 1);
        assert_eq!(db.match_status(&match_ids[0]).as_deref(), Some("aborted"));

        let crash_notices = notifications
            .try_iter()
            .filter(|notification| notification.kind == "crash")
            .count();
        assert_eq!(crash_notices, 1);
    }
}

//! One thread per watched directory.
//!
//! Change notifications from `notify` trigger debounced tail passes for the
//! targets whose file changed. Every target is also passed at the poll
//! cadence no matter how busy the notification stream is, so unhealthy
//! targets keep being retried. When the watch cannot be established the
//! directory is polled alone and the watch is attempted again later.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::backoff::{sleep_unless_shutdown, RetryPolicy};
use crate::health::HealthRegistry;
use crate::pipeline::Pipeline;
use crate::shutdown::ShutdownSignal;
use crate::state::ServerHandle;
use crate::tailer::FileTailer;

const IGNORED_SUFFIXES: [&str; 4] = [".bak", ".tmp", ".swp", "~"];
const IGNORED_INFIX: &str = "-backup-";

type Notification = Result<Event, notify::Error>;

#[derive(Debug, Clone, Copy)]
pub struct WatchSettings {
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub retry: RetryPolicy,
    pub reestablish_after: Duration,
}

struct WatchedTarget {
    server: Arc<ServerHandle>,
    tailer: FileTailer,
}

pub struct DirectoryWatcher {
    directory: PathBuf,
    targets: Vec<WatchedTarget>,
    pipeline: Arc<Pipeline>,
    health: Arc<HealthRegistry>,
    settings: WatchSettings,
    shutdown: ShutdownSignal,
    passes: u64,
}

impl DirectoryWatcher {
    pub fn new(
        directory: PathBuf,
        servers: Vec<Arc<ServerHandle>>,
        pipeline: Arc<Pipeline>,
        health: Arc<HealthRegistry>,
        settings: WatchSettings,
        shutdown: ShutdownSignal,
    ) -> Self {
        let targets = servers
            .into_iter()
            .map(|server| {
                let tailer = pipeline.open_tailer(&server.target);
                WatchedTarget { server, tailer }
            })
            .collect();

        Self {
            directory,
            targets,
            pipeline,
            health,
            settings,
            shutdown,
            passes: 0,
        }
    }

    /// Runs one tail pass over every target.
    pub fn pass_all(&mut self) {
        for index in 0..self.targets.len() {
            self.pass(index);
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        thread::spawn(move || self.run())
    }

    fn run(mut self) {
        info!(
            directory = %self.directory.display(),
            targets = self.targets.len(),
            "Directory watcher started"
        );

        while !self.shutdown.is_requested() {
            let (sender, receiver) = mpsc::channel();
            let watcher = self.establish_watch(sender);
            // Catch up on whatever was appended while unwatched.
            self.pass_all();

            match watcher {
                Some(_watcher) => self.notification_loop(&receiver),
                None => self.polling_loop(self.settings.reestablish_after),
            }
        }

        info!(
            directory = %self.directory.display(),
            passes = self.passes,
            "Directory watcher stopped"
        );
    }

    fn establish_watch(&self, sender: Sender<Notification>) -> Option<RecommendedWatcher> {
        let directory = self.directory.clone();
        let result = self
            .settings
            .retry
            .run("watch directory", &self.shutdown, || {
                let sender = sender.clone();
                let mut watcher = notify::recommended_watcher(move |result: Notification| {
                    if sender.send(result).is_err() {
                        debug!("Watch notification receiver dropped");
                    }
                })
                .map_err(|err| err.to_string())?;
                watcher
                    .watch(&directory, RecursiveMode::NonRecursive)
                    .map_err(|err| err.to_string())?;
                Ok(watcher)
            });

        match result {
            Ok(watcher) => {
                for target in &self.targets {
                    self.health.clear_watch_lost(target.server.server_id());
                }
                Some(watcher)
            }
            Err(err) => {
                for target in &self.targets {
                    self.health.mark_watch_lost(target.server.server_id(), &err);
                }
                None
            }
        }
    }

    /// Returns on shutdown, or when the watch channel closes.
    fn notification_loop(&mut self, receiver: &Receiver<Notification>) {
        let mut last_full_pass = Instant::now();

        while !self.shutdown.is_requested() {
            let until_full_pass = self
                .settings
                .poll_interval
                .saturating_sub(last_full_pass.elapsed());

            match receiver.recv_timeout(until_full_pass) {
                Ok(first) => {
                    let mut dirty = BTreeSet::new();
                    self.collect_dirty(first, &mut dirty);

                    let deadline = Instant::now() + self.settings.debounce;
                    loop {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            break;
                        }
                        match receiver.recv_timeout(remaining) {
                            Ok(next) => self.collect_dirty(next, &mut dirty),
                            Err(_) => break,
                        }
                    }

                    for index in dirty {
                        self.pass(index);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    for target in &self.targets {
                        self.health
                            .mark_watch_lost(target.server.server_id(), "watch channel closed");
                    }
                    return;
                }
            }

            if last_full_pass.elapsed() >= self.settings.poll_interval {
                self.pass_all();
                last_full_pass = Instant::now();
            }
        }
    }

    /// Polls every target until `duration` has passed or shutdown.
    fn polling_loop(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline
            && sleep_unless_shutdown(self.settings.poll_interval, &self.shutdown)
        {
            self.pass_all();
        }
    }

    fn collect_dirty(&self, notification: Notification, dirty: &mut BTreeSet<usize>) {
        let event = match notification {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    directory = %self.directory.display(),
                    error = %err,
                    "Watch notification error"
                );
                return;
            }
        };

        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }

        for path in &event.paths {
            if let Some(index) = self.target_for(path) {
                dirty.insert(index);
            }
        }
    }

    /// Unhealthy targets are left to the full passes.
    fn target_for(&self, path: &Path) -> Option<usize> {
        let name = path.file_name()?.to_str()?;
        if is_ignored_name(name) {
            return None;
        }
        self.targets.iter().position(|target| {
            target.server.target.log_file_name == name
                && !self.health.is_unhealthy(target.server.server_id())
        })
    }

    fn pass(&mut self, index: usize) {
        let pipeline = &self.pipeline;
        let Some(target) = self.targets.get_mut(index) else {
            return;
        };
        let server_id = target.server.server_id().to_string();
        self.passes += 1;

        match pipeline.catch_up(&target.server, &mut target.tailer) {
            Ok(_) => self.health.record_success(&server_id),
            Err(err) => {
                debug!(server_id = %server_id, error = %err, "Tail pass failed");
                self.health.record_failure(&server_id, &err.to_string());
            }
        }
    }
}

/// Editor swap files, rotations and backups next to the live log.
pub fn is_ignored_name(name: &str) -> bool {
    IGNORED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) || name.contains(IGNORED_INFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::NoopCommands;
    use crate::db::Db;
    use crate::feed::Feed;
    use crate::tracker::TrackerContext;
    use fraglog_core::{LineClassifier, ServerWatchTarget, StartPosition};
    use fs_err as fs;
    use notify::event::{AccessKind, ModifyKind};

    struct Fixture {
        _dir: tempfile::TempDir,
        health: Arc<HealthRegistry>,
        watcher: DirectoryWatcher,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = Arc::new(Db::new(dir.path().join("stats.db")).expect("db init"));
        let pipeline = Arc::new(Pipeline::new(
            LineClassifier::default(),
            TrackerContext {
                gateway: db,
                feed: Feed::log_only(),
                commands: Arc::new(NoopCommands),
            },
            StartPosition::Beginning,
        ));
        let servers = ["alpha", "bravo"]
            .iter()
            .map(|id| {
                Arc::new(ServerHandle::new(ServerWatchTarget {
                    server_id: id.to_string(),
                    display_name: id.to_string(),
                    log_directory: dir.path().to_path_buf(),
                    log_file_name: format!("{}.log", id),
                    enabled: true,
                }))
            })
            .collect();
        let health = Arc::new(HealthRegistry::new(2));
        let watcher = DirectoryWatcher::new(
            dir.path().to_path_buf(),
            servers,
            pipeline,
            health.clone(),
            WatchSettings {
                poll_interval: Duration::from_millis(50),
                debounce: Duration::from_millis(10),
                retry: RetryPolicy {
                    attempts: 1,
                    base: Duration::from_millis(1),
                    max: Duration::from_millis(1),
                },
                reestablish_after: Duration::from_millis(200),
            },
            ShutdownSignal::new(),
        );
        Fixture {
            _dir: dir,
            health,
            watcher,
        }
    }

    fn modified(path: PathBuf) -> Notification {
        Ok(Event::new(EventKind::Modify(ModifyKind::Any)).add_path(path))
    }

    #[test]
    fn ignores_backup_and_temp_names() {
        for name in ["a.log.bak", "a.log.tmp", "a.log~", ".a.log.swp", "a-backup-2025.log"] {
            assert!(is_ignored_name(name), "{name}");
        }
        assert!(!is_ignored_name("coop-1.log"));
    }

    #[test]
    fn notifications_map_to_targets_by_exact_name() {
        let fx = fixture();
        let dir = fx.watcher.directory.clone();
        let mut dirty = BTreeSet::new();

        fx.watcher.collect_dirty(modified(dir.join("bravo.log")), &mut dirty);
        fx.watcher.collect_dirty(modified(dir.join("alpha.log.bak")), &mut dirty);
        fx.watcher.collect_dirty(modified(dir.join("charlie.log")), &mut dirty);
        fx.watcher.collect_dirty(
            Ok(Event::new(EventKind::Access(AccessKind::Any)).add_path(dir.join("alpha.log"))),
            &mut dirty,
        );

        assert_eq!(dirty.into_iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn unhealthy_targets_are_left_to_polling() {
        let fx = fixture();
        let dir = fx.watcher.directory.clone();
        fx.health.mark_watch_lost("alpha", "test");

        let mut dirty = BTreeSet::new();
        fx.watcher.collect_dirty(modified(dir.join("alpha.log")), &mut dirty);
        assert!(dirty.is_empty());
    }

    #[test]
    fn pass_over_missing_files_is_healthy() {
        let mut fx = fixture();
        fx.watcher.pass_all();
        assert!(fx.health.snapshot().iter().all(|entry| entry.healthy));
    }

    #[test]
    fn unhealthy_target_is_retried_under_constant_notifications() {
        let mut fx = fixture();
        let dir = fx.watcher.directory.clone();
        fx.health.record_failure("alpha", "read failed");
        fx.health.record_failure("alpha", "read failed");
        assert!(fx.health.is_unhealthy("alpha"));
        fs::write(
            dir.join("alpha.log"),
            "[2025.10.04-15.23.38:790][412]LogGameplayEvents: Display: Round 5 Started\n",
        )
        .expect("write log");

        fx.watcher.settings.poll_interval = Duration::from_millis(100);
        let shutdown = fx.watcher.shutdown.clone();
        let (sender, receiver) = mpsc::channel();
        let alpha_log = dir.join("alpha.log");
        let chatter = thread::spawn(move || {
            let started = Instant::now();
            while started.elapsed() < Duration::from_millis(600) {
                sender.send(modified(alpha_log.clone())).expect("send");
                thread::sleep(Duration::from_millis(30));
            }
            shutdown.request();
            sender
        });
        fx.watcher.notification_loop(&receiver);
        let _sender = chatter.join().expect("chatter thread");

        assert!(!fx.health.is_unhealthy("alpha"));
        let alpha = &fx.watcher.targets[0];
        assert_eq!(alpha.server.server_id(), "alpha");
        assert_eq!(alpha.server.lock().tracker.round(), 5);
        assert!(alpha.tailer.cursor().byte_offset > 0);
    }

    #[test]
    fn notifications_within_debounce_window_share_one_pass() {
        let mut fx = fixture();
        let dir = fx.watcher.directory.clone();
        fx.watcher.settings.poll_interval = Duration::from_secs(30);
        fx.watcher.settings.debounce = Duration::from_millis(200);

        let (sender, receiver) = mpsc::channel();
        for _ in 0..5 {
            sender.send(modified(dir.join("bravo.log"))).expect("send");
        }
        drop(sender);

        fx.watcher.notification_loop(&receiver);

        assert_eq!(fx.watcher.passes, 1);
        let snapshot = fx.health.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|entry| entry.watch_lost));
    }

    #[test]
    fn lost_watch_is_reestablished_once_the_directory_exists() {
        let mut fx = fixture();
        let missing = fx.watcher.directory.join("not-yet");
        fx.watcher.directory = missing.clone();

        let (sender, _receiver) = mpsc::channel();
        assert!(fx.watcher.establish_watch(sender).is_none());
        assert!(fx.health.is_unhealthy("alpha"));
        assert!(fx.health.is_unhealthy("bravo"));

        fs::create_dir(&missing).expect("create dir");
        let (sender, _receiver) = mpsc::channel();
        assert!(fx.watcher.establish_watch(sender).is_some());
        assert!(!fx.health.is_unhealthy("alpha"));
        assert!(fx.health.snapshot().iter().all(|entry| !entry.watch_lost));
    }

    #[test]
    fn polling_spell_ends_so_the_watch_can_be_retried() {
        let mut fx = fixture();
        let started = Instant::now();
        fx.watcher.polling_loop(Duration::from_millis(200));

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(fx.watcher.passes >= 2);
    }
}

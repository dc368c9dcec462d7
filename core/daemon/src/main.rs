//! fraglog daemon entrypoint.
//!
//! A single-writer service: one thread per watched log directory, one crash
//! monitor, and a SQLite store. The main thread only waits for a shutdown
//! signal and then closes every server's state gracefully.

use clap::Parser;
use fraglog_core::{default_config_path, load_config, FraglogConfig, LineClassifier};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

mod backoff;
mod commands;
mod crash_monitor;
mod db;
mod feed;
mod health;
mod logging;
mod pipeline;
mod shutdown;
mod state;
mod tailer;
mod tracker;
mod watcher;

use backoff::{sleep_unless_shutdown, RetryPolicy};
use commands::StatsCommandHandler;
use crash_monitor::CrashMonitor;
use db::{Db, StatsGateway};
use feed::{Feed, Notification};
use health::HealthRegistry;
use pipeline::Pipeline;
use shutdown::ShutdownSignal;
use state::ServerRegistry;
use tracker::{CloseReason, TrackerContext};
use watcher::{DirectoryWatcher, WatchSettings};

const SHUTDOWN_POLL: Duration = Duration::from_millis(250);
const JOIN_POLL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "fraglog-daemon")]
#[command(about = "Tails game-server logs into session, match and weapon stats")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.fraglog/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Run one catch-up pass over every log, close all state, and exit
    #[arg(long)]
    once: bool,

    /// Also print every feed notification to stdout as a JSON line
    #[arg(long)]
    feed_json: bool,
}

fn main() {
    let cli = Cli::parse();

    let loaded = cli
        .config
        .or_else(default_config_path)
        .ok_or_else(|| "Home directory not found; pass --config".to_string())
        .and_then(|path| load_config(&path).map_err(String::from));

    let log_dir = loaded
        .as_ref()
        .ok()
        .and_then(|config| config.daemon.log_dir.clone());
    let _log_guard = logging::init(log_dir.as_deref());

    let config = match loaded {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    if let Err(err) = shutdown::install_signal_handlers() {
        warn!(error = %err, "Failed to install signal handlers");
    }
    let shutdown = ShutdownSignal::new();

    if !cli.once {
        match daemon_backoff_path() {
            Ok(path) => backoff::apply_startup_backoff(&path, &shutdown),
            Err(err) => warn!(error = %err, "Failed to resolve daemon backoff path"),
        }
    }

    let db = match Db::new(config.daemon.database_path.clone()) {
        Ok(db) => db,
        Err(err) => {
            error!(
                error = %err,
                path = %config.daemon.database_path.display(),
                "Failed to initialize stats database"
            );
            std::process::exit(1);
        }
    };

    let feed = if cli.feed_json {
        let (feed, receiver) = Feed::with_channel();
        spawn_feed_printer(receiver);
        feed
    } else {
        Feed::log_only()
    };

    run(config, Arc::new(db), feed, shutdown, cli.once);
}

fn run(
    config: FraglogConfig,
    gateway: Arc<dyn StatsGateway>,
    feed: Feed,
    shutdown: ShutdownSignal,
    once: bool,
) {
    let settings = &config.daemon;
    let context = TrackerContext {
        gateway: gateway.clone(),
        feed,
        commands: Arc::new(StatsCommandHandler::new(gateway)),
    };
    let pipeline = Arc::new(Pipeline::new(
        LineClassifier::new(settings.command_sigil.clone()),
        context.clone(),
        settings.start_at,
    ));
    let registry = Arc::new(ServerRegistry::new(config.enabled_servers()));
    if registry.is_empty() {
        error!("No enabled servers to watch");
        return;
    }
    let health = Arc::new(HealthRegistry::new(settings.unhealthy_after_errors));

    let watch_settings = WatchSettings {
        poll_interval: settings.poll_interval,
        debounce: settings.debounce,
        retry: RetryPolicy {
            attempts: settings.watch_retry_attempts,
            base: settings.watch_retry_base,
            max: settings.watch_retry_max,
        },
        reestablish_after: settings.watch_reestablish_interval,
    };
    let mut watchers: Vec<DirectoryWatcher> = registry
        .by_directory()
        .into_iter()
        .map(|(directory, servers)| {
            DirectoryWatcher::new(
                directory,
                servers,
                Arc::clone(&pipeline),
                Arc::clone(&health),
                watch_settings,
                shutdown.clone(),
            )
        })
        .collect();

    info!(
        servers = registry.len(),
        directories = watchers.len(),
        database = %settings.database_path.display(),
        "fraglog daemon started"
    );

    if once {
        for watcher in &mut watchers {
            watcher.pass_all();
        }
        close_all(&registry, &context);
        return;
    }

    let mut handles: Vec<JoinHandle<()>> = watchers
        .into_iter()
        .map(DirectoryWatcher::spawn)
        .collect();
    handles.push(
        CrashMonitor::new(
            Arc::clone(&registry),
            context.clone(),
            Arc::clone(&health),
            settings.inactivity_threshold,
        )
        .spawn(settings.crash_check_interval, shutdown.clone()),
    );

    while sleep_unless_shutdown(SHUTDOWN_POLL, &shutdown) {}
    info!("Shutdown requested");
    shutdown.request();

    join_within(handles, settings.shutdown_grace);
    close_all(&registry, &context);
    info!("fraglog daemon stopped");
}

fn join_within(handles: Vec<JoinHandle<()>>, grace: Duration) {
    let deadline = Instant::now() + grace;
    while handles.iter().any(|handle| !handle.is_finished()) {
        if Instant::now() >= deadline {
            let pending = handles.iter().filter(|handle| !handle.is_finished()).count();
            warn!(pending, "Worker threads did not stop within the grace period");
            break;
        }
        thread::sleep(JOIN_POLL);
    }

    for handle in handles.into_iter().filter(|handle| handle.is_finished()) {
        if handle.join().is_err() {
            warn!("Worker thread panicked");
        }
    }
}

fn close_all(registry: &ServerRegistry, context: &TrackerContext) {
    let now = Instant::now();
    for server in registry.iter() {
        let mut state = server.lock();
        let at = state.clock.crash_instant(now);
        state.tracker.close_all(CloseReason::Graceful, at, context);
    }
}

fn spawn_feed_printer(receiver: Receiver<Notification>) {
    thread::spawn(move || {
        let stdout = io::stdout();
        for notification in receiver {
            match serde_json::to_string(&notification) {
                Ok(line) => {
                    let mut out = stdout.lock();
                    if writeln!(out, "{}", line).and_then(|_| out.flush()).is_err() {
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "Failed to serialize feed notification"),
            }
        }
    });
}

fn daemon_backoff_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".fraglog").join("daemon-backoff.json"))
}

//! Configuration loading and validation.
//!
//! The daemon reads one TOML file listing the servers to watch plus optional
//! daemon settings. Everything here runs before watching begins, so every
//! error is fatal.
//!
//! ```toml
//! [daemon]
//! database_path = "/var/lib/fraglog/stats.db"
//! inactivity_threshold_secs = 180
//!
//! [[servers]]
//! id = "coop-1"
//! display_name = "Coop #1"
//! log_directory = "/srv/sandstorm/Insurgency/Saved/Logs"
//! ```

use fs_err as fs;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::parser::DEFAULT_COMMAND_SIGIL;

pub const ENV_INACTIVITY_SECS: &str = "FRAGLOG_INACTIVITY_SECS";

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".fraglog/config.toml";
const DEFAULT_DATABASE_RELATIVE_PATH: &str = ".fraglog/stats.db";
const LOG_FILE_EXTENSION: &str = "log";
const MAX_SERVER_ID_LEN: usize = 64;

// The game writes a heartbeat line well inside two minutes; three minutes of
// silence with players connected means the process is gone.
const DEFAULT_INACTIVITY_THRESHOLD_SECS: u64 = 180;
const DEFAULT_CRASH_CHECK_INTERVAL_SECS: u64 = 15;
const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
const DEFAULT_DEBOUNCE_MS: u64 = 150;
const DEFAULT_WATCH_RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_WATCH_RETRY_BASE_MS: u64 = 500;
const DEFAULT_WATCH_RETRY_MAX_MS: u64 = 30_000;
const DEFAULT_WATCH_REESTABLISH_SECS: u64 = 60;
const DEFAULT_UNHEALTHY_AFTER_ERRORS: u32 = 3;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

/// One game-server log file to watch. Fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerWatchTarget {
    pub server_id: String,
    pub display_name: String,
    pub log_directory: PathBuf,
    pub log_file_name: String,
    pub enabled: bool,
}

impl ServerWatchTarget {
    pub fn log_path(&self) -> PathBuf {
        self.log_directory.join(&self.log_file_name)
    }
}

/// Where a tailer starts on a file it has never seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Catch up on the whole file.
    #[default]
    Beginning,
    /// Skip existing content and follow new lines only.
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonSettings {
    pub database_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub inactivity_threshold: Duration,
    pub crash_check_interval: Duration,
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub watch_retry_attempts: u32,
    pub watch_retry_base: Duration,
    pub watch_retry_max: Duration,
    /// How long a directory stays on polling alone before its watch is retried.
    pub watch_reestablish_interval: Duration,
    pub unhealthy_after_errors: u32,
    pub shutdown_grace: Duration,
    pub command_sigil: String,
    pub start_at: StartPosition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FraglogConfig {
    pub daemon: DaemonSettings,
    pub servers: Vec<ServerWatchTarget>,
}

impl FraglogConfig {
    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerWatchTarget> {
        self.servers.iter().filter(|server| server.enabled)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Raw file shape
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    daemon: RawDaemonSettings,
    #[serde(default)]
    servers: Vec<RawServer>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDaemonSettings {
    database_path: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    inactivity_threshold_secs: Option<u64>,
    crash_check_interval_secs: Option<u64>,
    poll_interval_ms: Option<u64>,
    debounce_ms: Option<u64>,
    watch_retry_attempts: Option<u32>,
    watch_retry_base_ms: Option<u64>,
    watch_retry_max_ms: Option<u64>,
    watch_reestablish_secs: Option<u64>,
    unhealthy_after_errors: Option<u32>,
    shutdown_grace_secs: Option<u64>,
    command_sigil: Option<String>,
    #[serde(default)]
    start_at: StartPosition,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServer {
    id: String,
    display_name: Option<String>,
    log_directory: PathBuf,
    log_file_name: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the default config path (`~/.fraglog/config.toml`).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

/// Loads, applies environment overrides to, and validates a config file.
pub fn load_config(path: &Path) -> Result<FraglogConfig> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        context: format!("reading {}", path.display()),
        source,
    })?;

    let mut config = parse_config(&content, path)?;
    apply_env_overrides(&mut config.daemon, |name| std::env::var(name).ok())?;
    validate_config(&config)?;
    Ok(config)
}

/// Parses config text without touching the environment or the filesystem.
pub fn parse_config(content: &str, path: &Path) -> Result<FraglogConfig> {
    let raw: RawConfig = toml::from_str(content).map_err(|err| ConfigError::Malformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })?;

    let daemon = build_daemon_settings(raw.daemon);
    let servers = raw.servers.into_iter().map(build_target).collect();

    Ok(FraglogConfig { daemon, servers })
}

fn build_daemon_settings(raw: RawDaemonSettings) -> DaemonSettings {
    let database_path = raw.database_path.unwrap_or_else(|| {
        dirs::home_dir()
            .map(|home| home.join(DEFAULT_DATABASE_RELATIVE_PATH))
            .unwrap_or_else(|| PathBuf::from("fraglog-stats.db"))
    });

    DaemonSettings {
        database_path,
        log_dir: raw.log_dir,
        inactivity_threshold: Duration::from_secs(
            raw.inactivity_threshold_secs
                .unwrap_or(DEFAULT_INACTIVITY_THRESHOLD_SECS),
        ),
        crash_check_interval: Duration::from_secs(
            raw.crash_check_interval_secs
                .unwrap_or(DEFAULT_CRASH_CHECK_INTERVAL_SECS),
        ),
        poll_interval: Duration::from_millis(
            raw.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        ),
        debounce: Duration::from_millis(raw.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS)),
        watch_retry_attempts: raw
            .watch_retry_attempts
            .unwrap_or(DEFAULT_WATCH_RETRY_ATTEMPTS),
        watch_retry_base: Duration::from_millis(
            raw.watch_retry_base_ms.unwrap_or(DEFAULT_WATCH_RETRY_BASE_MS),
        ),
        watch_retry_max: Duration::from_millis(
            raw.watch_retry_max_ms.unwrap_or(DEFAULT_WATCH_RETRY_MAX_MS),
        ),
        watch_reestablish_interval: Duration::from_secs(
            raw.watch_reestablish_secs
                .unwrap_or(DEFAULT_WATCH_REESTABLISH_SECS),
        ),
        unhealthy_after_errors: raw
            .unhealthy_after_errors
            .unwrap_or(DEFAULT_UNHEALTHY_AFTER_ERRORS),
        shutdown_grace: Duration::from_secs(
            raw.shutdown_grace_secs.unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
        ),
        command_sigil: raw
            .command_sigil
            .unwrap_or_else(|| DEFAULT_COMMAND_SIGIL.to_string()),
        start_at: raw.start_at,
    }
}

fn build_target(raw: RawServer) -> ServerWatchTarget {
    let server_id = raw.id.trim().to_string();
    let display_name = raw
        .display_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| server_id.clone());
    let log_file_name = raw
        .log_file_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("{}.{}", server_id, LOG_FILE_EXTENSION));

    ServerWatchTarget {
        server_id,
        display_name,
        log_directory: raw.log_directory,
        log_file_name,
        enabled: raw.enabled,
    }
}

/// Applies environment overrides. `lookup` is injected so tests stay hermetic.
pub fn apply_env_overrides(
    settings: &mut DaemonSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(value) = lookup(ENV_INACTIVITY_SECS) {
        let secs: u64 = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidSetting {
                name: ENV_INACTIVITY_SECS.to_string(),
                reason: format!("expected whole seconds, got {:?}", value),
            })?;
        settings.inactivity_threshold = Duration::from_secs(secs);
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────────

pub fn validate_config(config: &FraglogConfig) -> Result<()> {
    validate_settings(&config.daemon)?;

    let mut seen = HashSet::new();
    let mut log_owners: HashMap<PathBuf, &str> = HashMap::new();
    for server in &config.servers {
        validate_server_id(&server.server_id)?;
        if !seen.insert(server.server_id.as_str()) {
            return Err(ConfigError::DuplicateServerId(server.server_id.clone()));
        }
        validate_log_file_name(server)?;
        if !server.enabled {
            continue;
        }
        validate_directory(server)?;

        let log_path = fs::canonicalize(&server.log_directory)
            .unwrap_or_else(|_| server.log_directory.clone())
            .join(&server.log_file_name);
        if let Some(owner) = log_owners.get(&log_path) {
            return Err(ConfigError::SharedLogFile {
                first: owner.to_string(),
                second: server.server_id.clone(),
                path: log_path,
            });
        }
        log_owners.insert(log_path, server.server_id.as_str());
    }

    if config.enabled_servers().next().is_none() {
        return Err(ConfigError::NoEnabledServers);
    }

    Ok(())
}

fn validate_settings(settings: &DaemonSettings) -> Result<()> {
    if settings.inactivity_threshold.is_zero() {
        return Err(invalid_setting(
            "inactivity_threshold_secs",
            "must be greater than zero",
        ));
    }
    if settings.crash_check_interval.is_zero() {
        return Err(invalid_setting(
            "crash_check_interval_secs",
            "must be greater than zero",
        ));
    }
    if settings.poll_interval.is_zero() {
        return Err(invalid_setting("poll_interval_ms", "must be greater than zero"));
    }
    if settings.watch_reestablish_interval.is_zero() {
        return Err(invalid_setting(
            "watch_reestablish_secs",
            "must be greater than zero",
        ));
    }
    if settings.watch_retry_base > settings.watch_retry_max {
        return Err(invalid_setting(
            "watch_retry_base_ms",
            "must not exceed watch_retry_max_ms",
        ));
    }
    if settings.command_sigil.trim().is_empty() {
        return Err(invalid_setting("command_sigil", "must not be empty"));
    }
    Ok(())
}

fn invalid_setting(name: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidSetting {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

pub fn validate_server_id(id: &str) -> Result<()> {
    let invalid = |reason: &str| ConfigError::InvalidServerId {
        id: id.to_string(),
        reason: reason.to_string(),
    };

    if id.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if id.len() > MAX_SERVER_ID_LEN {
        return Err(invalid("must be at most 64 characters"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid("may only contain ASCII letters, digits, '-' and '_'"));
    }
    Ok(())
}

fn validate_log_file_name(server: &ServerWatchTarget) -> Result<()> {
    let name = &server.log_file_name;
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(ConfigError::InvalidSetting {
            name: format!("servers.{}.log_file_name", server.server_id),
            reason: "must be a bare file name".to_string(),
        });
    }
    Ok(())
}

fn validate_directory(server: &ServerWatchTarget) -> Result<()> {
    let unreadable = |reason: String| ConfigError::UnreadableDirectory {
        server_id: server.server_id.clone(),
        path: server.log_directory.clone(),
        reason,
    };

    if !server.log_directory.is_dir() {
        return Err(unreadable("not a directory".to_string()));
    }
    fs::read_dir(&server.log_directory).map_err(|err| unreadable(err.to_string()))?;
    Ok(())
}

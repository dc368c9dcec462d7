//! Error types for fraglog-core operations.

use std::path::PathBuf;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors raised while loading or validating the watch configuration.
///
/// All of these are fatal at startup: nothing is watched until the
/// configuration validates cleanly.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Configuration file malformed: {path}: {details}")]
    Malformed { path: PathBuf, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Duplicate server identifier: {0}")]
    DuplicateServerId(String),

    #[error("Invalid server identifier {id:?}: {reason}")]
    InvalidServerId { id: String, reason: String },

    #[error("Log directory for server {server_id} is not readable: {path}: {reason}")]
    UnreadableDirectory {
        server_id: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Servers {first} and {second} both watch {path}")]
    SharedLogFile {
        first: String,
        second: String,
        path: PathBuf,
    },

    #[error("Invalid setting {name}: {reason}")]
    InvalidSetting { name: String, reason: String },

    #[error("No enabled servers configured")]
    NoEnabledServers,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Parse Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Token-level parse failures.
///
/// The line classifier never surfaces these to its caller; they exist so the
/// token parsers can say precisely what was wrong before the line is skipped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Timestamp missing millisecond separator: {0:?}")]
    MissingMillis(String),

    #[error("Timestamp millisecond part must be 1-3 digits: {0:?}")]
    InvalidMillis(String),

    #[error("Timestamp date/time malformed: {input:?}: {details}")]
    InvalidDateTime { input: String, details: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

impl From<ConfigError> for String {
    fn from(err: ConfigError) -> String {
        err.to_string()
    }
}

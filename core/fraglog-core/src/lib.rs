//! # fraglog-core
//!
//! Pure building blocks for the fraglog daemon: everything that can be
//! decided from a single log line or a config file without touching the
//! running system.
//!
//! ## Design Principles
//!
//! - **Synchronous and side-effect free**: parsing never blocks or writes.
//! - **Never fails on input**: the classifier returns "no event" for anything
//!   it does not recognise; only configuration loading returns errors.
//! - **Single source of truth**: every log-format detail lives in
//!   [`patterns`] and [`parser`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fraglog_core::LineClassifier;
//!
//! let classifier = LineClassifier::default();
//! if let Some(event) = classifier.classify(line) {
//!     println!("{} at {}", event.kind.label(), event.timestamp);
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod parser;
pub mod patterns;
pub mod timestamp;
pub mod weapons;

pub use config::{
    default_config_path, load_config, DaemonSettings, FraglogConfig, ServerWatchTarget,
    StartPosition,
};
pub use error::{ConfigError, ParseError, Result};
pub use events::{
    ChatCommand, Combatant, Event, EventKind, KillEvent, KillKind, MapLoadEvent, PlayerIdentity,
    TeamId,
};
pub use parser::{line_timestamp, parse_line, LineClassifier, DEFAULT_COMMAND_SIGIL};
pub use timestamp::parse_log_timestamp;
pub use weapons::normalize_weapon;

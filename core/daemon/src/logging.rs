//! Tracing setup.
//!
//! `FRAGLOG_DEBUG_LOG=1` forces debug output; otherwise `FRAGLOG_LOG` (or
//! `RUST_LOG`) selects the filter, defaulting to `info`. When a log directory
//! is configured, output also goes to a daily-rolling file there.

use std::env;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const ENV_LOG: &str = "FRAGLOG_LOG";
pub const ENV_DEBUG_LOG: &str = "FRAGLOG_DEBUG_LOG";

const LOG_FILE_PREFIX: &str = "fraglog-daemon.log";

/// Installs the global subscriber. Keep the returned guard alive for the
/// life of the process so buffered file output is flushed.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let file_writer = log_dir.map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        tracing_appender::non_blocking(appender)
    });

    let (file_layer, guard) = match file_writer {
        Some((writer, guard)) => (
            Some(fmt::layer().with_ansi(false).with_writer(writer)),
            Some(guard),
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(build_filter())
        .with(fmt::layer())
        .with(file_layer)
        .init();

    guard
}

fn build_filter() -> EnvFilter {
    if debug_forced(env::var(ENV_DEBUG_LOG).ok().as_deref()) {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_env(ENV_LOG)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn debug_forced(value: Option<&str>) -> bool {
    matches!(value, Some("1" | "true" | "TRUE" | "yes" | "YES"))
}

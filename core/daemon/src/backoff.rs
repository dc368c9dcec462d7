//! Retry pacing.
//!
//! Two flavours: a crash-loop guard that delays daemon startup when it has
//! been restarted repeatedly within a short window, and an exponential retry
//! policy for transient watch/IO failures.

use chrono::{DateTime, Utc};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::cmp;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration as StdDuration;
use tracing::{info, warn};

use crate::shutdown::ShutdownSignal;

const RESTART_WINDOW_MS: i64 = 120_000;
const FREE_RESTARTS: usize = 3;
const DELAY_PER_EXTRA_RESTART: StdDuration = StdDuration::from_secs(10);
const MAX_STARTUP_DELAY: StdDuration = StdDuration::from_secs(60);
const SLEEP_SLICE: StdDuration = StdDuration::from_millis(100);

/// Recent daemon start times, as epoch milliseconds.
#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct StartHistory {
    #[serde(default)]
    starts_ms: Vec<i64>,
}

impl StartHistory {
    fn read(path: &Path) -> Result<Self, String> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| format!("Corrupt start history: {}", err)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.to_string()),
        }
    }

    fn write(&self, path: &Path) -> Result<(), String> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|err| err.to_string())?;
        }
        let staged = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(self).map_err(|err| err.to_string())?;
        fs::write(&staged, bytes).map_err(|err| err.to_string())?;
        fs::rename(&staged, path).map_err(|err| err.to_string())
    }

    /// Forgets starts outside the window, records `now`, and returns how
    /// long this start should wait.
    fn record(&mut self, now: DateTime<Utc>) -> Option<StdDuration> {
        let now_ms = now.timestamp_millis();
        self.starts_ms
            .retain(|&at| at <= now_ms && now_ms - at <= RESTART_WINDOW_MS);
        self.starts_ms.push(now_ms);

        let extra = self.starts_ms.len().checked_sub(FREE_RESTARTS)?;
        if extra == 0 {
            return None;
        }
        let extra = u32::try_from(extra).unwrap_or(u32::MAX);
        Some(cmp::min(
            DELAY_PER_EXTRA_RESTART.saturating_mul(extra),
            MAX_STARTUP_DELAY,
        ))
    }
}

/// Delays startup when the daemon is being restarted in a tight loop, e.g.
/// by a supervisor while the config or database is broken.
pub fn apply_startup_backoff(path: &Path, shutdown: &ShutdownSignal) {
    let mut history = StartHistory::read(path).unwrap_or_else(|err| {
        warn!(path = %path.display(), error = %err, "Discarding start history");
        StartHistory::default()
    });
    let delay = history.record(Utc::now());

    if let Err(err) = history.write(path) {
        warn!(path = %path.display(), error = %err, "Failed to save start history");
    }

    let Some(delay) = delay else {
        return;
    };
    info!(
        recent_starts = history.starts_ms.len(),
        delay_secs = delay.as_secs(),
        "Restarted repeatedly; delaying startup"
    );
    sleep_unless_shutdown(delay, shutdown);
}

/// Bounded exponential retry: `base * 2^attempt`, capped at `max`, for at
/// most `attempts` tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: StdDuration,
    pub max: StdDuration,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> StdDuration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        cmp::min(self.base.saturating_mul(factor), self.max)
    }

    /// Runs `op` until it succeeds, attempts run out, or shutdown is
    /// requested. Returns the last error on exhaustion.
    pub fn run<T>(
        &self,
        what: &str,
        shutdown: &ShutdownSignal,
        mut op: impl FnMut() -> Result<T, String>,
    ) -> Result<T, String> {
        let attempts = self.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    last_error = err;
                    if attempt + 1 == attempts {
                        break;
                    }
                    let delay = self.delay(attempt);
                    warn!(
                        what,
                        attempt = attempt + 1,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %last_error,
                        "Retrying after failure"
                    );
                    if !sleep_unless_shutdown(delay, shutdown) {
                        return Err(format!("{} aborted by shutdown: {}", what, last_error));
                    }
                }
            }
        }

        Err(last_error)
    }
}

/// Sleeps in short slices; returns `false` if shutdown was requested.
pub fn sleep_unless_shutdown(duration: StdDuration, shutdown: &ShutdownSignal) -> bool {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if shutdown.is_requested() {
            return false;
        }
        let slice = cmp::min(remaining, SLEEP_SLICE);
        thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
    !shutdown.is_requested()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn history_at(now: DateTime<Utc>, ages_secs: &[i64]) -> StartHistory {
        StartHistory {
            starts_ms: ages_secs
                .iter()
                .map(|age| (now - Duration::seconds(*age)).timestamp_millis())
                .collect(),
        }
    }

    #[test]
    fn fourth_start_in_window_is_delayed() {
        let now = Utc::now();
        let mut history = history_at(now, &[30, 20]);
        assert_eq!(history.record(now), None);

        let later = now + Duration::seconds(1);
        assert_eq!(history.record(later), Some(DELAY_PER_EXTRA_RESTART));
        assert_eq!(history.starts_ms.len(), 4);
    }

    #[test]
    fn delay_is_capped() {
        let now = Utc::now();
        let mut history = history_at(now, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(history.record(now), Some(MAX_STARTUP_DELAY));
    }

    #[test]
    fn old_starts_fall_out_of_the_window() {
        let now = Utc::now();
        let mut history = history_at(now, &[500, 400, 300, 200]);
        assert_eq!(history.record(now), None);
        assert_eq!(history.starts_ms, vec![now.timestamp_millis()]);
    }

    #[test]
    fn history_survives_a_round_trip_and_tolerates_corruption() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("state").join("daemon-backoff.json");

        assert_eq!(StartHistory::read(&path), Ok(StartHistory::default()));
        let history = StartHistory {
            starts_ms: vec![1, 2, 3],
        };
        history.write(&path).expect("write history");
        assert_eq!(StartHistory::read(&path), Ok(history));

        fs::write(&path, b"{not json").expect("corrupt history");
        assert!(StartHistory::read(&path).is_err());
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            attempts: 5,
            base: StdDuration::from_millis(100),
            max: StdDuration::from_millis(500),
        };
        assert_eq!(policy.delay(0), StdDuration::from_millis(100));
        assert_eq!(policy.delay(1), StdDuration::from_millis(200));
        assert_eq!(policy.delay(2), StdDuration::from_millis(400));
        assert_eq!(policy.delay(3), StdDuration::from_millis(500));
        assert_eq!(policy.delay(40), StdDuration::from_millis(500));
    }

    #[test]
    fn retry_stops_after_attempts() {
        let policy = RetryPolicy {
            attempts: 3,
            base: StdDuration::from_millis(1),
            max: StdDuration::from_millis(2),
        };
        let shutdown = ShutdownSignal::new();
        let mut calls = 0;
        let result: Result<(), String> = policy.run("test op", &shutdown, || {
            calls += 1;
            Err(format!("failure {}", calls))
        });
        assert_eq!(calls, 3);
        assert_eq!(result, Err("failure 3".to_string()));
    }

    #[test]
    fn retry_returns_first_success() {
        let policy = RetryPolicy {
            attempts: 4,
            base: StdDuration::from_millis(1),
            max: StdDuration::from_millis(1),
        };
        let shutdown = ShutdownSignal::new();
        let mut calls = 0;
        let result = policy.run("test op", &shutdown, || {
            calls += 1;
            if calls < 2 {
                Err("not yet".to_string())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(2));
    }
}

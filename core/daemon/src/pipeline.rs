//! Line pipeline: tailer output -> classifier -> tracker, one server at a
//! time.
//!
//! Nothing in here fails outward. Unrecognised lines only refresh the
//! activity clock, and store errors are logged by the tracker.

use fraglog_core::{line_timestamp, LineClassifier, ServerWatchTarget, StartPosition};
use std::io;
use std::time::Instant;
use tracing::{debug, warn};

use crate::state::ServerHandle;
use crate::tailer::FileTailer;
use crate::tracker::TrackerContext;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub lines: usize,
    pub events: usize,
    pub truncated: bool,
}

pub struct Pipeline {
    classifier: LineClassifier,
    context: TrackerContext,
    start_at: StartPosition,
}

impl Pipeline {
    pub fn new(
        classifier: LineClassifier,
        context: TrackerContext,
        start_at: StartPosition,
    ) -> Self {
        Self {
            classifier,
            context,
            start_at,
        }
    }

    /// Tailer for `target`, resuming from the stored cursor when there is one.
    pub fn open_tailer(&self, target: &ServerWatchTarget) -> FileTailer {
        let path = target.log_path();
        let key = path.to_string_lossy().to_string();

        match self.context.gateway.load_cursor(&key) {
            Ok(Some(cursor)) => {
                debug!(
                    server_id = %target.server_id,
                    offset = cursor.byte_offset,
                    "Resuming from saved cursor"
                );
                return FileTailer::resume(cursor);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(
                    server_id = %target.server_id,
                    error = %err,
                    "Failed to load saved cursor; applying start position"
                );
            }
        }

        match self.start_at {
            StartPosition::Beginning => FileTailer::new(path),
            StartPosition::End => FileTailer::at_end(&path).unwrap_or_else(|err| {
                warn!(
                    server_id = %target.server_id,
                    error = %err,
                    "Failed to stat log file; reading from the beginning"
                );
                FileTailer::new(path)
            }),
        }
    }

    /// Feeds one raw line through the classifier and the server's tracker.
    /// Returns whether the line produced an event.
    pub fn process_line(&self, server: &ServerHandle, line: &str) -> bool {
        let event = self.classifier.classify(line);
        let mut state = server.lock();
        state.clock.touch(Instant::now(), line_timestamp(line));

        match event {
            Some(event) => {
                state.tracker.apply(&event, &self.context);
                true
            }
            None => false,
        }
    }

    /// Reads everything appended since the last pass, applies it, and
    /// persists the cursor after each chunk.
    pub fn catch_up(
        &self,
        server: &ServerHandle,
        tailer: &mut FileTailer,
    ) -> io::Result<PassSummary> {
        let mut summary = PassSummary::default();

        loop {
            let outcome = tailer.poll()?;
            summary.truncated |= outcome.truncated;

            for line in &outcome.lines {
                summary.lines += 1;
                if self.process_line(server, line) {
                    summary.events += 1;
                }
            }

            if !outcome.lines.is_empty() || outcome.truncated {
                if let Err(err) = self.context.gateway.save_cursor(tailer.cursor()) {
                    warn!(
                        server_id = %server.server_id(),
                        error = %err,
                        "Failed to persist tail cursor"
                    );
                }
            }

            if !outcome.more {
                break;
            }
        }

        if summary.lines > 0 {
            debug!(
                server_id = %server.server_id(),
                lines = summary.lines,
                events = summary.events,
                offset = tailer.cursor().byte_offset,
                "Tail pass complete"
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::NoopCommands;
    use crate::db::{Db, StatsGateway, TallyField};
    use crate::feed::Feed;
    use fs_err as fs;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Db>,
        target: ServerWatchTarget,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("temp dir");
            let db = Arc::new(Db::new(dir.path().join("stats.db")).expect("db init"));
            let target = ServerWatchTarget {
                server_id: "coop".to_string(),
                display_name: "Coop".to_string(),
                log_directory: dir.path().to_path_buf(),
                log_file_name: "coop.log".to_string(),
                enabled: true,
            };
            Self {
                _dir: dir,
                db,
                target,
            }
        }

        fn log_path(&self) -> PathBuf {
            self.target.log_path()
        }

        fn pipeline(&self) -> Pipeline {
            let context = TrackerContext {
                gateway: self.db.clone(),
                feed: Feed::log_only(),
                commands: Arc::new(NoopCommands),
            };
            Pipeline::new(LineClassifier::default(), context, StartPosition::Beginning)
        }

        fn server(&self) -> ServerHandle {
            ServerHandle::new(self.target.clone())
        }
    }

    fn stamp(secs: u32) -> String {
        format!("[2025.10.04-16.{:02}.{:02}:000][1]", secs / 60, secs % 60)
    }

    fn append(path: &Path, lines: &[String]) {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open log");
        for line in lines {
            writeln!(file, "{}", line).expect("append");
        }
    }

    fn map_load(secs: u32, map: &str) -> String {
        format!(
            "{}LogLoad: LoadMap: /Game/Maps/{map}/{map}?Scenario=Scenario_{map}_Checkpoint_Security?MaxPlayers=8?Lighting=Day",
            stamp(secs)
        )
    }

    fn login_and_join(secs: u32, name: &str, id: &str) -> Vec<String> {
        vec![
            format!(
                "{}LogNet: Login request: ?Name={name}?SplitscreenCount=1 userId: SteamNWI:{id} platform: SteamNWI",
                stamp(secs)
            ),
            format!("{}LogNet: Join succeeded: {name}", stamp(secs)),
        ]
    }

    fn leave(secs: u32, id: &str) -> String {
        format!(
            "{}LogNet: UChannel::Close: Sending CloseBunch. ChIndex == 0. UniqueId: SteamNWI:{id}",
            stamp(secs)
        )
    }

    fn gameplay(secs: u32, message: &str) -> String {
        format!("{}LogGameplayEvents: Display: {message}", stamp(secs))
    }

    fn match_script() -> Vec<String> {
        let mut lines = vec![map_load(0, "Farmhouse")];
        lines.extend(login_and_join(1, "P1", "1"));
        lines.extend(login_and_join(2, "P2", "2"));
        lines.push(gameplay(
            10,
            "P1[1, team 0] killed P2[2, team 0] with BP_Firearm_M16A4_C_1",
        ));
        lines.push(leave(20, "2"));
        lines.push(gameplay(30, "Round 1 Over: Team 0 won (win reason: Elimination)"));
        lines.push(gameplay(40, "Game over"));
        lines
    }

    #[test]
    fn full_match_flow_produces_consistent_rows() {
        let fixture = Fixture::new();
        append(&fixture.log_path(), &match_script());

        let pipeline = fixture.pipeline();
        let server = fixture.server();
        let mut tailer = pipeline.open_tailer(&fixture.target);
        let summary = pipeline.catch_up(&server, &mut tailer).expect("catch up");
        assert_eq!(summary.lines, 9);
        assert_eq!(summary.events, 9);

        let db = &fixture.db;
        let matches = db.match_ids();
        assert_eq!(matches.len(), 1);
        let match_id = &matches[0];
        assert_eq!(db.map_names(match_id), vec!["Farmhouse"]);
        assert_eq!(db.match_status(match_id).as_deref(), Some("completed"));
        assert_eq!(db.count("match_participants"), 2);

        let p1 = db.participant(match_id, "id:1").expect("P1 row");
        assert_eq!(p1.teamkills, 1);
        assert_eq!(p1.kills, 0);
        let p2 = db.participant(match_id, "id:2").expect("P2 row");
        assert_eq!(p2.deaths, 1);
        assert_eq!(p2.playtime_ms, 18_000);

        let (leave_time, duration, reason) = db.latest_session("id:2").expect("P2 session");
        assert!(leave_time.is_some());
        assert!(duration.expect("duration") > 0);
        assert_eq!(reason.as_deref(), Some("leave"));

        // P1 stays connected after game over.
        let state = server.lock();
        assert_eq!(state.tracker.open_session_count(), 1);
        assert_eq!(state.tracker.active_match_id(), None);
    }

    #[test]
    fn restart_with_saved_cursor_changes_nothing() {
        let fixture = Fixture::new();
        append(&fixture.log_path(), &match_script());

        {
            let pipeline = fixture.pipeline();
            let server = fixture.server();
            let mut tailer = pipeline.open_tailer(&fixture.target);
            pipeline.catch_up(&server, &mut tailer).expect("first run");
        }
        let teamkills = || fixture.db.weapon_tally("id:1", "M16A4", TallyField::Teamkills);
        assert_eq!(teamkills(), 1);

        let pipeline = fixture.pipeline();
        let server = fixture.server();
        let mut tailer = pipeline.open_tailer(&fixture.target);
        let summary = pipeline.catch_up(&server, &mut tailer).expect("second run");

        assert_eq!(summary.lines, 0);
        assert_eq!(teamkills(), 1);
        assert_eq!(fixture.db.count("kills"), 1);
        assert_eq!(fixture.db.match_ids().len(), 1);
    }

    #[test]
    fn without_saved_cursor_replay_double_counts() {
        let fixture = Fixture::new();
        append(&fixture.log_path(), &match_script());

        for _ in 0..2 {
            let pipeline = fixture.pipeline();
            let server = fixture.server();
            let mut tailer = FileTailer::new(fixture.log_path());
            pipeline.catch_up(&server, &mut tailer).expect("run");
        }

        assert_eq!(
            fixture.db.weapon_tally("id:1", "M16A4", TallyField::Teamkills),
            2
        );
        assert_eq!(fixture.db.count("kills"), 2);
    }

    #[test]
    fn truncated_log_is_read_again_from_zero() {
        let fixture = Fixture::new();
        let path = fixture.log_path();
        append(&path, &[gameplay(0, "Round 1 Started"), gameplay(5, "Round 2 Started")]);

        let pipeline = fixture.pipeline();
        let server = fixture.server();
        let mut tailer = pipeline.open_tailer(&fixture.target);
        pipeline.catch_up(&server, &mut tailer).expect("first pass");
        assert_eq!(server.lock().tracker.round(), 2);

        fs::write(&path, format!("{}\n", gameplay(60, "Round 7 Started"))).expect("rotate");
        let summary = pipeline.catch_up(&server, &mut tailer).expect("second pass");

        assert!(summary.truncated);
        assert_eq!(summary.lines, 1);
        assert_eq!(server.lock().tracker.round(), 7);

        let saved = fixture
            .db
            .load_cursor(&path.to_string_lossy())
            .expect("load")
            .expect("cursor");
        assert_eq!(saved.byte_offset, tailer.cursor().byte_offset);
    }

    #[test]
    fn unrecognised_lines_still_refresh_activity() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline();
        let server = fixture.server();

        let line = format!("{}LogTemp: Display: heartbeat", stamp(90));
        assert!(!pipeline.process_line(&server, &line));
        assert!(server.lock().clock.last_log_timestamp().is_some());
    }
}

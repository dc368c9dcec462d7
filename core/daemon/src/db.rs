//! SQLite persistence for fraglog-daemon.
//!
//! The tracker talks to storage only through [`StatsGateway`]. Every write is
//! an upsert keyed by a natural key or an additive counter bump; replay
//! protection lives in the persisted tail cursors, not here.

use chrono::{DateTime, Utc};
use fraglog_core::MapLoadEvent;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::PathBuf;

use crate::tailer::TailCursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    Active,
    Completed,
    Aborted,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Active => "active",
            MatchStatus::Completed => "completed",
            MatchStatus::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillCredit {
    Kill,
    Assist,
}

impl KillCredit {
    pub fn as_str(&self) -> &'static str {
        match self {
            KillCredit::Kill => "kill",
            KillCredit::Assist => "assist",
        }
    }
}

/// Which weapon counter to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TallyField {
    Kills,
    Assists,
    Teamkills,
    Suicides,
    Deaths,
}

impl TallyField {
    fn column(&self) -> &'static str {
        match self {
            TallyField::Kills => "kills",
            TallyField::Assists => "assists",
            TallyField::Teamkills => "teamkills",
            TallyField::Suicides => "suicides",
            TallyField::Deaths => "deaths",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionStart {
    pub session_key: String,
    pub server_id: String,
    pub player_key: String,
    pub player_name: String,
    pub join_time: DateTime<Utc>,
    pub match_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KillRecord {
    pub server_id: String,
    pub match_id: Option<String>,
    pub map: Option<String>,
    pub round: u32,
    pub occurred_at: DateTime<Utc>,
    pub killer_key: String,
    /// `None` for bot victims.
    pub victim_key: Option<String>,
    pub victim_name: String,
    pub weapon: String,
    pub kind: &'static str,
    pub credit: KillCredit,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantRecord {
    pub match_id: String,
    pub player_key: String,
    pub player_name: String,
    pub kills: u32,
    pub assists: u32,
    pub deaths: u32,
    pub teamkills: u32,
    pub suicides: u32,
    pub playtime_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerTotals {
    pub name: String,
    pub kills: u32,
    pub assists: u32,
    pub deaths: u32,
    pub teamkills: u32,
    pub suicides: u32,
    pub playtime_ms: i64,
}

/// Storage seam used by the tracker, the tailers and chat commands.
pub trait StatsGateway: Send + Sync {
    fn upsert_player(
        &self,
        player_key: &str,
        external_id: Option<&str>,
        name: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<(), String>;

    /// Moves everything recorded under `from_key` onto `to_key`.
    fn promote_player(
        &self,
        from_key: &str,
        to_key: &str,
        external_id: &str,
        name: &str,
        at: DateTime<Utc>,
    ) -> Result<(), String>;

    fn start_session(&self, session: &SessionStart) -> Result<(), String>;

    fn end_session(
        &self,
        session_key: &str,
        leave_time: DateTime<Utc>,
        duration_ms: i64,
        close_reason: &str,
    ) -> Result<(), String>;

    fn add_playtime(&self, player_key: &str, duration_ms: i64) -> Result<(), String>;

    fn insert_kill(&self, kill: &KillRecord) -> Result<(), String>;

    fn increment_weapon_tally(
        &self,
        player_key: &str,
        weapon: &str,
        field: TallyField,
    ) -> Result<(), String>;

    fn start_match(
        &self,
        match_id: &str,
        server_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), String>;

    fn append_match_map(
        &self,
        match_id: &str,
        seq: u32,
        map: &MapLoadEvent,
        loaded_at: DateTime<Utc>,
    ) -> Result<(), String>;

    fn record_round(
        &self,
        match_id: &str,
        round: u32,
        winning_team: u8,
        reason: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<(), String>;

    fn set_match_difficulty(&self, match_id: &str, difficulty: f32) -> Result<(), String>;

    fn end_match(
        &self,
        match_id: &str,
        ended_at: DateTime<Utc>,
        status: MatchStatus,
    ) -> Result<(), String>;

    fn upsert_participant(
        &self,
        participant: &ParticipantRecord,
        updated_at: DateTime<Utc>,
    ) -> Result<(), String>;

    fn record_fall_damage(&self, player_key: &str, damage: f32) -> Result<(), String>;

    fn load_cursor(&self, file_path: &str) -> Result<Option<TailCursor>, String>;

    fn save_cursor(&self, cursor: &TailCursor) -> Result<(), String>;

    fn player_totals(&self, player_key: &str) -> Result<Option<PlayerTotals>, String>;
}

pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS players (
                    player_key TEXT PRIMARY KEY,
                    external_id TEXT,
                    name TEXT NOT NULL,
                    first_seen_at TEXT NOT NULL,
                    last_seen_at TEXT NOT NULL,
                    playtime_ms INTEGER NOT NULL DEFAULT 0,
                    fall_count INTEGER NOT NULL DEFAULT 0,
                    fall_damage REAL NOT NULL DEFAULT 0
                 );
                 CREATE TABLE IF NOT EXISTS sessions (
                    session_key TEXT PRIMARY KEY,
                    server_id TEXT NOT NULL,
                    player_key TEXT NOT NULL,
                    player_name TEXT NOT NULL,
                    join_time TEXT NOT NULL,
                    leave_time TEXT,
                    duration_ms INTEGER,
                    match_id TEXT,
                    close_reason TEXT
                 );
                 CREATE TABLE IF NOT EXISTS matches (
                    match_id TEXT PRIMARY KEY,
                    server_id TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    ended_at TEXT,
                    status TEXT NOT NULL,
                    difficulty REAL
                 );
                 CREATE TABLE IF NOT EXISTS match_maps (
                    match_id TEXT NOT NULL,
                    seq INTEGER NOT NULL,
                    map TEXT NOT NULL,
                    scenario TEXT NOT NULL,
                    lighting TEXT NOT NULL,
                    max_players INTEGER NOT NULL,
                    loaded_at TEXT NOT NULL,
                    PRIMARY KEY (match_id, seq)
                 );
                 CREATE TABLE IF NOT EXISTS match_rounds (
                    match_id TEXT NOT NULL,
                    round INTEGER NOT NULL,
                    winning_team INTEGER NOT NULL,
                    reason TEXT NOT NULL,
                    ended_at TEXT NOT NULL,
                    PRIMARY KEY (match_id, round)
                 );
                 CREATE TABLE IF NOT EXISTS match_participants (
                    match_id TEXT NOT NULL,
                    player_key TEXT NOT NULL,
                    player_name TEXT NOT NULL,
                    kills INTEGER NOT NULL DEFAULT 0,
                    assists INTEGER NOT NULL DEFAULT 0,
                    deaths INTEGER NOT NULL DEFAULT 0,
                    teamkills INTEGER NOT NULL DEFAULT 0,
                    suicides INTEGER NOT NULL DEFAULT 0,
                    playtime_ms INTEGER NOT NULL DEFAULT 0,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (match_id, player_key)
                 );
                 CREATE TABLE IF NOT EXISTS kills (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    server_id TEXT NOT NULL,
                    match_id TEXT,
                    map TEXT,
                    round INTEGER NOT NULL,
                    occurred_at TEXT NOT NULL,
                    killer_key TEXT NOT NULL,
                    victim_key TEXT,
                    victim_name TEXT NOT NULL,
                    weapon TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    credit TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS weapon_tallies (
                    player_key TEXT NOT NULL,
                    weapon TEXT NOT NULL,
                    kills INTEGER NOT NULL DEFAULT 0,
                    assists INTEGER NOT NULL DEFAULT 0,
                    teamkills INTEGER NOT NULL DEFAULT 0,
                    suicides INTEGER NOT NULL DEFAULT 0,
                    deaths INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (player_key, weapon)
                 );
                 CREATE TABLE IF NOT EXISTS tail_cursors (
                    file_path TEXT PRIMARY KEY,
                    byte_offset INTEGER NOT NULL,
                    file_size INTEGER NOT NULL,
                    last_line TEXT,
                    updated_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_sessions_player ON sessions(player_key);
                 CREATE INDEX IF NOT EXISTS idx_kills_killer ON kills(killer_key);
                 CREATE INDEX IF NOT EXISTS idx_kills_match ON kills(match_id);
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))?;

            Ok(())
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("Failed to create database dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}

impl StatsGateway for Db {
    fn upsert_player(
        &self,
        player_key: &str,
        external_id: Option<&str>,
        name: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<(), String> {
        let seen_at = seen_at.to_rfc3339();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO players (player_key, external_id, name, first_seen_at, last_seen_at) \
                 VALUES (?1, ?2, ?3, ?4, ?4) \
                 ON CONFLICT(player_key) DO UPDATE SET \
                    external_id = COALESCE(excluded.external_id, players.external_id), \
                    name = excluded.name, \
                    last_seen_at = MAX(players.last_seen_at, excluded.last_seen_at)",
                params![player_key, external_id, name, seen_at],
            )
            .map_err(|err| format!("Failed to upsert player: {}", err))?;
            Ok(())
        })
    }

    fn promote_player(
        &self,
        from_key: &str,
        to_key: &str,
        external_id: &str,
        name: &str,
        at: DateTime<Utc>,
    ) -> Result<(), String> {
        let at = at.to_rfc3339();
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to start promotion transaction: {}", err))?;

            tx.execute(
                "INSERT INTO players \
                    (player_key, external_id, name, first_seen_at, last_seen_at, \
                     playtime_ms, fall_count, fall_damage) \
                 SELECT ?2, ?3, ?4, first_seen_at, ?5, playtime_ms, fall_count, fall_damage \
                 FROM players WHERE player_key = ?1 \
                 ON CONFLICT(player_key) DO UPDATE SET \
                    external_id = excluded.external_id, \
                    name = excluded.name, \
                    first_seen_at = MIN(players.first_seen_at, excluded.first_seen_at), \
                    last_seen_at = excluded.last_seen_at, \
                    playtime_ms = players.playtime_ms + excluded.playtime_ms, \
                    fall_count = players.fall_count + excluded.fall_count, \
                    fall_damage = players.fall_damage + excluded.fall_damage",
                params![from_key, to_key, external_id, name, at],
            )
            .map_err(|err| format!("Failed to merge promoted player: {}", err))?;
            tx.execute("DELETE FROM players WHERE player_key = ?1", params![from_key])
                .map_err(|err| format!("Failed to remove provisional player: {}", err))?;

            tx.execute(
                "INSERT INTO weapon_tallies \
                    (player_key, weapon, kills, assists, teamkills, suicides, deaths) \
                 SELECT ?2, weapon, kills, assists, teamkills, suicides, deaths \
                 FROM weapon_tallies WHERE player_key = ?1 \
                 ON CONFLICT(player_key, weapon) DO UPDATE SET \
                    kills = weapon_tallies.kills + excluded.kills, \
                    assists = weapon_tallies.assists + excluded.assists, \
                    teamkills = weapon_tallies.teamkills + excluded.teamkills, \
                    suicides = weapon_tallies.suicides + excluded.suicides, \
                    deaths = weapon_tallies.deaths + excluded.deaths",
                params![from_key, to_key],
            )
            .map_err(|err| format!("Failed to merge weapon tallies: {}", err))?;
            tx.execute(
                "DELETE FROM weapon_tallies WHERE player_key = ?1",
                params![from_key],
            )
            .map_err(|err| format!("Failed to remove provisional tallies: {}", err))?;

            tx.execute(
                "INSERT INTO match_participants \
                    (match_id, player_key, player_name, kills, assists, deaths, teamkills, \
                     suicides, playtime_ms, updated_at) \
                 SELECT match_id, ?2, ?3, kills, assists, deaths, teamkills, suicides, \
                        playtime_ms, ?4 \
                 FROM match_participants WHERE player_key = ?1 \
                 ON CONFLICT(match_id, player_key) DO UPDATE SET \
                    player_name = excluded.player_name, \
                    kills = match_participants.kills + excluded.kills, \
                    assists = match_participants.assists + excluded.assists, \
                    deaths = match_participants.deaths + excluded.deaths, \
                    teamkills = match_participants.teamkills + excluded.teamkills, \
                    suicides = match_participants.suicides + excluded.suicides, \
                    playtime_ms = match_participants.playtime_ms + excluded.playtime_ms, \
                    updated_at = excluded.updated_at",
                params![from_key, to_key, name, at],
            )
            .map_err(|err| format!("Failed to merge match participation: {}", err))?;
            tx.execute(
                "DELETE FROM match_participants WHERE player_key = ?1",
                params![from_key],
            )
            .map_err(|err| format!("Failed to remove provisional participation: {}", err))?;

            tx.execute(
                "UPDATE sessions SET player_key = ?2 WHERE player_key = ?1",
                params![from_key, to_key],
            )
            .map_err(|err| format!("Failed to re-key sessions: {}", err))?;
            tx.execute(
                "UPDATE kills SET killer_key = ?2 WHERE killer_key = ?1",
                params![from_key, to_key],
            )
            .map_err(|err| format!("Failed to re-key kills: {}", err))?;
            tx.execute(
                "UPDATE kills SET victim_key = ?2 WHERE victim_key = ?1",
                params![from_key, to_key],
            )
            .map_err(|err| format!("Failed to re-key deaths: {}", err))?;

            tx.commit()
                .map_err(|err| format!("Failed to commit promotion: {}", err))?;
            Ok(())
        })
    }

    fn start_session(&self, session: &SessionStart) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sessions \
                    (session_key, server_id, player_key, player_name, join_time, match_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(session_key) DO NOTHING",
                params![
                    session.session_key,
                    session.server_id,
                    session.player_key,
                    session.player_name,
                    session.join_time.to_rfc3339(),
                    session.match_id
                ],
            )
            .map_err(|err| format!("Failed to start session: {}", err))?;
            Ok(())
        })
    }

    fn end_session(
        &self,
        session_key: &str,
        leave_time: DateTime<Utc>,
        duration_ms: i64,
        close_reason: &str,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE sessions SET leave_time = ?2, duration_ms = ?3, close_reason = ?4 \
                 WHERE session_key = ?1",
                params![session_key, leave_time.to_rfc3339(), duration_ms, close_reason],
            )
            .map_err(|err| format!("Failed to end session: {}", err))?;
            Ok(())
        })
    }

    fn add_playtime(&self, player_key: &str, duration_ms: i64) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE players SET playtime_ms = playtime_ms + ?2 WHERE player_key = ?1",
                params![player_key, duration_ms.max(0)],
            )
            .map_err(|err| format!("Failed to add playtime: {}", err))?;
            Ok(())
        })
    }

    fn insert_kill(&self, kill: &KillRecord) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO kills \
                    (server_id, match_id, map, round, occurred_at, killer_key, victim_key, \
                     victim_name, weapon, kind, credit) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    kill.server_id,
                    kill.match_id,
                    kill.map,
                    kill.round,
                    kill.occurred_at.to_rfc3339(),
                    kill.killer_key,
                    kill.victim_key,
                    kill.victim_name,
                    kill.weapon,
                    kill.kind,
                    kill.credit.as_str()
                ],
            )
            .map_err(|err| format!("Failed to insert kill: {}", err))?;
            Ok(())
        })
    }

    fn increment_weapon_tally(
        &self,
        player_key: &str,
        weapon: &str,
        field: TallyField,
    ) -> Result<(), String> {
        let column = field.column();
        let sql = format!(
            "INSERT INTO weapon_tallies (player_key, weapon, {column}) VALUES (?1, ?2, 1) \
             ON CONFLICT(player_key, weapon) DO UPDATE SET {column} = weapon_tallies.{column} + 1"
        );
        self.with_connection(|conn| {
            conn.execute(&sql, params![player_key, weapon])
                .map_err(|err| format!("Failed to increment weapon tally: {}", err))?;
            Ok(())
        })
    }

    fn start_match(
        &self,
        match_id: &str,
        server_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO matches (match_id, server_id, started_at, status) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(match_id) DO NOTHING",
                params![
                    match_id,
                    server_id,
                    started_at.to_rfc3339(),
                    MatchStatus::Active.as_str()
                ],
            )
            .map_err(|err| format!("Failed to start match: {}", err))?;
            Ok(())
        })
    }

    fn append_match_map(
        &self,
        match_id: &str,
        seq: u32,
        map: &MapLoadEvent,
        loaded_at: DateTime<Utc>,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO match_maps \
                    (match_id, seq, map, scenario, lighting, max_players, loaded_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(match_id, seq) DO NOTHING",
                params![
                    match_id,
                    seq,
                    map.map,
                    map.scenario,
                    map.lighting,
                    map.max_players,
                    loaded_at.to_rfc3339()
                ],
            )
            .map_err(|err| format!("Failed to append match map: {}", err))?;
            Ok(())
        })
    }

    fn record_round(
        &self,
        match_id: &str,
        round: u32,
        winning_team: u8,
        reason: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO match_rounds (match_id, round, winning_team, reason, ended_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(match_id, round) DO UPDATE SET \
                    winning_team = excluded.winning_team, \
                    reason = excluded.reason, \
                    ended_at = excluded.ended_at",
                params![match_id, round, winning_team, reason, ended_at.to_rfc3339()],
            )
            .map_err(|err| format!("Failed to record round: {}", err))?;
            Ok(())
        })
    }

    fn set_match_difficulty(&self, match_id: &str, difficulty: f32) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE matches SET difficulty = ?2 WHERE match_id = ?1",
                params![match_id, f64::from(difficulty)],
            )
            .map_err(|err| format!("Failed to set match difficulty: {}", err))?;
            Ok(())
        })
    }

    fn end_match(
        &self,
        match_id: &str,
        ended_at: DateTime<Utc>,
        status: MatchStatus,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE matches SET ended_at = ?2, status = ?3 WHERE match_id = ?1",
                params![match_id, ended_at.to_rfc3339(), status.as_str()],
            )
            .map_err(|err| format!("Failed to end match: {}", err))?;
            Ok(())
        })
    }

    fn upsert_participant(
        &self,
        participant: &ParticipantRecord,
        updated_at: DateTime<Utc>,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO match_participants \
                    (match_id, player_key, player_name, kills, assists, deaths, teamkills, \
                     suicides, playtime_ms, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT(match_id, player_key) DO UPDATE SET \
                    player_name = excluded.player_name, \
                    kills = excluded.kills, \
                    assists = excluded.assists, \
                    deaths = excluded.deaths, \
                    teamkills = excluded.teamkills, \
                    suicides = excluded.suicides, \
                    playtime_ms = excluded.playtime_ms, \
                    updated_at = excluded.updated_at",
                params![
                    participant.match_id,
                    participant.player_key,
                    participant.player_name,
                    participant.kills,
                    participant.assists,
                    participant.deaths,
                    participant.teamkills,
                    participant.suicides,
                    participant.playtime_ms,
                    updated_at.to_rfc3339()
                ],
            )
            .map_err(|err| format!("Failed to upsert participant: {}", err))?;
            Ok(())
        })
    }

    fn record_fall_damage(&self, player_key: &str, damage: f32) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE players SET fall_count = fall_count + 1, fall_damage = fall_damage + ?2 \
                 WHERE player_key = ?1",
                params![player_key, f64::from(damage)],
            )
            .map_err(|err| format!("Failed to record fall damage: {}", err))?;
            Ok(())
        })
    }

    fn load_cursor(&self, file_path: &str) -> Result<Option<TailCursor>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT byte_offset, file_size, last_line FROM tail_cursors WHERE file_path = ?1",
                params![file_path],
                |row| {
                    Ok(TailCursor {
                        file_path: PathBuf::from(file_path),
                        byte_offset: row.get::<_, i64>(0)?.max(0) as u64,
                        file_size_at_last_read: row.get::<_, i64>(1)?.max(0) as u64,
                        last_line_seen: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|err| format!("Failed to load tail cursor: {}", err))
        })
    }

    fn save_cursor(&self, cursor: &TailCursor) -> Result<(), String> {
        let file_path = cursor.file_path.to_string_lossy().to_string();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO tail_cursors (file_path, byte_offset, file_size, last_line, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(file_path) DO UPDATE SET \
                    byte_offset = excluded.byte_offset, \
                    file_size = excluded.file_size, \
                    last_line = excluded.last_line, \
                    updated_at = excluded.updated_at",
                params![
                    file_path,
                    cursor.byte_offset as i64,
                    cursor.file_size_at_last_read as i64,
                    cursor.last_line_seen,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|err| format!("Failed to save tail cursor: {}", err))?;
            Ok(())
        })
    }

    fn player_totals(&self, player_key: &str) -> Result<Option<PlayerTotals>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT p.name, p.playtime_ms, \
                        COALESCE(SUM(w.kills), 0), COALESCE(SUM(w.assists), 0), \
                        COALESCE(SUM(w.deaths), 0), COALESCE(SUM(w.teamkills), 0), \
                        COALESCE(SUM(w.suicides), 0) \
                 FROM players p \
                 LEFT JOIN weapon_tallies w ON w.player_key = p.player_key \
                 WHERE p.player_key = ?1 \
                 GROUP BY p.player_key",
                params![player_key],
                |row| {
                    Ok(PlayerTotals {
                        name: row.get(0)?,
                        playtime_ms: row.get(1)?,
                        kills: row.get(2)?,
                        assists: row.get(3)?,
                        deaths: row.get(4)?,
                        teamkills: row.get(5)?,
                        suicides: row.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(|err| format!("Failed to load player totals: {}", err))
        })
    }
}

/// Read helpers for assertions.
#[cfg(test)]
impl Db {
    pub fn count(&self, table: &str) -> i64 {
        self.with_connection(|conn| {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })
            .map_err(|err| err.to_string())
        })
        .expect("count rows")
    }

    pub fn match_status(&self, match_id: &str) -> Option<String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT status FROM matches WHERE match_id = ?1",
                params![match_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| err.to_string())
        })
        .expect("match status")
    }

    pub fn match_ids(&self) -> Vec<String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT match_id FROM matches ORDER BY started_at")
                .map_err(|err| err.to_string())?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(|err| err.to_string())?;
            rows.collect::<Result<Vec<String>, _>>()
                .map_err(|err| err.to_string())
        })
        .expect("match ids")
    }

    pub fn participant(&self, match_id: &str, player_key: &str) -> Option<ParticipantRecord> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT player_name, kills, assists, deaths, teamkills, suicides, playtime_ms \
                 FROM match_participants WHERE match_id = ?1 AND player_key = ?2",
                params![match_id, player_key],
                |row| {
                    Ok(ParticipantRecord {
                        match_id: match_id.to_string(),
                        player_key: player_key.to_string(),
                        player_name: row.get(0)?,
                        kills: row.get(1)?,
                        assists: row.get(2)?,
                        deaths: row.get(3)?,
                        teamkills: row.get(4)?,
                        suicides: row.get(5)?,
                        playtime_ms: row.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(|err| err.to_string())
        })
        .expect("participant")
    }

    /// `(leave_time, duration_ms, close_reason)` of the player's latest session.
    pub fn latest_session(&self, player_key: &str) -> Option<(Option<String>, Option<i64>, Option<String>)> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT leave_time, duration_ms, close_reason FROM sessions \
                 WHERE player_key = ?1 ORDER BY join_time DESC LIMIT 1",
                params![player_key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|err| err.to_string())
        })
        .expect("latest session")
    }

    pub fn weapon_tally(&self, player_key: &str, weapon: &str, field: TallyField) -> i64 {
        self.with_connection(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM weapon_tallies WHERE player_key = ?1 AND weapon = ?2",
                    field.column()
                ),
                params![player_key, weapon],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| err.to_string())
        })
        .expect("weapon tally")
        .unwrap_or(0)
    }

    pub fn map_names(&self, match_id: &str) -> Vec<String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT map FROM match_maps WHERE match_id = ?1 ORDER BY seq")
                .map_err(|err| err.to_string())?;
            let rows = stmt
                .query_map(params![match_id], |row| row.get(0))
                .map_err(|err| err.to_string())?;
            rows.collect::<Result<Vec<String>, _>>()
                .map_err(|err| err.to_string())
        })
        .expect("map names")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, Db) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("stats.db")).expect("db init");
        (temp_dir, db)
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("timestamp")
    }

    #[test]
    fn weapon_tallies_accumulate() {
        let (_dir, db) = test_db();
        db.increment_weapon_tally("id:1", "M16A4", TallyField::Kills)
            .expect("tally");
        db.increment_weapon_tally("id:1", "M16A4", TallyField::Kills)
            .expect("tally");
        db.increment_weapon_tally("id:1", "M16A4", TallyField::Deaths)
            .expect("tally");

        assert_eq!(db.weapon_tally("id:1", "M16A4", TallyField::Kills), 2);
        assert_eq!(db.weapon_tally("id:1", "M16A4", TallyField::Deaths), 1);
        assert_eq!(db.weapon_tally("id:1", "M16A4", TallyField::Assists), 0);
    }

    #[test]
    fn cursor_round_trips_and_overwrites() {
        let (_dir, db) = test_db();
        assert_eq!(db.load_cursor("/logs/a.log").expect("load"), None);

        let mut cursor = TailCursor::new("/logs/a.log");
        cursor.byte_offset = 120;
        cursor.file_size_at_last_read = 130;
        cursor.last_line_seen = Some("last".to_string());
        db.save_cursor(&cursor).expect("save");

        cursor.byte_offset = 200;
        db.save_cursor(&cursor).expect("save again");
        assert_eq!(db.load_cursor("/logs/a.log").expect("load"), Some(cursor));
    }

    #[test]
    fn duplicate_session_start_is_ignored() {
        let (_dir, db) = test_db();
        let session = SessionStart {
            session_key: "coop:id:1:1000".to_string(),
            server_id: "coop".to_string(),
            player_key: "id:1".to_string(),
            player_name: "Alice".to_string(),
            join_time: ts(0),
            match_id: None,
        };
        db.start_session(&session).expect("start");
        db.start_session(&session).expect("start again");
        assert_eq!(db.count("sessions"), 1);

        db.end_session(&session.session_key, ts(30), 30_000, "leave")
            .expect("end");
        let (leave, duration, reason) = db.latest_session("id:1").expect("session");
        assert!(leave.is_some());
        assert_eq!(duration, Some(30_000));
        assert_eq!(reason.as_deref(), Some("leave"));
    }

    #[test]
    fn promotion_merges_provisional_records() {
        let (_dir, db) = test_db();
        db.upsert_player("name:Alice@1", None, "Alice", ts(0))
            .expect("provisional");
        db.add_playtime("name:Alice@1", 5_000).expect("playtime");
        db.increment_weapon_tally("name:Alice@1", "M4A1", TallyField::Kills)
            .expect("tally");
        db.upsert_player("id:42", Some("42"), "Alice", ts(10))
            .expect("known");
        db.increment_weapon_tally("id:42", "M4A1", TallyField::Kills)
            .expect("tally");

        db.promote_player("name:Alice@1", "id:42", "42", "Alice", ts(20))
            .expect("promote");

        let totals = db.player_totals("id:42").expect("totals").expect("player");
        assert_eq!(totals.kills, 2);
        assert_eq!(totals.playtime_ms, 5_000);
        assert_eq!(db.player_totals("name:Alice@1").expect("totals"), None);
        assert_eq!(db.count("players"), 1);
    }

    #[test]
    fn match_lifecycle_records_status() {
        let (_dir, db) = test_db();
        db.start_match("m1", "coop", ts(0)).expect("start");
        assert_eq!(db.match_status("m1").as_deref(), Some("active"));

        db.set_match_difficulty("m1", 0.5).expect("difficulty");
        db.record_round("m1", 1, 0, "Objective", ts(60))
            .expect("round");
        db.end_match("m1", ts(120), MatchStatus::Aborted)
            .expect("end");
        assert_eq!(db.match_status("m1").as_deref(), Some("aborted"));
        assert_eq!(db.count("match_rounds"), 1);
    }
}

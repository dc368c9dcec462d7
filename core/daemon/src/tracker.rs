//! Per-server session and match state machine.
//!
//! A [`Tracker`] owns the in-memory view of one server: who is connected,
//! which match is running, the current map and round. Each typed event is
//! applied exactly once and turned into gateway writes plus feed
//! notifications. Gateway failures are logged and never stop the stream.

use chrono::{DateTime, Utc};
use fraglog_core::{
    ChatCommand, Combatant, Event, EventKind, KillEvent, KillKind, MapLoadEvent, PlayerIdentity,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::commands::ChatCommandHandler;
use crate::db::{
    KillCredit, KillRecord, MatchStatus, ParticipantRecord, SessionStart, StatsGateway,
    TallyField,
};
use crate::feed::Feed;

/// Login requests that never reach a Join are forgotten after this long.
const PENDING_LOGIN_TTL_SECS: i64 = 300;

/// Shared collaborators handed to every tracker call.
#[derive(Clone)]
pub struct TrackerContext {
    pub gateway: Arc<dyn StatsGateway>,
    pub feed: Feed,
    pub commands: Arc<dyn ChatCommandHandler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Leave,
    ServerShutdown,
    Crash,
    Graceful,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Leave => "leave",
            CloseReason::ServerShutdown => "server_shutdown",
            CloseReason::Crash => "crash",
            CloseReason::Graceful => "graceful",
        }
    }

    fn match_status(&self) -> MatchStatus {
        match self {
            CloseReason::Crash => MatchStatus::Aborted,
            _ => MatchStatus::Completed,
        }
    }
}

#[derive(Debug, Clone)]
struct OpenSession {
    identity: PlayerIdentity,
    name: String,
    session_key: String,
    join_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct Participation {
    name: String,
    kills: u32,
    assists: u32,
    deaths: u32,
    teamkills: u32,
    suicides: u32,
    playtime_ms: i64,
    /// Set while the player is connected during this match.
    present_since: Option<DateTime<Utc>>,
}

impl Participation {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    fn bump(&mut self, field: TallyField) {
        let counter = match field {
            TallyField::Kills => &mut self.kills,
            TallyField::Assists => &mut self.assists,
            TallyField::Teamkills => &mut self.teamkills,
            TallyField::Suicides => &mut self.suicides,
            TallyField::Deaths => &mut self.deaths,
        };
        *counter = counter.saturating_add(1);
    }

    fn settle(&mut self, at: DateTime<Utc>) {
        if let Some(since) = self.present_since.take() {
            self.playtime_ms += elapsed_ms(since, at);
        }
    }

    fn merge(&mut self, other: Participation) {
        self.kills += other.kills;
        self.assists += other.assists;
        self.deaths += other.deaths;
        self.teamkills += other.teamkills;
        self.suicides += other.suicides;
        self.playtime_ms += other.playtime_ms;
        self.present_since = match (self.present_since, other.present_since) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }

    fn record(&self, match_id: &str, player_key: &str) -> ParticipantRecord {
        ParticipantRecord {
            match_id: match_id.to_string(),
            player_key: player_key.to_string(),
            player_name: self.name.clone(),
            kills: self.kills,
            assists: self.assists,
            deaths: self.deaths,
            teamkills: self.teamkills,
            suicides: self.suicides,
            playtime_ms: self.playtime_ms,
        }
    }
}

#[derive(Debug)]
struct PendingLogin {
    external_id: String,
    requested_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ActiveMatch {
    match_id: String,
    map_count: u32,
    participants: HashMap<String, Participation>,
}

#[derive(Debug)]
pub struct Tracker {
    server_id: String,
    /// Keyed by [`PlayerIdentity::storage_key`].
    sessions: BTreeMap<String, OpenSession>,
    /// Name -> login from `Login request` lines, consumed by the Join.
    pending_logins: HashMap<String, PendingLogin>,
    /// Name -> platform id from any earlier sighting.
    known_ids: HashMap<String, String>,
    active_match: Option<ActiveMatch>,
    current_map: Option<String>,
    round: u32,
    difficulty: Option<f32>,
}

impl Tracker {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            sessions: BTreeMap::new(),
            pending_logins: HashMap::new(),
            known_ids: HashMap::new(),
            active_match: None,
            current_map: None,
            round: 0,
            difficulty: None,
        }
    }

    /// Open sessions or a running match.
    pub fn has_open_state(&self) -> bool {
        !self.sessions.is_empty() || self.active_match.is_some()
    }

    pub fn open_session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn active_match_id(&self) -> Option<&str> {
        self.active_match.as_ref().map(|m| m.match_id.as_str())
    }

    #[cfg(test)]
    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn apply(&mut self, event: &Event, ctx: &TrackerContext) {
        let at = event.timestamp;
        match &event.kind {
            EventKind::LoginRequest { name, external_id } => {
                debug!(server_id = %self.server_id, name, external_id, "Login request");
                self.prune_pending_logins(at);
                self.pending_logins.insert(
                    name.clone(),
                    PendingLogin {
                        external_id: external_id.clone(),
                        requested_at: at,
                    },
                );
            }
            EventKind::Join { name } => self.on_join(name, at, ctx),
            EventKind::Leave { external_id } => self.on_leave(external_id, at, ctx),
            EventKind::Kill(kill) => self.on_kill(kill, at, ctx),
            EventKind::RoundStart { round } => {
                self.round = *round;
                ctx.feed.notify(
                    &self.server_id,
                    at,
                    "round_start",
                    format!("Round {} started", round),
                );
            }
            EventKind::RoundEnd {
                round,
                winning_team,
                reason,
            } => self.on_round_end(*round, *winning_team, reason, at, ctx),
            EventKind::MapLoad(map) => self.on_map_load(map, at, ctx),
            EventKind::GameOver => {
                if self.finish_match(at, MatchStatus::Completed, ctx) {
                    ctx.feed
                        .notify(&self.server_id, at, "game_over", "Match finished");
                }
            }
            EventKind::ServerShutdown => {
                self.finish_match(at, MatchStatus::Completed, ctx);
                self.close_sessions(at, CloseReason::ServerShutdown, ctx);
                self.pending_logins.clear();
                ctx.feed.notify(
                    &self.server_id,
                    at,
                    "server_shutdown",
                    "Server shut down",
                );
            }
            EventKind::DifficultyChange { difficulty } => {
                self.difficulty = Some(*difficulty);
                if let Some(active) = &self.active_match {
                    log_store(
                        ctx.gateway
                            .set_match_difficulty(&active.match_id, *difficulty),
                        &self.server_id,
                        "set_match_difficulty",
                    );
                }
                ctx.feed.notify(
                    &self.server_id,
                    at,
                    "difficulty_change",
                    format!("AI difficulty set to {}", difficulty),
                );
            }
            EventKind::FallDamage { player, damage } => {
                if let Some(identity) = self.resolve_combatant(player, at, ctx) {
                    log_store(
                        ctx.gateway
                            .record_fall_damage(&identity.storage_key(), *damage),
                        &self.server_id,
                        "record_fall_damage",
                    );
                    ctx.feed.notify(
                        &self.server_id,
                        at,
                        "fall_damage",
                        format!("{} took {} fall damage", player.name, damage),
                    );
                }
            }
            EventKind::ChatCommand(command) => self.on_chat_command(command, at, ctx),
        }
    }

    /// Closes the running match and every open session, then forgets all
    /// in-memory state. Returns `false` when there was nothing to close.
    pub fn close_all(
        &mut self,
        reason: CloseReason,
        at: DateTime<Utc>,
        ctx: &TrackerContext,
    ) -> bool {
        if !self.has_open_state() {
            return false;
        }

        let sessions = self.sessions.len();
        self.finish_match(at, reason.match_status(), ctx);
        self.close_sessions(at, reason, ctx);
        self.reset();

        info!(
            server_id = %self.server_id,
            reason = reason.as_str(),
            sessions,
            at = %at.to_rfc3339(),
            "Closed all server state"
        );
        ctx.feed.notify(
            &self.server_id,
            at,
            reason.as_str(),
            format!("Closed {} open session(s)", sessions),
        );
        true
    }

    /// Drops login requests whose connection never completed.
    fn prune_pending_logins(&mut self, now: DateTime<Utc>) {
        let before = self.pending_logins.len();
        self.pending_logins.retain(|_, login| {
            let age = now.signed_duration_since(login.requested_at);
            age.num_seconds() <= PENDING_LOGIN_TTL_SECS
        });
        let dropped = before - self.pending_logins.len();
        if dropped > 0 {
            debug!(server_id = %self.server_id, dropped, "Dropped stale login requests");
        }
    }

    fn reset(&mut self) {
        self.sessions.clear();
        self.pending_logins.clear();
        self.active_match = None;
        self.current_map = None;
        self.round = 0;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────

    fn on_join(&mut self, name: &str, at: DateTime<Utc>, ctx: &TrackerContext) {
        let external_id = self
            .pending_logins
            .remove(name)
            .map(|login| login.external_id)
            .or_else(|| self.known_ids.get(name).cloned());

        if self.has_session_for(name, external_id.as_deref()) {
            if let Some(id) = &external_id {
                self.promote_by_name(name, id, at, ctx);
            }
            debug!(server_id = %self.server_id, name, "Duplicate join ignored");
            return;
        }

        let identity = match &external_id {
            Some(id) => {
                self.known_ids.insert(name.to_string(), id.clone());
                PlayerIdentity::known(id.as_str())
            }
            None => PlayerIdentity::Provisional {
                name: name.to_string(),
                first_seen_at: at,
            },
        };
        let player_key = identity.storage_key();
        if self.sessions.contains_key(&player_key) {
            debug!(server_id = %self.server_id, name, "Duplicate join ignored");
            return;
        }

        log_store(
            ctx.gateway
                .upsert_player(&player_key, external_id.as_deref(), name, at),
            &self.server_id,
            "upsert_player",
        );

        let session_key = format!(
            "{}:{}:{}",
            self.server_id,
            player_key,
            at.timestamp_millis()
        );
        log_store(
            ctx.gateway.start_session(&SessionStart {
                session_key: session_key.clone(),
                server_id: self.server_id.clone(),
                player_key: player_key.clone(),
                player_name: name.to_string(),
                join_time: at,
                match_id: self.active_match_id().map(str::to_string),
            }),
            &self.server_id,
            "start_session",
        );

        if let Some(active) = &mut self.active_match {
            let participation = active
                .participants
                .entry(player_key.clone())
                .or_insert_with(|| Participation::new(name));
            participation.present_since.get_or_insert(at);
        }

        self.sessions.insert(
            player_key,
            OpenSession {
                identity,
                name: name.to_string(),
                session_key,
                join_time: at,
            },
        );

        ctx.feed
            .notify(&self.server_id, at, "join", format!("{} joined", name));
    }

    fn on_leave(&mut self, external_id: &str, at: DateTime<Utc>, ctx: &TrackerContext) {
        let player_key = PlayerIdentity::known(external_id).storage_key();
        let Some(session) = self.sessions.remove(&player_key) else {
            warn!(
                server_id = %self.server_id,
                external_id,
                "Leave for a player without an open session; dropped"
            );
            return;
        };

        self.end_session(&session, at, CloseReason::Leave, ctx);

        if let Some(active) = &mut self.active_match {
            if let Some(participation) = active.participants.get_mut(&player_key) {
                participation.settle(at);
                log_store(
                    ctx.gateway.upsert_participant(
                        &participation.record(&active.match_id, &player_key),
                        at,
                    ),
                    &self.server_id,
                    "upsert_participant",
                );
            }
        }

        ctx.feed
            .notify(&self.server_id, at, "leave", format!("{} left", session.name));
    }

    fn end_session(
        &self,
        session: &OpenSession,
        at: DateTime<Utc>,
        reason: CloseReason,
        ctx: &TrackerContext,
    ) {
        let duration_ms = elapsed_ms(session.join_time, at);
        log_store(
            ctx.gateway
                .end_session(&session.session_key, at, duration_ms, reason.as_str()),
            &self.server_id,
            "end_session",
        );
        log_store(
            ctx.gateway
                .add_playtime(&session.identity.storage_key(), duration_ms),
            &self.server_id,
            "add_playtime",
        );
    }

    fn close_sessions(&mut self, at: DateTime<Utc>, reason: CloseReason, ctx: &TrackerContext) {
        let sessions = std::mem::take(&mut self.sessions);
        for session in sessions.values() {
            self.end_session(session, at, reason, ctx);
        }
    }

    /// An open session that this Join repeats: same name, and either no id
    /// to tell them apart or a provisional/identical identity.
    fn has_session_for(&self, name: &str, external_id: Option<&str>) -> bool {
        let known_key = external_id.map(|id| PlayerIdentity::known(id).storage_key());
        self.sessions.iter().any(|(key, session)| {
            session.name == name
                && match &known_key {
                    Some(known_key) => !session.identity.is_known() || key == known_key,
                    None => true,
                }
        })
    }

    fn session_key_by_name(&self, name: &str) -> Option<String> {
        self.sessions
            .iter()
            .find(|(_, session)| session.name == name)
            .map(|(key, _)| key.clone())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Identity
    // ─────────────────────────────────────────────────────────────────────

    /// Bots resolve to `None`.
    fn resolve_combatant(
        &mut self,
        combatant: &Combatant,
        at: DateTime<Utc>,
        ctx: &TrackerContext,
    ) -> Option<PlayerIdentity> {
        let id = combatant.external_id.as_deref()?;
        Some(self.resolve_named(&combatant.name, Some(id), at, ctx))
    }

    fn resolve_named(
        &mut self,
        name: &str,
        external_id: Option<&str>,
        at: DateTime<Utc>,
        ctx: &TrackerContext,
    ) -> PlayerIdentity {
        if let Some(id) = external_id {
            self.known_ids.insert(name.to_string(), id.to_string());
            self.promote_by_name(name, id, at, ctx);
            let identity = PlayerIdentity::known(id);
            log_store(
                ctx.gateway
                    .upsert_player(&identity.storage_key(), Some(id), name, at),
                &self.server_id,
                "upsert_player",
            );
            return identity;
        }

        if let Some(key) = self.session_key_by_name(name) {
            if let Some(session) = self.sessions.get(&key) {
                return session.identity.clone();
            }
        }
        match self.known_ids.get(name) {
            Some(id) => PlayerIdentity::known(id.as_str()),
            None => PlayerIdentity::Provisional {
                name: name.to_string(),
                first_seen_at: at,
            },
        }
    }

    /// Re-keys a provisional session (and its match participation) once the
    /// player's platform id is seen.
    fn promote_by_name(&mut self, name: &str, id: &str, at: DateTime<Utc>, ctx: &TrackerContext) {
        let Some(old_key) = self
            .sessions
            .iter()
            .find(|(_, session)| session.name == name && !session.identity.is_known())
            .map(|(key, _)| key.clone())
        else {
            return;
        };

        let identity = PlayerIdentity::known(id);
        let new_key = identity.storage_key();
        if self.sessions.contains_key(&new_key) {
            warn!(
                server_id = %self.server_id,
                name,
                external_id = id,
                "Provisional session collides with a known session; keeping the known one"
            );
            if let Some(stale) = self.sessions.remove(&old_key) {
                self.end_session(&stale, at, CloseReason::Leave, ctx);
            }
            return;
        }

        let Some(mut session) = self.sessions.remove(&old_key) else {
            return;
        };
        session.identity = identity;
        self.sessions.insert(new_key.clone(), session);

        if let Some(active) = &mut self.active_match {
            if let Some(old) = active.participants.remove(&old_key) {
                active
                    .participants
                    .entry(new_key.clone())
                    .or_insert_with(|| Participation::new(name))
                    .merge(old);
            }
        }

        log_store(
            ctx.gateway.promote_player(&old_key, &new_key, id, name, at),
            &self.server_id,
            "promote_player",
        );
        info!(
            server_id = %self.server_id,
            name,
            from = %old_key,
            to = %new_key,
            "Promoted provisional player identity"
        );
    }

    // ─────────────────────────────────────────────────────────────────────
    // Combat
    // ─────────────────────────────────────────────────────────────────────

    fn on_kill(&mut self, kill: &KillEvent, at: DateTime<Utc>, ctx: &TrackerContext) {
        let victim = self.resolve_combatant(&kill.victim, at, ctx);

        let mut credited: Vec<(String, String, KillCredit)> = Vec::new();
        if let Some(identity) = self.resolve_combatant(kill.primary(), at, ctx) {
            credited.push((
                identity.storage_key(),
                kill.primary().name.clone(),
                KillCredit::Kill,
            ));
        }
        if kill.kind == KillKind::Kill {
            for assist in kill.assists() {
                if let Some(identity) = self.resolve_combatant(assist, at, ctx) {
                    credited.push((
                        identity.storage_key(),
                        assist.name.clone(),
                        KillCredit::Assist,
                    ));
                }
            }
        }

        let victim_key = victim.as_ref().map(PlayerIdentity::storage_key);
        let match_id = self.active_match_id().map(str::to_string);
        let mut touched = Vec::new();

        for (player_key, name, credit) in &credited {
            log_store(
                ctx.gateway.insert_kill(&KillRecord {
                    server_id: self.server_id.clone(),
                    match_id: match_id.clone(),
                    map: self.current_map.clone(),
                    round: self.round,
                    occurred_at: at,
                    killer_key: player_key.clone(),
                    victim_key: victim_key.clone(),
                    victim_name: kill.victim.name.clone(),
                    weapon: kill.weapon.clone(),
                    kind: kill.kind.as_str(),
                    credit: *credit,
                }),
                &self.server_id,
                "insert_kill",
            );

            let field = match (credit, kill.kind) {
                (KillCredit::Assist, _) => TallyField::Assists,
                (KillCredit::Kill, KillKind::Kill) => TallyField::Kills,
                (KillCredit::Kill, KillKind::FriendlyFire) => TallyField::Teamkills,
                (KillCredit::Kill, KillKind::Suicide) => TallyField::Suicides,
            };
            self.tally(player_key, name, &kill.weapon, field, ctx);
            touched.push(player_key.clone());
        }

        if let Some(victim_key) = &victim_key {
            self.tally(victim_key, &kill.victim.name, &kill.weapon, TallyField::Deaths, ctx);
            touched.push(victim_key.clone());
        }

        self.flush_participants(&touched, at, ctx);

        let message = match kill.kind {
            KillKind::Suicide => format!(
                "{} killed themselves with {}",
                kill.victim.name, kill.weapon
            ),
            KillKind::FriendlyFire => format!(
                "{} team-killed {} with {}",
                kill.primary().name,
                kill.victim.name,
                kill.weapon
            ),
            KillKind::Kill => format!(
                "{} killed {} with {}",
                kill.primary().name,
                kill.victim.name,
                kill.weapon
            ),
        };
        ctx.feed
            .notify(&self.server_id, at, kill.kind.as_str(), message);
    }

    fn tally(
        &mut self,
        player_key: &str,
        name: &str,
        weapon: &str,
        field: TallyField,
        ctx: &TrackerContext,
    ) {
        log_store(
            ctx.gateway.increment_weapon_tally(player_key, weapon, field),
            &self.server_id,
            "increment_weapon_tally",
        );
        if let Some(active) = &mut self.active_match {
            active
                .participants
                .entry(player_key.to_string())
                .or_insert_with(|| Participation::new(name))
                .bump(field);
        }
    }

    fn flush_participants(&self, keys: &[String], at: DateTime<Utc>, ctx: &TrackerContext) {
        let Some(active) = &self.active_match else {
            return;
        };
        for key in keys {
            if let Some(participation) = active.participants.get(key) {
                log_store(
                    ctx.gateway
                        .upsert_participant(&participation.record(&active.match_id, key), at),
                    &self.server_id,
                    "upsert_participant",
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Matches
    // ─────────────────────────────────────────────────────────────────────

    fn on_map_load(&mut self, map: &MapLoadEvent, at: DateTime<Utc>, ctx: &TrackerContext) {
        self.current_map = Some(map.map.clone());
        self.round = 0;
        self.prune_pending_logins(at);

        if self.active_match.is_none() {
            self.start_match(at, ctx);
        }

        if let Some(active) = &mut self.active_match {
            active.map_count += 1;
            log_store(
                ctx.gateway
                    .append_match_map(&active.match_id, active.map_count, map, at),
                &self.server_id,
                "append_match_map",
            );
        }

        ctx.feed.notify(
            &self.server_id,
            at,
            "map_load",
            format!("Loaded {} ({}, {})", map.map, map.scenario, map.lighting),
        );
    }

    fn start_match(&mut self, at: DateTime<Utc>, ctx: &TrackerContext) {
        let match_id = Ulid::new().to_string();
        log_store(
            ctx.gateway.start_match(&match_id, &self.server_id, at),
            &self.server_id,
            "start_match",
        );
        if let Some(difficulty) = self.difficulty {
            log_store(
                ctx.gateway.set_match_difficulty(&match_id, difficulty),
                &self.server_id,
                "set_match_difficulty",
            );
        }

        let participants = self
            .sessions
            .iter()
            .map(|(key, session)| {
                let mut participation = Participation::new(&session.name);
                participation.present_since = Some(at);
                (key.clone(), participation)
            })
            .collect();

        info!(server_id = %self.server_id, match_id = %match_id, "Match started");
        self.active_match = Some(ActiveMatch {
            match_id,
            map_count: 0,
            participants,
        });
    }

    fn on_round_end(
        &mut self,
        round: u32,
        winning_team: u8,
        reason: &str,
        at: DateTime<Utc>,
        ctx: &TrackerContext,
    ) {
        if let Some(active) = &self.active_match {
            log_store(
                ctx.gateway
                    .record_round(&active.match_id, round, winning_team, reason, at),
                &self.server_id,
                "record_round",
            );
        }
        self.round = round.saturating_add(1);
        ctx.feed.notify(
            &self.server_id,
            at,
            "round_end",
            format!("Round {} won by team {} ({})", round, winning_team, reason),
        );
    }

    /// Finalizes every participation row and closes the match. Sessions stay
    /// open. Returns `false` when no match was running.
    fn finish_match(
        &mut self,
        at: DateTime<Utc>,
        status: MatchStatus,
        ctx: &TrackerContext,
    ) -> bool {
        let Some(mut active) = self.active_match.take() else {
            return false;
        };

        for (player_key, participation) in active.participants.iter_mut() {
            participation.settle(at);
            log_store(
                ctx.gateway
                    .upsert_participant(&participation.record(&active.match_id, player_key), at),
                &self.server_id,
                "upsert_participant",
            );
        }
        log_store(
            ctx.gateway.end_match(&active.match_id, at, status),
            &self.server_id,
            "end_match",
        );

        info!(
            server_id = %self.server_id,
            match_id = %active.match_id,
            status = status.as_str(),
            participants = active.participants.len(),
            "Match closed"
        );
        self.round = 0;
        true
    }

    // ─────────────────────────────────────────────────────────────────────
    // Chat
    // ─────────────────────────────────────────────────────────────────────

    fn on_chat_command(&mut self, command: &ChatCommand, at: DateTime<Utc>, ctx: &TrackerContext) {
        let identity = self.resolve_named(
            &command.player_name,
            command.external_id.as_deref(),
            at,
            ctx,
        );
        let args = if command.args.is_empty() {
            String::new()
        } else {
            format!(" {}", command.args.join(" "))
        };
        ctx.feed.notify(
            &self.server_id,
            at,
            "chat_command",
            format!(
                "{} ran {}{} in {}",
                command.player_name, command.command, args, command.channel
            ),
        );
        if let Some(reply) = ctx.commands.handle(command, &identity) {
            ctx.feed.notify(&self.server_id, at, "command_reply", reply);
        }
    }
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    to.signed_duration_since(from).num_milliseconds().max(0)
}

fn log_store(result: Result<(), String>, server_id: &str, operation: &'static str) {
    if let Err(err) = result {
        warn!(server_id, operation, error = %err, "Stats store write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::NoopCommands;
    use crate::db::Db;
    use chrono::Duration;

    struct Harness {
        _dir: tempfile::TempDir,
        db: Arc<Db>,
        ctx: TrackerContext,
        tracker: Tracker,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = Arc::new(Db::new(dir.path().join("stats.db")).expect("db init"));
        let ctx = TrackerContext {
            gateway: db.clone(),
            feed: Feed::log_only(),
            commands: Arc::new(NoopCommands),
        };
        Harness {
            _dir: dir,
            db,
            ctx,
            tracker: Tracker::new("coop"),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp") + Duration::seconds(secs)
    }

    fn event(secs: i64, kind: EventKind) -> Event {
        Event {
            timestamp: at(secs),
            kind,
        }
    }

    fn human(name: &str, id: &str, team: u8) -> Combatant {
        Combatant {
            name: name.to_string(),
            external_id: Some(id.to_string()),
            team,
        }
    }

    fn bot(name: &str) -> Combatant {
        Combatant {
            name: name.to_string(),
            external_id: None,
            team: 1,
        }
    }

    fn kill(killers: Vec<Combatant>, victim: Combatant) -> EventKind {
        let kind = KillKind::classify(&killers[0], &victim);
        EventKind::Kill(KillEvent {
            killers,
            victim,
            weapon: "M16A4".to_string(),
            weapon_code: "BP_Firearm_M16A4_C".to_string(),
            kind,
        })
    }

    impl Harness {
        fn apply(&mut self, secs: i64, kind: EventKind) {
            let event = event(secs, kind);
            self.tracker.apply(&event, &self.ctx);
        }

        fn join(&mut self, secs: i64, name: &str, id: &str) {
            self.apply(
                secs,
                EventKind::LoginRequest {
                    name: name.to_string(),
                    external_id: id.to_string(),
                },
            );
            self.apply(secs, EventKind::Join { name: name.to_string() });
        }
    }

    #[test]
    fn login_request_gives_join_a_known_identity() {
        let mut h = harness();
        h.join(0, "Alice", "42");

        assert_eq!(h.tracker.open_session_count(), 1);
        assert!(h.db.player_totals("id:42").expect("totals").is_some());
    }

    #[test]
    fn duplicate_join_is_a_noop() {
        let mut h = harness();
        h.join(0, "Alice", "42");
        h.join(5, "Alice", "42");

        assert_eq!(h.tracker.open_session_count(), 1);
        assert_eq!(h.db.count("sessions"), 1);
    }

    #[test]
    fn leave_without_session_is_dropped() {
        let mut h = harness();
        h.apply(0, EventKind::Leave { external_id: "404".to_string() });
        assert!(!h.tracker.has_open_state());
        assert_eq!(h.db.count("sessions"), 0);
    }

    #[test]
    fn provisional_session_is_promoted_when_id_appears() {
        let mut h = harness();
        h.apply(0, EventKind::Join { name: "Alice".to_string() });
        assert_eq!(h.db.count("players"), 1);

        h.apply(10, kill(vec![human("Alice", "42", 0)], bot("Insurgent")));
        assert_eq!(h.tracker.open_session_count(), 1);

        h.apply(70, EventKind::Leave { external_id: "42".to_string() });
        assert_eq!(h.tracker.open_session_count(), 0);

        let totals = h.db.player_totals("id:42").expect("totals").expect("player");
        assert_eq!(totals.kills, 1);
        assert_eq!(totals.playtime_ms, 70_000);
        assert_eq!(h.db.count("players"), 1);
    }

    #[test]
    fn assists_are_credited_only_for_enemy_kills() {
        let mut h = harness();
        h.apply(
            0,
            kill(
                vec![human("Alice", "1", 0), human("Bob", "2", 0)],
                bot("Insurgent"),
            ),
        );
        h.apply(
            5,
            kill(
                vec![human("Alice", "1", 0), human("Bob", "2", 0)],
                human("Carol", "3", 0),
            ),
        );

        assert_eq!(h.db.weapon_tally("id:1", "M16A4", TallyField::Kills), 1);
        assert_eq!(h.db.weapon_tally("id:1", "M16A4", TallyField::Teamkills), 1);
        assert_eq!(h.db.weapon_tally("id:2", "M16A4", TallyField::Assists), 1);
        assert_eq!(h.db.weapon_tally("id:3", "M16A4", TallyField::Deaths), 1);
        assert_eq!(h.db.count("kills"), 3);
    }

    #[test]
    fn bots_get_no_credit_but_victims_still_die() {
        let mut h = harness();
        h.apply(0, kill(vec![bot("Insurgent")], human("Alice", "1", 0)));

        assert_eq!(h.db.count("kills"), 0);
        assert_eq!(h.db.weapon_tally("id:1", "M16A4", TallyField::Deaths), 1);
    }

    #[test]
    fn suicide_counts_suicide_and_death() {
        let mut h = harness();
        let alice = human("Alice", "1", 0);
        h.apply(0, kill(vec![alice.clone()], alice));

        assert_eq!(h.db.weapon_tally("id:1", "M16A4", TallyField::Suicides), 1);
        assert_eq!(h.db.weapon_tally("id:1", "M16A4", TallyField::Deaths), 1);
    }

    #[test]
    fn map_loads_extend_the_active_match() {
        let mut h = harness();
        let map = |name: &str| {
            EventKind::MapLoad(MapLoadEvent {
                map: name.to_string(),
                scenario: "Scenario_Farmhouse_Checkpoint_Security".to_string(),
                max_players: 8,
                lighting: "Day".to_string(),
            })
        };
        h.apply(0, EventKind::DifficultyChange { difficulty: 0.5 });
        h.apply(1, map("Farmhouse"));
        h.apply(600, map("Hideout"));

        let match_id = h.tracker.active_match_id().expect("match").to_string();
        assert_eq!(h.db.map_names(&match_id), vec!["Farmhouse", "Hideout"]);

        h.apply(900, EventKind::GameOver);
        assert_eq!(h.tracker.active_match_id(), None);
        assert_eq!(h.db.match_status(&match_id).as_deref(), Some("completed"));
    }

    #[test]
    fn round_end_advances_round_counter() {
        let mut h = harness();
        h.apply(0, EventKind::RoundStart { round: 3 });
        assert_eq!(h.tracker.round(), 3);
        h.apply(
            60,
            EventKind::RoundEnd {
                round: 3,
                winning_team: 0,
                reason: "Elimination".to_string(),
            },
        );
        assert_eq!(h.tracker.round(), 4);
    }

    #[test]
    fn server_shutdown_closes_everything() {
        let mut h = harness();
        h.join(0, "Alice", "1");
        h.apply(
            1,
            EventKind::MapLoad(MapLoadEvent {
                map: "Precinct".to_string(),
                scenario: "Scenario_Precinct_Checkpoint_Security".to_string(),
                max_players: 8,
                lighting: "Night".to_string(),
            }),
        );
        let match_id = h.tracker.active_match_id().expect("match").to_string();

        h.apply(120, EventKind::ServerShutdown);
        assert!(!h.tracker.has_open_state());
        assert_eq!(h.db.match_status(&match_id).as_deref(), Some("completed"));
        let (_, duration, reason) = h.db.latest_session("id:1").expect("session");
        assert_eq!(duration, Some(120_000));
        assert_eq!(reason.as_deref(), Some("server_shutdown"));
    }

    #[test]
    fn close_all_on_crash_aborts_match_once() {
        let mut h = harness();
        h.join(0, "Alice", "1");
        h.apply(
            1,
            EventKind::MapLoad(MapLoadEvent {
                map: "Outskirts".to_string(),
                scenario: "Scenario_Outskirts_Checkpoint_Insurgents".to_string(),
                max_players: 8,
                lighting: "Day".to_string(),
            }),
        );
        let match_id = h.tracker.active_match_id().expect("match").to_string();

        assert!(h.tracker.close_all(CloseReason::Crash, at(300), &h.ctx));
        assert!(!h.tracker.close_all(CloseReason::Crash, at(400), &h.ctx));

        assert_eq!(h.db.match_status(&match_id).as_deref(), Some("aborted"));
        let participant = h.db.participant(&match_id, "id:1").expect("participant");
        assert_eq!(participant.playtime_ms, 299_000);
    }

    #[test]
    fn same_name_with_different_ids_opens_two_sessions() {
        let mut h = harness();
        h.join(0, "Player", "111");
        h.join(5, "Player", "222");

        assert_eq!(h.tracker.open_session_count(), 2);
        assert_eq!(h.db.count("sessions"), 2);

        h.apply(65, EventKind::Leave { external_id: "222".to_string() });
        assert_eq!(h.tracker.open_session_count(), 1);
        let totals = h.db.player_totals("id:222").expect("totals").expect("player");
        assert_eq!(totals.playtime_ms, 60_000);
    }

    #[test]
    fn abandoned_login_requests_expire() {
        let mut h = harness();
        h.apply(
            0,
            EventKind::LoginRequest {
                name: "Ghost".to_string(),
                external_id: "9".to_string(),
            },
        );
        h.apply(
            PENDING_LOGIN_TTL_SECS + 60,
            EventKind::MapLoad(MapLoadEvent {
                map: "Farmhouse".to_string(),
                scenario: "Scenario_Farmhouse_Checkpoint_Security".to_string(),
                max_players: 8,
                lighting: "Day".to_string(),
            }),
        );
        assert!(h.tracker.pending_logins.is_empty());

        h.apply(
            PENDING_LOGIN_TTL_SECS + 61,
            EventKind::Join { name: "Ghost".to_string() },
        );
        assert_eq!(h.tracker.open_session_count(), 1);
        assert!(h.db.player_totals("id:9").expect("totals").is_none());
    }

    #[test]
    fn chat_command_is_announced_without_a_reply() {
        let mut h = harness();
        let (feed, notifications) = Feed::with_channel();
        h.ctx.feed = feed;
        h.join(0, "Alice", "42");
        h.apply(
            5,
            EventKind::ChatCommand(ChatCommand {
                player_name: "Alice".to_string(),
                external_id: Some("42".to_string()),
                channel: "Global".to_string(),
                command: "stats".to_string(),
                args: vec!["weapons".to_string()],
            }),
        );

        let kinds: Vec<_> = notifications.try_iter().map(|n| n.kind).collect();
        assert_eq!(kinds, vec!["join", "chat_command"]);
    }
}

//! Line classifier: one log line in, zero or one typed event out.
//!
//! All knowledge of the engine's line formats lives here. The classifier runs
//! unattended over an untrusted, append-only stream whose format drifts across
//! engine versions, so it never fails: lines it cannot make sense of are
//! reported as "no event", and a recognisable line with a bad timestamp is
//! skipped with a warning that carries the raw line.

use chrono::{DateTime, Utc};
use regex::Captures;

use crate::events::{
    ChatCommand, Combatant, Event, EventKind, KillEvent, KillKind, MapLoadEvent, TeamId,
};
use crate::patterns::{
    RE_CHAT, RE_DESCRIPTOR, RE_DIFFICULTY, RE_EXIT, RE_FALL_DAMAGE, RE_GAME_OVER, RE_JOIN,
    RE_KILL, RE_LEAVE, RE_LINE, RE_LOGIN_REQUEST, RE_MAP_LOAD, RE_ROUND_END, RE_ROUND_START,
};
use crate::timestamp::parse_log_timestamp;
use crate::weapons::normalize_weapon;

pub const DEFAULT_COMMAND_SIGIL: &str = "!";

const CHANNEL_GAMEPLAY: &str = "LogGameplayEvents";
const CHANNEL_NET: &str = "LogNet";
const CHANNEL_LOAD: &str = "LogLoad";
const CHANNEL_AI: &str = "LogAI";
const CHANNEL_CHAT: &str = "LogChat";
const CHANNEL_HEALTH: &str = "LogHealth";
const CHANNEL_SESSION: &str = "LogSession";
const CHANNEL_EXIT: &str = "LogExit";

const INVALID_ID: &str = "INVALID";
const UNATTRIBUTED_KILLER: &str = "?";
const KILLER_SEPARATOR: &str = " + ";

/// Stateless line classifier.
#[derive(Debug, Clone)]
pub struct LineClassifier {
    command_sigil: String,
}

impl Default for LineClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_SIGIL)
    }
}

impl LineClassifier {
    pub fn new(command_sigil: impl Into<String>) -> Self {
        let command_sigil = command_sigil.into();
        let command_sigil = if command_sigil.trim().is_empty() {
            DEFAULT_COMMAND_SIGIL.to_string()
        } else {
            command_sigil.trim().to_string()
        };
        Self { command_sigil }
    }

    pub fn command_sigil(&self) -> &str {
        &self.command_sigil
    }

    /// Classifies one raw line.
    pub fn classify(&self, line: &str) -> Option<Event> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let envelope = RE_LINE.captures(line)?;
        let channel = envelope.name("channel")?.as_str();
        let message = envelope.name("message")?.as_str().trim();

        let kind = self.classify_message(channel, message)?;

        let raw_ts = envelope.name("ts")?.as_str();
        match parse_log_timestamp(raw_ts) {
            Ok(timestamp) => Some(Event { timestamp, kind }),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    event = kind.label(),
                    line = %line,
                    "Skipping line with unparseable timestamp"
                );
                None
            }
        }
    }

    fn classify_message(&self, channel: &str, message: &str) -> Option<EventKind> {
        // Kills dominate the stream; try them before anything else.
        if channel == CHANNEL_GAMEPLAY {
            if let Some(kill) = RE_KILL.captures(message) {
                return parse_kill(&kill).map(EventKind::Kill);
            }
        }

        match channel {
            CHANNEL_GAMEPLAY => parse_gameplay(message),
            CHANNEL_NET => parse_net(message),
            CHANNEL_LOAD => RE_MAP_LOAD
                .captures(message)
                .and_then(|caps| parse_map_load(&caps))
                .map(EventKind::MapLoad),
            CHANNEL_AI => RE_DIFFICULTY
                .captures(message)
                .and_then(|caps| caps["value"].parse::<f32>().ok())
                .filter(|value| value.is_finite())
                .map(|difficulty| EventKind::DifficultyChange { difficulty }),
            CHANNEL_CHAT => RE_CHAT
                .captures(message)
                .and_then(|caps| self.parse_chat_command(&caps))
                .map(EventKind::ChatCommand),
            CHANNEL_HEALTH => RE_FALL_DAMAGE.captures(message).and_then(|caps| {
                let player = parse_descriptor(&caps["who"])?;
                let damage = caps["damage"].parse::<f32>().ok()?;
                Some(EventKind::FallDamage { player, damage })
            }),
            CHANNEL_SESSION => RE_GAME_OVER
                .is_match(message)
                .then_some(EventKind::GameOver),
            CHANNEL_EXIT => RE_EXIT.is_match(message).then_some(EventKind::ServerShutdown),
            _ => None,
        }
    }

    fn parse_chat_command(&self, caps: &Captures<'_>) -> Option<ChatCommand> {
        let body = caps["message"].trim();
        let body = body.strip_prefix(self.command_sigil.as_str())?;

        let mut tokens = body.split_whitespace();
        let command = tokens.next()?.to_lowercase();
        let args = tokens.map(str::to_string).collect();

        Some(ChatCommand {
            player_name: caps["name"].trim().to_string(),
            external_id: normalize_id(&caps["id"]),
            channel: caps["channel"].to_string(),
            command,
            args,
        })
    }
}

/// Classifies a line with the default command sigil.
pub fn parse_line(line: &str) -> Option<Event> {
    LineClassifier::default().classify(line)
}

/// Embedded timestamp of any well-formed line, event or not.
pub fn line_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let envelope = RE_LINE.captures(line.trim())?;
    parse_log_timestamp(envelope.name("ts")?.as_str()).ok()
}

fn parse_gameplay(message: &str) -> Option<EventKind> {
    if let Some(caps) = RE_ROUND_START.captures(message) {
        let round = caps["round"].parse().ok()?;
        return Some(EventKind::RoundStart { round });
    }
    if let Some(caps) = RE_ROUND_END.captures(message) {
        let round = caps["round"].parse().ok()?;
        let winning_team = caps["team"].parse().ok()?;
        return Some(EventKind::RoundEnd {
            round,
            winning_team,
            reason: caps["reason"].trim().to_string(),
        });
    }
    if RE_GAME_OVER.is_match(message) {
        return Some(EventKind::GameOver);
    }
    None
}

fn parse_net(message: &str) -> Option<EventKind> {
    if let Some(caps) = RE_JOIN.captures(message) {
        let name = caps["name"].trim();
        if name.is_empty() {
            return None;
        }
        return Some(EventKind::Join {
            name: name.to_string(),
        });
    }
    if let Some(caps) = RE_LOGIN_REQUEST.captures(message) {
        let name = caps["name"].trim();
        let external_id = normalize_id(&caps["id"])?;
        if name.is_empty() {
            return None;
        }
        return Some(EventKind::LoginRequest {
            name: name.to_string(),
            external_id,
        });
    }
    if let Some(caps) = RE_LEAVE.captures(message) {
        let external_id = normalize_id(&caps["id"])?;
        return Some(EventKind::Leave { external_id });
    }
    None
}

fn parse_kill(caps: &Captures<'_>) -> Option<KillEvent> {
    let killers_section = caps["killers"].trim();
    if killers_section == UNATTRIBUTED_KILLER {
        return None;
    }

    let killers: Vec<Combatant> = killers_section
        .split(KILLER_SEPARATOR)
        .filter_map(|raw| {
            let parsed = parse_descriptor(raw);
            if parsed.is_none() {
                tracing::debug!(descriptor = %raw, "Dropping malformed killer descriptor");
            }
            parsed
        })
        .collect();
    if killers.is_empty() {
        return None;
    }

    let victim = parse_descriptor(&caps["victim"])?;
    let weapon_code = caps["weapon"].trim().to_string();
    let kind = KillKind::classify(&killers[0], &victim);

    Some(KillEvent {
        weapon: normalize_weapon(&weapon_code),
        weapon_code,
        killers,
        victim,
        kind,
    })
}

fn parse_descriptor(raw: &str) -> Option<Combatant> {
    let caps = RE_DESCRIPTOR.captures(raw.trim())?;
    let name = caps["name"].trim();
    if name.is_empty() {
        return None;
    }
    let team: TeamId = caps["team"].parse().ok()?;

    Some(Combatant {
        name: name.to_string(),
        external_id: normalize_id(&caps["id"]),
        team,
    })
}

fn parse_map_load(caps: &Captures<'_>) -> Option<MapLoadEvent> {
    let map = caps["folder"].trim();
    if map.is_empty() {
        return None;
    }

    let mut scenario = None;
    let mut max_players = None;
    let mut lighting = None;
    for pair in caps["query"].split('?') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key {
            "Scenario" => scenario = Some(clean_scenario(value)),
            "MaxPlayers" => max_players = value.parse::<u32>().ok(),
            "Lighting" => lighting = Some(value.trim().to_string()),
            _ => {}
        }
    }

    let scenario = scenario.filter(|value| !value.is_empty())?;
    let lighting = lighting.filter(|value| !value.is_empty())?;

    Some(MapLoadEvent {
        map: map.to_string(),
        scenario,
        max_players: max_players?,
        lighting,
    })
}

fn clean_scenario(raw: &str) -> String {
    let trimmed = raw.trim();
    let stripped = trimmed.strip_prefix("Scenario_").unwrap_or(trimmed);
    stripped.replace('_', " ").trim().to_string()
}

fn normalize_id(raw: &str) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() || value.eq_ignore_ascii_case(INVALID_ID) {
        return None;
    }
    Some(value.to_string())
}

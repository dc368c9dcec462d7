//! Typed gameplay events extracted from server log lines.
//!
//! Events are immutable once parsed and carry the embedded log timestamp; the
//! tracker consumes each one exactly once.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Team index as written by the engine (`team 0`, `team 1`, ...).
pub type TeamId = u8;

/// One `Name[id, team T]` descriptor from a kill or damage line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Combatant {
    pub name: String,
    /// Platform id, or `None` when the engine wrote `INVALID` (bots).
    pub external_id: Option<String>,
    pub team: TeamId,
}

impl Combatant {
    pub fn is_bot(&self) -> bool {
        self.external_id.is_none()
    }

    /// Same identity: equal ids, or equal names when neither side has an id.
    pub fn same_identity(&self, other: &Combatant) -> bool {
        match (&self.external_id, &other.external_id) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.name == other.name,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KillKind {
    Kill,
    FriendlyFire,
    Suicide,
}

impl KillKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KillKind::Kill => "kill",
            KillKind::FriendlyFire => "friendly_fire",
            KillKind::Suicide => "suicide",
        }
    }

    /// Classifies a kill by its primary killer.
    pub fn classify(primary: &Combatant, victim: &Combatant) -> Self {
        if primary.same_identity(victim) {
            KillKind::Suicide
        } else if primary.team == victim.team {
            KillKind::FriendlyFire
        } else {
            KillKind::Kill
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KillEvent {
    /// Non-empty; the first entry is the primary killer, the rest assist.
    pub killers: Vec<Combatant>,
    pub victim: Combatant,
    /// Normalized display name.
    pub weapon: String,
    /// Identifier as written in the log.
    pub weapon_code: String,
    pub kind: KillKind,
}

impl KillEvent {
    pub fn primary(&self) -> &Combatant {
        &self.killers[0]
    }

    pub fn assists(&self) -> &[Combatant] {
        &self.killers[1..]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MapLoadEvent {
    pub map: String,
    pub scenario: String,
    pub max_players: u32,
    pub lighting: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatCommand {
    pub player_name: String,
    pub external_id: Option<String>,
    /// Chat channel as written by the engine (`Global`, `Team`, ...).
    pub channel: String,
    /// Lower-cased, without the sigil.
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Kill(KillEvent),
    LoginRequest {
        name: String,
        external_id: String,
    },
    Join {
        name: String,
    },
    Leave {
        external_id: String,
    },
    RoundStart {
        round: u32,
    },
    RoundEnd {
        round: u32,
        winning_team: TeamId,
        reason: String,
    },
    GameOver,
    MapLoad(MapLoadEvent),
    DifficultyChange {
        difficulty: f32,
    },
    ChatCommand(ChatCommand),
    FallDamage {
        player: Combatant,
        damage: f32,
    },
    ServerShutdown,
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Kill(kill) => kill.kind.as_str(),
            EventKind::LoginRequest { .. } => "login_request",
            EventKind::Join { .. } => "join",
            EventKind::Leave { .. } => "leave",
            EventKind::RoundStart { .. } => "round_start",
            EventKind::RoundEnd { .. } => "round_end",
            EventKind::GameOver => "game_over",
            EventKind::MapLoad(_) => "map_load",
            EventKind::DifficultyChange { .. } => "difficulty_change",
            EventKind::ChatCommand(_) => "chat_command",
            EventKind::FallDamage { .. } => "fall_damage",
            EventKind::ServerShutdown => "server_shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Stable identity of a player on one server.
///
/// Players are `Known` once a platform id has been seen for them. Until then
/// they are `Provisional`, keyed by name and the instant they were first
/// seen; the tracker promotes a provisional identity explicitly when the id
/// shows up.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlayerIdentity {
    Known {
        id: String,
    },
    Provisional {
        name: String,
        first_seen_at: DateTime<Utc>,
    },
}

impl PlayerIdentity {
    pub fn known(id: impl Into<String>) -> Self {
        PlayerIdentity::Known { id: id.into() }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, PlayerIdentity::Known { .. })
    }

    /// Natural key used by the store.
    pub fn storage_key(&self) -> String {
        match self {
            PlayerIdentity::Known { id } => format!("id:{}", id),
            PlayerIdentity::Provisional {
                name,
                first_seen_at,
            } => format!("name:{}@{}", name, first_seen_at.timestamp_millis()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn combatant(name: &str, id: Option<&str>, team: TeamId) -> Combatant {
        Combatant {
            name: name.to_string(),
            external_id: id.map(str::to_string),
            team,
        }
    }

    #[test]
    fn classify_covers_all_three_kinds() {
        let alice = combatant("Alice", Some("1"), 0);
        let bob = combatant("Bob", Some("2"), 0);
        let bot = combatant("Insurgent", None, 1);

        assert_eq!(KillKind::classify(&alice, &alice), KillKind::Suicide);
        assert_eq!(KillKind::classify(&alice, &bob), KillKind::FriendlyFire);
        assert_eq!(KillKind::classify(&alice, &bot), KillKind::Kill);
    }

    #[test]
    fn bots_with_same_name_are_the_same_identity() {
        let a = combatant("Insurgent", None, 1);
        let b = combatant("Insurgent", None, 1);
        assert!(a.same_identity(&b));
        assert!(!a.same_identity(&combatant("Insurgent", Some("9"), 1)));
    }

    #[test]
    fn storage_keys_distinguish_identity_kinds() {
        let known = PlayerIdentity::known("76561198000000001");
        assert_eq!(known.storage_key(), "id:76561198000000001");

        let provisional = PlayerIdentity::Provisional {
            name: "Alice".to_string(),
            first_seen_at: DateTime::from_timestamp_millis(1_000).expect("ts"),
        };
        assert_eq!(provisional.storage_key(), "name:Alice@1000");
    }
}

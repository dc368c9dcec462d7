//! Chat-command extension point.
//!
//! The tracker resolves the speaker's identity and hands every recognised
//! command to a [`ChatCommandHandler`]. A returned reply is published on the
//! feed; delivering it back into the game is left to whoever consumes the
//! feed.

use fraglog_core::{ChatCommand, PlayerIdentity};
use std::sync::Arc;
use tracing::warn;

use crate::db::{PlayerTotals, StatsGateway};

pub trait ChatCommandHandler: Send + Sync {
    fn handle(&self, command: &ChatCommand, identity: &PlayerIdentity) -> Option<String>;
}

/// Ignores every command.
#[cfg(test)]
pub struct NoopCommands;

#[cfg(test)]
impl ChatCommandHandler for NoopCommands {
    fn handle(&self, _command: &ChatCommand, _identity: &PlayerIdentity) -> Option<String> {
        None
    }
}

/// Answers `stats`, `kd` and `help` from the stats store.
pub struct StatsCommandHandler {
    gateway: Arc<dyn StatsGateway>,
}

impl StatsCommandHandler {
    pub fn new(gateway: Arc<dyn StatsGateway>) -> Self {
        Self { gateway }
    }

    fn totals(&self, identity: &PlayerIdentity) -> Option<PlayerTotals> {
        match self.gateway.player_totals(&identity.storage_key()) {
            Ok(totals) => totals,
            Err(err) => {
                warn!(error = %err, "Failed to load player totals for chat command");
                None
            }
        }
    }
}

impl ChatCommandHandler for StatsCommandHandler {
    fn handle(&self, command: &ChatCommand, identity: &PlayerIdentity) -> Option<String> {
        match command.command.as_str() {
            "stats" => Some(match self.totals(identity) {
                Some(totals) => format!(
                    "{}: {} kills, {} assists, {} deaths, {} teamkills, {} played",
                    command.player_name,
                    totals.kills,
                    totals.assists,
                    totals.deaths,
                    totals.teamkills,
                    format_playtime(totals.playtime_ms)
                ),
                None => format!("{}: no stats recorded yet", command.player_name),
            }),
            "kd" => Some(match self.totals(identity) {
                Some(totals) => format!(
                    "{}: K/D {}",
                    command.player_name,
                    format_ratio(totals.kills, totals.deaths)
                ),
                None => format!("{}: no stats recorded yet", command.player_name),
            }),
            "help" => Some("Commands: stats, kd, help".to_string()),
            _ => None,
        }
    }
}

fn format_ratio(kills: u32, deaths: u32) -> String {
    if deaths == 0 {
        return format!("{}.00", kills);
    }
    format!("{:.2}", f64::from(kills) / f64::from(deaths))
}

fn format_playtime(ms: i64) -> String {
    let minutes = ms.max(0) / 60_000;
    if minutes < 60 {
        format!("{}m", minutes)
    } else {
        format!("{}h {}m", minutes / 60, minutes % 60)
    }
}

//! Compiled regex patterns for classifying server log lines.
//!
//! These patterns are compiled once on first use and shared by every
//! classifier. Update these when the engine's log format changes.

use once_cell::sync::Lazy;
use regex::Regex;

// ═══════════════════════════════════════════════════════════════════════════════
// Line Envelope
// ═══════════════════════════════════════════════════════════════════════════════

/// `[2025.10.04-15.23.38:790][412]LogGameplayEvents: Display: <message>`
pub static RE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\[(?P<ts>[^\]]+)\]\[\s*(?P<frame>\d+)\](?P<channel>[A-Za-z0-9_]+): (?:(?P<verbosity>Display|Warning|Error|Log|Verbose|VeryVerbose): )?(?P<message>.*)$",
    )
    .unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════════
// LogGameplayEvents
// ═══════════════════════════════════════════════════════════════════════════════

pub static RE_KILL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<killers>.+?) killed (?P<victim>.+\]) with (?P<weapon>\S+)\s*$").unwrap()
});
pub static RE_DESCRIPTOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<name>.+)\[(?P<id>[^,\[\]]+), team (?P<team>\d{1,3})\]$").unwrap()
});
pub static RE_ROUND_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Round (?P<round>\d+) Started$").unwrap());
pub static RE_ROUND_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^Round (?P<round>\d+) Over: Team (?P<team>\d{1,3}) won \(win reason: (?P<reason>[^)]*)\)$",
    )
    .unwrap()
});
pub static RE_GAME_OVER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:Game over|Match has ended)\.?$").unwrap());

// ═══════════════════════════════════════════════════════════════════════════════
// LogNet
// ═══════════════════════════════════════════════════════════════════════════════

pub static RE_LOGIN_REQUEST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^Login request: .*?\?Name=(?P<name>[^?]+?)(?:\?\S*)? userId: [A-Za-z]+:(?P<id>[^\s,]+)",
    )
    .unwrap()
});
pub static RE_JOIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Join succeeded: (?P<name>.+?)\s*$").unwrap());
pub static RE_LEAVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^UChannel::Close: .*UniqueId: [A-Za-z]+:(?P<id>[^\s,]+)").unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════════
// LogLoad / LogAI / LogChat / LogHealth / LogExit
// ═══════════════════════════════════════════════════════════════════════════════

pub static RE_MAP_LOAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^LoadMap: /Game/Maps/(?P<folder>[^/?]+)/[^?]*\?(?P<query>\S+)\s*$").unwrap()
});
pub static RE_DIFFICULTY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^AI difficulty set to (?P<value>-?\d+(?:\.\d+)?)\s*$").unwrap()
});
pub static RE_CHAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<name>.+?)\((?P<id>[^()]*)\) (?P<channel>[A-Za-z]+) Chat: (?P<message>.*)$")
        .unwrap()
});
pub static RE_FALL_DAMAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<who>.+\]) took (?P<damage>\d+(?:\.\d+)?) fall damage\s*$").unwrap()
});
pub static RE_EXIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Exiting\.?\s*$").unwrap());

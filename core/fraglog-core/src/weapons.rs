//! Weapon identifier normalization.
//!
//! Kill lines name the weapon by its blueprint class, e.g.
//! `BP_Firearm_M16A4_C_2147481419`. Known classes map to display names via a
//! longest-match table; anything else is cleaned up heuristically so new
//! engine content still produces a readable name.

/// Known weapon codes and their display names.
///
/// Lookup picks the longest code contained in the identifier, so `M16A4`
/// wins over a hypothetical `M16` and `MK18` over `MK1`.
const KNOWN_WEAPONS: &[(&str, &str)] = &[
    ("M16A4", "M16A4"),
    ("M4A1", "M4A1"),
    ("MK18", "Mk 18"),
    ("AKM", "AKM"),
    ("AK74", "AK-74"),
    ("AKS74U", "AKS-74U"),
    ("ACE52CQB", "ACE 52 CQB"),
    ("Galil", "Galil"),
    ("G36K", "G36K"),
    ("FAL", "FAL"),
    ("SKS", "SKS"),
    ("M14", "M14 EBR"),
    ("Mosin", "Mosin-Nagant"),
    ("M24", "M24"),
    ("MP7", "MP7"),
    ("MP5A2", "MP5A2"),
    ("UMP45", "UMP45"),
    ("Uzi", "Uzi"),
    ("M249", "M249"),
    ("PKM", "PKM"),
    ("RPK", "RPK"),
    ("M870", "M870"),
    ("TOZ", "TOZ-194"),
    ("M9", "M9"),
    ("M1911", "M1911"),
    ("Makarov", "Makarov"),
    ("Revolver", "Revolver"),
    ("Frag_M67", "M67 Frag"),
    ("F1", "F1 Frag"),
    ("Molotov", "Molotov"),
    ("Incendiary", "Incendiary Grenade"),
    ("C4", "C4"),
    ("IED", "IED"),
    ("RPG7", "RPG-7"),
    ("AT4", "AT4"),
    ("Javelin", "Javelin"),
    ("Mortar", "Mortar Strike"),
    ("Artillery", "Artillery Strike"),
    ("Helicopter", "Helicopter Strike"),
    ("Knife", "Knife"),
    ("Kukri", "Kukri"),
];

const STRIP_PREFIXES: &[&str] = &[
    "BP_Firearm_",
    "BP_Projectile_",
    "BP_Explosive_",
    "BP_Melee_",
    "BP_Character_",
    "BP_",
];

const UNKNOWN_WEAPON: &str = "Unknown";

/// Maps a raw weapon identifier to a display name. Never fails.
pub fn normalize_weapon(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return UNKNOWN_WEAPON.to_string();
    }

    if let Some(name) = lookup_known(raw) {
        return name.to_string();
    }

    let cleaned = strip_decorations(raw);
    let titled = title_case(&cleaned);
    if titled.is_empty() {
        UNKNOWN_WEAPON.to_string()
    } else {
        titled
    }
}

fn lookup_known(raw: &str) -> Option<&'static str> {
    let haystack = raw.to_ascii_lowercase();
    KNOWN_WEAPONS
        .iter()
        .filter(|(code, _)| contains_token(&haystack, &code.to_ascii_lowercase()))
        .max_by_key(|(code, _)| code.len())
        .map(|(_, name)| *name)
}

/// Matches `needle` only on identifier boundaries (`_`, `-`, start, end) so
/// that `M9` does not match inside `M970`.
fn contains_token(haystack: &str, needle: &str) -> bool {
    let bytes = haystack.as_bytes();
    haystack.match_indices(needle).any(|(start, _)| {
        let end = start + needle.len();
        let before_ok = start == 0 || matches!(bytes[start - 1], b'_' | b'-');
        let after_ok = end == bytes.len() || matches!(bytes[end], b'_' | b'-');
        before_ok && after_ok
    })
}

fn strip_decorations(raw: &str) -> String {
    let mut value = raw;
    for prefix in STRIP_PREFIXES {
        if let Some(rest) = value.strip_prefix(prefix) {
            value = rest;
            break;
        }
    }

    let mut parts: Vec<&str> = value
        .split(['_', '-'])
        .filter(|part| !part.is_empty())
        .collect();

    // Trailing instance ids and the `_C` class marker, in either order.
    while let Some(last) = parts.last() {
        if last.bytes().all(|b| b.is_ascii_digit()) || *last == "C" {
            parts.pop();
        } else {
            break;
        }
    }

    parts.join(" ")
}

fn title_case(value: &str) -> String {
    value
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    let rest: String = chars.collect();
                    if rest.chars().any(|c| c.is_ascii_uppercase()) {
                        // Mixed-case codes like "G3A3" keep their casing.
                        format!("{}{}", first.to_ascii_uppercase(), rest)
                    } else {
                        format!("{}{}", first.to_ascii_uppercase(), rest.to_ascii_lowercase())
                    }
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

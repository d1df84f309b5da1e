//! Argument parsing for the attribute and function-like macros

use darling::FromMeta;

/// Parsed `#[event_hook(...)]` arguments
#[derive(Debug, FromMeta)]
pub struct EventHookArgs {
    /// Event name, e.g. `"tick"` or `"map_load"`
    pub event: String,
}

/// Event names accepted by `#[event_hook]`, with the `HookEvent` variant each maps to
pub const EVENTS: &[(&str, &str)] = &[
    ("pre_tick", "PreTick"),
    ("tick", "Tick"),
    ("pre_map_load", "PreMapLoad"),
    ("map_load", "MapLoad"),
];

pub fn event_variant(name: &str) -> Option<&'static str> {
    EVENTS
        .iter()
        .find(|(event, _)| *event == name)
        .map(|(_, variant)| *variant)
}

/// Parse pattern text: whitespace-separated hex bytes, `?`/`??` wildcards.
///
/// Mirrors `Pattern::parse` so errors surface at compile time.
pub fn parse_pattern(text: &str) -> Result<Vec<Option<u8>>, String> {
    let mut bytes = Vec::new();

    for part in text.split_whitespace() {
        if part == "?" || part == "??" {
            bytes.push(None);
        } else if part.len() == 2 {
            let byte =
                u8::from_str_radix(part, 16).map_err(|_| format!("invalid hex byte `{}`", part))?;
            bytes.push(Some(byte));
        } else {
            return Err(format!("invalid hex byte `{}`", part));
        }
    }

    if bytes.is_empty() {
        return Err("empty signature pattern".to_string());
    }
    if bytes.iter().all(Option::is_none) {
        return Err("signature pattern has no concrete bytes".to_string());
    }
    Ok(bytes)
}

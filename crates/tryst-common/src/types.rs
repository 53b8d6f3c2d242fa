//! Core type definitions for the rendezvous protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Interaction mode a user queues for. Selects the matching queue and the
/// session's initial mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Server-relayed text chat.
    Text,
    /// Peer-to-peer video; the server only relays setup payloads.
    Video,
    /// Peer-to-peer voice; the server only relays setup payloads.
    Voice,
}

impl Mode {
    /// All modes, in queue-iteration order.
    pub const ALL: [Mode; 3] = [Mode::Text, Mode::Video, Mode::Voice];

    /// Stable wire name of the mode.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Text => "text",
            Mode::Video => "video",
            Mode::Voice => "voice",
        }
    }

    /// True when media for this mode is established peer-to-peer and the
    /// paired users need an offerer/answerer election.
    #[must_use]
    pub fn needs_offerer(self) -> bool {
        !matches!(self, Mode::Text)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a [`Mode`] from a string fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseModeError;

impl fmt::Display for ParseModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("mode must be one of: text, video, voice")
    }
}

impl std::error::Error for ParseModeError {}

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Mode::Text),
            "video" => Ok(Mode::Video),
            "voice" => Ok(Mode::Voice),
            _ => Err(ParseModeError),
        }
    }
}

/// Stable session identifier for a pair: the two user ids sorted and joined.
///
/// The same two users always produce the same pair id regardless of argument
/// order.
///
/// # Examples
///
/// ```
/// assert_eq!(tryst_common::types::pair_id("bob", "alice"), "alice:bob");
/// assert_eq!(tryst_common::types::pair_id("alice", "bob"), "alice:bob");
/// ```
#[must_use]
pub fn pair_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_str() {
        for mode in Mode::ALL {
            assert_eq!(mode.as_str().parse::<Mode>().unwrap(), mode);
        }
    }

    #[test]
    fn unknown_mode_fails_to_parse() {
        assert!("vide".parse::<Mode>().is_err());
        assert!("".parse::<Mode>().is_err());
    }

    #[test]
    fn text_needs_no_offerer() {
        assert!(!Mode::Text.needs_offerer());
        assert!(Mode::Video.needs_offerer());
        assert!(Mode::Voice.needs_offerer());
    }

    #[test]
    fn pair_id_is_order_independent() {
        assert_eq!(pair_id("x", "y"), pair_id("y", "x"));
    }

    #[test]
    fn pair_id_of_equal_ids_is_well_formed() {
        assert_eq!(pair_id("a", "a"), "a:a");
    }
}

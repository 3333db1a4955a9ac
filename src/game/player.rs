//! Player Model
//!
//! Connection-bound participants in a race session. A player is either
//! a racer with live progress fields or a spectator whose progress is
//! never written. Display names are sanitized on entry and colors come
//! from a fixed palette assigned round-robin.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::clock::TimestampMs;
use crate::core::id::PlayerId;

/// Fixed palette racers cycle through.
pub const COLOR_PALETTE: [&str; 8] = [
    "#FF5252", "#FFB142", "#FFF200", "#32FF7E", "#18DCFF", "#7D5FFF", "#FF66B3", "#C56CF0",
];

/// Neutral color assigned to spectators.
pub const SPECTATOR_COLOR: &str = "#AAAAAA";

/// Display names are clamped to this many characters.
pub const MAX_NAME_LEN: usize = 15;

/// A participant in a race session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    /// Player identifier (the connection id).
    pub id: PlayerId,
    /// Sanitized display name.
    pub name: String,
    /// Display color (palette entry, or neutral for spectators).
    pub color: String,
    /// Progress through the passage, percent 0-100.
    pub position: f64,
    /// Character offset into the passage.
    pub current_index: usize,
    /// Words per minute as reported by the client.
    pub wpm: f64,
    /// Accuracy percentage as reported by the client.
    pub accuracy: f64,
    /// Ready to start.
    pub is_ready: bool,
    /// When the player crossed the finish line, if they have.
    pub finish_time: Option<TimestampMs>,
    /// Connection liveness. Disconnected racers are retained mid-race.
    pub is_connected: bool,
    /// Spectators never race; their progress fields stay zero.
    pub is_spectator: bool,
}

impl Player {
    /// Create a racer with a palette color.
    pub fn racer(id: PlayerId, name: String, color: &str) -> Self {
        Self {
            id,
            name,
            color: color.to_string(),
            position: 0.0,
            current_index: 0,
            wpm: 0.0,
            accuracy: 0.0,
            is_ready: false,
            finish_time: None,
            is_connected: true,
            is_spectator: false,
        }
    }

    /// Create a spectator. The name is suffixed and the color is neutral.
    pub fn spectator(id: PlayerId, name: String) -> Self {
        Self {
            id,
            name: format!("{} (Spectator)", name),
            color: SPECTATOR_COLOR.to_string(),
            position: 0.0,
            current_index: 0,
            wpm: 0.0,
            accuracy: 0.0,
            is_ready: true,
            finish_time: None,
            is_connected: true,
            is_spectator: true,
        }
    }

    /// Whether the player has crossed the finish line.
    pub fn has_finished(&self) -> bool {
        self.finish_time.is_some()
    }

    /// Reset progress fields to the starting line.
    pub fn reset_progress(&mut self) {
        self.position = 0.0;
        self.current_index = 0;
        self.wpm = 0.0;
        self.accuracy = 0.0;
        self.finish_time = None;
    }
}

/// Derive a 0-100 position from a character offset.
pub fn position_of(current_index: usize, text_len: usize) -> f64 {
    if text_len == 0 {
        return 100.0;
    }
    (current_index as f64 / text_len as f64 * 100.0).min(100.0)
}

/// Sanitize a raw display name: trim, clamp to [`MAX_NAME_LEN`] chars,
/// and substitute a generated name when nothing usable remains.
pub fn sanitize_name(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return fallback_name();
    }
    trimmed.chars().take(MAX_NAME_LEN).collect()
}

/// `Player-<4 random digits>`.
fn fallback_name() -> String {
    format!("Player-{:04}", rand::thread_rng().gen_range(0..10_000))
}

/// Palette entry for the n-th racer of a session.
pub fn palette_color(index: usize) -> &'static str {
    COLOR_PALETTE[index % COLOR_PALETTE.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_trims_and_keeps() {
        assert_eq!(sanitize_name("  Ada  "), "Ada");
        assert_eq!(sanitize_name("Bob"), "Bob");
    }

    #[test]
    fn test_sanitize_clamps_long_names() {
        let long = "abcdefghijklmnopqrstuvwxyz";
        let name = sanitize_name(long);
        assert_eq!(name.chars().count(), MAX_NAME_LEN);
        assert_eq!(name, "abcdefghijklmno");
    }

    #[test]
    fn test_sanitize_clamps_on_char_boundaries() {
        let name = sanitize_name("ääääääääääääääääää");
        assert_eq!(name.chars().count(), MAX_NAME_LEN);
    }

    #[test]
    fn test_sanitize_replaces_empty() {
        for raw in ["", "   ", "\t\n"] {
            let name = sanitize_name(raw);
            assert!(name.starts_with("Player-"), "got {:?}", name);
            assert_eq!(name.len(), "Player-".len() + 4);
        }
    }

    #[test]
    fn test_palette_cycles() {
        assert_eq!(palette_color(0), COLOR_PALETTE[0]);
        assert_eq!(palette_color(7), COLOR_PALETTE[7]);
        assert_eq!(palette_color(8), COLOR_PALETTE[0]);
        assert_eq!(palette_color(11), COLOR_PALETTE[3]);
    }

    #[test]
    fn test_position_of_clamps_at_100() {
        assert_eq!(position_of(0, 100), 0.0);
        assert_eq!(position_of(50, 100), 50.0);
        assert_eq!(position_of(150, 100), 100.0);
        assert_eq!(position_of(5, 0), 100.0);
    }

    #[test]
    fn test_spectator_shape() {
        let p = Player::spectator(PlayerId::generate(), "Carol".to_string());
        assert_eq!(p.name, "Carol (Spectator)");
        assert_eq!(p.color, SPECTATOR_COLOR);
        assert!(p.is_ready);
        assert!(p.is_spectator);
        assert!(!p.has_finished());
    }

    #[test]
    fn test_reset_progress() {
        let mut p = Player::racer(PlayerId::generate(), "Ada".to_string(), palette_color(0));
        p.position = 80.0;
        p.current_index = 40;
        p.wpm = 92.0;
        p.accuracy = 97.5;
        p.finish_time = Some(123);

        p.reset_progress();
        assert_eq!(p.position, 0.0);
        assert_eq!(p.current_index, 0);
        assert_eq!(p.wpm, 0.0);
        assert!(p.finish_time.is_none());
    }

    #[test]
    fn test_player_serializes_camel_case() {
        let p = Player::racer(PlayerId::generate(), "Ada".to_string(), palette_color(0));
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"currentIndex\""));
        assert!(json.contains("\"isReady\""));
        assert!(json.contains("\"finishTime\""));
        assert!(json.contains("\"isSpectator\""));
    }
}

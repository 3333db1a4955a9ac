//! Race Session
//!
//! Per-session state machine and player roster. State only advances
//! `Waiting -> Countdown -> Racing -> Finished`; the [`RaceEngine`]
//! (`game::engine`) is the sole mutator. Each session owns its timers
//! (countdown ticker, race deadline, cleanup delay) so that terminal
//! transitions can cancel them.
//!
//! [`RaceEngine`]: crate::game::engine::RaceEngine

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::core::clock::TimestampMs;
use crate::core::id::{PlayerId, SessionId};
use crate::game::engine::EngineError;
use crate::game::player::{palette_color, Player};

/// Session lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaceState {
    /// Waiting for players to join and ready up.
    Waiting,
    /// Countdown before the race starts.
    Countdown,
    /// Race in progress.
    Racing,
    /// Race over; session awaits cleanup.
    Finished,
}

/// Timers owned by a session. Aborted on terminal transitions and on
/// session destruction.
#[derive(Default)]
pub struct SessionTimers {
    /// 1 Hz countdown ticker.
    pub countdown: Option<JoinHandle<()>>,
    /// Maximum race duration deadline.
    pub deadline: Option<JoinHandle<()>>,
    /// Post-race cleanup delay.
    pub cleanup: Option<JoinHandle<()>>,
}

impl SessionTimers {
    /// Abort every armed timer.
    pub fn abort_all(&mut self) {
        for handle in [
            self.countdown.take(),
            self.deadline.take(),
            self.cleanup.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }

    /// Abort just the countdown ticker.
    pub fn abort_countdown(&mut self) {
        if let Some(handle) = self.countdown.take() {
            handle.abort();
        }
    }

    /// Abort just the race deadline.
    pub fn abort_deadline(&mut self) {
        if let Some(handle) = self.deadline.take() {
            handle.abort();
        }
    }
}

/// One race instance.
pub struct RaceSession {
    /// Session identifier.
    pub id: SessionId,
    /// Current lifecycle state.
    pub state: RaceState,
    /// Ordered participant list (racers and spectators).
    pub players: Vec<Player>,
    /// The immutable passage chosen at creation.
    pub text: String,
    /// Passage length in characters, cached for position math.
    pub text_len: usize,
    /// Maximum racers (spectators are not counted).
    pub max_players: usize,
    /// Connected racers required before the countdown can start.
    pub min_players: usize,
    /// Creation timestamp.
    pub created_at: TimestampMs,
    /// Set on entry to Racing.
    pub start_time: Option<TimestampMs>,
    /// Set on entry to Finished.
    pub end_time: Option<TimestampMs>,
    /// Seconds left; only meaningful in Countdown.
    pub countdown_remaining: u32,
    /// Session-owned timers.
    pub timers: SessionTimers,
    /// Next palette slot for round-robin color assignment.
    color_cursor: usize,
}

impl RaceSession {
    /// Create a session in Waiting with no players.
    pub fn new(
        id: SessionId,
        text: String,
        max_players: usize,
        min_players: usize,
        now: TimestampMs,
    ) -> Self {
        let text_len = text.chars().count();
        Self {
            id,
            state: RaceState::Waiting,
            players: Vec::new(),
            text,
            text_len,
            max_players,
            min_players,
            created_at: now,
            start_time: None,
            end_time: None,
            countdown_remaining: 0,
            timers: SessionTimers::default(),
            color_cursor: 0,
        }
    }

    /// Look up a player.
    pub fn player(&self, id: PlayerId) -> Option<&Player> {
        self.players.iter().find(|p| p.id == id)
    }

    /// Look up a player mutably.
    pub fn player_mut(&mut self, id: PlayerId) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.id == id)
    }

    /// Number of racers (spectators excluded).
    pub fn racer_count(&self) -> usize {
        self.players.iter().filter(|p| !p.is_spectator).count()
    }

    /// Racers that are currently connected.
    pub fn connected_racers(&self) -> impl Iterator<Item = &Player> {
        self.players
            .iter()
            .filter(|p| !p.is_spectator && p.is_connected)
    }

    /// Append a racer. Fails when the session is full or the id is taken.
    pub fn add_racer(&mut self, id: PlayerId, name: String) -> Result<Player, EngineError> {
        if self.player(id).is_some() {
            return Err(EngineError::PlayerAlreadyExists);
        }
        if self.racer_count() >= self.max_players {
            return Err(EngineError::GameFull);
        }
        let player = Player::racer(id, name, palette_color(self.color_cursor));
        self.color_cursor += 1;
        self.players.push(player.clone());
        Ok(player)
    }

    /// Append a spectator. Spectators do not count against capacity.
    pub fn add_spectator(&mut self, id: PlayerId, name: String) -> Result<Player, EngineError> {
        if self.player(id).is_some() {
            return Err(EngineError::PlayerAlreadyExists);
        }
        let player = Player::spectator(id, name);
        self.players.push(player.clone());
        Ok(player)
    }

    /// Remove a player entirely. Only valid while Waiting.
    pub fn remove_player(&mut self, id: PlayerId) -> bool {
        let before = self.players.len();
        self.players.retain(|p| p.id != id);
        self.players.len() != before
    }

    /// True when the countdown may start: every connected racer is ready
    /// and there are at least `min_players` of them.
    pub fn can_start(&self) -> bool {
        let connected: Vec<_> = self.connected_racers().collect();
        connected.len() >= self.min_players && connected.iter().all(|p| p.is_ready)
    }

    /// True when every connected racer has crossed the finish line.
    pub fn all_connected_finished(&self) -> bool {
        let mut any = false;
        for p in self.connected_racers() {
            any = true;
            if !p.has_finished() {
                return false;
            }
        }
        any
    }

    /// Age of the session: time since the race started, or since
    /// creation when it never did.
    pub fn game_age(&self, now: TimestampMs) -> TimestampMs {
        let origin = self.start_time.unwrap_or(self.created_at);
        now.saturating_sub(origin)
    }

    /// Serializable snapshot of the session.
    pub fn view(&self) -> GameState {
        GameState {
            id: self.id,
            state: self.state,
            players: self.players.clone(),
            text: self.text.clone(),
            max_players: self.max_players,
            created_at: self.created_at,
            start_time: self.start_time,
            end_time: self.end_time,
            countdown_remaining: self.countdown_remaining,
        }
    }

    /// One-line listing entry for the session.
    pub fn summary(&self) -> GameSummary {
        GameSummary {
            id: self.id,
            player_count: self.racer_count(),
            state: self.state,
        }
    }
}

/// Serializable session snapshot sent to clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    /// Session identifier.
    pub id: SessionId,
    /// Lifecycle state.
    pub state: RaceState,
    /// Participant list, in join order.
    pub players: Vec<Player>,
    /// The race passage.
    pub text: String,
    /// Racer capacity.
    pub max_players: usize,
    /// Creation timestamp.
    pub created_at: TimestampMs,
    /// Racing entry time, if reached.
    pub start_time: Option<TimestampMs>,
    /// Finished entry time, if reached.
    pub end_time: Option<TimestampMs>,
    /// Countdown seconds remaining.
    pub countdown_remaining: u32,
}

/// Listing entry for `get_all_games` and the admin surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSummary {
    /// Session identifier.
    pub id: SessionId,
    /// Number of racers.
    pub player_count: usize,
    /// Lifecycle state.
    pub state: RaceState,
}

//! Protocol Events
//!
//! Wire format for client-server communication over WebSocket.
//! All events are JSON objects tagged by `type`; payload fields are
//! camelCase to match the browser client. Dispatch is an exhaustive
//! match over these enums, so an unhandled event cannot slip through.

use serde::{Deserialize, Serialize};

use crate::control::flags::{FlagsPatch, FlagsSnapshot};
use crate::core::clock::TimestampMs;
use crate::core::id::{PlayerId, SessionId};
use crate::game::engine::{EngineError, EngineStats};
use crate::game::player::Player;
use crate::game::race::{GameState, GameSummary};
use crate::game::ranking::RaceSummary;
use crate::game::replay::Replay;

// =============================================================================
// CLIENT -> SERVER EVENTS
// =============================================================================

/// Events sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Create a game with the caller as first racer.
    CreateGame(CreateGamePayload),

    /// Join a specific game, or any open one.
    JoinGame(JoinGamePayload),

    /// Ready to race.
    PlayerReady(GameRef),

    /// Typing progress report.
    UpdateProgress(ProgressPayload),

    /// Authoritative finish report.
    PlayerFinished(FinishPayload),

    /// Leave a game.
    LeaveGame(GameRef),

    /// Fetch a stored replay.
    GetReplay(GameRef),

    /// Fetch a session snapshot.
    GetGameState(GameRef),

    /// List all sessions.
    GetAllGames,

    /// Fetch mitigation status and counters.
    GetSystemStatus,

    /// Apply a partial mitigation update.
    SetSystemConfig(FlagsPatch),

    /// Latency probe.
    Ping {
        /// Client timestamp, echoed back.
        timestamp: u64,
    },
}

/// `create_game` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGamePayload {
    /// Requested display name.
    pub player_name: String,
    /// Racer capacity override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_players: Option<usize>,
}

/// `join_game` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinGamePayload {
    /// Requested display name.
    pub player_name: String,
    /// Target session; omitted means "any open game".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<SessionId>,
    /// Join as spectator even while the game is joinable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_spectator: Option<bool>,
}

/// Payload carrying just a session reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRef {
    /// Target session.
    pub game_id: SessionId,
}

/// `update_progress` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    /// Target session.
    pub game_id: SessionId,
    /// Character offset into the passage.
    pub current_index: usize,
    /// Client-computed words per minute.
    pub wpm: f64,
    /// Client-computed accuracy percentage.
    pub accuracy: f64,
}

/// `player_finished` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishPayload {
    /// Target session.
    pub game_id: SessionId,
    /// Final words per minute.
    pub wpm: f64,
    /// Final accuracy percentage.
    pub accuracy: f64,
    /// Client finish timestamp.
    pub finish_time: TimestampMs,
}

// =============================================================================
// SERVER -> CLIENT EVENTS
// =============================================================================

/// Events sent from server to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Session snapshot or progress delta.
    GameStateUpdate(GameStateUpdate),

    /// A player joined the room's session.
    PlayerJoined(PlayerJoinedPayload),

    /// A player left the room's session.
    PlayerLeft(PlayerLeftPayload),

    /// Countdown tick.
    GameCountdown(CountdownPayload),

    /// The race started.
    GameStarted(GameStartedPayload),

    /// The race finished, with rankings.
    GameFinished(GameFinishedPayload),

    /// The session was terminated by the server.
    GameTerminated(GameTerminatedPayload),

    /// Stored replay reply.
    ReplayData(ReplayDataPayload),

    /// Session listing reply.
    AllGames(AllGamesPayload),

    /// Latency probe reply.
    #[serde(rename_all = "camelCase")]
    Pong {
        /// Echo of the client timestamp.
        timestamp: u64,
        /// Server wall-clock at reply time.
        server_time: TimestampMs,
    },

    /// Operation failure, sent only to the originating connection.
    Error(ErrorPayload),
}

/// Kind discriminator inside `game_state_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// A game was created for the receiver.
    GameCreated,
    /// The receiver joined a game.
    GameJoined,
    /// A player readied up.
    PlayerReady,
    /// A racer's progress changed.
    ProgressUpdate,
    /// A racer finished.
    PlayerFinished,
    /// Requested session snapshot.
    StateSync,
    /// Mitigation status and counters.
    SystemStatus,
}

/// `game_state_update` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStateUpdate {
    /// What changed.
    pub update: UpdateKind,
    /// Session, absent for system-status updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<SessionId>,
    /// Full session snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_state: Option<GameState>,
    /// Single-player delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<Player>,
    /// Mitigation snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FlagsSnapshot>,
    /// Server counters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<SystemStats>,
}

impl GameStateUpdate {
    /// An update carrying a full session snapshot.
    pub fn with_state(update: UpdateKind, state: GameState) -> Self {
        Self {
            update,
            game_id: Some(state.id),
            game_state: Some(state),
            player: None,
            status: None,
            stats: None,
        }
    }

    /// An update carrying a single player's fields.
    pub fn with_player(update: UpdateKind, game_id: SessionId, player: Player) -> Self {
        Self {
            update,
            game_id: Some(game_id),
            game_state: None,
            player: Some(player),
            status: None,
            stats: None,
        }
    }

    /// A system-status update.
    pub fn system(status: FlagsSnapshot, stats: SystemStats) -> Self {
        Self {
            update: UpdateKind::SystemStatus,
            game_id: None,
            game_state: None,
            player: None,
            status: Some(status),
            stats: Some(stats),
        }
    }
}

/// `player_joined` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerJoinedPayload {
    /// Session joined.
    pub game_id: SessionId,
    /// The joining player.
    pub player: Player,
}

/// `player_left` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerLeftPayload {
    /// Session left.
    pub game_id: SessionId,
    /// Who left.
    pub player_id: PlayerId,
}

/// `game_countdown` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountdownPayload {
    /// Counting session.
    pub game_id: SessionId,
    /// Seconds remaining.
    pub countdown: u32,
}

/// `game_started` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStartedPayload {
    /// Racing session.
    pub game_id: SessionId,
    /// Racing entry timestamp.
    pub start_time: TimestampMs,
}

/// `game_finished` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameFinishedPayload {
    /// Snapshot at the finish.
    pub game_state: GameState,
    /// Ranked summary.
    pub summary: RaceSummary,
}

/// `game_terminated` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameTerminatedPayload {
    /// Terminated session.
    pub game_id: SessionId,
    /// Machine-readable reason.
    pub reason: String,
}

/// `replay_data` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayDataPayload {
    /// The stored replay.
    pub replay: Replay,
}

/// `all_games` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllGamesPayload {
    /// One entry per session.
    pub games: Vec<GameSummary>,
}

/// Server counters bundled into system-status replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStats {
    /// Engine counters.
    pub games: EngineStats,
    /// Live connections.
    pub connections: usize,
    /// Room broadcasts delivered.
    pub broadcasts_sent: u64,
    /// Progress broadcasts suppressed by throttling.
    pub broadcasts_throttled: u64,
    /// Events dropped by per-connection backpressure.
    pub messages_dropped: u64,
    /// Connections closed for unrecoverable backpressure.
    pub connections_closed: u64,
}

/// `error` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Human-readable message.
    pub message: String,
    /// Machine-readable code.
    pub code: ErrorCode,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No such game.
    GameNotFound,
    /// Game at racer capacity.
    GameFull,
    /// No such player in the game.
    PlayerNotFound,
    /// The player id is already connected.
    PlayerAlreadyExists,
    /// Operation invalid in the game's current state.
    InvalidState,
    /// Not accepting new players.
    ServiceUnavailable,
    /// Creation accepted into the pending queue.
    Queued,
    /// Caller may not perform the operation.
    Unauthorized,
    /// No stored replay for the game.
    ReplayNotFound,
    /// Malformed event payload.
    InvalidPayload,
    /// Catch-all server failure.
    Internal,
}

impl ErrorPayload {
    /// Build an error payload from an engine error.
    pub fn from_engine(err: &EngineError) -> Self {
        let code = match err {
            EngineError::GameNotFound => ErrorCode::GameNotFound,
            EngineError::GameFull => ErrorCode::GameFull,
            EngineError::PlayerNotFound => ErrorCode::PlayerNotFound,
            EngineError::PlayerAlreadyExists => ErrorCode::PlayerAlreadyExists,
            EngineError::InvalidState => ErrorCode::InvalidState,
            EngineError::ServiceUnavailable => ErrorCode::ServiceUnavailable,
            EngineError::Queued => ErrorCode::Queued,
        };
        Self {
            message: err.to_string(),
            code,
        }
    }

    /// Build an arbitrary error payload.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }
}

// =============================================================================
// DELIVERY PRIORITY
// =============================================================================

/// Priority levels for outbound events, used by the per-connection
/// backpressure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Can be dropped when a peer's queue is full.
    Droppable = 0,
    /// Must be delivered; a peer that cannot take it is disconnected.
    Critical = 1,
}

impl ServerEvent {
    /// Delivery priority of this event.
    pub fn priority(&self) -> Priority {
        match self {
            // Race transitions and replies a client must not miss.
            ServerEvent::GameCountdown(_) => Priority::Critical,
            ServerEvent::GameStarted(_) => Priority::Critical,
            ServerEvent::GameFinished(_) => Priority::Critical,
            ServerEvent::GameTerminated(_) => Priority::Critical,
            ServerEvent::ReplayData(_) => Priority::Critical,
            ServerEvent::Error(_) => Priority::Critical,

            // High-volume or recoverable traffic.
            ServerEvent::GameStateUpdate(_) => Priority::Droppable,
            ServerEvent::PlayerJoined(_) => Priority::Droppable,
            ServerEvent::PlayerLeft(_) => Priority::Droppable,
            ServerEvent::AllGames(_) => Priority::Droppable,
            ServerEvent::Pong { .. } => Priority::Droppable,
        }
    }

    /// Whether this is a progress-update broadcast, the only event kind
    /// eligible for adaptive throttling.
    pub fn is_progress_update(&self) -> bool {
        matches!(
            self,
            ServerEvent::GameStateUpdate(u) if u.update == UpdateKind::ProgressUpdate
        )
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientEvent {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerEvent {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

//! Race Logic Module
//!
//! All session, player, ranking, and replay state. The engine here is
//! the single authoritative mutator; the network layer only routes.
//!
//! ## Module Structure
//!
//! - `player`: Player model, name sanitization, color palette
//! - `race`: Per-session state machine and serializable views
//! - `ranking`: Pure ranking function and post-race summary
//! - `replay`: Snapshot capture, compaction, and retention
//! - `engine`: Session registry, operations, and timers

pub mod engine;
pub mod player;
pub mod race;
pub mod ranking;
pub mod replay;

// Re-export key types
pub use engine::{EngineConfig, EngineError, EngineEvent, EngineStats, RaceEngine};
pub use player::Player;
pub use race::{GameState, GameSummary, RaceSession, RaceState};
pub use ranking::{RaceSummary, RankingEntry, SummaryStats};
pub use replay::{PlayerReplay, ProgressSnapshot, Replay, ReplayStore};

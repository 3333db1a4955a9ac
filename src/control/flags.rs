//! Mitigation Flags
//!
//! The tunables the self-healing controller flips, packed into one
//! struct of atomics so hot paths (progress fan-out, game creation)
//! read them without locking. Every write bumps a version counter so
//! observers can detect transitions.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Default interval between admitted replay snapshots.
pub const DEFAULT_SNAPSHOT_INTERVAL_MS: u64 = 100;

/// Snapshot interval under CPU pressure.
pub const REDUCED_SNAPSHOT_INTERVAL_MS: u64 = 500;

/// Default replay retention after session destruction (1 hour).
pub const DEFAULT_RETENTION_MS: u64 = 3_600_000;

/// Replay retention under session-count pressure (15 minutes).
pub const REDUCED_RETENTION_MS: u64 = 900_000;

/// Outbound progress-update cadence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateFrequency {
    /// Every progress update is broadcast.
    Normal,
    /// Most progress updates are dropped before fan-out.
    Low,
}

/// Lock-free mitigation state. Readers use the getters; all writes go
/// through the setters, which bump [`ControlFlags::version`].
pub struct ControlFlags {
    accepting_new_players: AtomicBool,
    throttling_enabled: AtomicBool,
    low_frequency: AtomicBool,
    replay_snapshot_interval_ms: AtomicU64,
    replay_retention_ms: AtomicU64,
    game_creation_queue_enabled: AtomicBool,
    creation_backoff_enabled: AtomicBool,
    defer_resource_intensive_ops: AtomicBool,
    max_players_reduction: AtomicUsize,
    version: AtomicU64,
}

impl ControlFlags {
    /// All defaults: accepting players, no throttling, normal cadence.
    pub fn new() -> Self {
        Self {
            accepting_new_players: AtomicBool::new(true),
            throttling_enabled: AtomicBool::new(false),
            low_frequency: AtomicBool::new(false),
            replay_snapshot_interval_ms: AtomicU64::new(DEFAULT_SNAPSHOT_INTERVAL_MS),
            replay_retention_ms: AtomicU64::new(DEFAULT_RETENTION_MS),
            game_creation_queue_enabled: AtomicBool::new(false),
            creation_backoff_enabled: AtomicBool::new(false),
            defer_resource_intensive_ops: AtomicBool::new(false),
            max_players_reduction: AtomicUsize::new(0),
            version: AtomicU64::new(0),
        }
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether new players and games are being accepted.
    pub fn accepting_new_players(&self) -> bool {
        self.accepting_new_players.load(Ordering::Relaxed)
    }

    /// Toggle acceptance of new players.
    pub fn set_accepting_new_players(&self, value: bool) {
        self.accepting_new_players.store(value, Ordering::Relaxed);
        self.bump();
    }

    /// Whether broadcast throttling is enabled.
    pub fn throttling_enabled(&self) -> bool {
        self.throttling_enabled.load(Ordering::Relaxed)
    }

    /// Toggle broadcast throttling.
    pub fn set_throttling_enabled(&self, value: bool) {
        self.throttling_enabled.store(value, Ordering::Relaxed);
        self.bump();
    }

    /// Current outbound update cadence.
    pub fn update_frequency(&self) -> UpdateFrequency {
        if self.low_frequency.load(Ordering::Relaxed) {
            UpdateFrequency::Low
        } else {
            UpdateFrequency::Normal
        }
    }

    /// Set the outbound update cadence.
    pub fn set_update_frequency(&self, freq: UpdateFrequency) {
        self.low_frequency
            .store(freq == UpdateFrequency::Low, Ordering::Relaxed);
        self.bump();
    }

    /// True when progress broadcasts should be rate-limited: both the
    /// throttle switch and the low-frequency cadence are on.
    pub fn throttle_progress(&self) -> bool {
        self.throttling_enabled() && self.update_frequency() == UpdateFrequency::Low
    }

    /// Minimum interval between admitted replay snapshots.
    pub fn replay_snapshot_interval_ms(&self) -> u64 {
        self.replay_snapshot_interval_ms.load(Ordering::Relaxed)
    }

    /// Set the replay snapshot interval.
    pub fn set_replay_snapshot_interval_ms(&self, value: u64) {
        self.replay_snapshot_interval_ms
            .store(value, Ordering::Relaxed);
        self.bump();
    }

    /// Replay retention after session destruction.
    pub fn replay_retention_ms(&self) -> u64 {
        self.replay_retention_ms.load(Ordering::Relaxed)
    }

    /// Set the replay retention.
    pub fn set_replay_retention_ms(&self, value: u64) {
        self.replay_retention_ms.store(value, Ordering::Relaxed);
        self.bump();
    }

    /// Whether game creation goes through the pending queue.
    pub fn game_creation_queue_enabled(&self) -> bool {
        self.game_creation_queue_enabled.load(Ordering::Relaxed)
    }

    /// Toggle the game-creation queue.
    pub fn set_game_creation_queue_enabled(&self, value: bool) {
        self.game_creation_queue_enabled
            .store(value, Ordering::Relaxed);
        self.bump();
    }

    /// Whether the creation queue drains at the slower cadence.
    pub fn creation_backoff_enabled(&self) -> bool {
        self.creation_backoff_enabled.load(Ordering::Relaxed)
    }

    /// Toggle creation backoff.
    pub fn set_creation_backoff_enabled(&self, value: bool) {
        self.creation_backoff_enabled.store(value, Ordering::Relaxed);
        self.bump();
    }

    /// Whether resource-intensive operations are deferred.
    pub fn defer_resource_intensive_ops(&self) -> bool {
        self.defer_resource_intensive_ops.load(Ordering::Relaxed)
    }

    /// Toggle deferral of resource-intensive operations.
    pub fn set_defer_resource_intensive_ops(&self, value: bool) {
        self.defer_resource_intensive_ops
            .store(value, Ordering::Relaxed);
        self.bump();
    }

    /// Capacity reduction applied to newly created sessions.
    pub fn max_players_reduction(&self) -> usize {
        self.max_players_reduction.load(Ordering::Relaxed)
    }

    /// Set the capacity reduction for new sessions.
    pub fn set_max_players_reduction(&self, value: usize) {
        self.max_players_reduction.store(value, Ordering::Relaxed);
        self.bump();
    }

    /// Effective capacity for a new session: the requested capacity
    /// minus the current reduction, floored at 2.
    pub fn effective_max_players(&self, requested: usize) -> usize {
        requested.saturating_sub(self.max_players_reduction()).max(2)
    }

    /// Version counter; incremented on every write.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    /// Restore every tunable to its default.
    pub fn restore_defaults(&self) {
        self.accepting_new_players.store(true, Ordering::Relaxed);
        self.throttling_enabled.store(false, Ordering::Relaxed);
        self.low_frequency.store(false, Ordering::Relaxed);
        self.replay_snapshot_interval_ms
            .store(DEFAULT_SNAPSHOT_INTERVAL_MS, Ordering::Relaxed);
        self.replay_retention_ms
            .store(DEFAULT_RETENTION_MS, Ordering::Relaxed);
        self.game_creation_queue_enabled
            .store(false, Ordering::Relaxed);
        self.creation_backoff_enabled.store(false, Ordering::Relaxed);
        self.defer_resource_intensive_ops
            .store(false, Ordering::Relaxed);
        self.max_players_reduction.store(0, Ordering::Relaxed);
        self.bump();
    }

    /// Read a consistent-enough snapshot for status reporting.
    pub fn snapshot(&self) -> FlagsSnapshot {
        FlagsSnapshot {
            accepting_new_players: self.accepting_new_players(),
            throttling_enabled: self.throttling_enabled(),
            update_frequency: self.update_frequency(),
            replay_snapshot_interval_ms: self.replay_snapshot_interval_ms(),
            replay_retention_ms: self.replay_retention_ms(),
            game_creation_queue_enabled: self.game_creation_queue_enabled(),
            creation_backoff_enabled: self.creation_backoff_enabled(),
            defer_resource_intensive_ops: self.defer_resource_intensive_ops(),
            max_players_reduction: self.max_players_reduction(),
            version: self.version(),
        }
    }

    /// Apply a partial update from `set_system_config` or the admin API.
    pub fn apply_patch(&self, patch: &FlagsPatch) {
        if let Some(v) = patch.accepting_new_players {
            self.set_accepting_new_players(v);
        }
        if let Some(v) = patch.throttling_enabled {
            self.set_throttling_enabled(v);
        }
        if let Some(v) = patch.update_frequency {
            self.set_update_frequency(v);
        }
        if let Some(v) = patch.replay_snapshot_interval_ms {
            self.set_replay_snapshot_interval_ms(v);
        }
        if let Some(v) = patch.replay_retention_ms {
            self.set_replay_retention_ms(v);
        }
        if let Some(v) = patch.game_creation_queue_enabled {
            self.set_game_creation_queue_enabled(v);
        }
        if let Some(v) = patch.creation_backoff_enabled {
            self.set_creation_backoff_enabled(v);
        }
        if let Some(v) = patch.defer_resource_intensive_ops {
            self.set_defer_resource_intensive_ops(v);
        }
    }
}

impl Default for ControlFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the mitigation state.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagsSnapshot {
    /// Accepting new players and games.
    pub accepting_new_players: bool,
    /// Broadcast throttling enabled.
    pub throttling_enabled: bool,
    /// Outbound update cadence.
    pub update_frequency: UpdateFrequency,
    /// Replay snapshot interval.
    pub replay_snapshot_interval_ms: u64,
    /// Replay retention.
    pub replay_retention_ms: u64,
    /// Creation queue enabled.
    pub game_creation_queue_enabled: bool,
    /// Creation backoff enabled.
    pub creation_backoff_enabled: bool,
    /// Deferring resource-intensive work.
    pub defer_resource_intensive_ops: bool,
    /// Capacity reduction for new sessions.
    pub max_players_reduction: usize,
    /// Write-version at snapshot time.
    pub version: u64,
}

/// Partial mitigation update; unset fields are left alone.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagsPatch {
    /// Accepting new players.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepting_new_players: Option<bool>,
    /// Broadcast throttling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttling_enabled: Option<bool>,
    /// Update cadence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_frequency: Option<UpdateFrequency>,
    /// Snapshot interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_snapshot_interval_ms: Option<u64>,
    /// Replay retention.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_retention_ms: Option<u64>,
    /// Creation queue toggle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_creation_queue_enabled: Option<bool>,
    /// Creation backoff toggle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_backoff_enabled: Option<bool>,
    /// Deferral toggle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defer_resource_intensive_ops: Option<bool>,
}

//! Replay Store
//!
//! Per-session append-only buffers of progress snapshots plus finalized
//! per-player stats. Snapshot admission is rate-limited; the controller
//! can compact buffers under memory pressure and shorten retention under
//! session-count pressure. Spectators are never recorded.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::core::clock::TimestampMs;
use crate::core::id::{PlayerId, SessionId};
use crate::game::player::Player;

/// Snapshot buffers longer than this are eligible for compaction.
pub const COMPACTION_MIN_SNAPSHOTS: usize = 20;

/// Compaction keeps every n-th snapshot.
pub const COMPACTION_STRIDE: usize = 5;

/// Admit a snapshot early when position moved at least this much.
pub const SNAPSHOT_POSITION_DELTA: f64 = 5.0;

/// One point of a player's progress curve.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    /// When the snapshot was taken.
    pub timestamp: TimestampMs,
    /// Progress percent 0-100.
    pub position: f64,
    /// Character offset into the passage.
    pub current_index: usize,
    /// Reported words per minute.
    pub wpm: f64,
    /// Reported accuracy percentage.
    pub accuracy: f64,
}

/// Final per-player stats, written exactly once.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalStats {
    /// Final words per minute.
    pub wpm: f64,
    /// Final accuracy percentage.
    pub accuracy: f64,
    /// Finish timestamp, absent when the race ended first.
    pub finish_time: Option<TimestampMs>,
    /// Final rank, backfilled when the race ends.
    pub rank: Option<usize>,
}

/// A single player's replay track.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerReplay {
    /// Display name at race time.
    pub name: String,
    /// Progress curve, non-decreasing in timestamp.
    pub snapshots: Vec<ProgressSnapshot>,
    /// Set exactly once; later writes are ignored.
    pub final_stats: Option<FinalStats>,
}

/// Captured replay of one race.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Replay {
    /// Session the replay belongs to.
    pub game_id: SessionId,
    /// The race passage.
    pub text: String,
    /// Race start, stamped on entry to Racing.
    pub start_time: Option<TimestampMs>,
    /// Race end, stamped on entry to Finished.
    pub end_time: Option<TimestampMs>,
    /// Per-racer tracks.
    pub players: BTreeMap<PlayerId, PlayerReplay>,
}

/// In-memory replay storage shared between the engine, the controller,
/// and the admin surface.
pub struct ReplayStore {
    replays: RwLock<BTreeMap<SessionId, Replay>>,
}

impl ReplayStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            replays: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create the replay for a session entering Countdown. Only racers
    /// get tracks; spectators are skipped.
    pub async fn init_session(&self, id: SessionId, text: &str, players: &[Player]) {
        let mut replays = self.replays.write().await;
        let tracks = players
            .iter()
            .filter(|p| !p.is_spectator)
            .map(|p| {
                (
                    p.id,
                    PlayerReplay {
                        name: p.name.clone(),
                        snapshots: Vec::new(),
                        final_stats: None,
                    },
                )
            })
            .collect();
        replays.insert(
            id,
            Replay {
                game_id: id,
                text: text.to_string(),
                start_time: None,
                end_time: None,
                players: tracks,
            },
        );
    }

    /// Stamp the race start.
    pub async fn set_start(&self, id: SessionId, at: TimestampMs) {
        if let Some(replay) = self.replays.write().await.get_mut(&id) {
            replay.start_time = Some(at);
        }
    }

    /// Stamp the race end.
    pub async fn set_end(&self, id: SessionId, at: TimestampMs) {
        if let Some(replay) = self.replays.write().await.get_mut(&id) {
            replay.end_time = Some(at);
        }
    }

    /// Record a progress snapshot, subject to admission. Returns whether
    /// the snapshot was admitted. Unknown players (spectators, stale
    /// sessions) and finalized players are ignored.
    pub async fn record_progress(
        &self,
        id: SessionId,
        player: PlayerId,
        snapshot: ProgressSnapshot,
        interval_ms: u64,
    ) -> bool {
        let mut replays = self.replays.write().await;
        let Some(track) = replays.get_mut(&id).and_then(|r| r.players.get_mut(&player)) else {
            return false;
        };
        if track.final_stats.is_some() {
            return false;
        }
        if let Some(prev) = track.snapshots.last() {
            if snapshot.timestamp < prev.timestamp {
                return false;
            }
            let elapsed = snapshot.timestamp - prev.timestamp;
            let moved = (snapshot.position - prev.position).abs() >= SNAPSHOT_POSITION_DELTA;
            let finishing = snapshot.position >= 100.0 && prev.position < 100.0;
            if elapsed < interval_ms && !moved && !finishing {
                return false;
            }
        }
        track.snapshots.push(snapshot);
        true
    }

    /// Set a player's final stats. A second call is a no-op.
    pub async fn finalize_player(&self, id: SessionId, player: PlayerId, stats: FinalStats) {
        let mut replays = self.replays.write().await;
        if let Some(track) = replays.get_mut(&id).and_then(|r| r.players.get_mut(&player)) {
            if track.final_stats.is_none() {
                track.final_stats = Some(stats);
            }
        }
    }

    /// Backfill final ranks once the race is ranked.
    pub async fn set_ranks(&self, id: SessionId, ranks: &[(PlayerId, usize)]) {
        let mut replays = self.replays.write().await;
        if let Some(replay) = replays.get_mut(&id) {
            for (player, rank) in ranks {
                if let Some(stats) = replay
                    .players
                    .get_mut(player)
                    .and_then(|t| t.final_stats.as_mut())
                {
                    stats.rank = Some(*rank);
                }
            }
        }
    }

    /// Fetch a replay by session id.
    pub async fn get(&self, id: SessionId) -> Option<Replay> {
        self.replays.read().await.get(&id).cloned()
    }

    /// Delete a replay. Returns whether it existed.
    pub async fn remove(&self, id: SessionId) -> bool {
        self.replays.write().await.remove(&id).is_some()
    }

    /// Ids of all stored replays.
    pub async fn list_ids(&self) -> Vec<SessionId> {
        self.replays.read().await.keys().copied().collect()
    }

    /// Number of stored replays.
    pub async fn len(&self) -> usize {
        self.replays.read().await.len()
    }

    /// True when no replays are stored.
    pub async fn is_empty(&self) -> bool {
        self.replays.read().await.is_empty()
    }

    /// Compact oversized snapshot buffers: tracks with more than
    /// [`COMPACTION_MIN_SNAPSHOTS`] snapshots keep every
    /// [`COMPACTION_STRIDE`]-th one, in order. Returns the number of
    /// snapshots discarded.
    pub async fn compact(&self) -> usize {
        let mut replays = self.replays.write().await;
        let mut discarded = 0;
        for replay in replays.values_mut() {
            for track in replay.players.values_mut() {
                if track.snapshots.len() > COMPACTION_MIN_SNAPSHOTS {
                    let before = track.snapshots.len();
                    let kept: Vec<ProgressSnapshot> = track
                        .snapshots
                        .iter()
                        .step_by(COMPACTION_STRIDE)
                        .cloned()
                        .collect();
                    discarded += before - kept.len();
                    track.snapshots = kept;
                }
            }
        }
        discarded
    }
}

impl Default for ReplayStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::player::palette_color;

    fn snapshot(timestamp: TimestampMs, position: f64) -> ProgressSnapshot {
        ProgressSnapshot {
            timestamp,
            position,
            current_index: (position as usize) * 2,
            wpm: 60.0,
            accuracy: 95.0,
        }
    }

    async fn store_with_one_racer() -> (ReplayStore, SessionId, PlayerId) {
        let store = ReplayStore::new();
        let session = SessionId::generate();
        let player_id = PlayerId::generate();
        let player = Player::racer(player_id, "Ada".to_string(), palette_color(0));
        store.init_session(session, "some text", &[player]).await;
        (store, session, player_id)
    }

    #[tokio::test]
    async fn test_first_snapshot_always_admitted() {
        let (store, session, player) = store_with_one_racer().await;
        assert!(store.record_progress(session, player, snapshot(0, 1.0), 100).await);
    }

    #[tokio::test]
    async fn test_interval_gates_admission() {
        let (store, session, player) = store_with_one_racer().await;
        assert!(store.record_progress(session, player, snapshot(0, 1.0), 100).await);
        // Too soon, barely moved.
        assert!(!store.record_progress(session, player, snapshot(50, 2.0), 100).await);
        // Interval elapsed.
        assert!(store.record_progress(session, player, snapshot(100, 3.0), 100).await);
    }

    #[tokio::test]
    async fn test_position_jump_bypasses_interval() {
        let (store, session, player) = store_with_one_racer().await;
        assert!(store.record_progress(session, player, snapshot(0, 1.0), 100).await);
        assert!(store.record_progress(session, player, snapshot(10, 7.0), 100).await);
    }

    #[tokio::test]
    async fn test_finish_snapshot_always_admitted() {
        let (store, session, player) = store_with_one_racer().await;
        assert!(store.record_progress(session, player, snapshot(0, 97.0), 100).await);
        // Within the interval and under the delta, but it crosses 100.
        assert!(store.record_progress(session, player, snapshot(10, 100.0), 100).await);
    }

    #[tokio::test]
    async fn test_larger_interval_fewer_snapshots() {
        let (store_a, session_a, player_a) = store_with_one_racer().await;
        let (store_b, session_b, player_b) = store_with_one_racer().await;
        let mut admitted_fast = 0;
        let mut admitted_slow = 0;
        for i in 0..20u64 {
            let snap = snapshot(i * 100, (i as f64) * 0.5);
            if store_a.record_progress(session_a, player_a, snap.clone(), 100).await {
                admitted_fast += 1;
            }
            if store_b.record_progress(session_b, player_b, snap, 500).await {
                admitted_slow += 1;
            }
        }
        assert!(admitted_slow < admitted_fast);
    }

    #[tokio::test]
    async fn test_unknown_player_ignored() {
        let (store, session, _) = store_with_one_racer().await;
        let stranger = PlayerId::generate();
        assert!(!store.record_progress(session, stranger, snapshot(0, 1.0), 100).await);
    }

    #[tokio::test]
    async fn test_spectators_have_no_track() {
        let store = ReplayStore::new();
        let session = SessionId::generate();
        let spectator = Player::spectator(PlayerId::generate(), "Eve".to_string());
        store.init_session(session, "text", &[spectator.clone()]).await;
        let replay = store.get(session).await.unwrap();
        assert!(replay.players.is_empty());
        assert!(!store.record_progress(session, spectator.id, snapshot(0, 1.0), 100).await);
    }

    #[tokio::test]
    async fn test_finalize_only_once() {
        let (store, session, player) = store_with_one_racer().await;
        store
            .finalize_player(
                session,
                player,
                FinalStats { wpm: 80.0, accuracy: 99.0, finish_time: Some(500), rank: None },
            )
            .await;
        store
            .finalize_player(
                session,
                player,
                FinalStats { wpm: 10.0, accuracy: 10.0, finish_time: Some(900), rank: None },
            )
            .await;
        let replay = store.get(session).await.unwrap();
        let stats = replay.players[&player].final_stats.as_ref().unwrap();
        assert_eq!(stats.wpm, 80.0);
        assert_eq!(stats.finish_time, Some(500));
    }

    #[tokio::test]
    async fn test_no_snapshots_after_finalize() {
        let (store, session, player) = store_with_one_racer().await;
        store
            .finalize_player(
                session,
                player,
                FinalStats { wpm: 80.0, accuracy: 99.0, finish_time: Some(500), rank: None },
            )
            .await;
        assert!(!store.record_progress(session, player, snapshot(1_000, 50.0), 100).await);
    }

    #[tokio::test]
    async fn test_set_ranks_backfills() {
        let (store, session, player) = store_with_one_racer().await;
        store
            .finalize_player(
                session,
                player,
                FinalStats { wpm: 80.0, accuracy: 99.0, finish_time: Some(500), rank: None },
            )
            .await;
        store.set_ranks(session, &[(player, 1)]).await;
        let replay = store.get(session).await.unwrap();
        assert_eq!(replay.players[&player].final_stats.as_ref().unwrap().rank, Some(1));
    }

    #[tokio::test]
    async fn test_compaction_keeps_every_fifth() {
        let (store, session, player) = store_with_one_racer().await;
        for i in 0..23u64 {
            assert!(store.record_progress(session, player, snapshot(i * 200, i as f64), 100).await);
        }
        let discarded = store.compact().await;
        let replay = store.get(session).await.unwrap();
        let kept = &replay.players[&player].snapshots;
        // ceil(23 / 5) = 5 snapshots survive, in original order.
        assert_eq!(kept.len(), 5);
        assert_eq!(discarded, 18);
        let times: Vec<_> = kept.iter().map(|s| s.timestamp).collect();
        assert_eq!(times, vec![0, 1_000, 2_000, 3_000, 4_000]);
    }

    #[tokio::test]
    async fn test_compaction_skips_small_buffers() {
        let (store, session, player) = store_with_one_racer().await;
        for i in 0..10u64 {
            store.record_progress(session, player, snapshot(i * 200, i as f64), 100).await;
        }
        assert_eq!(store.compact().await, 0);
        let replay = store.get(session).await.unwrap();
        assert_eq!(replay.players[&player].snapshots.len(), 10);
    }

    #[tokio::test]
    async fn test_snapshots_monotonic_in_timestamp() {
        let (store, session, player) = store_with_one_racer().await;
        store.record_progress(session, player, snapshot(1_000, 10.0), 100).await;
        // A snapshot from the past is refused.
        assert!(!store.record_progress(session, player, snapshot(500, 50.0), 100).await);
        let replay = store.get(session).await.unwrap();
        let track = &replay.players[&player].snapshots;
        assert!(track.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_remove_then_get_is_not_found() {
        let (store, session, _) = store_with_one_racer().await;
        assert!(store.remove(session).await);
        assert!(store.get(session).await.is_none());
        assert!(!store.remove(session).await);
    }
}

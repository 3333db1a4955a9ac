//! Race Engine
//!
//! Owns all session and player state; the single authoritative mutator.
//! Sessions live behind per-session locks inside a registry, so each
//! session's mutations are serialized while independent sessions run
//! concurrently. Every client-visible emission flows through one event
//! channel the fan-out layer drains, which is what gives per-connection
//! delivery order equal to engine emission order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::control::flags::ControlFlags;
use crate::core::clock::{epoch_ms, TimestampMs};
use crate::core::id::{PlayerId, SessionId};
use crate::core::text::TextProvider;
use crate::game::player::{position_of, sanitize_name, Player};
use crate::game::race::{GameState, GameSummary, RaceSession, RaceState};
use crate::game::ranking::{self, RaceSummary};
use crate::game::replay::{FinalStats, ProgressSnapshot, ReplayStore};

/// Creation-queue drain cadence.
const CREATION_QUEUE_DRAIN_SECS: u64 = 2;

/// Creation-queue drain cadence under backoff.
const CREATION_QUEUE_BACKOFF_SECS: u64 = 5;

/// Queued creation requests older than this are discarded.
const CREATION_QUEUE_MAX_AGE: Duration = Duration::from_secs(30);

/// Waiting sessions at least this old with at most one connected
/// player are fair game for idle termination.
const IDLE_WAITING_AGE_MS: TimestampMs = 5 * 60 * 1000;

/// Engine configuration, derived from the environment at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default racer capacity for new sessions.
    pub max_players_per_game: usize,
    /// Connected racers required before a countdown can start.
    pub min_players_to_start: usize,
    /// Countdown length in seconds.
    pub countdown_seconds: u32,
    /// Maximum race duration before the race is force-ended.
    pub max_race_time: Duration,
    /// Delay between Finished and session destruction.
    pub cleanup_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_players_per_game: 4,
            min_players_to_start: 2,
            countdown_seconds: 3,
            max_race_time: Duration::from_secs(120),
            cleanup_delay: Duration::from_secs(180),
        }
    }
}

/// Engine operation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// No session with the given id.
    #[error("game not found")]
    GameNotFound,

    /// Session is at racer capacity.
    #[error("game is full")]
    GameFull,

    /// No such player in the session.
    #[error("player not found")]
    PlayerNotFound,

    /// The player id is already connected in the session.
    #[error("player already in game")]
    PlayerAlreadyExists,

    /// The session is not in the state the operation requires.
    #[error("operation not valid in current game state")]
    InvalidState,

    /// The server is not accepting new players.
    #[error("server is not accepting new players")]
    ServiceUnavailable,

    /// Creation accepted into the pending queue.
    #[error("game creation queued")]
    Queued,
}

/// Events the engine emits for the fan-out layer. One channel, one
/// consumer; emission order is delivery order.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A session was created by `creator`.
    SessionCreated {
        /// New session.
        session: SessionId,
        /// The creating player (already inside the session).
        creator: PlayerId,
        /// Snapshot after creation.
        state: GameState,
    },
    /// A player joined (or reconnected to) a session.
    PlayerJoined {
        /// Target session.
        session: SessionId,
        /// The joined player.
        player: Player,
        /// Snapshot after the join.
        state: GameState,
    },
    /// A player readied up.
    PlayerReady {
        /// Target session.
        session: SessionId,
        /// Who readied.
        player: PlayerId,
        /// Snapshot after the change.
        state: GameState,
    },
    /// One tick of the pre-race countdown.
    CountdownTick {
        /// Target session.
        session: SessionId,
        /// Seconds remaining.
        seconds: u32,
    },
    /// The race started.
    RaceStarted {
        /// Target session.
        session: SessionId,
        /// Racing entry timestamp.
        start_time: TimestampMs,
    },
    /// A racer's progress changed.
    ProgressUpdated {
        /// Target session.
        session: SessionId,
        /// The updated racer.
        player: Player,
    },
    /// A racer crossed the finish line.
    PlayerFinished {
        /// Target session.
        session: SessionId,
        /// The finished racer.
        player: Player,
    },
    /// The race ended.
    RaceFinished {
        /// Target session.
        session: SessionId,
        /// Snapshot at the finish.
        state: GameState,
        /// Ranked summary.
        summary: RaceSummary,
    },
    /// A player left or disconnected.
    PlayerLeft {
        /// Target session.
        session: SessionId,
        /// Who left.
        player: PlayerId,
        /// Snapshot after the change.
        state: GameState,
    },
    /// The session was terminated by the server.
    SessionTerminated {
        /// Target session.
        session: SessionId,
        /// Machine-readable reason.
        reason: String,
    },
    /// The session was destroyed after normal cleanup.
    SessionClosed {
        /// Target session.
        session: SessionId,
    },
}

/// A queued game-creation request.
#[derive(Debug, Clone)]
struct PendingCreate {
    player: PlayerId,
    name: String,
    max_players: Option<usize>,
    submitted_at: tokio::time::Instant,
}

/// Counters for monitoring.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    /// Sessions in the registry.
    pub active_games: usize,
    /// Sessions in Waiting.
    pub waiting_games: usize,
    /// Sessions in Racing.
    pub racing_games: usize,
    /// Sessions in Finished, not yet destroyed.
    pub finished_games: usize,
    /// Participants across all sessions.
    pub total_players: usize,
    /// Connected participants across all sessions.
    pub connected_players: usize,
}

struct EngineInner {
    cfg: EngineConfig,
    texts: TextProvider,
    flags: Arc<ControlFlags>,
    replays: Arc<ReplayStore>,
    sessions: RwLock<BTreeMap<SessionId, Arc<RwLock<RaceSession>>>>,
    player_sessions: RwLock<BTreeMap<PlayerId, Vec<SessionId>>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    creation_queue: Mutex<VecDeque<PendingCreate>>,
}

/// Cheaply cloneable handle to the engine; all shared state lives
/// behind one inner `Arc` so timer tasks can capture their own handle.
#[derive(Clone)]
pub struct RaceEngine {
    inner: Arc<EngineInner>,
}

impl RaceEngine {
    /// Build an engine and the event stream the fan-out layer drains.
    pub fn new(
        cfg: EngineConfig,
        texts: TextProvider,
        flags: Arc<ControlFlags>,
        replays: Arc<ReplayStore>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let engine = Self {
            inner: Arc::new(EngineInner {
                cfg,
                texts,
                flags,
                replays,
                sessions: RwLock::new(BTreeMap::new()),
                player_sessions: RwLock::new(BTreeMap::new()),
                events,
                creation_queue: Mutex::new(VecDeque::new()),
            }),
        };
        (engine, events_rx)
    }

    fn emit(&self, event: EngineEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("Engine event receiver dropped; emission discarded");
        }
    }

    async fn session_arc(&self, id: SessionId) -> Option<Arc<RwLock<RaceSession>>> {
        self.inner.sessions.read().await.get(&id).cloned()
    }

    async fn register_player(&self, player: PlayerId, session: SessionId) {
        let mut map = self.inner.player_sessions.write().await;
        let entry = map.entry(player).or_default();
        if !entry.contains(&session) {
            entry.push(session);
        }
    }

    async fn unregister_player(&self, player: PlayerId, session: SessionId) {
        let mut map = self.inner.player_sessions.write().await;
        if let Some(entry) = map.get_mut(&player) {
            entry.retain(|s| *s != session);
            if entry.is_empty() {
                map.remove(&player);
            }
        }
    }

    /// Sessions a player currently belongs to.
    pub async fn sessions_of(&self, player: PlayerId) -> Vec<SessionId> {
        self.inner
            .player_sessions
            .read()
            .await
            .get(&player)
            .cloned()
            .unwrap_or_default()
    }

    // =========================================================================
    // CREATE / JOIN
    // =========================================================================

    /// Create a game with the caller as its first racer.
    ///
    /// Fails with [`EngineError::ServiceUnavailable`] when a memory trip
    /// stopped intake, and with [`EngineError::Queued`] when creation is
    /// queued; queued requests are served by the queue worker.
    pub async fn create_game(
        &self,
        player: PlayerId,
        name: &str,
        max_players: Option<usize>,
    ) -> Result<(SessionId, Player), EngineError> {
        if !self.inner.flags.accepting_new_players() {
            return Err(EngineError::ServiceUnavailable);
        }
        if self.inner.flags.game_creation_queue_enabled() {
            let mut queue = self.inner.creation_queue.lock().await;
            queue.push_back(PendingCreate {
                player,
                name: name.to_string(),
                max_players,
                submitted_at: tokio::time::Instant::now(),
            });
            debug!("Queued game creation for {} ({} pending)", player, queue.len());
            return Err(EngineError::Queued);
        }
        self.create_now(player, name, max_players).await
    }

    async fn create_now(
        &self,
        player: PlayerId,
        name: &str,
        max_players: Option<usize>,
    ) -> Result<(SessionId, Player), EngineError> {
        let id = SessionId::generate();
        let text = self.inner.texts.random_passage().to_string();
        let requested = max_players.unwrap_or(self.inner.cfg.max_players_per_game);
        let capacity = self.inner.flags.effective_max_players(requested);

        let mut session = RaceSession::new(
            id,
            text,
            capacity,
            self.inner.cfg.min_players_to_start,
            epoch_ms(),
        );
        let joined = session.add_racer(player, sanitize_name(name))?;
        let state = session.view();

        // Emit before the session is discoverable so no later event for
        // this session can be ordered ahead of its creation.
        self.emit(EngineEvent::SessionCreated {
            session: id,
            creator: player,
            state,
        });
        self.inner
            .sessions
            .write()
            .await
            .insert(id, Arc::new(RwLock::new(session)));
        self.register_player(player, id).await;

        info!("Created game {} (capacity {}) for {}", id, capacity, player);
        Ok((id, joined))
    }

    /// Join a game, or any open game when `session_id` is omitted. Falls
    /// back to creating a game when nothing is joinable. Returns the
    /// session, the player, and whether they joined as spectator.
    pub async fn join_game(
        &self,
        player: PlayerId,
        name: &str,
        session_id: Option<SessionId>,
        as_spectator: bool,
    ) -> Result<(SessionId, Player, bool), EngineError> {
        let target = match session_id {
            Some(id) => id,
            None => match self.find_open_session().await {
                Some(id) => id,
                None => {
                    let (id, joined) = self.create_game(player, name, None).await?;
                    return Ok((id, joined, false));
                }
            },
        };

        let arc = self
            .session_arc(target)
            .await
            .ok_or(EngineError::GameNotFound)?;

        let joined: Player;
        let spectator: bool;
        {
            let mut s = arc.write().await;
            if let Some(existing) = s.player_mut(player) {
                if existing.is_connected {
                    return Err(EngineError::PlayerAlreadyExists);
                }
                existing.is_connected = true;
                joined = existing.clone();
                spectator = joined.is_spectator;
                debug!("Player {} reconnected to {}", player, target);
            } else if as_spectator || s.state != RaceState::Waiting {
                joined = s.add_spectator(player, sanitize_name(name))?;
                spectator = true;
            } else {
                joined = s.add_racer(player, sanitize_name(name))?;
                spectator = false;
            }
            let state = s.view();
            self.emit(EngineEvent::PlayerJoined {
                session: target,
                player: joined.clone(),
                state,
            });
        }
        self.register_player(player, target).await;
        Ok((target, joined, spectator))
    }

    async fn find_open_session(&self) -> Option<SessionId> {
        let entries: Vec<(SessionId, Arc<RwLock<RaceSession>>)> = {
            let sessions = self.inner.sessions.read().await;
            sessions.iter().map(|(id, s)| (*id, s.clone())).collect()
        };
        for (id, arc) in entries {
            let s = arc.read().await;
            if s.state == RaceState::Waiting && s.racer_count() < s.max_players {
                return Some(id);
            }
        }
        None
    }

    // =========================================================================
    // READY / COUNTDOWN / START
    // =========================================================================

    /// Mark a player ready. Idempotent. Starts the countdown once every
    /// connected racer is ready and the minimum headcount is met.
    pub async fn player_ready(
        &self,
        session_id: SessionId,
        player: PlayerId,
    ) -> Result<(), EngineError> {
        let arc = self
            .session_arc(session_id)
            .await
            .ok_or(EngineError::GameNotFound)?;

        let should_start;
        {
            let mut s = arc.write().await;
            let Some(p) = s.player_mut(player) else {
                return Err(EngineError::PlayerNotFound);
            };
            p.is_ready = true;
            let state = s.view();
            self.emit(EngineEvent::PlayerReady {
                session: session_id,
                player,
                state,
            });
            should_start = s.state == RaceState::Waiting && s.can_start();
        }
        if should_start {
            self.start_countdown(session_id).await;
        }
        Ok(())
    }

    /// Whether the session could start its countdown right now.
    pub async fn can_start_game(&self, session_id: SessionId) -> bool {
        match self.session_arc(session_id).await {
            Some(arc) => {
                let s = arc.read().await;
                s.state == RaceState::Waiting && s.can_start()
            }
            None => false,
        }
    }

    /// Transition Waiting -> Countdown, initialize the replay, and arm
    /// the 1 Hz ticker. No-op outside Waiting.
    pub async fn start_countdown(&self, session_id: SessionId) {
        let Some(arc) = self.session_arc(session_id).await else {
            return;
        };
        {
            let mut s = arc.write().await;
            if s.state != RaceState::Waiting {
                return;
            }
            s.state = RaceState::Countdown;
            s.countdown_remaining = self.inner.cfg.countdown_seconds;
            self.inner
                .replays
                .init_session(session_id, &s.text, &s.players)
                .await;
            info!("Game {} entering countdown", session_id);
        }

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            engine.countdown_loop(session_id).await;
        });
        arc.write().await.timers.countdown = Some(handle);
    }

    async fn countdown_loop(self, session_id: SessionId) {
        let mut ticker = interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let Some(arc) = self.session_arc(session_id).await else {
                return;
            };
            let start_now;
            {
                let mut s = arc.write().await;
                if s.state != RaceState::Countdown {
                    return;
                }
                if s.countdown_remaining == 0 {
                    start_now = true;
                } else {
                    self.emit(EngineEvent::CountdownTick {
                        session: session_id,
                        seconds: s.countdown_remaining,
                    });
                    s.countdown_remaining -= 1;
                    start_now = false;
                }
            }
            if start_now {
                self.start_race(session_id).await;
                return;
            }
        }
    }

    /// Transition Countdown -> Racing: stamp the start, reset progress,
    /// and arm the race deadline. No-op outside Countdown.
    pub async fn start_race(&self, session_id: SessionId) {
        let Some(arc) = self.session_arc(session_id).await else {
            return;
        };
        {
            let mut s = arc.write().await;
            if s.state != RaceState::Countdown {
                return;
            }
            s.state = RaceState::Racing;
            let now = epoch_ms();
            s.start_time = Some(now);
            for p in s.players.iter_mut().filter(|p| !p.is_spectator) {
                p.reset_progress();
            }
            // The ticker is the caller; detach instead of aborting it.
            s.timers.countdown.take();
            self.inner.replays.set_start(session_id, now).await;
            self.emit(EngineEvent::RaceStarted {
                session: session_id,
                start_time: now,
            });
            info!("Game {} racing", session_id);
        }

        let engine = self.clone();
        let max_race_time = self.inner.cfg.max_race_time;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(max_race_time).await;
            debug!("Race deadline reached for {}", session_id);
            engine.end_race(session_id).await;
        });
        arc.write().await.timers.deadline = Some(handle);
    }

    // =========================================================================
    // PROGRESS / FINISH
    // =========================================================================

    /// Ingest a progress report. Outside Racing the report is dropped
    /// with a warning (no error event, to avoid message storms);
    /// spectator reports are ignored silently.
    pub async fn update_progress(
        &self,
        session_id: SessionId,
        player: PlayerId,
        current_index: usize,
        wpm: f64,
        accuracy: f64,
    ) -> Result<(), EngineError> {
        let arc = self
            .session_arc(session_id)
            .await
            .ok_or(EngineError::GameNotFound)?;

        let mut s = arc.write().await;
        if s.state != RaceState::Racing {
            warn!(
                "Dropping progress for {} in game {} (state {:?})",
                player, session_id, s.state
            );
            return Ok(());
        }
        let text_len = s.text_len;
        let Some(p) = s.player_mut(player) else {
            return Err(EngineError::PlayerNotFound);
        };
        if p.is_spectator {
            return Ok(());
        }

        let now = epoch_ms();
        let wpm = if wpm.is_finite() { wpm.max(0.0) } else { 0.0 };
        let accuracy = if accuracy.is_finite() {
            accuracy.clamp(0.0, 100.0)
        } else {
            0.0
        };
        p.current_index = current_index.min(text_len);
        p.position = position_of(p.current_index, text_len);
        p.wpm = wpm;
        p.accuracy = accuracy;
        let finished_now = p.position >= 100.0 && p.finish_time.is_none();
        if finished_now {
            p.finish_time = Some(now);
        }
        let snapshot = ProgressSnapshot {
            timestamp: now,
            position: p.position,
            current_index: p.current_index,
            wpm,
            accuracy,
        };
        let updated = p.clone();

        let interval_ms = self.inner.flags.replay_snapshot_interval_ms();
        self.inner
            .replays
            .record_progress(session_id, player, snapshot, interval_ms)
            .await;
        if finished_now {
            self.inner
                .replays
                .finalize_player(
                    session_id,
                    player,
                    FinalStats {
                        wpm,
                        accuracy,
                        finish_time: Some(now),
                        rank: None,
                    },
                )
                .await;
        }
        self.emit(EngineEvent::ProgressUpdated {
            session: session_id,
            player: updated,
        });
        Ok(())
    }

    /// Authoritative finish. Returns `true` when every connected racer
    /// has now finished (in which case the race is ended too); a repeat
    /// call for an already-finished player changes nothing and returns
    /// `false`.
    pub async fn player_finished(
        &self,
        session_id: SessionId,
        player: PlayerId,
        wpm: f64,
        accuracy: f64,
        finish_time: TimestampMs,
    ) -> Result<bool, EngineError> {
        let arc = self
            .session_arc(session_id)
            .await
            .ok_or(EngineError::GameNotFound)?;

        let all_done;
        {
            let mut s = arc.write().await;
            if s.state != RaceState::Racing {
                // A repeat finish after the race closed is an idempotent no-op.
                let already = s.player(player).map(|p| p.has_finished()).unwrap_or(false);
                if s.state == RaceState::Finished && already {
                    return Ok(false);
                }
                return Err(EngineError::InvalidState);
            }
            let text_len = s.text_len;
            let Some(p) = s.player_mut(player) else {
                return Err(EngineError::PlayerNotFound);
            };
            if p.is_spectator || p.finish_time.is_some() {
                return Ok(false);
            }
            p.position = 100.0;
            p.current_index = text_len;
            p.wpm = wpm;
            p.accuracy = accuracy;
            p.finish_time = Some(finish_time);
            let finished = p.clone();

            self.inner
                .replays
                .finalize_player(
                    session_id,
                    player,
                    FinalStats {
                        wpm,
                        accuracy,
                        finish_time: Some(finish_time),
                        rank: None,
                    },
                )
                .await;
            self.emit(EngineEvent::PlayerFinished {
                session: session_id,
                player: finished,
            });
            all_done = s.all_connected_finished();
        }
        if all_done {
            self.end_race(session_id).await;
        }
        Ok(all_done)
    }

    /// Transition Racing -> Finished: stamp the end, finalize stragglers
    /// in the replay, emit the ranked summary, and arm cleanup. No-op
    /// outside Racing, so a late deadline fire is harmless.
    pub async fn end_race(&self, session_id: SessionId) {
        let Some(arc) = self.session_arc(session_id).await else {
            return;
        };
        let ended;
        {
            let mut s = arc.write().await;
            if s.state != RaceState::Racing {
                return;
            }
            s.state = RaceState::Finished;
            let now = epoch_ms();
            s.end_time = Some(now);
            // The deadline task may be the caller; detach, never abort.
            s.timers.deadline.take();

            let stragglers: Vec<(PlayerId, FinalStats)> = s
                .connected_racers()
                .filter(|p| !p.has_finished())
                .map(|p| {
                    (
                        p.id,
                        FinalStats {
                            wpm: p.wpm,
                            accuracy: p.accuracy,
                            finish_time: None,
                            rank: None,
                        },
                    )
                })
                .collect();
            for (pid, stats) in stragglers {
                self.inner.replays.finalize_player(session_id, pid, stats).await;
            }

            let summary = ranking::summarize(&s);
            let ranks: Vec<(PlayerId, usize)> = summary
                .rankings
                .iter()
                .map(|r| (r.id, r.rank))
                .collect();
            self.inner.replays.set_end(session_id, now).await;
            self.inner.replays.set_ranks(session_id, &ranks).await;

            self.emit(EngineEvent::RaceFinished {
                session: session_id,
                state: s.view(),
                summary,
            });
            info!("Game {} finished", session_id);
            ended = true;
        }
        if ended {
            self.arm_cleanup(&arc, session_id).await;
        }
    }

    async fn arm_cleanup(&self, arc: &Arc<RwLock<RaceSession>>, session_id: SessionId) {
        let engine = self.clone();
        let delay = self.inner.cfg.cleanup_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.destroy_session(session_id, None).await;
        });
        let mut s = arc.write().await;
        match s.timers.cleanup {
            Some(_) => handle.abort(),
            None => s.timers.cleanup = Some(handle),
        }
    }

    // =========================================================================
    // LEAVE / DESTROY
    // =========================================================================

    /// Handle a player leaving or disconnecting. While Waiting the
    /// player is removed (and an emptied session destroyed); later they
    /// are only marked disconnected so rankings keep them.
    pub async fn player_left(
        &self,
        session_id: SessionId,
        player: PlayerId,
    ) -> Result<(), EngineError> {
        let arc = self
            .session_arc(session_id)
            .await
            .ok_or(EngineError::GameNotFound)?;

        let mut destroy_now = false;
        let mut end_now = false;
        let mut schedule_cleanup = false;
        {
            let mut s = arc.write().await;
            let was_spectator = match s.player(player) {
                Some(p) => p.is_spectator,
                None => return Err(EngineError::PlayerNotFound),
            };

            if s.state == RaceState::Waiting {
                s.remove_player(player);
                if s.players.is_empty() {
                    destroy_now = true;
                }
            } else if let Some(p) = s.player_mut(player) {
                p.is_connected = false;
            }

            let state = s.view();
            self.emit(EngineEvent::PlayerLeft {
                session: session_id,
                player,
                state,
            });

            if !destroy_now && !was_spectator && s.connected_racers().count() == 0 {
                match s.state {
                    RaceState::Racing => end_now = true,
                    RaceState::Countdown => {
                        // Countdown with nobody left: cancel the ticker so
                        // the race never starts, then age the session out.
                        s.timers.abort_countdown();
                        schedule_cleanup = true;
                    }
                    RaceState::Waiting | RaceState::Finished => {}
                }
            }
        }
        self.unregister_player(player, session_id).await;

        if destroy_now {
            self.destroy_session(session_id, None).await;
        } else if end_now {
            self.end_race(session_id).await;
        } else if schedule_cleanup {
            self.arm_cleanup(&arc, session_id).await;
        }
        Ok(())
    }

    /// Route a connection drop to `player_left` for every session the
    /// player is part of.
    pub async fn disconnect_player(&self, player: PlayerId) {
        for session_id in self.sessions_of(player).await {
            if let Err(e) = self.player_left(session_id, player).await {
                debug!("Disconnect cleanup for {} in {}: {}", player, session_id, e);
            }
        }
    }

    /// Remove a session from the registry, cancel its timers, and arm
    /// replay retention. With a reason, clients are told the session was
    /// terminated; without one it closes silently after normal cleanup.
    pub async fn destroy_session(&self, session_id: SessionId, reason: Option<&str>) {
        let Some(arc) = self.inner.sessions.write().await.remove(&session_id) else {
            return;
        };
        let participants: Vec<PlayerId> = {
            let mut s = arc.write().await;
            // The cleanup task may be the caller; detach it, abort the rest.
            s.timers.cleanup.take();
            s.timers.abort_countdown();
            s.timers.abort_deadline();
            match reason {
                Some(r) => self.emit(EngineEvent::SessionTerminated {
                    session: session_id,
                    reason: r.to_string(),
                }),
                None => self.emit(EngineEvent::SessionClosed { session: session_id }),
            }
            s.players.iter().map(|p| p.id).collect()
        };
        for pid in participants {
            self.unregister_player(pid, session_id).await;
        }

        let retention = Duration::from_millis(self.inner.flags.replay_retention_ms());
        let replays = self.inner.replays.clone();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            replays.remove(session_id).await;
        });
        info!("Destroyed game {} (reason: {:?})", session_id, reason);
    }

    /// Delete Finished sessions plus stale Waiting sessions with at
    /// most one connected player. Returns how many went away.
    pub async fn terminate_idle_games(&self) -> usize {
        let entries: Vec<(SessionId, Arc<RwLock<RaceSession>>)> = {
            let sessions = self.inner.sessions.read().await;
            sessions.iter().map(|(id, s)| (*id, s.clone())).collect()
        };
        let now = epoch_ms();
        let mut terminated = 0;
        for (id, arc) in entries {
            let (finished, idle_waiting) = {
                let s = arc.read().await;
                let connected = s.players.iter().filter(|p| p.is_connected).count();
                (
                    s.state == RaceState::Finished,
                    s.state == RaceState::Waiting
                        && connected <= 1
                        && s.game_age(now) >= IDLE_WAITING_AGE_MS,
                )
            };
            if finished {
                self.destroy_session(id, None).await;
                terminated += 1;
            } else if idle_waiting {
                self.destroy_session(id, Some("idle")).await;
                terminated += 1;
            }
        }
        if terminated > 0 {
            info!("Terminated {} idle games", terminated);
        }
        terminated
    }

    /// Compact replay buffers. Returns the number of snapshots dropped.
    pub async fn clear_caches(&self) -> usize {
        self.inner.replays.compact().await
    }

    /// Terminate every session, telling clients why. Used at shutdown.
    pub async fn terminate_all(&self, reason: &str) {
        let ids: Vec<SessionId> = self.inner.sessions.read().await.keys().copied().collect();
        for id in ids {
            self.destroy_session(id, Some(reason)).await;
        }
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Listing of all sessions.
    pub async fn list_games(&self) -> Vec<GameSummary> {
        let entries: Vec<Arc<RwLock<RaceSession>>> = {
            let sessions = self.inner.sessions.read().await;
            sessions.values().cloned().collect()
        };
        let mut out = Vec::with_capacity(entries.len());
        for arc in entries {
            out.push(arc.read().await.summary());
        }
        out
    }

    /// Snapshot of one session.
    pub async fn game_state(&self, session_id: SessionId) -> Option<GameState> {
        let arc = self.session_arc(session_id).await?;
        let s = arc.read().await;
        Some(s.view())
    }

    /// Number of sessions in the registry.
    pub async fn active_session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Aggregate counters for monitoring.
    pub async fn stats(&self) -> EngineStats {
        let entries: Vec<Arc<RwLock<RaceSession>>> = {
            let sessions = self.inner.sessions.read().await;
            sessions.values().cloned().collect()
        };
        let mut stats = EngineStats {
            active_games: entries.len(),
            waiting_games: 0,
            racing_games: 0,
            finished_games: 0,
            total_players: 0,
            connected_players: 0,
        };
        for arc in entries {
            let s = arc.read().await;
            match s.state {
                RaceState::Waiting => stats.waiting_games += 1,
                RaceState::Racing => stats.racing_games += 1,
                RaceState::Finished => stats.finished_games += 1,
                RaceState::Countdown => {}
            }
            stats.total_players += s.players.len();
            stats.connected_players += s.players.iter().filter(|p| p.is_connected).count();
        }
        stats
    }

    // =========================================================================
    // CREATION QUEUE
    // =========================================================================

    /// Spawn the background worker that drains queued creations at a
    /// 2 s cadence (5 s under backoff).
    pub fn spawn_creation_queue_worker(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                let secs = if engine.inner.flags.creation_backoff_enabled() {
                    CREATION_QUEUE_BACKOFF_SECS
                } else {
                    CREATION_QUEUE_DRAIN_SECS
                };
                tokio::time::sleep(Duration::from_secs(secs)).await;
                engine.drain_creation_queue().await;
            }
        })
    }

    /// Drain the creation queue once, discarding stale entries. While
    /// intake is stopped the queue is left untouched (entries keep
    /// aging). Returns how many games were created.
    pub async fn drain_creation_queue(&self) -> usize {
        if !self.inner.flags.accepting_new_players() {
            return 0;
        }
        let mut created = 0;
        loop {
            let entry = self.inner.creation_queue.lock().await.pop_front();
            let Some(e) = entry else { break };
            if e.submitted_at.elapsed() > CREATION_QUEUE_MAX_AGE {
                warn!("Discarding stale game-creation request from {}", e.player);
                continue;
            }
            match self.create_now(e.player, &e.name, e.max_players).await {
                Ok((id, _)) => {
                    created += 1;
                    debug!("Drained queued creation from {} into game {}", e.player, id);
                }
                Err(err) => warn!("Queued game creation for {} failed: {}", e.player, err),
            }
        }
        created
    }

    /// Pending creation requests.
    pub async fn creation_queue_len(&self) -> usize {
        self.inner.creation_queue.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn test_engine() -> (RaceEngine, mpsc::UnboundedReceiver<EngineEvent>) {
        test_engine_with(EngineConfig {
            max_players_per_game: 4,
            min_players_to_start: 2,
            countdown_seconds: 3,
            max_race_time: Duration::from_secs(60),
            cleanup_delay: Duration::from_secs(60),
        })
    }

    fn test_engine_with(cfg: EngineConfig) -> (RaceEngine, mpsc::UnboundedReceiver<EngineEvent>) {
        RaceEngine::new(
            cfg,
            TextProvider::builtin(),
            Arc::new(ControlFlags::new()),
            Arc::new(ReplayStore::new()),
        )
    }

    fn flags_of(engine: &RaceEngine) -> Arc<ControlFlags> {
        engine.inner.flags.clone()
    }

    fn replays_of(engine: &RaceEngine) -> Arc<ReplayStore> {
        engine.inner.replays.clone()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> EngineEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for engine event")
            .expect("event channel closed")
    }

    /// Drive a 2-player session to Racing and return its id and text length.
    async fn racing_pair(
        engine: &RaceEngine,
        p1: PlayerId,
        p2: PlayerId,
    ) -> (SessionId, usize) {
        let (id, _) = engine.create_game(p1, "Ada", Some(2)).await.unwrap();
        engine.join_game(p2, "Bob", Some(id), false).await.unwrap();
        engine.player_ready(id, p1).await.unwrap();
        engine.player_ready(id, p2).await.unwrap();
        // Skip the ticker: force the transition directly.
        {
            let arc = engine.session_arc(id).await.unwrap();
            arc.write().await.countdown_remaining = 0;
        }
        engine.start_race(id).await;
        let state = engine.game_state(id).await.unwrap();
        assert_eq!(state.state, RaceState::Racing);
        (id, state.text.chars().count())
    }

    #[tokio::test]
    async fn test_create_game_waiting_with_creator() {
        let (engine, mut rx) = test_engine();
        let p1 = PlayerId::generate();
        let (id, player) = engine.create_game(p1, "  Ada  ", None).await.unwrap();

        assert_eq!(player.name, "Ada");
        assert!(!player.is_spectator);
        let state = engine.game_state(id).await.unwrap();
        assert_eq!(state.state, RaceState::Waiting);
        assert_eq!(state.players.len(), 1);
        assert_eq!(state.max_players, 4);

        match next_event(&mut rx).await {
            EngineEvent::SessionCreated { session, creator, .. } => {
                assert_eq!(session, id);
                assert_eq!(creator, p1);
            }
            other => panic!("expected SessionCreated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_respects_service_unavailable() {
        let (engine, _rx) = test_engine();
        flags_of(&engine).set_accepting_new_players(false);
        let err = engine
            .create_game(PlayerId::generate(), "Ada", None)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::ServiceUnavailable);
    }

    #[tokio::test]
    async fn test_create_queued_when_queue_enabled() {
        let (engine, _rx) = test_engine();
        flags_of(&engine).set_game_creation_queue_enabled(true);
        let err = engine
            .create_game(PlayerId::generate(), "Ada", None)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Queued);
        assert_eq!(engine.creation_queue_len().await, 1);
        assert_eq!(engine.active_session_count().await, 0);

        let created = engine.drain_creation_queue().await;
        assert_eq!(created, 1);
        assert_eq!(engine.active_session_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_queue_entries_discarded() {
        let (engine, _rx) = test_engine();
        flags_of(&engine).set_game_creation_queue_enabled(true);
        let _ = engine.create_game(PlayerId::generate(), "Ada", None).await;
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(engine.drain_creation_queue().await, 0);
        assert_eq!(engine.creation_queue_len().await, 0);
        assert_eq!(engine.active_session_count().await, 0);
    }

    #[tokio::test]
    async fn test_queue_held_while_not_accepting() {
        let (engine, _rx) = test_engine();
        flags_of(&engine).set_game_creation_queue_enabled(true);
        let _ = engine.create_game(PlayerId::generate(), "Ada", None).await;
        flags_of(&engine).set_accepting_new_players(false);
        assert_eq!(engine.drain_creation_queue().await, 0);
        assert_eq!(engine.creation_queue_len().await, 1);
    }

    #[tokio::test]
    async fn test_join_unknown_game_not_found() {
        let (engine, _rx) = test_engine();
        let err = engine
            .join_game(PlayerId::generate(), "Bob", Some(SessionId::generate()), false)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::GameNotFound);
    }

    #[tokio::test]
    async fn test_join_without_id_finds_waiting_game() {
        let (engine, _rx) = test_engine();
        let (id, _) = engine
            .create_game(PlayerId::generate(), "Ada", None)
            .await
            .unwrap();
        let (joined_id, player, spectator) = engine
            .join_game(PlayerId::generate(), "Bob", None, false)
            .await
            .unwrap();
        assert_eq!(joined_id, id);
        assert!(!spectator);
        assert_eq!(player.name, "Bob");
    }

    #[tokio::test]
    async fn test_join_without_id_creates_when_nothing_open() {
        let (engine, _rx) = test_engine();
        let (id, _, spectator) = engine
            .join_game(PlayerId::generate(), "Bob", None, false)
            .await
            .unwrap();
        assert!(!spectator);
        assert_eq!(engine.active_session_count().await, 1);
        assert!(engine.game_state(id).await.is_some());
    }

    #[tokio::test]
    async fn test_third_join_at_capacity_two_is_full() {
        let (engine, _rx) = test_engine();
        let (id, _) = engine
            .create_game(PlayerId::generate(), "Ada", Some(2))
            .await
            .unwrap();
        engine
            .join_game(PlayerId::generate(), "Bob", Some(id), false)
            .await
            .unwrap();
        let err = engine
            .join_game(PlayerId::generate(), "Cid", Some(id), false)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::GameFull);
    }

    #[tokio::test]
    async fn test_connected_duplicate_join_rejected() {
        let (engine, _rx) = test_engine();
        let p1 = PlayerId::generate();
        let (id, _) = engine.create_game(p1, "Ada", None).await.unwrap();
        let err = engine.join_game(p1, "Ada", Some(id), false).await.unwrap_err();
        assert_eq!(err, EngineError::PlayerAlreadyExists);
    }

    #[tokio::test]
    async fn test_reconnect_returns_existing_player() {
        let (engine, _rx) = test_engine();
        let p1 = PlayerId::generate();
        let p2 = PlayerId::generate();
        let (id, _) = racing_pair(&engine, p1, p2).await;

        engine.player_left(id, p2).await.unwrap();
        let state = engine.game_state(id).await.unwrap();
        assert!(!state.players.iter().find(|p| p.id == p2).unwrap().is_connected);

        let (joined_id, player, _) = engine.join_game(p2, "Ignored", Some(id), false).await.unwrap();
        assert_eq!(joined_id, id);
        assert_eq!(player.id, p2);
        assert_eq!(player.name, "Bob");
        let state = engine.game_state(id).await.unwrap();
        assert_eq!(state.players.len(), 2);
        assert!(state.players.iter().find(|p| p.id == p2).unwrap().is_connected);
    }

    #[tokio::test]
    async fn test_spectator_join_after_start() {
        let (engine, _rx) = test_engine();
        let p1 = PlayerId::generate();
        let p2 = PlayerId::generate();
        let (id, _) = racing_pair(&engine, p1, p2).await;

        let p3 = PlayerId::generate();
        let (_, spectator, is_spectator) =
            engine.join_game(p3, "Carol", Some(id), false).await.unwrap();
        assert!(is_spectator);
        assert_eq!(spectator.name, "Carol (Spectator)");
        assert_eq!(spectator.color, crate::game::player::SPECTATOR_COLOR);
        assert!(spectator.is_ready);
    }

    #[tokio::test]
    async fn test_spectator_progress_ignored() {
        let (engine, mut rx) = test_engine();
        let p1 = PlayerId::generate();
        let p2 = PlayerId::generate();
        let (id, _) = racing_pair(&engine, p1, p2).await;
        let p3 = PlayerId::generate();
        engine.join_game(p3, "Carol", Some(id), false).await.unwrap();
        while rx.try_recv().is_ok() {}

        engine.update_progress(id, p3, 10, 50.0, 99.0).await.unwrap();

        // No progress event was emitted and no replay track exists.
        assert!(rx.try_recv().is_err());
        let replay = replays_of(&engine).get(id).await.unwrap();
        assert!(!replay.players.contains_key(&p3));
        let state = engine.game_state(id).await.unwrap();
        let spec = state.players.iter().find(|p| p.id == p3).unwrap();
        assert_eq!(spec.position, 0.0);
    }

    #[tokio::test]
    async fn test_ready_starts_countdown_at_min_players() {
        let (engine, _rx) = test_engine();
        let p1 = PlayerId::generate();
        let p2 = PlayerId::generate();
        let (id, _) = engine.create_game(p1, "Ada", Some(2)).await.unwrap();
        engine.join_game(p2, "Bob", Some(id), false).await.unwrap();

        engine.player_ready(id, p1).await.unwrap();
        assert_eq!(engine.game_state(id).await.unwrap().state, RaceState::Waiting);
        assert!(!engine.can_start_game(id).await);

        engine.player_ready(id, p2).await.unwrap();
        let state = engine.game_state(id).await.unwrap();
        assert_eq!(state.state, RaceState::Countdown);
        assert_eq!(state.countdown_remaining, 3);

        // Replay is created on countdown entry.
        assert!(replays_of(&engine).get(id).await.is_some());
    }

    #[tokio::test]
    async fn test_player_ready_is_idempotent() {
        let (engine, _rx) = test_engine();
        let p1 = PlayerId::generate();
        let (id, _) = engine.create_game(p1, "Ada", Some(2)).await.unwrap();
        engine.player_ready(id, p1).await.unwrap();
        engine.player_ready(id, p1).await.unwrap();
        let state = engine.game_state(id).await.unwrap();
        // Still waiting: one ready racer is below the minimum.
        assert_eq!(state.state, RaceState::Waiting);
        assert!(state.players[0].is_ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_ticks_then_race_starts() {
        let (engine, mut rx) = test_engine();
        let p1 = PlayerId::generate();
        let p2 = PlayerId::generate();
        let (id, _) = engine.create_game(p1, "Ada", Some(2)).await.unwrap();
        engine.join_game(p2, "Bob", Some(id), false).await.unwrap();
        engine.player_ready(id, p1).await.unwrap();
        engine.player_ready(id, p2).await.unwrap();

        let mut seen_ticks = Vec::new();
        loop {
            match next_event(&mut rx).await {
                EngineEvent::CountdownTick { seconds, .. } => seen_ticks.push(seconds),
                EngineEvent::RaceStarted { session, start_time } => {
                    assert_eq!(session, id);
                    assert!(start_time > 0);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(seen_ticks, vec![3, 2, 1]);
        let state = engine.game_state(id).await.unwrap();
        assert_eq!(state.state, RaceState::Racing);
        assert!(state.start_time.is_some());
    }

    #[tokio::test]
    async fn test_progress_moves_player_and_snapshots() {
        let (engine, _rx) = test_engine();
        let p1 = PlayerId::generate();
        let p2 = PlayerId::generate();
        let (id, text_len) = racing_pair(&engine, p1, p2).await;

        engine
            .update_progress(id, p1, text_len / 2, 61.5, 97.0)
            .await
            .unwrap();
        let state = engine.game_state(id).await.unwrap();
        let ada = state.players.iter().find(|p| p.id == p1).unwrap();
        assert!(ada.position > 0.0 && ada.position < 100.0);
        assert_eq!(ada.wpm, 61.5);

        let replay = replays_of(&engine).get(id).await.unwrap();
        assert_eq!(replay.players[&p1].snapshots.len(), 1);
    }

    #[tokio::test]
    async fn test_progress_index_clamped_to_text() {
        let (engine, _rx) = test_engine();
        let p1 = PlayerId::generate();
        let p2 = PlayerId::generate();
        let (id, text_len) = racing_pair(&engine, p1, p2).await;

        engine
            .update_progress(id, p1, text_len + 500, 60.0, 95.0)
            .await
            .unwrap();
        let state = engine.game_state(id).await.unwrap();
        let ada = state.players.iter().find(|p| p.id == p1).unwrap();
        assert_eq!(ada.current_index, text_len);
        assert_eq!(ada.position, 100.0);
        assert!(ada.finish_time.is_some());
    }

    #[tokio::test]
    async fn test_rapid_progress_reports_all_accepted() {
        let (engine, _rx) = test_engine();
        let p1 = PlayerId::generate();
        let p2 = PlayerId::generate();
        let (id, text_len) = racing_pair(&engine, p1, p2).await;

        // Clients may over-send; every report lands in engine state and
        // none of them fails the connection.
        for i in 1..=100usize {
            engine
                .update_progress(id, p1, (i * text_len / 200).min(text_len - 1), 60.0, 95.0)
                .await
                .unwrap();
        }
        let state = engine.game_state(id).await.unwrap();
        let ada = state.players.iter().find(|p| p.id == p1).unwrap();
        assert_eq!(ada.current_index, (100 * text_len / 200).min(text_len - 1));
    }

    #[tokio::test]
    async fn test_progress_outside_racing_silently_dropped() {
        let (engine, mut rx) = test_engine();
        let p1 = PlayerId::generate();
        let (id, _) = engine.create_game(p1, "Ada", None).await.unwrap();
        while rx.try_recv().is_ok() {}

        engine.update_progress(id, p1, 10, 60.0, 95.0).await.unwrap();
        assert!(rx.try_recv().is_err());
        let state = engine.game_state(id).await.unwrap();
        assert_eq!(state.players[0].position, 0.0);
    }

    #[tokio::test]
    async fn test_progress_unknown_game_errors() {
        let (engine, _rx) = test_engine();
        let err = engine
            .update_progress(SessionId::generate(), PlayerId::generate(), 1, 1.0, 1.0)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::GameNotFound);
    }

    #[tokio::test]
    async fn test_finish_flow_ends_race_when_all_done() {
        let (engine, _rx) = test_engine();
        let p1 = PlayerId::generate();
        let p2 = PlayerId::generate();
        let (id, _) = racing_pair(&engine, p1, p2).await;

        let all_done = engine
            .player_finished(id, p1, 80.0, 98.0, epoch_ms())
            .await
            .unwrap();
        assert!(!all_done);
        assert_eq!(engine.game_state(id).await.unwrap().state, RaceState::Racing);

        let all_done = engine
            .player_finished(id, p2, 70.0, 95.0, epoch_ms())
            .await
            .unwrap();
        assert!(all_done);
        let state = engine.game_state(id).await.unwrap();
        assert_eq!(state.state, RaceState::Finished);
        assert!(state.end_time.is_some());
        assert!(state.end_time.unwrap() >= state.start_time.unwrap());
    }

    #[tokio::test]
    async fn test_double_finish_is_a_no_op() {
        let (engine, _rx) = test_engine();
        let p1 = PlayerId::generate();
        let p2 = PlayerId::generate();
        let (id, _) = racing_pair(&engine, p1, p2).await;

        engine
            .player_finished(id, p1, 80.0, 98.0, 1_000)
            .await
            .unwrap();
        let again = engine
            .player_finished(id, p1, 999.0, 1.0, 2_000)
            .await
            .unwrap();
        assert!(!again);

        let state = engine.game_state(id).await.unwrap();
        let ada = state.players.iter().find(|p| p.id == p1).unwrap();
        assert_eq!(ada.wpm, 80.0);
        assert_eq!(ada.finish_time, Some(1_000));
    }

    #[tokio::test]
    async fn test_disconnect_mid_race_keeps_player_in_rankings() {
        let (engine, mut rx) = test_engine();
        let p1 = PlayerId::generate();
        let p2 = PlayerId::generate();
        let (id, text_len) = racing_pair(&engine, p1, p2).await;

        engine
            .update_progress(id, p2, (text_len as f64 * 0.4) as usize, 40.0, 90.0)
            .await
            .unwrap();
        engine.player_left(id, p2).await.unwrap();

        let state = engine.game_state(id).await.unwrap();
        assert_eq!(state.state, RaceState::Racing);
        assert_eq!(state.players.len(), 2);
        assert!(!state.players.iter().find(|p| p.id == p2).unwrap().is_connected);

        while rx.try_recv().is_ok() {}
        let all_done = engine
            .player_finished(id, p1, 80.0, 98.0, epoch_ms())
            .await
            .unwrap();
        assert!(all_done, "race ends when the last connected racer finishes");

        let summary = loop {
            match next_event(&mut rx).await {
                EngineEvent::RaceFinished { summary, .. } => break summary,
                _ => {}
            }
        };
        assert_eq!(summary.rankings.len(), 2);
        assert_eq!(summary.rankings[0].id, p1);
        assert_eq!(summary.rankings[0].rank, 1);
        assert!(summary.rankings[0].finished);
        let bob = summary.rankings.iter().find(|r| r.id == p2).unwrap();
        assert!(!bob.finished);
    }

    #[tokio::test]
    async fn test_waiting_leave_removes_and_empties_session() {
        let (engine, mut rx) = test_engine();
        let p1 = PlayerId::generate();
        let (id, _) = engine.create_game(p1, "Ada", None).await.unwrap();
        while rx.try_recv().is_ok() {}

        engine.player_left(id, p1).await.unwrap();
        assert_eq!(engine.active_session_count().await, 0);
        assert!(engine.sessions_of(p1).await.is_empty());

        let mut saw_closed = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, EngineEvent::SessionClosed { session } if session == id) {
                saw_closed = true;
            }
        }
        assert!(saw_closed);
    }

    #[tokio::test]
    async fn test_countdown_emptied_never_starts() {
        let (engine, mut rx) = test_engine();
        let p1 = PlayerId::generate();
        let p2 = PlayerId::generate();
        let (id, _) = engine.create_game(p1, "Ada", Some(2)).await.unwrap();
        engine.join_game(p2, "Bob", Some(id), false).await.unwrap();
        engine.player_ready(id, p1).await.unwrap();
        engine.player_ready(id, p2).await.unwrap();
        assert_eq!(engine.game_state(id).await.unwrap().state, RaceState::Countdown);

        engine.player_left(id, p1).await.unwrap();
        engine.player_left(id, p2).await.unwrap();

        // Give the (cancelled) ticker a chance to misbehave.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let state = engine.game_state(id).await.unwrap();
        assert_eq!(state.state, RaceState::Countdown);
        assert!(state.start_time.is_none());

        while let Ok(ev) = rx.try_recv() {
            assert!(
                !matches!(ev, EngineEvent::RaceStarted { .. }),
                "race must not start after everyone left"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_deadline_forces_end() {
        let (engine, mut rx) = test_engine_with(EngineConfig {
            max_race_time: Duration::from_secs(5),
            ..EngineConfig::default()
        });
        let p1 = PlayerId::generate();
        let p2 = PlayerId::generate();
        let (id, _) = racing_pair(&engine, p1, p2).await;
        while rx.try_recv().is_ok() {}

        tokio::time::advance(Duration::from_secs(6)).await;
        let summary = loop {
            match next_event(&mut rx).await {
                EngineEvent::RaceFinished { summary, .. } => break summary,
                _ => {}
            }
        };
        assert!(summary.rankings.iter().all(|r| !r.finished));
        assert_eq!(summary.stats.finish_rate, 0.0);
        assert_eq!(engine.game_state(id).await.unwrap().state, RaceState::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_destroys_finished_session() {
        let (engine, _rx) = test_engine_with(EngineConfig {
            cleanup_delay: Duration::from_secs(3),
            ..EngineConfig::default()
        });
        let p1 = PlayerId::generate();
        let p2 = PlayerId::generate();
        let (id, _) = racing_pair(&engine, p1, p2).await;
        engine.player_finished(id, p1, 80.0, 98.0, epoch_ms()).await.unwrap();
        engine.player_finished(id, p2, 70.0, 95.0, epoch_ms()).await.unwrap();
        assert_eq!(engine.active_session_count().await, 1);

        tokio::time::advance(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;
        assert_eq!(engine.active_session_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_retention_evicts() {
        let (engine, _rx) = test_engine_with(EngineConfig {
            cleanup_delay: Duration::from_secs(1),
            ..EngineConfig::default()
        });
        flags_of(&engine).set_replay_retention_ms(2_000);
        let p1 = PlayerId::generate();
        let p2 = PlayerId::generate();
        let (id, _) = racing_pair(&engine, p1, p2).await;
        engine.player_finished(id, p1, 80.0, 98.0, epoch_ms()).await.unwrap();
        engine.player_finished(id, p2, 70.0, 95.0, epoch_ms()).await.unwrap();
        assert!(replays_of(&engine).get(id).await.is_some());

        // Cleanup delay elapses, then the retention window.
        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(replays_of(&engine).get(id).await.is_some());
        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert!(replays_of(&engine).get(id).await.is_none());
    }

    #[tokio::test]
    async fn test_terminate_idle_games() {
        let (engine, _rx) = test_engine();
        // A finished game.
        let p1 = PlayerId::generate();
        let p2 = PlayerId::generate();
        let (finished_id, _) = racing_pair(&engine, p1, p2).await;
        engine.player_finished(finished_id, p1, 80.0, 98.0, epoch_ms()).await.unwrap();
        engine.player_finished(finished_id, p2, 70.0, 95.0, epoch_ms()).await.unwrap();

        // A stale waiting game with one connected player.
        let (stale_id, _) = engine.create_game(PlayerId::generate(), "Old", None).await.unwrap();
        {
            let arc = engine.session_arc(stale_id).await.unwrap();
            arc.write().await.created_at = epoch_ms() - IDLE_WAITING_AGE_MS - 1;
        }

        // A fresh waiting game that must survive.
        let (fresh_id, _) = engine.create_game(PlayerId::generate(), "New", None).await.unwrap();

        let terminated = engine.terminate_idle_games().await;
        assert_eq!(terminated, 2);
        assert!(engine.game_state(finished_id).await.is_none());
        assert!(engine.game_state(stale_id).await.is_none());
        assert!(engine.game_state(fresh_id).await.is_some());
    }

    #[tokio::test]
    async fn test_effective_capacity_reduced_under_pressure() {
        let (engine, _rx) = test_engine();
        flags_of(&engine).set_max_players_reduction(1);
        let (id, _) = engine
            .create_game(PlayerId::generate(), "Ada", None)
            .await
            .unwrap();
        assert_eq!(engine.game_state(id).await.unwrap().max_players, 3);
    }

    #[tokio::test]
    async fn test_disconnect_player_routes_to_sessions() {
        let (engine, _rx) = test_engine();
        let p1 = PlayerId::generate();
        let p2 = PlayerId::generate();
        let (id, _) = racing_pair(&engine, p1, p2).await;

        engine.disconnect_player(p2).await;
        let state = engine.game_state(id).await.unwrap();
        assert!(!state.players.iter().find(|p| p.id == p2).unwrap().is_connected);
        assert!(engine.sessions_of(p2).await.is_empty());
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let (engine, _rx) = test_engine();
        let p1 = PlayerId::generate();
        let p2 = PlayerId::generate();
        racing_pair(&engine, p1, p2).await;
        engine.create_game(PlayerId::generate(), "Solo", None).await.unwrap();

        let stats = engine.stats().await;
        assert_eq!(stats.active_games, 2);
        assert_eq!(stats.racing_games, 1);
        assert_eq!(stats.waiting_games, 1);
        assert_eq!(stats.total_players, 3);
        assert_eq!(stats.connected_players, 3);
    }

    #[tokio::test]
    async fn test_terminate_all_emits_reason() {
        let (engine, mut rx) = test_engine();
        engine.create_game(PlayerId::generate(), "Ada", None).await.unwrap();
        while rx.try_recv().is_ok() {}

        engine.terminate_all("server_shutdown").await;
        assert_eq!(engine.active_session_count().await, 0);
        let mut saw_terminated = false;
        while let Ok(ev) = rx.try_recv() {
            if let EngineEvent::SessionTerminated { reason, .. } = ev {
                assert_eq!(reason, "server_shutdown");
                saw_terminated = true;
            }
        }
        assert!(saw_terminated);
    }
}

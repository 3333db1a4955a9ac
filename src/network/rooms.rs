//! Rooms and Per-Connection Fan-out
//!
//! Connection registry and per-session broadcast rooms. Every
//! connection gets one bounded outbound queue drained by its writer
//! task; the broadcaster never blocks on a peer. Droppable events are
//! discarded when a peer's queue is full, critical events close the
//! peer instead, so one slow connection can never stall a room.
//! Progress broadcasts are additionally throttled when the controller
//! has switched the server to low-frequency updates.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::control::flags::ControlFlags;
use crate::core::id::{PlayerId, SessionId};
use crate::network::protocol::{Priority, ServerEvent};

/// Outbound events buffered per connection before backpressure kicks in.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Under throttling, one progress broadcast in this many is forwarded.
const THROTTLE_KEEP_ONE_IN: u64 = 5;

/// Fan-out counters, exposed on the monitoring surface.
#[derive(Debug, Default)]
pub struct FanoutMetrics {
    /// Events enqueued to room members.
    pub broadcasts_sent: AtomicU64,
    /// Progress broadcasts suppressed by throttling.
    pub broadcasts_throttled: AtomicU64,
    /// Droppable events discarded by full peer queues.
    pub messages_dropped: AtomicU64,
    /// Connections closed because a critical event could not be queued.
    pub connections_closed: AtomicU64,
}

impl FanoutMetrics {
    /// Events enqueued to room members.
    pub fn sent(&self) -> u64 {
        self.broadcasts_sent.load(Ordering::Relaxed)
    }

    /// Progress broadcasts suppressed by throttling.
    pub fn throttled(&self) -> u64 {
        self.broadcasts_throttled.load(Ordering::Relaxed)
    }

    /// Droppable events discarded by full peer queues.
    pub fn dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    /// Connections closed for unrecoverable backpressure.
    pub fn closed(&self) -> u64 {
        self.connections_closed.load(Ordering::Relaxed)
    }
}

struct ConnectionHandle {
    tx: mpsc::Sender<ServerEvent>,
}

/// Connection registry plus session-id -> room membership.
pub struct RoomRegistry {
    flags: Arc<ControlFlags>,
    connections: RwLock<BTreeMap<PlayerId, ConnectionHandle>>,
    rooms: RwLock<BTreeMap<SessionId, BTreeSet<PlayerId>>>,
    progress_seq: AtomicU64,
    /// Fan-out counters.
    pub metrics: FanoutMetrics,
}

impl RoomRegistry {
    /// Create an empty registry.
    pub fn new(flags: Arc<ControlFlags>) -> Self {
        Self {
            flags,
            connections: RwLock::new(BTreeMap::new()),
            rooms: RwLock::new(BTreeMap::new()),
            progress_seq: AtomicU64::new(0),
            metrics: FanoutMetrics::default(),
        }
    }

    /// Register a connection. The returned receiver is drained by the
    /// connection's writer task.
    pub async fn register(&self, id: PlayerId) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        self.connections
            .write()
            .await
            .insert(id, ConnectionHandle { tx });
        rx
    }

    /// Drop a connection and its room memberships. Dropping the sender
    /// ends the writer task, which closes the socket.
    pub async fn unregister(&self, id: PlayerId) {
        self.connections.write().await.remove(&id);
        let mut rooms = self.rooms.write().await;
        for members in rooms.values_mut() {
            members.remove(&id);
        }
        rooms.retain(|_, members| !members.is_empty());
    }

    /// Subscribe a connection to a session's events.
    pub async fn join_room(&self, session: SessionId, player: PlayerId) {
        self.rooms
            .write()
            .await
            .entry(session)
            .or_default()
            .insert(player);
    }

    /// Unsubscribe a connection from a session's events.
    pub async fn leave_room(&self, session: SessionId, player: PlayerId) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(&session) {
            members.remove(&player);
            if members.is_empty() {
                rooms.remove(&session);
            }
        }
    }

    /// Drop a room entirely.
    pub async fn close_room(&self, session: SessionId) {
        self.rooms.write().await.remove(&session);
    }

    /// Number of connections subscribed to a session.
    pub async fn room_size(&self, session: SessionId) -> usize {
        self.rooms
            .read()
            .await
            .get(&session)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Enqueue an event to one connection, applying the backpressure
    /// policy for its priority. Returns whether it was enqueued.
    pub async fn send_to(&self, player: PlayerId, event: ServerEvent) -> bool {
        let tx = {
            let connections = self.connections.read().await;
            match connections.get(&player) {
                Some(handle) => handle.tx.clone(),
                None => return false,
            }
        };
        let priority = event.priority();
        match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => match priority {
                Priority::Droppable => {
                    let dropped = self
                        .metrics
                        .messages_dropped
                        .fetch_add(1, Ordering::Relaxed)
                        + 1;
                    if dropped % 100 == 1 {
                        warn!(
                            "Outbound queue full for {}; dropped droppable event (total {})",
                            player, dropped
                        );
                    }
                    false
                }
                Priority::Critical => {
                    warn!(
                        "Outbound queue full for {} on a critical event; closing connection",
                        player
                    );
                    self.metrics
                        .connections_closed
                        .fetch_add(1, Ordering::Relaxed);
                    self.unregister(player).await;
                    false
                }
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Outbound channel for {} already closed", player);
                self.unregister(player).await;
                false
            }
        }
    }

    /// Broadcast an event to a session's room. Progress updates are
    /// throttled to one in five while the controller has low-frequency
    /// updates active. Returns the number of connections reached.
    pub async fn broadcast(&self, session: SessionId, event: ServerEvent) -> usize {
        if event.is_progress_update() && self.flags.throttle_progress() {
            let seq = self.progress_seq.fetch_add(1, Ordering::Relaxed);
            if seq % THROTTLE_KEEP_ONE_IN != 0 {
                self.metrics
                    .broadcasts_throttled
                    .fetch_add(1, Ordering::Relaxed);
                return 0;
            }
        }
        let members: Vec<PlayerId> = {
            let rooms = self.rooms.read().await;
            rooms
                .get(&session)
                .map(|m| m.iter().copied().collect())
                .unwrap_or_default()
        };
        let mut reached = 0;
        for player in members {
            if self.send_to(player, event.clone()).await {
                reached += 1;
            }
        }
        self.metrics
            .broadcasts_sent
            .fetch_add(reached as u64, Ordering::Relaxed);
        reached
    }

    /// Broadcast an event to every registered connection.
    pub async fn broadcast_all(&self, event: ServerEvent) -> usize {
        let ids: Vec<PlayerId> = self.connections.read().await.keys().copied().collect();
        let mut reached = 0;
        for player in ids {
            if self.send_to(player, event.clone()).await {
                reached += 1;
            }
        }
        reached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::{
        CountdownPayload, GameStateUpdate, PlayerLeftPayload, UpdateKind,
    };
    use crate::game::player::{palette_color, Player};

    fn registry() -> (RoomRegistry, Arc<ControlFlags>) {
        let flags = Arc::new(ControlFlags::new());
        (RoomRegistry::new(flags.clone()), flags)
    }

    fn progress_event(session: SessionId) -> ServerEvent {
        let player = Player::racer(PlayerId::generate(), "Ada".into(), palette_color(0));
        ServerEvent::GameStateUpdate(GameStateUpdate::with_player(
            UpdateKind::ProgressUpdate,
            session,
            player,
        ))
    }

    fn critical_event(session: SessionId) -> ServerEvent {
        ServerEvent::GameCountdown(CountdownPayload {
            game_id: session,
            countdown: 3,
        })
    }

    fn droppable_event(session: SessionId) -> ServerEvent {
        ServerEvent::PlayerLeft(PlayerLeftPayload {
            game_id: session,
            player_id: PlayerId::generate(),
        })
    }

    #[tokio::test]
    async fn test_send_to_registered_connection() {
        let (registry, _) = registry();
        let conn = PlayerId::generate();
        let mut rx = registry.register(conn).await;

        assert!(registry.send_to(conn, droppable_event(SessionId::generate())).await);
        assert!(rx.try_recv().is_ok());
        assert!(!registry.send_to(PlayerId::generate(), droppable_event(SessionId::generate())).await);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_room_members_only() {
        let (registry, _) = registry();
        let session = SessionId::generate();
        let in_room = PlayerId::generate();
        let outside = PlayerId::generate();
        let mut rx_in = registry.register(in_room).await;
        let mut rx_out = registry.register(outside).await;
        registry.join_room(session, in_room).await;

        let reached = registry.broadcast(session, critical_event(session)).await;
        assert_eq!(reached, 1);
        assert!(rx_in.try_recv().is_ok());
        assert!(rx_out.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_leave_and_close_room() {
        let (registry, _) = registry();
        let session = SessionId::generate();
        let a = PlayerId::generate();
        let b = PlayerId::generate();
        let _rx_a = registry.register(a).await;
        let _rx_b = registry.register(b).await;
        registry.join_room(session, a).await;
        registry.join_room(session, b).await;
        assert_eq!(registry.room_size(session).await, 2);

        registry.leave_room(session, a).await;
        assert_eq!(registry.room_size(session).await, 1);

        registry.close_room(session).await;
        assert_eq!(registry.room_size(session).await, 0);
    }

    #[tokio::test]
    async fn test_unregister_clears_memberships() {
        let (registry, _) = registry();
        let session = SessionId::generate();
        let conn = PlayerId::generate();
        let _rx = registry.register(conn).await;
        registry.join_room(session, conn).await;

        registry.unregister(conn).await;
        assert_eq!(registry.connection_count().await, 0);
        assert_eq!(registry.room_size(session).await, 0);
    }

    #[tokio::test]
    async fn test_throttle_drops_about_eighty_percent() {
        let (registry, flags) = registry();
        flags.set_throttling_enabled(true);
        flags.set_update_frequency(crate::control::flags::UpdateFrequency::Low);

        let session = SessionId::generate();
        let conn = PlayerId::generate();
        let mut rx = registry.register(conn).await;
        registry.join_room(session, conn).await;

        for _ in 0..100 {
            registry.broadcast(session, progress_event(session)).await;
        }
        let mut delivered = 0;
        while rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 20);
        assert_eq!(registry.metrics.throttled(), 80);
    }

    #[tokio::test]
    async fn test_throttle_never_touches_other_events() {
        let (registry, flags) = registry();
        flags.set_throttling_enabled(true);
        flags.set_update_frequency(crate::control::flags::UpdateFrequency::Low);

        let session = SessionId::generate();
        let conn = PlayerId::generate();
        let mut rx = registry.register(conn).await;
        registry.join_room(session, conn).await;

        for _ in 0..10 {
            registry.broadcast(session, critical_event(session)).await;
            registry.broadcast(session, droppable_event(session)).await;
        }
        let mut delivered = 0;
        while rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 20);
    }

    #[tokio::test]
    async fn test_throttle_off_delivers_everything() {
        let (registry, flags) = registry();
        // Only one of the two switches: no throttling.
        flags.set_throttling_enabled(true);

        let session = SessionId::generate();
        let conn = PlayerId::generate();
        let mut rx = registry.register(conn).await;
        registry.join_room(session, conn).await;

        for _ in 0..50 {
            registry.broadcast(session, progress_event(session)).await;
        }
        let mut delivered = 0;
        while rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 50);
    }

    #[tokio::test]
    async fn test_full_queue_drops_droppable_keeps_connection() {
        let (registry, _) = registry();
        let session = SessionId::generate();
        let conn = PlayerId::generate();
        // Receiver exists but is never drained.
        let _rx = registry.register(conn).await;

        for _ in 0..OUTBOUND_QUEUE_CAPACITY {
            assert!(registry.send_to(conn, droppable_event(session)).await);
        }
        assert!(!registry.send_to(conn, droppable_event(session)).await);
        assert_eq!(registry.metrics.dropped(), 1);
        assert_eq!(registry.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_full_queue_on_critical_closes_connection() {
        let (registry, _) = registry();
        let session = SessionId::generate();
        let conn = PlayerId::generate();
        let _rx = registry.register(conn).await;

        for _ in 0..OUTBOUND_QUEUE_CAPACITY {
            registry.send_to(conn, droppable_event(session)).await;
        }
        assert!(!registry.send_to(conn, critical_event(session)).await);
        assert_eq!(registry.metrics.closed(), 1);
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_slow_peer_does_not_stall_room() {
        let (registry, _) = registry();
        let session = SessionId::generate();
        let slow = PlayerId::generate();
        let healthy = PlayerId::generate();
        let _slow_rx = registry.register(slow).await;
        let mut healthy_rx = registry.register(healthy).await;
        registry.join_room(session, slow).await;
        registry.join_room(session, healthy).await;

        // Saturate the slow peer.
        for _ in 0..OUTBOUND_QUEUE_CAPACITY + 10 {
            registry.broadcast(session, droppable_event(session)).await;
        }
        // The healthy peer still got the capacity's worth of events.
        let mut delivered = 0;
        while healthy_rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, OUTBOUND_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn test_broadcast_all() {
        let (registry, _) = registry();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let id = PlayerId::generate();
            receivers.push(registry.register(id).await);
        }
        let reached = registry
            .broadcast_all(critical_event(SessionId::generate()))
            .await;
        assert_eq!(reached, 3);
        for rx in receivers.iter_mut() {
            assert!(rx.try_recv().is_ok());
        }
    }
}

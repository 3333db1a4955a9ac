//! WebSocket Fan-out Server
//!
//! Async WebSocket server for race connections. Accepts clients,
//! routes inbound events to the engine, and pumps engine events out to
//! rooms. The connection id minted at accept time is the player id for
//! every session the connection joins.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use crate::config::Environment;
use crate::control::flags::ControlFlags;
use crate::core::clock::epoch_ms;
use crate::core::id::PlayerId;
use crate::game::engine::{EngineEvent, RaceEngine};
use crate::game::replay::ReplayStore;
use crate::network::protocol::{
    AllGamesPayload, ClientEvent, CountdownPayload, ErrorCode, ErrorPayload, GameFinishedPayload,
    GameStartedPayload, GameStateUpdate, GameTerminatedPayload, PlayerJoinedPayload,
    PlayerLeftPayload, ReplayDataPayload, ServerEvent, SystemStats, UpdateKind,
};
use crate::network::rooms::RoomRegistry;

/// Fan-out server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Runtime environment, gates `set_system_config` over the socket.
    pub environment: Environment,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("static bind address"),
            max_connections: 1000,
            environment: Environment::Development,
        }
    }
}

/// Fan-out server errors.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The WebSocket server. Owns the engine-event receiver; `run`
/// consumes the server.
pub struct GameServer {
    config: ServerConfig,
    engine: RaceEngine,
    rooms: Arc<RoomRegistry>,
    flags: Arc<ControlFlags>,
    replays: Arc<ReplayStore>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a server over an already-wired engine graph.
    pub fn new(
        config: ServerConfig,
        engine: RaceEngine,
        rooms: Arc<RoomRegistry>,
        flags: Arc<ControlFlags>,
        replays: Arc<ReplayStore>,
        events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            engine,
            rooms,
            flags,
            replays,
            events_rx,
            shutdown_tx,
        }
    }

    /// Handle for signaling shutdown from outside `run`.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run the accept loop and the engine-event pump until shutdown.
    pub async fn run(self) -> Result<(), NetError> {
        let GameServer {
            config,
            engine,
            rooms,
            flags,
            replays,
            events_rx,
            shutdown_tx,
        } = self;

        let listener = TcpListener::bind(&config.bind_addr).await?;
        info!("Game server listening on {}", config.bind_addr);

        let pump_rooms = rooms.clone();
        let pump = tokio::spawn(async move {
            run_event_pump(pump_rooms, events_rx).await;
        });

        let mut shutdown_rx = shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if rooms.connection_count().await >= config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            let engine = engine.clone();
                            let rooms = rooms.clone();
                            let flags = flags.clone();
                            let replays = replays.clone();
                            let environment = config.environment;
                            tokio::spawn(async move {
                                handle_connection(
                                    stream, addr, engine, rooms, flags, replays, environment,
                                )
                                .await;
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        pump.abort();
        Ok(())
    }
}

/// Drain engine events into room broadcasts and directed sends.
async fn run_event_pump(
    rooms: Arc<RoomRegistry>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) {
    while let Some(event) = events.recv().await {
        dispatch_engine_event(&rooms, event).await;
    }
    debug!("Engine event channel closed; pump exiting");
}

async fn dispatch_engine_event(rooms: &RoomRegistry, event: EngineEvent) {
    match event {
        EngineEvent::SessionCreated {
            session,
            creator,
            state,
        } => {
            rooms.join_room(session, creator).await;
            let player = state.players.iter().find(|p| p.id == creator).cloned();
            rooms
                .send_to(
                    creator,
                    ServerEvent::GameStateUpdate(GameStateUpdate::with_state(
                        UpdateKind::GameCreated,
                        state,
                    )),
                )
                .await;
            if let Some(player) = player {
                rooms
                    .broadcast(
                        session,
                        ServerEvent::PlayerJoined(PlayerJoinedPayload {
                            game_id: session,
                            player,
                        }),
                    )
                    .await;
            }
        }
        EngineEvent::PlayerJoined {
            session,
            player,
            state,
        } => {
            let joined = player.id;
            rooms.join_room(session, joined).await;
            rooms
                .send_to(
                    joined,
                    ServerEvent::GameStateUpdate(GameStateUpdate::with_state(
                        UpdateKind::GameJoined,
                        state,
                    )),
                )
                .await;
            rooms
                .broadcast(
                    session,
                    ServerEvent::PlayerJoined(PlayerJoinedPayload {
                        game_id: session,
                        player,
                    }),
                )
                .await;
        }
        EngineEvent::PlayerReady { session, state, .. } => {
            rooms
                .broadcast(
                    session,
                    ServerEvent::GameStateUpdate(GameStateUpdate::with_state(
                        UpdateKind::PlayerReady,
                        state,
                    )),
                )
                .await;
        }
        EngineEvent::CountdownTick { session, seconds } => {
            rooms
                .broadcast(
                    session,
                    ServerEvent::GameCountdown(CountdownPayload {
                        game_id: session,
                        countdown: seconds,
                    }),
                )
                .await;
        }
        EngineEvent::RaceStarted {
            session,
            start_time,
        } => {
            rooms
                .broadcast(
                    session,
                    ServerEvent::GameStarted(GameStartedPayload {
                        game_id: session,
                        start_time,
                    }),
                )
                .await;
        }
        EngineEvent::ProgressUpdated { session, player } => {
            rooms
                .broadcast(
                    session,
                    ServerEvent::GameStateUpdate(GameStateUpdate::with_player(
                        UpdateKind::ProgressUpdate,
                        session,
                        player,
                    )),
                )
                .await;
        }
        EngineEvent::PlayerFinished { session, player } => {
            rooms
                .broadcast(
                    session,
                    ServerEvent::GameStateUpdate(GameStateUpdate::with_player(
                        UpdateKind::PlayerFinished,
                        session,
                        player,
                    )),
                )
                .await;
        }
        EngineEvent::RaceFinished {
            session,
            state,
            summary,
        } => {
            rooms
                .broadcast(
                    session,
                    ServerEvent::GameFinished(GameFinishedPayload {
                        game_state: state,
                        summary,
                    }),
                )
                .await;
        }
        EngineEvent::PlayerLeft {
            session, player, ..
        } => {
            rooms
                .broadcast(
                    session,
                    ServerEvent::PlayerLeft(PlayerLeftPayload {
                        game_id: session,
                        player_id: player,
                    }),
                )
                .await;
            rooms.leave_room(session, player).await;
        }
        EngineEvent::SessionTerminated { session, reason } => {
            rooms
                .broadcast(
                    session,
                    ServerEvent::GameTerminated(GameTerminatedPayload {
                        game_id: session,
                        reason,
                    }),
                )
                .await;
            rooms.close_room(session).await;
        }
        EngineEvent::SessionClosed { session } => {
            rooms.close_room(session).await;
        }
    }
}

/// Handle one WebSocket connection: register it, spawn its writer, and
/// process inbound events until the peer goes away.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    engine: RaceEngine,
    rooms: Arc<RoomRegistry>,
    flags: Arc<ControlFlags>,
    replays: Arc<ReplayStore>,
    environment: Environment,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let conn_id = PlayerId::generate();
    let mut outbound = rooms.register(conn_id).await;
    info!("Connection {} accepted from {}", conn_id, addr);

    // Dedicated writer: drains the bounded outbound queue so a slow
    // socket never backs up into the broadcaster.
    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match event.to_json() {
                Ok(t) => t,
                Err(e) => {
                    error!("Failed to serialize outbound event: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let event = match ClientEvent::from_json(&text) {
                    Ok(ev) => ev,
                    Err(e) => {
                        debug!("Invalid event from {}: {}", conn_id, e);
                        rooms
                            .send_to(
                                conn_id,
                                ServerEvent::Error(ErrorPayload::new(
                                    ErrorCode::InvalidPayload,
                                    "invalid event format",
                                )),
                            )
                            .await;
                        continue;
                    }
                };
                handle_client_event(
                    conn_id,
                    event,
                    &engine,
                    &rooms,
                    &flags,
                    &replays,
                    environment,
                )
                .await;
            }
            Ok(Message::Close(_)) => {
                debug!("Connection {} sent close", conn_id);
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // Transport-level pings are answered by tungstenite.
            }
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket error for {}: {}", conn_id, e);
                break;
            }
        }
    }

    engine.disconnect_player(conn_id).await;
    rooms.unregister(conn_id).await;
    writer.abort();
    info!("Connection {} closed", conn_id);
}

/// Route one inbound event. Engine errors become `error` events to the
/// originating connection only; progress errors are just logged.
async fn handle_client_event(
    conn_id: PlayerId,
    event: ClientEvent,
    engine: &RaceEngine,
    rooms: &Arc<RoomRegistry>,
    flags: &Arc<ControlFlags>,
    replays: &Arc<ReplayStore>,
    environment: Environment,
) {
    match event {
        ClientEvent::CreateGame(p) => {
            if let Err(e) = engine.create_game(conn_id, &p.player_name, p.max_players).await {
                send_engine_error(rooms, conn_id, &e).await;
            }
        }
        ClientEvent::JoinGame(p) => {
            let spectate = p.is_spectator.unwrap_or(false);
            if let Err(e) = engine
                .join_game(conn_id, &p.player_name, p.game_id, spectate)
                .await
            {
                send_engine_error(rooms, conn_id, &e).await;
            }
        }
        ClientEvent::PlayerReady(r) => {
            if let Err(e) = engine.player_ready(r.game_id, conn_id).await {
                send_engine_error(rooms, conn_id, &e).await;
            }
        }
        ClientEvent::UpdateProgress(p) => {
            // Swallowed with a warning: an error event per progress
            // report would amplify a client bug into a message storm.
            if let Err(e) = engine
                .update_progress(p.game_id, conn_id, p.current_index, p.wpm, p.accuracy)
                .await
            {
                warn!("Progress update from {} rejected: {}", conn_id, e);
            }
        }
        ClientEvent::PlayerFinished(p) => {
            if let Err(e) = engine
                .player_finished(p.game_id, conn_id, p.wpm, p.accuracy, p.finish_time)
                .await
            {
                send_engine_error(rooms, conn_id, &e).await;
            }
        }
        ClientEvent::LeaveGame(r) => {
            if let Err(e) = engine.player_left(r.game_id, conn_id).await {
                send_engine_error(rooms, conn_id, &e).await;
            }
        }
        ClientEvent::GetReplay(r) => {
            match replays.get(r.game_id).await {
                Some(replay) => {
                    rooms
                        .send_to(conn_id, ServerEvent::ReplayData(ReplayDataPayload { replay }))
                        .await;
                }
                None => {
                    rooms
                        .send_to(
                            conn_id,
                            ServerEvent::Error(ErrorPayload::new(
                                ErrorCode::ReplayNotFound,
                                "replay not found",
                            )),
                        )
                        .await;
                }
            }
        }
        ClientEvent::GetGameState(r) => match engine.game_state(r.game_id).await {
            Some(state) => {
                rooms
                    .send_to(
                        conn_id,
                        ServerEvent::GameStateUpdate(GameStateUpdate::with_state(
                            UpdateKind::StateSync,
                            state,
                        )),
                    )
                    .await;
            }
            None => {
                rooms
                    .send_to(
                        conn_id,
                        ServerEvent::Error(ErrorPayload::new(
                            ErrorCode::GameNotFound,
                            "game not found",
                        )),
                    )
                    .await;
            }
        },
        ClientEvent::GetAllGames => {
            let games = engine.list_games().await;
            rooms
                .send_to(conn_id, ServerEvent::AllGames(AllGamesPayload { games }))
                .await;
        }
        ClientEvent::GetSystemStatus => {
            let status = system_status_event(engine, rooms, flags).await;
            rooms.send_to(conn_id, status).await;
        }
        ClientEvent::SetSystemConfig(patch) => {
            if environment == Environment::Production {
                rooms
                    .send_to(
                        conn_id,
                        ServerEvent::Error(ErrorPayload::new(
                            ErrorCode::Unauthorized,
                            "system config changes require the admin API in production",
                        )),
                    )
                    .await;
                return;
            }
            flags.apply_patch(&patch);
            info!("System config patched over socket by {}", conn_id);
            let status = system_status_event(engine, rooms, flags).await;
            rooms.broadcast_all(status).await;
        }
        ClientEvent::Ping { timestamp } => {
            rooms
                .send_to(
                    conn_id,
                    ServerEvent::Pong {
                        timestamp,
                        server_time: epoch_ms(),
                    },
                )
                .await;
        }
    }
}

async fn send_engine_error(
    rooms: &Arc<RoomRegistry>,
    conn_id: PlayerId,
    err: &crate::game::engine::EngineError,
) {
    rooms
        .send_to(conn_id, ServerEvent::Error(ErrorPayload::from_engine(err)))
        .await;
}

/// Assemble the system-status reply from the live graph.
pub async fn system_status_event(
    engine: &RaceEngine,
    rooms: &Arc<RoomRegistry>,
    flags: &Arc<ControlFlags>,
) -> ServerEvent {
    let stats = SystemStats {
        games: engine.stats().await,
        connections: rooms.connection_count().await,
        broadcasts_sent: rooms.metrics.sent(),
        broadcasts_throttled: rooms.metrics.throttled(),
        messages_dropped: rooms.metrics.dropped(),
        connections_closed: rooms.metrics.closed(),
    };
    ServerEvent::GameStateUpdate(GameStateUpdate::system(flags.snapshot(), stats))
}

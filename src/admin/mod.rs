//! Admin & Monitoring HTTP Surface
//!
//! Read-only health/status/replay endpoints plus gated mitigation
//! writes, served by hyper over its own listener. Per-IP rate limiting
//! applies to everything; in production the monitor metrics/stats/
//! dashboard routes and config writes additionally require the
//! `x-api-key` header.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::Environment;
use crate::control::flags::{ControlFlags, FlagsPatch};
use crate::core::clock::epoch_ms;
use crate::core::id::{PlayerId, SessionId};
use crate::game::engine::{EngineError, RaceEngine};
use crate::game::replay::ReplayStore;
use crate::network::protocol::{CreateGamePayload, JoinGamePayload, SystemStats};
use crate::network::rooms::RoomRegistry;

/// Requests allowed per IP per window.
pub const RATE_LIMIT_MAX: u32 = 100;

/// Rate-limit window.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Admin surface configuration.
#[derive(Debug, Clone)]
pub struct AdminConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Runtime environment; production gates the monitor routes.
    pub environment: Environment,
    /// CORS allow-origin.
    pub client_url: String,
    /// API key for gated routes.
    pub api_key: Option<String>,
}

/// Fixed-window per-IP rate limiter.
pub struct RateLimiter {
    max: u32,
    window: Duration,
    hits: Mutex<HashMap<IpAddr, (tokio::time::Instant, u32)>>,
}

impl RateLimiter {
    /// Create a limiter allowing `max` requests per `window` per IP.
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record a hit and report whether it is within the limit.
    pub async fn allow(&self, ip: IpAddr) -> bool {
        let now = tokio::time::Instant::now();
        let mut hits = self.hits.lock().await;
        let entry = hits.entry(ip).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        entry.1 += 1;
        entry.1 <= self.max
    }
}

/// Shared state behind the admin routes.
#[derive(Clone)]
pub struct AdminState {
    engine: RaceEngine,
    flags: Arc<ControlFlags>,
    replays: Arc<ReplayStore>,
    rooms: Arc<RoomRegistry>,
    config: Arc<AdminConfig>,
    limiter: Arc<RateLimiter>,
    started_at: std::time::Instant,
}

impl AdminState {
    /// Wire the admin surface over the live graph.
    pub fn new(
        config: AdminConfig,
        engine: RaceEngine,
        flags: Arc<ControlFlags>,
        replays: Arc<ReplayStore>,
        rooms: Arc<RoomRegistry>,
    ) -> Self {
        Self {
            engine,
            flags,
            replays,
            rooms,
            config: Arc::new(config),
            limiter: Arc::new(RateLimiter::new(RATE_LIMIT_MAX, RATE_LIMIT_WINDOW)),
            started_at: std::time::Instant::now(),
        }
    }
}

/// Run the admin HTTP listener.
pub async fn run_admin_server(state: AdminState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(state.config.bind_addr).await?;
    info!("Admin server listening on {}", state.config.bind_addr);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Failed to accept admin connection: {}", e);
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let state = state.clone();
        tokio::spawn(async move {
            let peer_ip = peer.ip();
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(route(req, peer_ip, state).await) }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Admin connection error: {}", err);
            }
        });
    }
}

fn response(status: StatusCode, body: serde_json::Value, client_url: &str) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("access-control-allow-origin", client_url)
        .body(Full::new(Bytes::from(bytes)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"{}"))))
}

fn error_response(
    status: StatusCode,
    code: &str,
    message: &str,
    client_url: &str,
) -> Response<Full<Bytes>> {
    response(status, json!({ "error": message, "code": code }), client_url)
}

fn engine_error_response(err: &EngineError, client_url: &str) -> Response<Full<Bytes>> {
    let (status, code) = match err {
        EngineError::GameNotFound => (StatusCode::NOT_FOUND, "GAME_NOT_FOUND"),
        EngineError::PlayerNotFound => (StatusCode::NOT_FOUND, "PLAYER_NOT_FOUND"),
        EngineError::GameFull => (StatusCode::CONFLICT, "GAME_FULL"),
        EngineError::PlayerAlreadyExists => (StatusCode::CONFLICT, "PLAYER_ALREADY_EXISTS"),
        EngineError::InvalidState => (StatusCode::CONFLICT, "INVALID_STATE"),
        EngineError::ServiceUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE"),
        EngineError::Queued => (StatusCode::ACCEPTED, "QUEUED"),
    };
    error_response(status, code, &err.to_string(), client_url)
}

/// Overall health bucket derived from the mitigation flags.
fn health_status(flags: &ControlFlags) -> &'static str {
    if !flags.accepting_new_players() {
        "critical"
    } else if flags.throttling_enabled()
        || flags.game_creation_queue_enabled()
        || flags.defer_resource_intensive_ops()
    {
        "warning"
    } else {
        "ok"
    }
}

fn authorized<B>(state: &AdminState, req: &Request<B>) -> bool {
    if state.config.environment != Environment::Production {
        return true;
    }
    match &state.config.api_key {
        Some(key) => req
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == key)
            .unwrap_or(false),
        None => false,
    }
}

async fn gather_stats(state: &AdminState) -> SystemStats {
    SystemStats {
        games: state.engine.stats().await,
        connections: state.rooms.connection_count().await,
        broadcasts_sent: state.rooms.metrics.sent(),
        broadcasts_throttled: state.rooms.metrics.throttled(),
        messages_dropped: state.rooms.metrics.dropped(),
        connections_closed: state.rooms.metrics.closed(),
    }
}

async fn route<B>(req: Request<B>, peer: IpAddr, state: AdminState) -> Response<Full<Bytes>>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    let client_url = state.config.client_url.clone();

    if !state.limiter.allow(peer).await {
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "rate limit exceeded",
            &client_url,
        );
    }
    if req.method() == Method::OPTIONS {
        return Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("access-control-allow-origin", client_url.as_str())
            .header("access-control-allow-methods", "GET, POST, OPTIONS")
            .header("access-control-allow-headers", "content-type, x-api-key")
            .body(Full::new(Bytes::new()))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())));
    }

    let method = req.method().clone();
    let path = req.uri().path().trim_end_matches('/').to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let gated = authorized(&state, &req);

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("Failed to read admin request body: {}", e);
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_PAYLOAD",
                "unreadable request body",
                &client_url,
            );
        }
    };

    match (method, segments.as_slice()) {
        (Method::GET, ["health"]) => {
            let status = health_status(&state.flags);
            let http_status = if status == "critical" {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            response(
                http_status,
                json!({
                    "status": status,
                    "env": state.config.environment.to_string(),
                    "timestamp": epoch_ms(),
                }),
                &client_url,
            )
        }

        (Method::GET, ["api", "game", "games"]) => {
            let games = state.engine.list_games().await;
            response(StatusCode::OK, json!({ "games": games }), &client_url)
        }

        (Method::GET, ["api", "game", "games", id]) => match SessionId::parse(id) {
            Some(session) => match state.engine.game_state(session).await {
                Some(game) => response(StatusCode::OK, json!({ "game": game }), &client_url),
                None => error_response(
                    StatusCode::NOT_FOUND,
                    "GAME_NOT_FOUND",
                    "game not found",
                    &client_url,
                ),
            },
            None => error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_PAYLOAD",
                "malformed game id",
                &client_url,
            ),
        },

        (Method::POST, ["api", "game", "create"]) => {
            let payload: CreateGamePayload = match serde_json::from_slice(&body) {
                Ok(p) => p,
                Err(e) => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        "INVALID_PAYLOAD",
                        &format!("invalid create payload: {}", e),
                        &client_url,
                    )
                }
            };
            match state
                .engine
                .create_game(PlayerId::generate(), &payload.player_name, payload.max_players)
                .await
            {
                Ok((game_id, player)) => response(
                    StatusCode::CREATED,
                    json!({ "gameId": game_id, "player": player }),
                    &client_url,
                ),
                Err(e) => engine_error_response(&e, &client_url),
            }
        }

        (Method::POST, ["api", "game", "join"]) => {
            let payload: JoinGamePayload = match serde_json::from_slice(&body) {
                Ok(p) => p,
                Err(e) => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        "INVALID_PAYLOAD",
                        &format!("invalid join payload: {}", e),
                        &client_url,
                    )
                }
            };
            let spectate = payload.is_spectator.unwrap_or(false);
            match state
                .engine
                .join_game(
                    PlayerId::generate(),
                    &payload.player_name,
                    payload.game_id,
                    spectate,
                )
                .await
            {
                Ok((game_id, player, is_spectator)) => response(
                    StatusCode::OK,
                    json!({
                        "gameId": game_id,
                        "player": player,
                        "isSpectator": is_spectator,
                    }),
                    &client_url,
                ),
                Err(e) => engine_error_response(&e, &client_url),
            }
        }

        (Method::GET, ["api", "game", "system", "status"]) => {
            let stats = gather_stats(&state).await;
            response(
                StatusCode::OK,
                json!({ "status": state.flags.snapshot(), "stats": stats }),
                &client_url,
            )
        }

        (Method::GET, ["api", "game", "replays"]) => {
            let replays = state.replays.list_ids().await;
            response(StatusCode::OK, json!({ "replays": replays }), &client_url)
        }

        (Method::GET, ["api", "game", "replays", id]) => match SessionId::parse(id) {
            Some(session) => match state.replays.get(session).await {
                Some(replay) => response(StatusCode::OK, json!({ "replay": replay }), &client_url),
                None => error_response(
                    StatusCode::NOT_FOUND,
                    "REPLAY_NOT_FOUND",
                    "replay not found",
                    &client_url,
                ),
            },
            None => error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_PAYLOAD",
                "malformed replay id",
                &client_url,
            ),
        },

        (Method::GET, ["api", "monitor", "health"]) => response(
            StatusCode::OK,
            json!({
                "status": health_status(&state.flags),
                "env": state.config.environment.to_string(),
                "uptimeSeconds": state.started_at.elapsed().as_secs(),
                "timestamp": epoch_ms(),
            }),
            &client_url,
        ),

        (Method::GET, ["api", "monitor", "metrics"]) => {
            if !gated {
                return error_response(
                    StatusCode::UNAUTHORIZED,
                    "UNAUTHORIZED",
                    "missing or invalid api key",
                    &client_url,
                );
            }
            let stats = gather_stats(&state).await;
            response(
                StatusCode::OK,
                json!({ "flags": state.flags.snapshot(), "stats": stats }),
                &client_url,
            )
        }

        (Method::GET, ["api", "monitor", "stats"]) => {
            if !gated {
                return error_response(
                    StatusCode::UNAUTHORIZED,
                    "UNAUTHORIZED",
                    "missing or invalid api key",
                    &client_url,
                );
            }
            let stats = gather_stats(&state).await;
            response(
                StatusCode::OK,
                json!({
                    "uptimeSeconds": state.started_at.elapsed().as_secs(),
                    "stats": stats,
                }),
                &client_url,
            )
        }

        (Method::GET, ["api", "monitor", "dashboard"]) => {
            if !gated {
                return error_response(
                    StatusCode::UNAUTHORIZED,
                    "UNAUTHORIZED",
                    "missing or invalid api key",
                    &client_url,
                );
            }
            let stats = gather_stats(&state).await;
            let games = state.engine.list_games().await;
            response(
                StatusCode::OK,
                json!({
                    "health": health_status(&state.flags),
                    "flags": state.flags.snapshot(),
                    "stats": stats,
                    "games": games,
                    "replays": state.replays.len().await,
                    "uptimeSeconds": state.started_at.elapsed().as_secs(),
                }),
                &client_url,
            )
        }

        (Method::POST, ["api", "monitor", "config"]) => {
            if !gated {
                return error_response(
                    StatusCode::UNAUTHORIZED,
                    "UNAUTHORIZED",
                    "missing or invalid api key",
                    &client_url,
                );
            }
            let patch: FlagsPatch = match serde_json::from_slice(&body) {
                Ok(p) => p,
                Err(e) => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        "INVALID_PAYLOAD",
                        &format!("invalid config payload: {}", e),
                        &client_url,
                    )
                }
            };
            state.flags.apply_patch(&patch);
            info!("Mitigation config patched via admin API");
            response(
                StatusCode::OK,
                json!({ "status": state.flags.snapshot() }),
                &client_url,
            )
        }

        _ => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "no such route", &client_url),
    }
}

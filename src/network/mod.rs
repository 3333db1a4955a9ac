//! Fan-out Layer
//!
//! WebSocket transport between clients and the engine: typed wire
//! events, per-session rooms with bounded per-connection queues, and
//! the accept loop plus engine-event pump. All race logic lives in
//! `game/`; this layer only validates, routes, and broadcasts.

pub mod protocol;
pub mod rooms;
pub mod server;

pub use protocol::{ClientEvent, ErrorCode, ErrorPayload, Priority, ServerEvent, UpdateKind};
pub use rooms::{FanoutMetrics, RoomRegistry, OUTBOUND_QUEUE_CAPACITY};
pub use server::{GameServer, NetError, ServerConfig};

//! # Typerace Server
//!
//! Authoritative server for real-time multiplayer typing races.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TYPERACE SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Leaf services                             │
//! │  ├── clock.rs    - Wall-clock ms timestamps                  │
//! │  ├── id.rs       - Opaque session/player identifiers         │
//! │  └── text.rs     - Race passage corpus                       │
//! │                                                              │
//! │  game/           - Race engine (authoritative state)         │
//! │  ├── player.rs   - Player model, names, colors               │
//! │  ├── race.rs     - Session state machine                     │
//! │  ├── ranking.rs  - Pure ranking + race summary               │
//! │  ├── replay.rs   - Snapshot capture and retention            │
//! │  └── engine.rs   - Registry, operations, timers              │
//! │                                                              │
//! │  network/        - Fan-out layer                             │
//! │  ├── protocol.rs - Tagged wire events (JSON)                 │
//! │  ├── rooms.rs    - Rooms, bounded queues, throttling         │
//! │  └── server.rs   - WebSocket accept loop + event pump        │
//! │                                                              │
//! │  control/        - Self-healing                              │
//! │  ├── flags.rs    - Lock-free mitigation flags                │
//! │  ├── sampler.rs  - Host pressure readings                    │
//! │  └── controller.rs - Hysteresis loop + deferred ops          │
//! │                                                              │
//! │  admin/          - HTTP health/monitoring surface            │
//! │  config.rs       - Environment-driven configuration          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All race state is in-memory and owned by the engine; the fan-out
//! layer and admin surface are stateless views over it. A single
//! engine-event channel carries every client-visible emission, which
//! keeps per-connection delivery in engine emission order.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod admin;
pub mod config;
pub mod control;
pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use config::{Config, Environment};
pub use control::{ControlFlags, ControllerConfig, SelfHealingController};
pub use core::{PlayerId, SessionId, TextProvider};
pub use game::{EngineConfig, EngineError, EngineEvent, RaceEngine, ReplayStore};
pub use network::{ClientEvent, GameServer, RoomRegistry, ServerEvent};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

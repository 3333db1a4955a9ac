//! Core services.
//!
//! Leaf utilities with no game knowledge: wall-clock timestamps,
//! opaque identifiers, and the read-only passage corpus.

pub mod clock;
pub mod id;
pub mod text;

// Re-export core types
pub use clock::{epoch_ms, TimestampMs};
pub use id::{PlayerId, SessionId};
pub use text::{TextError, TextProvider};

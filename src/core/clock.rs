//! Clock Service
//!
//! Wall-clock timestamps in milliseconds since the Unix epoch.
//! Every time recorded on a session, player, or replay snapshot
//! comes from here so the units never drift between subsystems.

/// A wall-clock timestamp in milliseconds since the Unix epoch.
pub type TimestampMs = u64;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn epoch_ms() -> TimestampMs {
    chrono::Utc::now().timestamp_millis().max(0) as TimestampMs
}

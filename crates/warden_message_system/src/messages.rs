//! Built-in message catalog and the locked standard tag assignments.
//!
//! These are the control and telemetry messages the watchdog and the game
//! server wrapper exchange. The tag numbers in [`standard_registry`] are the
//! wire compatibility contract: both processes compile against this module,
//! and a tag must never be renumbered or reused once shipped.

use crate::registry::MessageRegistry;
use crate::BusError;
use serde::{Deserialize, Serialize};

/// Liveness probe sent periodically by the watchdog.
///
/// The worker answers every ping with a [`HealthPong`] echoing the sequence
/// number; a run of unanswered pings is what makes the watchdog consider the
/// worker hung.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthPing {
    /// Monotonic probe counter, echoed back in the pong
    pub sequence: u64,
    /// Unix timestamp when the ping was sent
    pub timestamp: u64,
}

/// The worker's answer to a [`HealthPing`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthPong {
    /// Sequence number copied from the ping being answered
    pub sequence: u64,
    /// Unix timestamp when the pong was sent
    pub timestamp: u64,
}

/// Asks the worker to shut the game server down gracefully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownRequest {
    /// Human-readable reason, logged by the worker
    pub reason: String,
    /// Seconds the worker may spend on a clean save/stop before the
    /// watchdog escalates
    pub deadline_secs: u32,
}

/// The worker's acknowledgement that shutdown has begun.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownAck {
    /// Unix timestamp when the worker accepted the request
    pub timestamp: u64,
}

/// Periodic performance snapshot published by the worker.
///
/// Loss-tolerant by design (the next snapshot supersedes a lost one), which
/// makes it suitable for the datagram channel as well as the stream channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    /// Duration of the last completed game tick, in milliseconds
    pub tick_millis: f64,
    /// Players currently connected to the game server
    pub players_online: u32,
    /// Resident heap usage of the game server process, in bytes
    pub heap_bytes: u64,
    /// Unix timestamp the snapshot was taken
    pub timestamp: u64,
}

/// One line of in-game chat relayed to the watchdog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatLine {
    /// Chat channel the line was spoken in (e.g. "global", "team")
    pub channel: String,
    /// Display name of the speaker
    pub sender: String,
    /// The chat text
    pub text: String,
    /// Unix timestamp the line was received by the wrapper
    pub timestamp: u64,
}

/// Emitted when a player finishes connecting to the game server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerJoined {
    /// Display name of the player
    pub player_name: String,
    /// Wrapper-assigned connection identifier
    pub client_id: String,
    /// Unix timestamp of the join
    pub timestamp: u64,
}

/// Emitted when a player disconnects from the game server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerLeft {
    /// Display name of the player
    pub player_name: String,
    /// Disconnect reason as reported by the game server
    pub reason: String,
    /// Unix timestamp of the leave
    pub timestamp: u64,
}

/// One line of game-server console output relayed to the watchdog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// Severity as reported by the game server ("info", "warn", ...)
    pub level: String,
    /// The raw console line
    pub line: String,
    /// Unix timestamp the line was captured
    pub timestamp: u64,
}

/// Builds the registry both processes must construct identically.
///
/// Tag assignments are locked: extend only by appending new tags, never by
/// renumbering.
pub fn standard_registry() -> Result<MessageRegistry, BusError> {
    let mut registry = MessageRegistry::new();
    registry.register::<HealthPing>(1)?;
    registry.register::<HealthPong>(2)?;
    registry.register::<ShutdownRequest>(3)?;
    registry.register::<ShutdownAck>(4)?;
    registry.register::<MetricSnapshot>(5)?;
    registry.register::<ChatLine>(6)?;
    registry.register::<PlayerJoined>(7)?;
    registry.register::<PlayerLeft>(8)?;
    registry.register::<LogLine>(9)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BusMessage;

    #[test]
    fn test_standard_registry_builds_cleanly() {
        let registry = standard_registry().expect("standard tags must not collide");
        assert_eq!(registry.len(), 9);
        assert_eq!(registry.tag_of::<HealthPing>().unwrap(), 1);
        assert_eq!(registry.tag_of::<LogLine>().unwrap(), 9);
    }

    #[test]
    fn test_catalog_messages_round_trip_through_schema() {
        let ping = HealthPing {
            sequence: 7,
            timestamp: 1_700_000_000,
        };
        let bytes = ping.encode().unwrap();
        let back = HealthPing::decode(&bytes).unwrap();
        assert_eq!(back.sequence, 7);
        assert_eq!(back.timestamp, 1_700_000_000);
    }
}

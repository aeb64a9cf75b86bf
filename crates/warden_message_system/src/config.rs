//! Bus configuration types and defaults.
//!
//! These structures carry everything the transport adapters and the batch
//! layer need: channel naming, buffer sizing, queue bounds and timeouts.
//! They derive serde traits so hosting applications can load them straight
//! from a TOML section.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default for `initial_buffer_capacity`
fn default_initial_buffer_capacity() -> usize {
    4096
}

/// Default for `flush_threshold_bytes`
fn default_flush_threshold() -> usize {
    16 * 1024
}

/// Default for `writer_queue_depth`
fn default_writer_queue_depth() -> usize {
    256
}

/// Default for `connect_timeout_ms`
fn default_connect_timeout() -> u64 {
    5000
}

/// Default for `recv_timeout_ms`
fn default_recv_timeout() -> u64 {
    250
}

/// Default for `socket_buffer_bytes`
fn default_socket_buffer() -> usize {
    256 * 1024
}

/// Default for `max_datagram_bytes`
fn default_max_datagram() -> usize {
    64 * 1024
}

/// Configuration for the stream-channel bus between the watchdog and the
/// worker it supervises.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Logical channel identifier; the two endpoint names are derived from
    /// it by appending fixed direction suffixes
    pub channel_name: String,

    /// Directory the endpoint sockets live in
    #[serde(default = "std::env::temp_dir")]
    pub channel_dir: PathBuf,

    /// Starting capacity of freshly allocated pool buffers
    #[serde(default = "default_initial_buffer_capacity")]
    pub initial_buffer_capacity: usize,

    /// Batch size at which an outgoing batch flushes on its own
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold_bytes: usize,

    /// Bound of the writer FIFO; producers block (never drop) when it fills
    #[serde(default = "default_writer_queue_depth")]
    pub writer_queue_depth: usize,

    /// How long a connecting worker retries before giving up on the host
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel_name: "warden-bus".to_string(),
            channel_dir: std::env::temp_dir(),
            initial_buffer_capacity: default_initial_buffer_capacity(),
            flush_threshold_bytes: default_flush_threshold(),
            writer_queue_depth: default_writer_queue_depth(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

/// Configuration for the loopback datagram channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatagramConfig {
    /// Loopback port the receive socket binds (0 for ephemeral)
    pub bind_port: u16,

    /// Loopback port datagrams are sent to
    pub peer_port: u16,

    /// SO_RCVBUF/SO_SNDBUF size; also bounds how large a payload can travel
    /// in one datagram
    #[serde(default = "default_socket_buffer")]
    pub socket_buffer_bytes: usize,

    /// Largest datagram the receiver will accept without truncation
    #[serde(default = "default_max_datagram")]
    pub max_datagram_bytes: usize,

    /// Receive timeout; elapsing merely means the peer is not up yet
    #[serde(default = "default_recv_timeout")]
    pub recv_timeout_ms: u64,

    /// Bound of the sender FIFO
    #[serde(default = "default_writer_queue_depth")]
    pub writer_queue_depth: usize,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            bind_port: 27615,
            peer_port: 27616,
            socket_buffer_bytes: default_socket_buffer(),
            max_datagram_bytes: default_max_datagram(),
            recv_timeout_ms: default_recv_timeout(),
            writer_queue_depth: default_writer_queue_depth(),
        }
    }
}

//! # Warden Message System
//!
//! A low-latency, allocation-frugal, typed publish/subscribe message bus
//! connecting the Warden watchdog process with the game server wrapper it
//! launches and supervises. The bus survives worker restarts and carries
//! small control/telemetry messages (health pings, shutdown requests, metric
//! snapshots, chat, player events) without introducing allocation pressure
//! proportional to the message rate.
//!
//! ## Core Features
//!
//! - **Pooled Buffers**: reference-counted, reusable byte buffers with
//!   generation-based stale-access detection
//! - **Framed Packets**: a self-describing wire format batching multiple
//!   typed sub-messages into one length-prefixed frame
//! - **Type Safety**: messages are strongly typed serde structs routed by a
//!   closed, version-locked single-byte tag registry
//! - **Thread-Per-Direction I/O**: each transport adapter owns one reader
//!   and one writer thread with bounded FIFOs and cancellable blocking I/O
//! - **Two Transports**: a paired named byte-stream channel (watchdog ↔
//!   worker) and a loopback datagram channel for loss-tolerant telemetry
//!
//! ## Architecture Overview
//!
//! The crate is layered leaves-first:
//!
//! 1. [`pool`] - reusable buffers behind checkout handles
//! 2. [`codec`] - frame encoding/decoding over pooled buffers
//! 3. [`distributor`] - type-tag routing to registered handlers
//! 4. [`transport`] - byte-stream and datagram adapters
//! 5. [`bus`] - the typed publish/subscribe façade
//!
//! ## Quick Start Example
//!
//! ```rust,no_run
//! use warden_message_system::*;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), BusError> {
//!     let config = BusConfig::default();
//!     let pool = BufferPool::new(config.initial_buffer_capacity);
//!     let distributor = Arc::new(PacketDistributor::new());
//!
//!     // The watchdog hosts the channel; the wrapped worker calls
//!     // `StreamChannel::connect` with the same configuration.
//!     let channel = StreamChannel::host(&config, pool.clone(), distributor.clone())?;
//!     let bus = MessageBus::new(
//!         Arc::new(standard_registry()?),
//!         distributor,
//!         pool,
//!         channel.sender(),
//!         &config,
//!     );
//!
//!     let _sub = bus.subscribe(|ping: HealthPing| {
//!         println!("worker is alive, sequence {}", ping.sequence);
//!         Ok(())
//!     })?;
//!
//!     bus.publish::<ShutdownRequest>()?
//!         .send(ShutdownRequest { reason: "maintenance".to_string(), deadline_secs: 30 })?;
//!     bus.flush()?;
//!     Ok(())
//! }
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

pub mod batch;
pub mod bus;
pub mod codec;
pub mod config;
pub mod distributor;
pub mod messages;
pub mod pool;
pub mod registry;
pub mod transport;
pub mod utils;


pub use batch::OutgoingBatch;
pub use bus::{MessageBus, PublishToken, Subscription};
pub use codec::MessageToken;
pub use config::{BusConfig, DatagramConfig};
pub use distributor::{MessageHandler, PacketDistributor, TypedMessageHandler};
pub use messages::{
    standard_registry, ChatLine, HealthPing, HealthPong, LogLine, MetricSnapshot, PlayerJoined,
    PlayerLeft, ShutdownAck, ShutdownRequest,
};
pub use pool::{BufferHandle, BufferPool, PoolStats, StaleHandleError, WeakBufferHandle};
pub use registry::MessageRegistry;
pub use transport::{datagram::DatagramChannel, stream::StreamChannel};
pub use utils::current_timestamp;

// ============================================================================
// Message Trait and Blanket Implementation
// ============================================================================

/// Trait for all messages carried by the bus.
///
/// Most types never implement this directly: the blanket implementation
/// below covers every serde-derived struct, so a new message type only needs
/// `#[derive(Debug, Serialize, Deserialize)]` plus a tag assignment in a
/// [`MessageRegistry`].
///
/// The encoded form is the bus's payload schema seam - the frame codec treats
/// payloads as opaque blobs and never inspects them.
pub trait BusMessage: Send + Sync + std::fmt::Debug + 'static {
    /// Returns a stable, unique identifier for the message type, used for
    /// registry diagnostics and error reporting.
    fn type_name() -> &'static str
    where
        Self: Sized;

    /// Serializes the message payload to bytes for transmission.
    fn encode(&self) -> Result<Vec<u8>, BusError>;

    /// Deserializes a message payload from bytes.
    fn decode(data: &[u8]) -> Result<Self, BusError>
    where
        Self: Sized;
}

/// Blanket implementation of [`BusMessage`] for serde-compatible types.
///
/// Any type implementing `Serialize + DeserializeOwned + Send + Sync + Debug`
/// is automatically a bus message with JSON payload encoding:
///
/// ```rust
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct MapRotated {
///     map_name: String,
/// }
/// // MapRotated can now be registered, published and subscribed.
/// ```
impl<T> BusMessage for T
where
    T: Serialize + DeserializeOwned + Send + Sync + std::fmt::Debug + 'static,
{
    fn type_name() -> &'static str {
        std::any::type_name::<T>()
    }

    fn encode(&self) -> Result<Vec<u8>, BusError> {
        serde_json::to_vec(self).map_err(BusError::Serialization)
    }

    fn decode(data: &[u8]) -> Result<Self, BusError> {
        serde_json::from_slice(data).map_err(BusError::Deserialization)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors produced by the message bus.
///
/// The taxonomy follows three families with different handling policies:
///
/// - **Protocol errors** ([`CorruptFrame`](BusError::CorruptFrame),
///   [`UnregisteredTag`](BusError::UnregisteredTag),
///   [`DuplicateHandler`](BusError::DuplicateHandler)) indicate build-time
///   schema drift between the two processes and abort the receive loop.
/// - **Transport errors** ([`TransportClosed`](BusError::TransportClosed),
///   [`Io`](BusError::Io), [`Timeout`](BusError::Timeout)) are recoverable at
///   the adapter boundary; closure ends the reader loop with a single log
///   line, never a retry inside the core.
/// - **Misuse errors** ([`StaleHandle`](BusError::StaleHandle)) signal a
///   buffer lifetime bug in the caller and are treated assertion-style.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Serialization failed when converting a message payload to bytes
    #[error("Serialization error: {0}")]
    Serialization(serde_json::Error),
    /// Deserialization failed when converting payload bytes to a message
    #[error("Deserialization error: {0}")]
    Deserialization(serde_json::Error),
    /// The frame structure on the wire is malformed
    #[error("Corrupt frame: {0}")]
    CorruptFrame(String),
    /// A decoded sub-message carries a tag nobody registered a handler for
    #[error("No handler registered for type tag {0}")]
    UnregisteredTag(u8),
    /// A second handler was registered for a tag that already has one
    #[error("Handler already registered for type tag {0}")]
    DuplicateHandler(u8),
    /// Two message types were assigned the same tag in the registry
    #[error("Type tag {tag} is already assigned to {existing}")]
    TagInUse {
        /// The contested tag value
        tag: u8,
        /// Type name that already owns the tag
        existing: &'static str,
    },
    /// The same message type was registered twice
    #[error("Message type {0} is already registered")]
    TypeAlreadyRegistered(&'static str),
    /// A publish or subscribe referenced a type absent from the registry
    #[error("Message type {0} is not in the registry")]
    UnknownMessageType(&'static str),
    /// The peer closed the transport (or the adapter was shut down)
    #[error("Transport closed")]
    TransportClosed,
    /// A request/response wait elapsed without a matching reply
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// An I/O operation on the underlying stream or socket failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A pooled buffer was accessed through an outdated handle
    #[error(transparent)]
    StaleHandle(#[from] StaleHandleError),
}

//! # Packet Distributor
//!
//! Routes decoded sub-messages to the single handler registered for their
//! type tag.
//!
//! Dispatch is synchronous and happens on the calling thread - in practice
//! the transport adapter's reader thread. No queueing or thread-hop occurs
//! here; if a handler needs to move work elsewhere, that is its own
//! business.
//!
//! ## Failure Policy
//!
//! - A sub-message with an *unregistered* tag aborts the receive loop. It
//!   means the two processes disagree about the type registry (schema
//!   drift), and dropping such messages silently would hide the bug.
//! - A handler *returning an error* is logged and isolated: the remaining
//!   sub-messages of the frame are still delivered, matching the failure
//!   isolation the rest of the system expects from event handlers.
//! - Registering a second handler for an occupied tag is a startup-time
//!   error, never a runtime race.

use crate::codec::{self, MessageToken};
use crate::pool::BufferHandle;
use crate::{BusError, BusMessage};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

/// Handler trait for processing decoded sub-messages.
///
/// Most users never implement this directly; the typed pub/sub façade wraps
/// callbacks in [`TypedMessageHandler`].
pub trait MessageHandler: Send + Sync {
    /// Handles one sub-message. The token keeps the backing frame buffer
    /// alive for the duration of the call (and longer, if the handler clones
    /// it).
    fn handle(&self, token: MessageToken) -> Result<(), BusError>;

    /// Human-readable name for diagnostics.
    fn handler_name(&self) -> &str;
}

/// Type-safe wrapper bridging a typed callback to the type-erased
/// [`MessageHandler`] interface.
///
/// Decodes the token's payload as `T` before invoking the callback, so the
/// callback only ever sees fully-typed messages.
pub struct TypedMessageHandler<T, F>
where
    T: BusMessage,
    F: Fn(T) -> Result<(), BusError> + Send + Sync,
{
    handler: F,
    name: String,
    _phantom: std::marker::PhantomData<fn() -> T>,
}

impl<T, F> TypedMessageHandler<T, F>
where
    T: BusMessage,
    F: Fn(T) -> Result<(), BusError> + Send + Sync,
{
    /// Creates a typed handler with a diagnostic name.
    pub fn new(name: String, handler: F) -> Self {
        Self {
            handler,
            name,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<T, F> MessageHandler for TypedMessageHandler<T, F>
where
    T: BusMessage,
    F: Fn(T) -> Result<(), BusError> + Send + Sync,
{
    fn handle(&self, token: MessageToken) -> Result<(), BusError> {
        let message = token.decode::<T>()?;
        (self.handler)(message)
    }

    fn handler_name(&self) -> &str {
        &self.name
    }
}

/// Counters describing distributor activity since startup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DistributorStats {
    /// Handlers currently registered
    pub registered_handlers: usize,
    /// Sub-messages successfully handed to a handler
    pub dispatched: u64,
    /// Handler invocations that returned an error
    pub handler_failures: u64,
}

/// The type-tag-to-handler routing table used on the receive path.
///
/// Thread-safe: registration typically happens at startup, but the table
/// supports concurrent register/unregister/dispatch for subscription
/// disposal while the reader threads are live.
#[derive(Default)]
pub struct PacketDistributor {
    handlers: DashMap<u8, Arc<dyn MessageHandler>>,
    dispatched: AtomicU64,
    handler_failures: AtomicU64,
}

impl std::fmt::Debug for PacketDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketDistributor")
            .field("registered_handlers", &self.handlers.len())
            .field("dispatched", &self.dispatched.load(Ordering::Relaxed))
            .finish()
    }
}

impl PacketDistributor {
    /// Creates a distributor with an empty routing table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for a single tag.
    ///
    /// At most one handler may exist per tag; a duplicate registration is a
    /// startup-time configuration error.
    pub fn register(&self, tag: u8, handler: Arc<dyn MessageHandler>) -> Result<(), BusError> {
        match self.handlers.entry(tag) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(BusError::DuplicateHandler(tag)),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(handler);
                Ok(())
            }
        }
    }

    /// Registers one handler for several tags, the multi-type registration
    /// shape used by handlers that demultiplex related messages themselves.
    ///
    /// All-or-nothing: when a tag collides, the tags already claimed by this
    /// call are released again, so a failed startup registration leaves the
    /// routing table untouched.
    pub fn register_for_tags(
        &self,
        handler: Arc<dyn MessageHandler>,
        tags: &[u8],
    ) -> Result<(), BusError> {
        for (index, &tag) in tags.iter().enumerate() {
            if let Err(e) = self.register(tag, Arc::clone(&handler)) {
                for &claimed in &tags[..index] {
                    self.unregister(claimed);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Removes the handler for `tag`. Returns whether one was registered.
    pub fn unregister(&self, tag: u8) -> bool {
        self.handlers.remove(&tag).is_some()
    }

    /// Dispatches one sub-message to its registered handler, synchronously,
    /// on the calling thread.
    ///
    /// An unregistered tag is a protocol error: the caller (the reader loop)
    /// must treat it as fatal and stop. A handler returning an error is
    /// logged here and isolated.
    pub fn dispatch(&self, token: MessageToken) -> Result<(), BusError> {
        let tag = token.tag();
        let handler = self
            .handlers
            .get(&tag)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(BusError::UnregisteredTag(tag))?;

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = handler.handle(token) {
            self.handler_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                handler = handler.handler_name(),
                tag,
                error = %e,
                "Message handler failed"
            );
        }
        Ok(())
    }

    /// Splits a decoded frame and dispatches every sub-message in order.
    ///
    /// Consumes the reader's buffer handle; the per-message tokens keep the
    /// buffer alive only as long as handlers need it. Returns the number of
    /// sub-messages delivered.
    pub fn dispatch_frame(&self, handle: BufferHandle) -> Result<usize, BusError> {
        let tokens = codec::split_frame(&handle)?;
        drop(handle);

        let mut delivered = 0;
        for token in tokens {
            self.dispatch(token)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Returns a snapshot of dispatch counters.
    pub fn stats(&self) -> DistributorStats {
        DistributorStats {
            registered_handlers: self.handlers.len(),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

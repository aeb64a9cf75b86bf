//! # Outgoing Batch
//!
//! Accumulates outbound sub-messages into one checked-out pooled buffer and
//! hands finished frames to a transport writer queue.
//!
//! Messages appended to a batch share a single buffer until the flush
//! threshold is crossed or an explicit flush occurs. At that point the batch
//! atomically swaps in a fresh buffer, seals the filled one into a complete
//! wire frame, and pushes its handle onto the writer FIFO. Per-message cost
//! is therefore bounded by occasional buffer growth, never one allocation
//! per message.
//!
//! The writer queue is bounded: when it fills up, the flushing producer
//! blocks until the writer thread drains a slot. Control and health traffic
//! must not be dropped under overload.

use crate::codec;
use crate::pool::{BufferHandle, BufferPool};
use crate::{BusError, BusMessage};
use crossbeam::channel::Sender;
use std::sync::{Mutex, MutexGuard};
use tracing::trace;

/// An accumulator bound to one checked-out buffer, feeding a transport
/// writer queue.
///
/// The batch is safe to share across producer threads; appends and flushes
/// are serialized internally.
#[derive(Debug)]
pub struct OutgoingBatch {
    pool: BufferPool,
    sink: Sender<BufferHandle>,
    flush_threshold: usize,
    state: Mutex<BatchState>,
}

#[derive(Debug)]
struct BatchState {
    handle: BufferHandle,
    tags: Vec<u8>,
}

impl OutgoingBatch {
    /// Creates a batch drawing buffers from `pool` and flushing frames into
    /// `sink` (a transport adapter's writer queue).
    pub fn new(pool: BufferPool, sink: Sender<BufferHandle>, flush_threshold: usize) -> Self {
        let handle = pool.checkout();
        codec::begin_frame(&mut handle.bytes());
        Self {
            pool,
            sink,
            flush_threshold,
            state: Mutex::new(BatchState {
                handle,
                tags: Vec::new(),
            }),
        }
    }

    /// Appends one typed message under the given tag.
    ///
    /// Auto-flushes when the accumulated frame crosses the flush threshold.
    pub fn append<T: BusMessage>(&self, tag: u8, message: &T) -> Result<(), BusError> {
        let payload = message.encode()?;
        self.append_raw(tag, &payload)
    }

    /// Appends one already-encoded payload under the given tag.
    pub fn append_raw(&self, tag: u8, payload: &[u8]) -> Result<(), BusError> {
        let mut state = self.lock_state();
        let filled = {
            let mut buf = state.handle.bytes();
            codec::append_blob(&mut buf, payload);
            buf.len()
        };
        state.tags.push(tag);
        trace!(tag, payload_len = payload.len(), filled, "appended sub-message to batch");

        if filled >= self.flush_threshold {
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }

    /// Seals the current buffer into a frame and queues it for the writer
    /// thread. A batch with no pending messages flushes to nothing.
    pub fn flush(&self) -> Result<(), BusError> {
        let mut state = self.lock_state();
        self.flush_locked(&mut state)
    }

    /// Number of sub-messages waiting in the current buffer.
    pub fn pending_messages(&self) -> usize {
        self.lock_state().tags.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn flush_locked(&self, state: &mut MutexGuard<'_, BatchState>) -> Result<(), BusError> {
        if state.tags.is_empty() {
            return Ok(());
        }

        // Swap in a fresh buffer before sealing so other producers blocked
        // on the state lock find a ready batch as soon as we release it.
        let fresh = self.pool.checkout();
        codec::begin_frame(&mut fresh.bytes());
        let full = std::mem::replace(&mut state.handle, fresh);
        let tags = std::mem::take(&mut state.tags);

        codec::seal_frame(&mut full.bytes(), &tags);
        trace!(messages = tags.len(), "flushing batch to writer queue");

        // Blocks when the writer FIFO is full (bounded backpressure). A
        // disconnected queue means the adapter shut down underneath us.
        self.sink.send(full).map_err(|_| BusError::TransportClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use crossbeam::channel;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn decode_queued(pool: &BufferPool, frame: &BufferHandle) -> Vec<(u8, Vec<u8>)> {
        let wire = frame.bytes().clone();
        let handle = pool.checkout();
        let mut cursor = Cursor::new(wire);
        codec::read_frame(&mut cursor, &handle).expect("frame did not decode");
        codec::split_frame(&handle)
            .expect("frame did not split")
            .iter()
            .map(|t| (t.tag(), t.payload().unwrap()))
            .collect()
    }

    #[test]
    fn test_messages_share_one_buffer_until_flush() {
        let pool = BufferPool::new(256);
        let (tx, rx) = channel::bounded(8);
        let batch = OutgoingBatch::new(pool.clone(), tx, 64 * 1024);

        batch.append_raw(1, b"alpha").unwrap();
        batch.append_raw(2, b"beta").unwrap();
        batch.append_raw(3, b"gamma").unwrap();
        assert!(rx.is_empty(), "nothing should hit the wire before flush");
        assert_eq!(batch.pending_messages(), 3);

        batch.flush().unwrap();
        let frame = rx.try_recv().expect("flush queued no frame");
        let decoded = decode_queued(&pool, &frame);
        assert_eq!(
            decoded,
            vec![
                (1, b"alpha".to_vec()),
                (2, b"beta".to_vec()),
                (3, b"gamma".to_vec())
            ]
        );
    }

    #[test]
    fn test_threshold_crossing_flushes_without_explicit_call() {
        // 1200 bytes of payload against a 1024-byte threshold must flush on
        // its own.
        let pool = BufferPool::new(256);
        let (tx, rx) = channel::bounded(8);
        let batch = OutgoingBatch::new(pool.clone(), tx, 1024);

        let payload = vec![0x77u8; 1200];
        batch.append_raw(5, &payload).unwrap();

        let frame = rx.try_recv().expect("size-triggered flush did not happen");
        let decoded = decode_queued(&pool, &frame);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].0, 5);
        assert_eq!(decoded[0].1, payload);
        assert_eq!(batch.pending_messages(), 0);
    }

    #[test]
    fn test_full_writer_queue_blocks_producers_instead_of_dropping() {
        let pool = BufferPool::new(256);
        let (tx, rx) = channel::bounded(1);
        let batch = Arc::new(OutgoingBatch::new(pool.clone(), tx, 64 * 1024));

        // First flush occupies the only queue slot.
        batch.append_raw(1, b"first").unwrap();
        batch.flush().unwrap();
        batch.append_raw(2, b"second").unwrap();

        let flushed = Arc::new(AtomicBool::new(false));
        let flusher = {
            let batch = Arc::clone(&batch);
            let flushed = Arc::clone(&flushed);
            thread::spawn(move || {
                batch.flush().unwrap();
                flushed.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(
            !flushed.load(Ordering::SeqCst),
            "flush must block while the writer queue is full"
        );

        // Draining one slot unblocks the waiting flush; both frames arrive
        // intact, nothing was dropped.
        let first = rx.recv().unwrap();
        flusher.join().expect("flusher thread panicked");
        assert!(flushed.load(Ordering::SeqCst));
        let second = rx.recv().unwrap();

        assert_eq!(decode_queued(&pool, &first), vec![(1, b"first".to_vec())]);
        assert_eq!(decode_queued(&pool, &second), vec![(2, b"second".to_vec())]);
    }

    #[test]
    fn test_flush_with_nothing_pending_queues_nothing() {
        let pool = BufferPool::new(256);
        let (tx, rx) = channel::bounded(8);
        let batch = OutgoingBatch::new(pool, tx, 1024);

        batch.flush().unwrap();
        assert!(rx.is_empty());
    }

    #[test]
    fn test_flush_after_adapter_shutdown_reports_transport_closed() {
        let pool = BufferPool::new(256);
        let (tx, rx) = channel::bounded(8);
        let batch = OutgoingBatch::new(pool, tx, 1024);
        drop(rx);

        batch.append_raw(1, b"ping").unwrap();
        assert!(matches!(batch.flush(), Err(BusError::TransportClosed)));
    }

    #[test]
    fn test_typed_append_round_trips_through_schema() {
        let pool = BufferPool::new(256);
        let (tx, rx) = channel::bounded(8);
        let batch = OutgoingBatch::new(pool.clone(), tx, 64 * 1024);

        let ping = crate::messages::HealthPing {
            sequence: 41,
            timestamp: 1_700_000_000,
        };
        batch.append(9, &ping).unwrap();
        batch.flush().unwrap();

        let frame = rx.try_recv().unwrap();
        let decoded = decode_queued(&pool, &frame);
        let parsed: crate::messages::HealthPing = serde_json::from_slice(&decoded[0].1).unwrap();
        assert_eq!(parsed.sequence, 41);
    }
}
